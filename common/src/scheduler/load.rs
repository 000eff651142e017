//! Freno por carga del sistema (load average de 1 minuto) con histéresis.

use std::time::{Duration, Instant};

use sysinfo::{System, SystemExt};
use tracing::info;

use crate::config::LoadGate;

pub type LoadSampler = Box<dyn FnMut() -> Option<f64> + Send>;

pub fn system_load_sampler() -> LoadSampler {
    let sys = System::new();
    Box::new(move || {
        let avg = sys.load_average();
        Some(avg.one)
    })
}

pub struct LoadMonitor {
    gate: Option<LoadGate>,
    interval: Duration,
    sampler: LoadSampler,
    last_check: Option<Instant>,
    high: bool,
}

impl LoadMonitor {
    pub fn new(gate: Option<LoadGate>, interval: Duration, sampler: LoadSampler) -> Self {
        Self {
            gate,
            interval,
            sampler,
            last_check: None,
            high: false,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(5), Box::new(|| None))
    }

    /// `true` si hay que frenar arranques.
    pub fn blocked(&self) -> bool {
        self.high
    }

    /// Muestrea si pasó el intervalo. Devuelve `true` si cambió el estado.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(gate) = self.gate else {
            return false;
        };
        if self
            .last_check
            .is_some_and(|t| now.saturating_duration_since(t) < self.interval)
        {
            return false;
        }
        self.last_check = Some(now);

        let Some(load) = (self.sampler)() else {
            return false;
        };
        let was = self.high;
        if !self.high && load >= gate.high {
            self.high = true;
            info!("load {:.2} >= {:.2}: se frenan arranques", load, gate.high);
        } else if self.high && load <= gate.low {
            self.high = false;
            info!("load {:.2} <= {:.2}: se reanudan arranques", load, gate.low);
        }
        was != self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn histeresis_entre_alto_y_bajo() {
        let values = Arc::new(Mutex::new(vec![1.0, 3.0, 2.0, 0.5]));
        let feed = Arc::clone(&values);
        let sampler: LoadSampler = Box::new(move || Some(feed.lock().unwrap().remove(0)));
        let gate = LoadGate { high: 2.5, low: 1.0 };
        let mut m = LoadMonitor::new(Some(gate), Duration::from_secs(1), sampler);

        let t0 = Instant::now();
        assert!(!m.poll(t0));
        assert!(!m.blocked());

        assert!(m.poll(t0 + Duration::from_secs(1)));
        assert!(m.blocked());

        // 2.0 está entre los umbrales: sigue frenado
        assert!(!m.poll(t0 + Duration::from_secs(2)));
        assert!(m.blocked());

        assert!(m.poll(t0 + Duration::from_secs(3)));
        assert!(!m.blocked());
    }

    #[test]
    fn respeta_el_intervalo() {
        let calls = Arc::new(Mutex::new(0));
        let c = Arc::clone(&calls);
        let sampler: LoadSampler = Box::new(move || {
            *c.lock().unwrap() += 1;
            Some(0.0)
        });
        let mut m = LoadMonitor::new(Some(LoadGate { high: 1.0, low: 0.5 }), Duration::from_secs(5), sampler);

        let t0 = Instant::now();
        m.poll(t0);
        m.poll(t0 + Duration::from_secs(1));
        m.poll(t0 + Duration::from_secs(5));
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn sin_umbral_nunca_frena() {
        let mut m = LoadMonitor::disabled();
        assert!(!m.poll(Instant::now()));
        assert!(!m.blocked());
    }
}
