//! Conversión entre relojes locales y milisegundos de época para el protocolo.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

pub fn now_ms() -> i64 {
    system_time_to_ms(SystemTime::now())
}

pub fn system_time_to_ms(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

pub fn ms_to_system_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

/// 0 en el cable significa "sin fecha".
pub fn datetime_to_ms(t: Option<DateTime<Utc>>) -> i64 {
    t.map_or(0, |t| t.timestamp_millis())
}

pub fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

/// Diferencia estimada entre el reloj del peer y el nuestro (`remoto - local`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockSkew {
    pub offset_ms: i64,
    pub rtt_ms: i64,
}

impl ClockSkew {
    /// Estima el skew a partir de un ida y vuelta: mandamos en `sent_local`,
    /// el peer contestó con su reloj `remote` y lo recibimos en `recv_local`.
    /// Se asume que el peer leyó su reloj a mitad de camino.
    pub fn estimate(sent_local: i64, remote: i64, recv_local: i64) -> Self {
        let rtt = (recv_local - sent_local).max(0);
        let midpoint = sent_local + rtt / 2;
        Self {
            offset_ms: remote - midpoint,
            rtt_ms: rtt,
        }
    }

    pub fn local_to_remote(&self, local_ms: i64) -> i64 {
        local_ms + self.offset_ms
    }

    pub fn remote_to_local(&self, remote_ms: i64) -> i64 {
        remote_ms - self.offset_ms
    }
}
