use std::time::Instant;

use tracing::{info, warn};

use common::config::LinkConfig;
use common::scheduler::DriverUpcall;
use common::task::{ExecReport, ExecStatus, TermReason};
use common::wire::control::{keepalive_check, KeepAlive};

use crate::state::WorkerLink;

/// Qué hacer con una conexión en esta pasada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Ping,
    /// Cerrarla y devolver sus tareas
    Dead(&'static str),
}

/// Una pasada de chequeo sobre un worker:
/// 1. handshake que no avanza
/// 2. TaskRequest sin respuesta
/// 3. keepalive (ping si está quieta, cerrar si un request venció)
pub fn sweep_once(w: &WorkerLink, now: Instant, cfg: &LinkConfig) -> Verdict {
    let idle = w.link.idle_for(now);

    // 1) Autenticación colgada
    if !w.stage.is_session() && idle >= cfg.response_timeout {
        return Verdict::Dead("handshake sin respuesta");
    }

    // 2) Dispatch colgado (la conexión además tiene que estar quieta)
    if let Some(d) = &w.dispatch {
        if idle >= cfg.response_timeout && now.saturating_duration_since(d.sent_at) >= cfg.response_timeout {
            return Verdict::Dead("TaskRequest sin respuesta");
        }
    }

    // 3) Keepalive
    if !w.stage.is_session() {
        return Verdict::Healthy;
    }
    match keepalive_check(idle, &w.control, now, cfg) {
        KeepAlive::Nothing => Verdict::Healthy,
        KeepAlive::Ping => Verdict::Ping,
        KeepAlive::Close => Verdict::Dead("control sin respuesta"),
    }
}

fn lost_status() -> ExecStatus {
    ExecStatus {
        reason: TermReason::TransferFailed,
        ..ExecStatus::killed()
    }
}

/// Devuelve al scheduler todo lo que tenía un worker que se cayó.
///
/// Se recorren de la más vieja a la más nueva: cada put-back va al frente de
/// `todo`, así la más reciente queda primera.
pub fn put_back_all(w: &mut WorkerLink, out: &mut Vec<DriverUpcall>) -> usize {
    // 1) Outputs a medio subir
    if let Some(mut report) = w.report.take() {
        report.discard_parts();
    }

    // 2) Dispatch pendiente: suelta el estado fijo de sus archivos
    w.dispatch = None;

    // 3) Reencolar
    let n = w.assigned.len();
    for a in w.assigned.drain(..) {
        let mut report = ExecReport::default();
        for kind in a.mask.kinds() {
            *report.slot_mut(kind) = Some(lost_status());
        }
        info!(
            "reencolando frame {} (tarea {}) por caída del worker {}",
            a.frame, a.task, w.addr
        );
        out.push(DriverUpcall::PutBack { task: a.task, report });
    }
    w.tasks_put_back += n as u64;

    if n > 0 {
        warn!("worker {} perdido con {} tareas asignadas", w.addr, n);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitness::tests::{assign, worker};
    use crate::state::{Dispatch, Stage};
    use common::JobKind;
    use std::time::Duration;

    fn cfg() -> LinkConfig {
        LinkConfig {
            keepalive_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(20),
            ..LinkConfig::new("x")
        }
    }

    #[tokio::test]
    async fn put_back_de_la_mas_vieja_a_la_mas_nueva() {
        let mut w = worker(1, 2, 2, &[(JobKind::Render, "blender")]);
        assign(&mut w, 3);
        let mut out = Vec::new();

        assert_eq!(put_back_all(&mut w, &mut out), 3);
        let ids: Vec<_> = out
            .iter()
            .map(|u| match u {
                DriverUpcall::PutBack { task, report } => {
                    assert!(!report.has_hard_failure());
                    *task
                }
                other => panic!("upcall inesperado: {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1000, 1001, 1002]);
        assert!(w.assigned.is_empty());

        // segunda vez no hay nada
        out.clear();
        assert_eq!(put_back_all(&mut w, &mut out), 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn handshake_colgado_se_cierra() {
        let mut w = worker(1, 2, 2, &[]);
        w.stage = Stage::Connected;
        let later = Instant::now() + Duration::from_secs(21);
        assert_eq!(sweep_once(&w, later, &cfg()), Verdict::Dead("handshake sin respuesta"));
    }

    #[tokio::test]
    async fn dispatch_colgado_se_cierra() {
        let mut w = worker(1, 2, 2, &[]);
        let now = Instant::now();
        w.dispatch = Some(Dispatch {
            task: 1,
            files: Vec::new(),
            sent_at: now,
        });
        assert_eq!(sweep_once(&w, now, &cfg()), Verdict::Healthy);
        assert_eq!(
            sweep_once(&w, now + Duration::from_secs(25), &cfg()),
            Verdict::Dead("TaskRequest sin respuesta")
        );
    }

    #[tokio::test]
    async fn quieta_pide_ping() {
        let w = worker(1, 2, 2, &[]);
        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(sweep_once(&w, later, &cfg()), Verdict::Ping);
    }
}
