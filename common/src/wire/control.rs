//! Comandos de control pendientes y keepalive de una conexión.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::LinkConfig;
use crate::error::ProtocolError;

use super::message::ControlCmd;

#[derive(Debug, Clone, Copy)]
pub struct PendingControl {
    pub seq: u32,
    pub cmd: ControlCmd,
    pub sent_at: Instant,
}

/// Requests de control enviados que esperan respuesta, en orden de envío.
#[derive(Debug, Default)]
pub struct ControlQueue {
    next_seq: u32,
    pending: VecDeque<PendingControl>,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un request nuevo y devuelve su número de secuencia.
    pub fn issue(&mut self, cmd: ControlCmd, now: Instant) -> u32 {
        self.next_seq = self.next_seq.wrapping_add(1);
        let seq = self.next_seq;
        self.pending.push_back(PendingControl {
            seq,
            cmd,
            sent_at: now,
        });
        seq
    }

    /// Empareja una respuesta. Una respuesta a algo que no pedimos es una
    /// violación de protocolo.
    pub fn resolve(&mut self, seq: u32, cmd: ControlCmd) -> Result<PendingControl, ProtocolError> {
        self.pending
            .iter()
            .position(|p| p.seq == seq && p.cmd.same_kind(cmd))
            .and_then(|pos| self.pending.remove(pos))
            .ok_or(ProtocolError::Unexpected {
                got: "ControlResponse",
                state: "sin request pendiente",
            })
    }

    pub fn is_pending(&self, cmd: ControlCmd) -> bool {
        self.pending.iter().any(|p| p.cmd.same_kind(cmd))
    }

    /// El request más viejo que ya superó `timeout`.
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Option<&PendingControl> {
        self.pending
            .iter()
            .find(|p| now.saturating_duration_since(p.sent_at) >= timeout)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    Nothing,
    Ping,
    Close,
}

/// `idle` es el tiempo sin tráfico en ningún sentido (cualquier byte cuenta).
/// Se cierra sólo si hay un request vencido y además la conexión está quieta:
/// mientras se bombean archivos la respuesta puede venir atrasada.
pub fn keepalive_check(idle: Duration, queue: &ControlQueue, now: Instant, cfg: &LinkConfig) -> KeepAlive {
    if idle >= cfg.response_timeout && queue.overdue(now, cfg.response_timeout).is_some() {
        return KeepAlive::Close;
    }
    if idle >= cfg.keepalive_interval && !queue.is_pending(ControlCmd::Ping) {
        return KeepAlive::Ping;
    }
    KeepAlive::Nothing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LinkConfig {
        LinkConfig {
            keepalive_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(20),
            ..LinkConfig::new("x")
        }
    }

    #[test]
    fn respuestas_se_emparejan_por_secuencia() {
        let now = Instant::now();
        let mut q = ControlQueue::new();
        let a = q.issue(ControlCmd::Stop, now);
        let b = q.issue(ControlCmd::Ping, now);
        assert_ne!(a, b);

        assert_eq!(q.resolve(b, ControlCmd::Ping).unwrap().seq, b);
        assert_eq!(q.len(), 1);
        // repetir la misma respuesta ya no matchea
        assert!(q.resolve(b, ControlCmd::Ping).is_err());
        // seq correcta con otro comando tampoco
        assert!(q.resolve(a, ControlCmd::Continue).is_err());
        assert!(q.resolve(a, ControlCmd::Stop).is_ok());
        assert!(q.is_empty());
    }

    #[test]
    fn keepalive_pinguea_y_despues_cierra() {
        let t0 = Instant::now();
        let mut q = ControlQueue::new();
        let c = cfg();

        assert_eq!(keepalive_check(Duration::from_secs(5), &q, t0, &c), KeepAlive::Nothing);
        assert_eq!(keepalive_check(Duration::from_secs(30), &q, t0, &c), KeepAlive::Ping);

        q.issue(ControlCmd::Ping, t0);
        // ping en vuelo: no se manda otro
        assert_eq!(keepalive_check(Duration::from_secs(31), &q, t0, &c), KeepAlive::Nothing);

        let later = t0 + Duration::from_secs(21);
        assert_eq!(keepalive_check(Duration::from_secs(51), &q, later, &c), KeepAlive::Close);
        // hubo tráfico reciente: se espera aunque el ping esté vencido
        assert_eq!(keepalive_check(Duration::from_secs(1), &q, later, &c), KeepAlive::Nothing);
    }
}
