use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    /// Terminar lo que está corriendo y salir
    QuitScheduled,
    /// Sin pedir más: terminar lo que hay en todo y salir
    QuitAfterDrain,
    /// Matar todo y salir
    KillAndQuitNow,
    /// Se perdió la fuente: matar, vaciar y volver a `Running`
    Recovering,
}

impl RunState {
    pub fn is_quitting(self) -> bool {
        matches!(
            self,
            RunState::QuitScheduled | RunState::QuitAfterDrain | RunState::KillAndQuitNow
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopState {
    Running,
    Stopping,
    Stopped,
    Continuing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourcePhase {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub completed: u64,
    pub failed: u64,
    /// Devueltas a la fuente sin terminar
    pub given_back: u64,
    pub put_back: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub todo: usize,
    pub proc: usize,
    pub done: usize,
    pub run: RunState,
    pub stop: StopState,
    pub source: SourcePhase,
    pub failed_in_sequence: u32,
    pub stats: RunStats,
}
