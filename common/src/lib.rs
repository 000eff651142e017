//! Tipos y maquinaria compartida entre `master` (dispatcher) y `worker`.

pub mod clock;
pub mod config;
pub mod error;
pub mod files;
pub mod logging;
pub mod scheduler;
pub mod task;
pub mod wire;

pub use error::{ProtocolError, SourceError};
pub use files::{DeletePolicy, FileHandle, FileRegistry, FileRole};
pub use task::{ConnId, ExecReport, ExecStatus, FrameNo, JobKind, JobMask, JobSpec, Owner, Task, TaskId, TaskState};
