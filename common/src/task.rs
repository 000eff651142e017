use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::files::FileHandle;

pub type TaskId = u64;
pub type FrameNo = i32;
pub type ConnId = u64;

/* --------- Tipos de sub-job --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Render,
    Filter,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Render, JobKind::Filter];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Render => "render",
            JobKind::Filter => "filter",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qué mitades de una tarea se asignan a un ejecutor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobMask {
    pub render: bool,
    pub filter: bool,
}

impl JobMask {
    pub const NONE: JobMask = JobMask {
        render: false,
        filter: false,
    };

    pub fn only(kind: JobKind) -> Self {
        let mut m = Self::NONE;
        m.set(kind);
        m
    }

    pub fn set(&mut self, kind: JobKind) {
        match kind {
            JobKind::Render => self.render = true,
            JobKind::Filter => self.filter = true,
        }
    }

    pub fn has(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::Render => self.render,
            JobKind::Filter => self.filter,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.render && !self.filter
    }

    /// `true` si esta máscara cubre todas las mitades de `other`.
    pub fn covers(&self, other: JobMask) -> bool {
        (!other.render || self.render) && (!other.filter || self.filter)
    }

    pub fn kinds(self) -> impl Iterator<Item = JobKind> {
        JobKind::ALL.into_iter().filter(move |k| self.has(*k))
    }
}

/* --------- Estado de ejecución --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TermReason {
    /// Todavía no se ejecutó
    #[default]
    Unset,
    /// Terminó por sí mismo; `ExecStatus::code` es el exit code
    Exited,
    /// Terminó por una señal que no enviamos nosotros
    Signaled,
    /// Se pasó del timeout del job
    Timeout,
    /// No se pudo lanzar el proceso
    LaunchFailed,
    /// Lo matamos nosotros (quit, recovery, kill remoto)
    Killed,
    /// Falló la transferencia de archivos con el worker
    TransferFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputState {
    #[default]
    Unset,
    Bad,
    Resumable,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStatus {
    pub reason: TermReason,
    /// exit code o número de señal, según `reason`
    pub code: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cpu_time: Duration,
    pub output: OutputState,
}

impl ExecStatus {
    pub fn is_success(&self) -> bool {
        self.reason == TermReason::Exited && self.code == 0 && self.output != OutputState::Bad
    }

    /// Fallo "duro": volver a intentarlo igual no tiene sentido sin contar el fallo.
    pub fn is_hard_failure(&self) -> bool {
        match self.reason {
            TermReason::Exited => self.code != 0 || self.output == OutputState::Bad,
            TermReason::Signaled | TermReason::Timeout | TermReason::LaunchFailed => true,
            TermReason::Unset | TermReason::Killed | TermReason::TransferFailed => false,
        }
    }

    pub fn killed() -> Self {
        Self {
            reason: TermReason::Killed,
            ended_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn launch_failed() -> Self {
        Self {
            reason: TermReason::LaunchFailed,
            code: -1,
            ended_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// Resultado que un driver reporta para una tarea: sólo trae las mitades que ejecutó.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecReport {
    pub render: Option<ExecStatus>,
    pub filter: Option<ExecStatus>,
}

impl ExecReport {
    pub fn single(kind: JobKind, status: ExecStatus) -> Self {
        let mut r = Self::default();
        *r.slot_mut(kind) = Some(status);
        r
    }

    pub fn get(&self, kind: JobKind) -> Option<&ExecStatus> {
        match kind {
            JobKind::Render => self.render.as_ref(),
            JobKind::Filter => self.filter.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, kind: JobKind) -> &mut Option<ExecStatus> {
        match kind {
            JobKind::Render => &mut self.render,
            JobKind::Filter => &mut self.filter,
        }
    }

    pub fn has_hard_failure(&self) -> bool {
        JobKind::ALL
            .iter()
            .filter_map(|k| self.get(*k))
            .any(ExecStatus::is_hard_failure)
    }
}

/* --------- Tarea --------- */

#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Nombre del renderer/filtro; se compara con las capacidades del worker
    pub desc: String,
    pub input: FileHandle,
    pub output: FileHandle,
    pub format: String,
    pub args: Vec<String>,
    pub additional: Vec<FileHandle>,
    pub timeout: Option<Duration>,
    pub status: ExecStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    ToBeRendered,
    ToBeFiltered,
    Done,
}

/// Quién tiene la tarea mientras está en `proc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Local,
    Worker(ConnId),
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub frame: FrameNo,
    pub render: Option<JobSpec>,
    pub filter: Option<JobSpec>,
    pub state: TaskState,
    pub owner: Option<Owner>,
    /// Se dio por perdida (fallo duro); vive en `done` igual que una completa
    pub failed: bool,
    /// Un worker la devolvió sin procesarla
    pub given_back: bool,
    pub put_backs: u32,
}

impl Task {
    pub fn new(id: TaskId, frame: FrameNo, render: Option<JobSpec>, filter: Option<JobSpec>) -> Self {
        let state = if render.is_some() {
            TaskState::ToBeRendered
        } else if filter.is_some() {
            TaskState::ToBeFiltered
        } else {
            TaskState::Done
        };

        Self {
            id,
            frame,
            render,
            filter,
            state,
            owner: None,
            failed: false,
            given_back: false,
            put_backs: 0,
        }
    }

    pub fn job(&self, kind: JobKind) -> Option<&JobSpec> {
        match kind {
            JobKind::Render => self.render.as_ref(),
            JobKind::Filter => self.filter.as_ref(),
        }
    }

    pub fn job_mut(&mut self, kind: JobKind) -> Option<&mut JobSpec> {
        match kind {
            JobKind::Render => self.render.as_mut(),
            JobKind::Filter => self.filter.as_mut(),
        }
    }

    /// Siguiente mitad que hay que ejecutar.
    pub fn next_kind(&self) -> Option<JobKind> {
        match self.state {
            TaskState::ToBeRendered => Some(JobKind::Render),
            TaskState::ToBeFiltered => Some(JobKind::Filter),
            TaskState::Done => None,
        }
    }

    /// Todas las mitades que faltan.
    pub fn pending_kinds(&self) -> JobMask {
        let mut m = JobMask::NONE;
        match self.state {
            TaskState::ToBeRendered => {
                m.render = true;
                m.filter = self.filter.is_some();
            }
            TaskState::ToBeFiltered => m.filter = true,
            TaskState::Done => {}
        }
        m
    }

    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Done || self.failed
    }

    /// Copia el reporte en los registros de estado y avanza `state` por cada
    /// mitad que terminó bien. Devuelve `true` si hubo algún fallo duro.
    pub fn commit_report(&mut self, report: &ExecReport) -> bool {
        for kind in JobKind::ALL {
            if let (Some(status), Some(job)) = (report.get(kind), self.job_mut(kind)) {
                job.status = status.clone();
            }
        }

        if self.state == TaskState::ToBeRendered
            && report.render.as_ref().is_some_and(ExecStatus::is_success)
        {
            self.state = if self.filter.is_some() {
                TaskState::ToBeFiltered
            } else {
                TaskState::Done
            };
        }
        if self.state == TaskState::ToBeFiltered
            && report.filter.as_ref().is_some_and(ExecStatus::is_success)
        {
            self.state = TaskState::Done;
        }

        report.has_hard_failure()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {} (tarea {})", self.frame, self.id)
    }
}
