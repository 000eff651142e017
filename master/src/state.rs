// master/src/state.rs

use std::path::PathBuf;
use std::time::Instant;

use common::clock::ClockSkew;
use common::wire::control::ControlQueue;
use common::wire::link::LinkHandle;
use common::wire::{Capability, TaskDone};
use common::{ConnId, FileHandle, FrameNo, JobKind, JobMask, TaskId};
use tokio::task::JoinHandle;

/// Etapa de la conexión con un worker, vista desde el dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// TCP arriba, esperando el challenge
    Connected,
    /// Respondimos el challenge a `sent_ms` (reloj local)
    ResponseSent { sent_ms: i64 },
    Ready,
    /// El worker avisó que se va; no recibe más tareas
    Quitting,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Connected => "connected",
            Stage::ResponseSent { .. } => "response-sent",
            Stage::Ready => "ready",
            Stage::Quitting => "quitting",
        }
    }

    /// Puede hablar del intercambio de tareas.
    pub fn is_session(self) -> bool {
        matches!(self, Stage::Ready | Stage::Quitting)
    }
}

/// Tarea asignada a un worker (aceptada o todavía en dispatch).
#[derive(Debug)]
pub struct Assignment {
    pub task: TaskId,
    pub frame: FrameNo,
    pub mask: JobMask,
    /// (kind, desc) de cada mitad enviada, para decidir si otro worker puede
    pub descs: Vec<(JobKind, String)>,
    /// Dónde van los outputs que suba el worker
    pub outputs: Vec<(JobKind, FileHandle)>,
    pub accepted: bool,
    pub since: Instant,
}

impl Assignment {
    pub fn output(&self, kind: JobKind) -> Option<&FileHandle> {
        self.outputs.iter().find(|(k, _)| *k == kind).map(|(_, h)| h)
    }
}

/// TaskRequest enviado y sin TaskResponse todavía. `files` sigue el orden
/// del manifiesto y mantiene el estado fijo de cada archivo.
#[derive(Debug)]
pub struct Dispatch {
    pub task: TaskId,
    pub files: Vec<FileHandle>,
    pub sent_at: Instant,
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        for h in &self.files {
            h.clear_fixed_state();
        }
    }
}

/// Upload que está llegando: `part` se renombra a `dest` con el DoneComplete.
#[derive(Debug)]
pub struct Upload {
    pub kind: JobKind,
    pub part: PathBuf,
    pub dest: PathBuf,
}

/// Reporte en curso: TaskDone recibido, faltan uploads y/o DoneComplete.
#[derive(Debug)]
pub struct InboundReport {
    pub done: TaskDone,
    /// Mitades cuyo output se espera
    pub expected: Vec<JobKind>,
    pub received: Vec<Upload>,
    pub current: Option<Upload>,
    /// Uploads que llegaron pero no se pudieron guardar
    pub failed: Vec<JobKind>,
}

impl InboundReport {
    pub fn discard_parts(&mut self) {
        for up in self.received.drain(..).chain(self.current.take()) {
            let _ = std::fs::remove_file(&up.part);
        }
    }
}

#[derive(Debug)]
pub struct WorkerLink {
    pub id: ConnId,
    pub addr: String,
    pub link: LinkHandle,
    pub writer: Option<JoinHandle<()>>,
    pub stage: Stage,
    pub skew: ClockSkew,
    pub max_jobs: usize,
    pub capacity: usize,
    pub caps: Vec<Capability>,

    // de la más vieja a la más nueva
    pub assigned: Vec<Assignment>,
    pub dispatch: Option<Dispatch>,
    pub report: Option<InboundReport>,
    pub control: ControlQueue,

    pub no_more_tasks: bool,
    pub give_back_pending: bool,
    pub kill_sent: bool,

    // Métricas
    pub connected_at: Instant,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_put_back: u64,
}

impl WorkerLink {
    pub fn new(id: ConnId, addr: String, link: LinkHandle, writer: JoinHandle<()>) -> Self {
        Self {
            id,
            addr,
            link,
            writer: Some(writer),
            stage: Stage::Connected,
            skew: ClockSkew::default(),
            max_jobs: 0,
            capacity: 0,
            caps: Vec::new(),
            assigned: Vec::new(),
            dispatch: None,
            report: None,
            control: ControlQueue::new(),
            no_more_tasks: false,
            give_back_pending: false,
            kill_sent: false,
            connected_at: Instant::now(),
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            tasks_put_back: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.stage == Stage::Ready
    }

    pub fn can_do(&self, kind: JobKind, desc: &str) -> bool {
        self.caps.iter().any(|c| c.kind == kind && c.desc == desc)
    }

    pub fn assignment_mut(&mut self, task: TaskId) -> Option<&mut Assignment> {
        self.assigned.iter_mut().find(|a| a.task == task)
    }

    pub fn take_assignment(&mut self, task: TaskId) -> Option<Assignment> {
        let pos = self.assigned.iter().position(|a| a.task == task)?;
        Some(self.assigned.remove(pos))
    }
}
