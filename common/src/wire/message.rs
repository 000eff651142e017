use serde::{Deserialize, Serialize};

use crate::task::{ExecStatus, FrameNo, JobKind, TaskId};

use super::{CHALLENGE_LEN, RESPONSE_LEN};

/// Código de comando del header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    ChallengeRequest = 1,
    ChallengeResponse = 2,
    NowConnected = 3,
    TaskRequest = 4,
    FileRequest = 5,
    FileDownload = 6,
    TaskResponse = 7,
    TaskDone = 8,
    FileUpload = 9,
    DoneComplete = 10,
    ControlRequest = 11,
    ControlResponse = 12,
}

impl Command {
    pub fn from_u16(raw: u16) -> Option<Self> {
        use Command::*;
        Some(match raw {
            1 => ChallengeRequest,
            2 => ChallengeResponse,
            3 => NowConnected,
            4 => TaskRequest,
            5 => FileRequest,
            6 => FileDownload,
            7 => TaskResponse,
            8 => TaskDone,
            9 => FileUpload,
            10 => DoneComplete,
            11 => ControlRequest,
            12 => ControlResponse,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use Command::*;
        match self {
            ChallengeRequest => "ChallengeRequest",
            ChallengeResponse => "ChallengeResponse",
            NowConnected => "NowConnected",
            TaskRequest => "TaskRequest",
            FileRequest => "FileRequest",
            FileDownload => "FileDownload",
            TaskResponse => "TaskResponse",
            TaskDone => "TaskDone",
            FileUpload => "FileUpload",
            DoneComplete => "DoneComplete",
            ControlRequest => "ControlRequest",
            ControlResponse => "ControlResponse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Accepted,
    AuthFailed,
    AlreadyConnected,
    Busy,
}

/// Lo que un worker sabe ejecutar: tipo de job + nombre del renderer/filtro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub kind: JobKind,
    pub desc: String,
}

/// Un sub-job dentro de un `TaskRequest`. Los archivos se nombran con su
/// nombre en el manifiesto (relativo al directorio de trabajo del worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub kind: JobKind,
    pub desc: String,
    pub input: String,
    pub output: String,
    pub format: String,
    /// 0 = sin timeout
    pub timeout_ms: u32,
    pub args: Vec<String>,
    pub additional: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    /// mtime con el reloj del dispatcher
    pub mtime_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub frame: FrameNo,
    pub jobs: Vec<JobRequest>,
    pub files: Vec<ManifestEntry>,
}

impl TaskRequest {
    pub fn job(&self, kind: JobKind) -> Option<&JobRequest> {
        self.jobs.iter().find(|j| j.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResponseCode {
    Accepted,
    Busy,
    Unsupported,
    Quitting,
    TransferFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    /// Se ejecutó (bien o mal); los estados vienen en el mensaje
    Processed,
    /// Se devuelve sin ejecutar
    GivenBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDone {
    pub task_id: TaskId,
    pub outcome: DoneOutcome,
    pub render: Option<ExecStatus>,
    pub filter: Option<ExecStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCmd {
    KillUser,
    KillServer,
    Stop,
    Continue,
    Ping,
    ClientQuit,
    NoMoreTasks,
    /// El worker se queda con a lo sumo `keep` tareas (0 = devolver todas)
    GiveBack { keep: u32 },
}

impl ControlCmd {
    pub fn name(self) -> &'static str {
        match self {
            ControlCmd::KillUser => "kill-user",
            ControlCmd::KillServer => "kill-server",
            ControlCmd::Stop => "stop",
            ControlCmd::Continue => "continue",
            ControlCmd::Ping => "ping",
            ControlCmd::ClientQuit => "client-quit",
            ControlCmd::NoMoreTasks => "no-more-tasks",
            ControlCmd::GiveBack { .. } => "give-back",
        }
    }

    /// Mismo comando sin mirar argumentos.
    pub fn same_kind(self, other: ControlCmd) -> bool {
        std::mem::discriminant(&self) == std::mem::discriminant(&other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    Ok,
    Refused,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ChallengeRequest {
        challenge: [u8; CHALLENGE_LEN],
        now_ms: i64,
        max_jobs: u16,
        task_capacity: u16,
    },
    ChallengeResponse {
        response: [u8; RESPONSE_LEN],
        now_ms: i64,
    },
    NowConnected {
        code: ConnectCode,
        now_ms: i64,
        capabilities: Vec<Capability>,
    },
    TaskRequest(TaskRequest),
    FileRequest {
        task_id: TaskId,
        index: u16,
    },
    /// Lo sigue un cuerpo de `size` bytes
    FileDownload {
        task_id: TaskId,
        index: u16,
        size: u64,
    },
    TaskResponse {
        task_id: TaskId,
        code: TaskResponseCode,
    },
    TaskDone(TaskDone),
    /// Lo sigue un cuerpo de `size` bytes
    FileUpload {
        task_id: TaskId,
        kind: JobKind,
        size: u64,
    },
    DoneComplete {
        task_id: TaskId,
    },
    ControlRequest {
        seq: u32,
        cmd: ControlCmd,
    },
    ControlResponse {
        seq: u32,
        cmd: ControlCmd,
        status: ControlStatus,
        a: u32,
        b: u32,
    },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::ChallengeRequest { .. } => Command::ChallengeRequest,
            Message::ChallengeResponse { .. } => Command::ChallengeResponse,
            Message::NowConnected { .. } => Command::NowConnected,
            Message::TaskRequest(_) => Command::TaskRequest,
            Message::FileRequest { .. } => Command::FileRequest,
            Message::FileDownload { .. } => Command::FileDownload,
            Message::TaskResponse { .. } => Command::TaskResponse,
            Message::TaskDone(_) => Command::TaskDone,
            Message::FileUpload { .. } => Command::FileUpload,
            Message::DoneComplete { .. } => Command::DoneComplete,
            Message::ControlRequest { .. } => Command::ControlRequest,
            Message::ControlResponse { .. } => Command::ControlResponse,
        }
    }

    pub fn name(&self) -> &'static str {
        self.command().name()
    }

    /// Tamaño del cuerpo de archivo que sigue al mensaje, si lo hay.
    pub fn body_len(&self) -> Option<u64> {
        match self {
            Message::FileDownload { size, .. } | Message::FileUpload { size, .. } => Some(*size),
            _ => None,
        }
    }
}
