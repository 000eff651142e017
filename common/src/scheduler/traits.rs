//! Interfaces entre el scheduler, la fuente de tareas y el driver que las ejecuta.
//!
//! Nada de esto es async: las llamadas no bloquean y los resultados que llegan
//! después vuelven como upcalls, empujados a un `Vec` de salida que el
//! `TaskManager` procesa en orden.

use std::time::Instant;

use tokio::task::JoinHandle;

use crate::task::{ExecReport, Owner, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// Quit inmediato (segundo Ctrl-C)
    Quit,
    /// La fuente se perdió y hay que volver a cero
    Recovery,
    /// Pedido remoto del usuario
    User,
    /// Pedido remoto del servidor (el dispatcher cierra)
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCont {
    Stop,
    Continue,
}

/// Comandos fuera de banda que trae una fuente activa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceControl {
    Kill(KillReason),
    Stop,
    Continue,
    /// Quedarse con a lo sumo `keep` tareas en todo (0 = devolver todas)
    GiveBack { keep: u32 },
}

#[derive(Debug)]
pub enum SourceUpcall {
    Connected,
    ConnectFailed(String),
    NewTask(Task),
    /// Fuente pasiva sin más tareas
    NoMoreTasks,
    Disconnected,
    /// `reply` es el identificador con el que contestar vía `control_done`
    Control {
        reply: Option<u32>,
        ctl: SourceControl,
    },
    UpstreamLost,
}

/// Lo que la fuente puede ver de las colas al decidir si acepta trabajo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueView {
    pub todo: usize,
    pub proc: usize,
    pub done: usize,
    /// `false` mientras hay stop, quit, recovery o el breaker saltó
    pub accepting: bool,
}

pub trait TaskSource {
    type Io;

    /// Activa: empuja tareas y control por su cuenta. Pasiva: hay que pedirle.
    fn is_active(&self) -> bool;

    fn connect(&mut self, out: &mut Vec<SourceUpcall>);

    /// Pide una tarea; llega como `NewTask` o `NoMoreTasks`.
    fn get_task(&mut self, out: &mut Vec<SourceUpcall>);

    /// Devuelve una tarea terminada (o no, si se está vaciando la cola).
    fn done_task(&mut self, task: Task, out: &mut Vec<SourceUpcall>);

    /// Respuesta a `SourceControl::GiveBack`.
    fn give_back_tasks(&mut self, tasks: Vec<Task>, todo_after: usize, proc_after: usize, reply: u32);

    /// Respuesta a los demás `SourceControl`.
    fn control_done(&mut self, reply: u32, ctl: SourceControl, a: u32, b: u32);

    /// El scheduler decidió terminar: no va a aceptar más trabajo.
    fn quitting(&mut self);

    fn disconnect(&mut self, out: &mut Vec<SourceUpcall>);

    /// Se terminó de vaciar todo después de un `UpstreamLost`.
    fn recovery_complete(&mut self, out: &mut Vec<SourceUpcall>);

    fn handle_io(&mut self, ev: Self::Io, view: &QueueView, out: &mut Vec<SourceUpcall>);

    fn on_tick(&mut self, now: Instant, out: &mut Vec<SourceUpcall>);

    /// Tareas de I/O a esperar antes de salir (lo encolado tiene que salir).
    fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchResult {
    Ok(Owner),
    /// Ahora no se puede (no hay ejecutor libre); se reintenta más tarde
    Retry,
    /// Nunca se va a poder; la tarea se da por fallida
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopContResult {
    Done,
    /// Llegará `DriverUpcall::StopContDone`
    InProgress,
}

#[derive(Debug)]
pub enum DriverUpcall {
    Launched(TaskId),
    LaunchFailed {
        task: TaskId,
        fatal: bool,
        report: Option<ExecReport>,
    },
    JobSucceeded {
        task: TaskId,
        report: ExecReport,
    },
    TaskFailed {
        task: TaskId,
        report: ExecReport,
    },
    PutBack {
        task: TaskId,
        report: ExecReport,
    },
    CheckStartNewJobs,
    StopContDone(StopCont),
}

pub trait TaskDriver {
    type Io;

    fn start(&mut self, out: &mut Vec<DriverUpcall>);

    /// Elige qué tarea de `todo` conviene arrancar. `tight` = la fuente no
    /// tiene más trabajo y hay que repartir lo que queda.
    fn task_to_start(&mut self, todo: &[&Task], tight: bool) -> Option<TaskId>;

    fn launch_task(&mut self, task: &Task, out: &mut Vec<DriverUpcall>) -> LaunchResult;

    /// Mata todo lo que está corriendo. Una segunda llamada escala (SIGKILL,
    /// cerrar conexiones). Devuelve cuántas tareas quedan afectadas.
    fn term_all_jobs(&mut self, reason: KillReason, out: &mut Vec<DriverUpcall>) -> usize;

    fn stop_cont_tasks(&mut self, sc: StopCont, out: &mut Vec<DriverUpcall>) -> StopContResult;

    /// Pedir a los ejecutores que devuelvan lo que no empezaron (dejando `keep`).
    fn schedule_give_back(&mut self, keep: usize);

    fn rebalance(&mut self, tight: bool, todo_len: usize);

    fn handle_io(&mut self, ev: Self::Io, out: &mut Vec<DriverUpcall>);

    fn on_tick(&mut self, now: Instant, out: &mut Vec<DriverUpcall>);

    /// Cierre final; devuelve las tareas de I/O a esperar.
    fn shutdown(&mut self) -> Vec<JoinHandle<()>>;
}
