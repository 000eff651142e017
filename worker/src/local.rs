//! Driver local: cada mitad de una tarea corre como un proceso del sistema.
//!
//! El renderer/filtro recibe todo por variables de entorno (`FARM_INPUT`,
//! `FARM_OUTPUT`, `FARM_FORMAT`, `FARM_FRAME`, `FARM_KIND`,
//! `FARM_ADDITIONAL`); los argumentos son los de la herramienta seguidos de
//! los del job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::scheduler::{DriverUpcall, KillReason, LaunchResult, StopCont, StopContResult, TaskDriver};
use common::task::{ExecReport, ExecStatus, OutputState, TermReason};
use common::wire::Capability;
use common::{FrameNo, JobKind, Owner, Task, TaskId};

/// Una herramienta instalada en este worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub kind: JobKind,
    /// Nombre con el que el dispatcher la pide
    pub desc: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn capability(&self) -> Capability {
        Capability {
            kind: self.kind,
            desc: self.desc.clone(),
        }
    }
}

/// Cómo terminó un proceso, visto desde la tarea que lo espera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    pub reason: TermReason,
    pub code: i32,
    pub output: OutputState,
}

#[derive(Debug)]
pub enum LocalIo {
    Exited {
        task: TaskId,
        kind: JobKind,
        end: Finished,
        at: DateTime<Utc>,
    },
}

struct Running {
    frame: FrameNo,
    kind: JobKind,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    since: Instant,
    /// Lo matamos nosotros: el resultado es un put-back, no un fallo
    killed: bool,
    term_sent: bool,
    hard_kill: Option<oneshot::Sender<()>>,
    waiter: JoinHandle<()>,
}

pub struct LocalDriver {
    tools: Vec<ToolSpec>,
    slots: Arc<Semaphore>,
    max_jobs: usize,
    io_tx: mpsc::UnboundedSender<LocalIo>,
    running: HashMap<TaskId, Running>,
}

impl LocalDriver {
    pub fn new(tools: Vec<ToolSpec>, max_jobs: usize, io_tx: mpsc::UnboundedSender<LocalIo>) -> Self {
        let max_jobs = max_jobs.max(1);
        Self {
            tools,
            slots: Arc::new(Semaphore::new(max_jobs)),
            max_jobs,
            io_tx,
            running: HashMap::new(),
        }
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    fn tool(&self, kind: JobKind, desc: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.kind == kind && t.desc == desc)
    }

    fn can_run(&self, task: &Task) -> bool {
        task.next_kind()
            .and_then(|k| task.job(k).map(|j| (k, j)))
            .is_some_and(|(k, j)| self.tool(k, &j.desc).is_some())
    }

    fn spawn(&self, task: &Task, kind: JobKind, tool: &ToolSpec, permit: OwnedSemaphorePermit) -> std::io::Result<Running> {
        let Some(job) = task.job(kind) else {
            return Err(std::io::Error::other(format!("la tarea no tiene {kind}")));
        };
        let output = job.output.path().to_path_buf();
        // un output viejo haría pasar por bueno un proceso que no escribió nada
        if let Err(e) = std::fs::remove_file(&output) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("no se pudo borrar el output viejo {}: {}", output.display(), e);
            }
        }
        let additional = std::env::join_paths(job.additional.iter().map(|h| h.path()))
            .map_err(std::io::Error::other)?;

        let child = Command::new(&tool.program)
            .args(&tool.args)
            .args(&job.args)
            .env("FARM_INPUT", job.input.path())
            .env("FARM_OUTPUT", &output)
            .env("FARM_FORMAT", &job.format)
            .env("FARM_FRAME", task.frame.to_string())
            .env("FARM_KIND", kind.as_str())
            .env("FARM_ADDITIONAL", additional)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let tx = self.io_tx.clone();
        let id = task.id;
        let limit = job.timeout;

        let waiter = tokio::spawn(async move {
            let end = supervise(child, limit, kill_rx, output).await;
            drop(permit);
            let _ = tx.send(LocalIo::Exited {
                task: id,
                kind,
                end,
                at: Utc::now(),
            });
        });

        Ok(Running {
            frame: task.frame,
            kind,
            pid,
            started_at: Utc::now(),
            since: Instant::now(),
            killed: false,
            term_sent: false,
            hard_kill: Some(kill_tx),
            waiter,
        })
    }
}

/* --------- Supervisión del proceso --------- */

async fn expire(limit: Option<Duration>) {
    match limit {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

fn classify(status: ExitStatus) -> (TermReason, i32) {
    if let Some(code) = status.code() {
        return (TermReason::Exited, code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (TermReason::Signaled, sig);
        }
    }
    (TermReason::Signaled, -1)
}

async fn supervise(
    mut child: Child,
    limit: Option<Duration>,
    mut hard_kill: oneshot::Receiver<()>,
    output: PathBuf,
) -> Finished {
    let deadline = expire(limit);
    tokio::pin!(deadline);

    let waited = tokio::select! {
        r = child.wait() => r.map(classify),
        _ = &mut deadline => child.kill().await.map(|_| (TermReason::Timeout, 0)),
        Ok(()) = &mut hard_kill => child.kill().await.map(|_| (TermReason::Killed, 9)),
    };

    let (reason, code) = match waited {
        Ok(rc) => rc,
        Err(e) => {
            error!("no se pudo esperar al proceso: {}", e);
            (TermReason::LaunchFailed, -1)
        }
    };

    // 0 sin output no es éxito
    let output = if reason == TermReason::Exited && code == 0 {
        match tokio::fs::metadata(&output).await {
            Ok(m) if m.len() > 0 => OutputState::Complete,
            _ => OutputState::Bad,
        }
    } else {
        OutputState::Unset
    };

    Finished { reason, code, output }
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, sig: libc::c_int) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    // SAFETY: kill(2) no toca memoria; un pid que ya no existe da ESRCH
    unsafe { libc::kill(pid as libc::pid_t, sig) == 0 }
}

/* --------- TaskDriver --------- */

impl TaskDriver for LocalDriver {
    type Io = LocalIo;

    fn start(&mut self, _out: &mut Vec<DriverUpcall>) {
        let tools: Vec<String> = self.tools.iter().map(|t| format!("{}:{}", t.kind, t.desc)).collect();
        info!("driver local: {} procesos en paralelo, herramientas [{}]", self.max_jobs, tools.join(", "));
    }

    fn task_to_start(&mut self, todo: &[&Task], _tight: bool) -> Option<TaskId> {
        if self.slots.available_permits() == 0 {
            return None;
        }
        // una tarea sin herramienta se ofrece igual para que falle
        todo.iter()
            .find(|t| self.can_run(t))
            .or_else(|| todo.first())
            .map(|t| t.id)
    }

    fn launch_task(&mut self, task: &Task, out: &mut Vec<DriverUpcall>) -> LaunchResult {
        let Some(kind) = task.next_kind() else {
            return LaunchResult::Fatal;
        };
        let Some(tool) = task.job(kind).and_then(|j| self.tool(kind, &j.desc)).cloned() else {
            error!("{}: no hay herramienta para {}", task, kind);
            return LaunchResult::Fatal;
        };
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            return LaunchResult::Retry;
        };

        match self.spawn(task, kind, &tool, permit) {
            Ok(r) => {
                info!("{}: {} con {} (pid {:?})", task, kind, tool.program.display(), r.pid);
                self.running.insert(task.id, r);
                out.push(DriverUpcall::Launched(task.id));
            }
            Err(e) => {
                error!("{}: no se pudo lanzar {}: {}", task, tool.program.display(), e);
                out.push(DriverUpcall::LaunchFailed {
                    task: task.id,
                    fatal: true,
                    report: Some(ExecReport::single(kind, ExecStatus::launch_failed())),
                });
            }
        }
        LaunchResult::Ok(Owner::Local)
    }

    fn term_all_jobs(&mut self, reason: KillReason, _out: &mut Vec<DriverUpcall>) -> usize {
        for (id, r) in self.running.iter_mut() {
            r.killed = true;
            if r.term_sent {
                debug!("tarea {}: SIGKILL", id);
                if let Some(tx) = r.hard_kill.take() {
                    let _ = tx.send(());
                }
                continue;
            }
            r.term_sent = true;

            #[cfg(unix)]
            {
                // un proceso suspendido no atiende el SIGTERM
                if send_signal(r.pid, libc::SIGTERM) {
                    send_signal(r.pid, libc::SIGCONT);
                    continue;
                }
            }
            if let Some(tx) = r.hard_kill.take() {
                let _ = tx.send(());
            }
        }
        if !self.running.is_empty() {
            warn!("kill ({:?}) a {} procesos", reason, self.running.len());
        }
        self.running.len()
    }

    fn stop_cont_tasks(&mut self, sc: StopCont, _out: &mut Vec<DriverUpcall>) -> StopContResult {
        #[cfg(unix)]
        {
            let sig = match sc {
                StopCont::Stop => libc::SIGSTOP,
                StopCont::Continue => libc::SIGCONT,
            };
            for (id, r) in &self.running {
                if !send_signal(r.pid, sig) {
                    debug!("tarea {}: no se pudo mandar {:?}", id, sc);
                }
            }
        }
        #[cfg(not(unix))]
        if !self.running.is_empty() {
            warn!("{:?} no está soportado en esta plataforma", sc);
        }
        StopContResult::Done
    }

    // sin cola propia: todo lo que no arrancó sigue en el scheduler
    fn schedule_give_back(&mut self, _keep: usize) {}

    fn rebalance(&mut self, _tight: bool, _todo_len: usize) {}

    fn handle_io(&mut self, ev: LocalIo, out: &mut Vec<DriverUpcall>) {
        let LocalIo::Exited { task, kind, end, at } = ev;
        let Some(r) = self.running.remove(&task) else {
            debug!("fin de la tarea {} que no estaba corriendo", task);
            return;
        };
        debug_assert_eq!(r.kind, kind);

        let mut status = ExecStatus {
            reason: end.reason,
            code: end.code,
            started_at: Some(r.started_at),
            ended_at: Some(at),
            cpu_time: Duration::ZERO,
            output: end.output,
        };
        if r.killed && !status.is_success() {
            status.reason = TermReason::Killed;
        }
        let report = ExecReport::single(kind, status.clone());

        let upcall = if status.is_success() {
            info!("frame {} (tarea {}): {} ok en {:?}", r.frame, task, kind, r.since.elapsed());
            DriverUpcall::JobSucceeded { task, report }
        } else if status.reason == TermReason::Killed {
            info!("frame {} (tarea {}): {} interrumpido", r.frame, task, kind);
            DriverUpcall::PutBack { task, report }
        } else {
            warn!(
                "frame {} (tarea {}): {} falló ({:?} {}, output {:?})",
                r.frame, task, kind, status.reason, status.code, status.output
            );
            DriverUpcall::TaskFailed { task, report }
        };
        out.push(upcall);
        out.push(DriverUpcall::CheckStartNewJobs);
    }

    fn on_tick(&mut self, _now: Instant, _out: &mut Vec<DriverUpcall>) {}

    fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        self.running.drain().map(|(_, r)| r.waiter).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{FileRegistry, FileRole, JobSpec};
    use std::path::Path;

    fn sh(kind: JobKind, desc: &str, script: &str) -> ToolSpec {
        ToolSpec {
            kind,
            desc: desc.into(),
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn render_task(reg: &FileRegistry, dir: &Path, id: TaskId, timeout: Option<Duration>) -> Task {
        let frame = id as FrameNo;
        let input = dir.join(format!("scene-{frame}.blend"));
        std::fs::write(&input, b"escena").unwrap();
        let spec = JobSpec {
            desc: "blender".into(),
            input: reg.get_or_create(input, FileRole::RenderInput),
            output: reg.get_or_create(dir.join(format!("frame-{frame}.png")), FileRole::RenderOutput),
            format: "png".into(),
            args: Vec::new(),
            additional: Vec::new(),
            timeout,
            status: ExecStatus::default(),
        };
        Task::new(id, frame, Some(spec), None)
    }

    struct Harness {
        drv: LocalDriver,
        rx: mpsc::UnboundedReceiver<LocalIo>,
        out: Vec<DriverUpcall>,
    }

    impl Harness {
        fn new(tools: Vec<ToolSpec>, max_jobs: usize) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                drv: LocalDriver::new(tools, max_jobs, tx),
                rx,
                out: Vec::new(),
            }
        }

        /// Espera el próximo proceso que termina y devuelve su upcall principal.
        async fn next_end(&mut self) -> DriverUpcall {
            let ev = tokio::time::timeout(Duration::from_secs(10), self.rx.recv())
                .await
                .expect("timeout esperando al proceso")
                .expect("canal cerrado");
            let mut out = Vec::new();
            self.drv.handle_io(ev, &mut out);
            assert!(matches!(out.last(), Some(DriverUpcall::CheckStartNewJobs)));
            out.remove(0)
        }
    }

    #[tokio::test]
    async fn proceso_que_escribe_el_output_termina_bien() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let t = render_task(&reg, dir.path(), 1, None);
        let mut h = Harness::new(vec![sh(JobKind::Render, "blender", "cp \"$FARM_INPUT\" \"$FARM_OUTPUT\"")], 2);

        assert_eq!(h.drv.task_to_start(&[&t], false), Some(1));
        assert_eq!(h.drv.launch_task(&t, &mut h.out), LaunchResult::Ok(Owner::Local));
        assert!(matches!(h.out.as_slice(), [DriverUpcall::Launched(1)]));

        match h.next_end().await {
            DriverUpcall::JobSucceeded { task: 1, report } => {
                let st = report.render.unwrap();
                assert_eq!(st.output, OutputState::Complete);
                assert!(st.started_at.is_some() && st.ended_at.is_some());
            }
            other => panic!("upcall inesperado: {other:?}"),
        }
        assert_eq!(std::fs::read(dir.path().join("frame-1.png")).unwrap(), b"escena");
        assert_eq!(h.drv.running(), 0);
    }

    #[tokio::test]
    async fn exit_distinto_de_cero_es_fallo() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let t = render_task(&reg, dir.path(), 1, None);
        let mut h = Harness::new(vec![sh(JobKind::Render, "blender", "exit 3")], 1);

        h.drv.launch_task(&t, &mut h.out);
        match h.next_end().await {
            DriverUpcall::TaskFailed { task: 1, report } => {
                let st = report.render.unwrap();
                assert_eq!((st.reason, st.code), (TermReason::Exited, 3));
                assert!(st.is_hard_failure());
            }
            other => panic!("upcall inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_cero_sin_output_es_fallo() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let t = render_task(&reg, dir.path(), 1, None);
        // un output de una corrida anterior no cuenta
        std::fs::write(dir.path().join("frame-1.png"), b"viejo").unwrap();
        let mut h = Harness::new(vec![sh(JobKind::Render, "blender", "true")], 1);

        h.drv.launch_task(&t, &mut h.out);
        match h.next_end().await {
            DriverUpcall::TaskFailed { report, .. } => {
                assert_eq!(report.render.unwrap().output, OutputState::Bad);
            }
            other => panic!("upcall inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_mata_el_proceso() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let t = render_task(&reg, dir.path(), 1, Some(Duration::from_millis(100)));
        let mut h = Harness::new(vec![sh(JobKind::Render, "blender", "sleep 30")], 1);

        h.drv.launch_task(&t, &mut h.out);
        match h.next_end().await {
            DriverUpcall::TaskFailed { report, .. } => {
                assert_eq!(report.render.unwrap().reason, TermReason::Timeout);
            }
            other => panic!("upcall inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn kill_devuelve_la_tarea() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let t = render_task(&reg, dir.path(), 1, None);
        let mut h = Harness::new(vec![sh(JobKind::Render, "blender", "sleep 30")], 1);

        h.drv.launch_task(&t, &mut h.out);
        assert_eq!(h.drv.term_all_jobs(KillReason::Recovery, &mut h.out), 1);
        match h.next_end().await {
            DriverUpcall::PutBack { task: 1, report } => {
                let st = report.render.unwrap();
                assert_eq!(st.reason, TermReason::Killed);
                assert!(!st.is_hard_failure());
            }
            other => panic!("upcall inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn segundo_kill_escala() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let t = render_task(&reg, dir.path(), 1, None);
        // ignora SIGTERM
        let mut h = Harness::new(vec![sh(JobKind::Render, "blender", "trap '' TERM; sleep 30")], 1);

        h.drv.launch_task(&t, &mut h.out);
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.drv.term_all_jobs(KillReason::Quit, &mut h.out);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.drv.running(), 1);
        h.drv.term_all_jobs(KillReason::Quit, &mut h.out);

        assert!(matches!(h.next_end().await, DriverUpcall::PutBack { task: 1, .. }));
    }

    #[tokio::test]
    async fn sin_herramienta_es_fatal_y_sin_slot_se_reintenta() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let t1 = render_task(&reg, dir.path(), 1, None);
        let t2 = render_task(&reg, dir.path(), 2, None);

        let mut h = Harness::new(vec![sh(JobKind::Render, "cycles", "true")], 1);
        assert_eq!(h.drv.launch_task(&t1, &mut h.out), LaunchResult::Fatal);

        let mut h = Harness::new(vec![sh(JobKind::Render, "blender", "sleep 30")], 1);
        h.drv.launch_task(&t1, &mut h.out);
        assert_eq!(h.drv.task_to_start(&[&t2], false), None);
        assert_eq!(h.drv.launch_task(&t2, &mut h.out), LaunchResult::Retry);
        h.drv.term_all_jobs(KillReason::Quit, &mut h.out);
        h.next_end().await;
    }

    #[tokio::test]
    async fn programa_inexistente_falla_el_lanzamiento() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let t = render_task(&reg, dir.path(), 1, None);
        let tool = ToolSpec {
            kind: JobKind::Render,
            desc: "blender".into(),
            program: dir.path().join("no-existe"),
            args: Vec::new(),
        };
        let mut h = Harness::new(vec![tool], 1);

        assert_eq!(h.drv.launch_task(&t, &mut h.out), LaunchResult::Ok(Owner::Local));
        match h.out.as_slice() {
            [DriverUpcall::LaunchFailed { task: 1, fatal: true, report: Some(r) }] => {
                assert_eq!(r.render.as_ref().unwrap().reason, TermReason::LaunchFailed);
            }
            other => panic!("upcalls inesperados: {other:?}"),
        }
        // el slot se liberó
        assert_eq!(h.drv.task_to_start(&[&t], false), Some(1));
    }
}
