//! Driver remoto: reparte tareas entre workers conectados por TCP.
//!
//! El dispatcher es quien conecta; cada worker escucha y autentica. Todo el
//! estado de las conexiones vive acá y sólo lo toca el runtime del scheduler:
//! las tareas de lectura/escritura de cada conexión se comunican por el canal
//! de [`DispatchIo`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::clock::{self, ClockSkew};
use common::config::LinkConfig;
use common::scheduler::{
    DriverUpcall, KillReason, LaunchResult, StopCont, StopContResult, TaskDriver,
};
use common::task::{ExecReport, ExecStatus, TermReason};
use common::wire::link::{spawn_link, BodySink, LinkEvent};
use common::wire::manifest::WireNames;
use common::wire::{
    auth, ConnectCode, ControlCmd, ControlStatus, DoneOutcome, JobRequest, ManifestEntry, Message,
    TaskDone, TaskRequest, TaskResponseCode,
};
use common::{ConnId, FileHandle, JobKind, JobMask, Owner, ProtocolError, Task, TaskId};

use crate::failover::{self, Verdict};
use crate::fitness::{self, Choice, Refusals};
use crate::state::{Assignment, Dispatch, InboundReport, Stage, Upload, WorkerLink};

#[derive(Debug)]
pub enum DispatchIo {
    Connected { addr: String, stream: TcpStream },
    ConnectFailed { addr: String, error: String },
    Link(ConnId, LinkEvent),
}

pub struct RemoteDriver {
    cfg: LinkConfig,
    addrs: Vec<String>,
    reconnect: Duration,
    io_tx: mpsc::UnboundedSender<DispatchIo>,

    workers: BTreeMap<ConnId, WorkerLink>,
    next_conn: ConnId,
    connecting: HashMap<String, JoinHandle<()>>,
    retry_at: HashMap<String, Instant>,

    refused: Refusals,
    planned: Option<Choice>,
    tight: bool,
    stop_wait: Option<(StopCont, HashSet<ConnId>)>,
    /// Kills de esta ronda; vuelve a cero cuando no queda nada asignado
    kills: u32,
    wire_names: WireNames,
    /// Quit en curso: no se reconecta ni se rebalancea
    draining: bool,
}

impl RemoteDriver {
    pub fn new(
        addrs: Vec<String>,
        cfg: LinkConfig,
        reconnect: Duration,
        io_tx: mpsc::UnboundedSender<DispatchIo>,
    ) -> Self {
        Self {
            cfg,
            addrs,
            reconnect,
            io_tx,
            workers: BTreeMap::new(),
            next_conn: 1,
            connecting: HashMap::new(),
            retry_at: HashMap::new(),
            refused: Refusals::new(),
            planned: None,
            tight: false,
            stop_wait: None,
            kills: 0,
            wire_names: WireNames::new(),
            draining: false,
        }
    }

    pub fn ready_workers(&self) -> usize {
        self.workers.values().filter(|w| w.is_ready()).count()
    }

    fn is_connected(&self, addr: &str) -> bool {
        self.workers.values().any(|w| w.addr == addr)
    }

    /// Cierra la ronda de kills si ya no queda ninguna tarea asignada.
    fn end_kill_round(&mut self) {
        if self.kills == 0 || self.workers.values().any(|w| !w.assigned.is_empty()) {
            return;
        }
        debug!("ronda de kills terminada después de {} intentos", self.kills);
        self.kills = 0;
        for w in self.workers.values_mut() {
            w.kill_sent = false;
        }
    }

    fn all_workers_ready(&self) -> bool {
        !self.addrs.is_empty()
            && self
                .addrs
                .iter()
                .all(|a| self.workers.values().any(|w| w.addr == *a && w.is_ready()))
    }

    fn spawn_connect(&mut self, addr: String) {
        if self.connecting.contains_key(&addr) {
            return;
        }
        let tx = self.io_tx.clone();
        let limit = self.cfg.response_timeout;
        let target = addr.clone();

        let h = tokio::spawn(async move {
            let ev = match tokio::time::timeout(limit, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => DispatchIo::Connected {
                    addr: target,
                    stream,
                },
                Ok(Err(e)) => DispatchIo::ConnectFailed {
                    addr: target,
                    error: e.to_string(),
                },
                Err(_) => DispatchIo::ConnectFailed {
                    addr: target,
                    error: format!("sin respuesta en {:?}", limit),
                },
            };
            let _ = tx.send(ev);
        });
        debug!("conectando a {}", addr);
        self.connecting.insert(addr, h);
    }

    fn on_connected(&mut self, addr: String, stream: TcpStream, out: &mut Vec<DriverUpcall>) {
        self.connecting.remove(&addr);
        if self.draining {
            debug!("conexión a {} descartada: cerrando", addr);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay({}): {}", addr, e);
        }

        let id = self.next_conn;
        self.next_conn += 1;
        let (link, writer) = spawn_link(
            id,
            stream,
            addr.clone(),
            self.cfg.max_message_len,
            self.io_tx.clone(),
            DispatchIo::Link,
        );
        info!("conectado a worker {} (conexión {})", addr, id);
        self.workers.insert(id, WorkerLink::new(id, addr, link, writer));
        out.push(DriverUpcall::CheckStartNewJobs);
    }

    /// Cierra la conexión y devuelve sus tareas al scheduler.
    fn drop_link(&mut self, id: ConnId, out: &mut Vec<DriverUpcall>) {
        let Some(mut w) = self.workers.remove(&id) else {
            return;
        };
        w.link.close();
        let n = failover::put_back_all(&mut w, out);
        info!(
            "worker {} desconectado: {} tareas devueltas (sesión de {:?}: {} lanzadas, {} ok, {} fallidas, {} put-backs)",
            w.addr,
            n,
            w.connected_at.elapsed(),
            w.tasks_started,
            w.tasks_succeeded,
            w.tasks_failed,
            w.tasks_put_back
        );

        for set in self.refused.values_mut() {
            set.remove(&id);
        }
        self.refused.retain(|_, s| !s.is_empty());
        if self.planned.is_some_and(|c| c.conn == id) {
            self.planned = None;
        }
        self.stop_ack(id, out);

        if !self.draining {
            self.retry_at.insert(w.addr.clone(), Instant::now() + self.reconnect);
        }
        out.push(DriverUpcall::CheckStartNewJobs);
    }

    fn stop_ack(&mut self, id: ConnId, out: &mut Vec<DriverUpcall>) {
        let Some((sc, waiting)) = &mut self.stop_wait else {
            return;
        };
        waiting.remove(&id);
        if waiting.is_empty() {
            let sc = *sc;
            self.stop_wait = None;
            info!("todos los workers confirmaron {:?}", sc);
            out.push(DriverUpcall::StopContDone(sc));
        }
    }

    fn send_control(w: &mut WorkerLink, cmd: ControlCmd, now: Instant) {
        let seq = w.control.issue(cmd, now);
        debug!("→ {}: control {} (#{})", w.addr, cmd.name(), seq);
        w.link.send(Message::ControlRequest { seq, cmd });
    }

    /// Nadie conectado puede hacer la siguiente mitad de `task`, y están todos.
    fn hopeless(&self, task: &Task) -> bool {
        let Some(kind) = task.next_kind() else {
            return true;
        };
        let desc = task.job(kind).map_or("", |j| j.desc.as_str());
        self.all_workers_ready() && !fitness::someone_else_can(&self.workers, None, kind, desc, None)
    }

    /* --------- Mensajes --------- */

    fn on_message(&mut self, id: ConnId, msg: Message, out: &mut Vec<DriverUpcall>) -> Result<(), ProtocolError> {
        let Some(w) = self.workers.get_mut(&id) else {
            return Ok(());
        };

        match (w.stage, msg) {
            (
                Stage::Connected,
                Message::ChallengeRequest {
                    challenge,
                    max_jobs,
                    task_capacity,
                    ..
                },
            ) => {
                let sent = clock::now_ms();
                let response = auth::keyed_response(&self.cfg.secret, &challenge);
                w.max_jobs = max_jobs as usize;
                w.capacity = task_capacity as usize;
                w.link.send(Message::ChallengeResponse { response, now_ms: sent });
                w.stage = Stage::ResponseSent { sent_ms: sent };
                Ok(())
            }
            (
                Stage::ResponseSent { sent_ms },
                Message::NowConnected {
                    code,
                    now_ms,
                    capabilities,
                },
            ) => {
                if code != ConnectCode::Accepted {
                    return Err(ProtocolError::Denied(code));
                }
                w.skew = ClockSkew::estimate(sent_ms, now_ms, clock::now_ms());
                w.caps = capabilities;
                w.stage = Stage::Ready;

                let caps: Vec<String> = w.caps.iter().map(|c| format!("{}:{}", c.kind, c.desc)).collect();
                info!(
                    "worker {} listo: {} jobs en paralelo, cola {}, skew {} ms, capacidades [{}]",
                    w.addr,
                    w.max_jobs,
                    w.capacity,
                    w.skew.offset_ms,
                    caps.join(", ")
                );
                let addr = w.addr.clone();
                self.retry_at.remove(&addr);
                out.push(DriverUpcall::CheckStartNewJobs);
                Ok(())
            }
            (stage, msg) if stage.is_session() => self.on_session_message(id, msg, out),
            (stage, msg) => Err(ProtocolError::Unexpected {
                got: msg.name(),
                state: stage.name(),
            }),
        }
    }

    fn on_session_message(
        &mut self,
        id: ConnId,
        msg: Message,
        out: &mut Vec<DriverUpcall>,
    ) -> Result<(), ProtocolError> {
        match msg {
            Message::FileRequest { task_id, index } => self.serve_file(id, task_id, index),
            Message::TaskResponse { task_id, code } => self.on_task_response(id, task_id, code, out),
            Message::TaskDone(done) => self.on_task_done(id, done),
            Message::FileUpload { task_id, kind, size } => self.on_file_upload(id, task_id, kind, size),
            Message::DoneComplete { task_id } => self.on_done_complete(id, task_id, out),
            Message::ControlRequest { seq, cmd } => {
                self.on_worker_control(id, seq, cmd);
                Ok(())
            }
            Message::ControlResponse {
                seq,
                cmd,
                status,
                a,
                b,
            } => self.on_control_response(id, seq, cmd, status, (a, b), out),
            other => Err(ProtocolError::Unexpected {
                got: other.name(),
                state: "sesión",
            }),
        }
    }

    fn serve_file(&mut self, id: ConnId, task_id: TaskId, index: u16) -> Result<(), ProtocolError> {
        let Some(w) = self.workers.get_mut(&id) else {
            return Ok(());
        };
        let d = w
            .dispatch
            .as_ref()
            .filter(|d| d.task == task_id)
            .ok_or(ProtocolError::Unexpected {
                got: "FileRequest",
                state: "sin TaskRequest pendiente",
            })?;
        let h = d.files.get(index as usize).ok_or(ProtocolError::InvalidValue {
            field: "file index",
            value: index as u64,
        })?;

        let size = h.stat()?.size;
        debug!(
            "→ {}: {} para la tarea {} ({} bytes)",
            w.addr,
            h.path().display(),
            task_id,
            size
        );
        w.link.send_file(
            Message::FileDownload { task_id, index, size },
            h.path().to_path_buf(),
            size,
            Some(h.clone()),
        );
        Ok(())
    }

    fn on_task_response(
        &mut self,
        id: ConnId,
        task_id: TaskId,
        code: TaskResponseCode,
        out: &mut Vec<DriverUpcall>,
    ) -> Result<(), ProtocolError> {
        let Some(w) = self.workers.get_mut(&id) else {
            return Ok(());
        };
        if !w.dispatch.as_ref().is_some_and(|d| d.task == task_id) {
            return Err(ProtocolError::Unexpected {
                got: "TaskResponse",
                state: "sin TaskRequest pendiente",
            });
        }
        w.dispatch = None;

        if code == TaskResponseCode::Accepted {
            if let Some(a) = w.assignment_mut(task_id) {
                a.accepted = true;
                let frame = a.frame;
                debug!("worker {} aceptó frame {} (tarea {})", w.addr, frame, task_id);
            }
            out.push(DriverUpcall::CheckStartNewJobs);
            return Ok(());
        }

        // Rechazo: la tarea vuelve a todo o se da por perdida
        let a = w.take_assignment(task_id);
        if code == TaskResponseCode::Quitting {
            w.stage = Stage::Quitting;
        }
        let addr = w.addr.clone();
        self.refused.entry(task_id).or_default().insert(id);

        let hard = matches!(code, TaskResponseCode::Unsupported | TaskResponseCode::TransferFailed);
        let fatal = hard
            && a.as_ref()
                .and_then(|a| a.descs.first())
                .is_some_and(|(kind, desc)| {
                    !fitness::someone_else_can(&self.workers, Some(id), *kind, desc, self.refused.get(&task_id))
                });

        if fatal {
            error!("tarea {} rechazada por {} ({:?}) y nadie más puede hacerla", task_id, addr, code);
            self.refused.remove(&task_id);
        } else {
            warn!("tarea {} rechazada por {} ({:?}); se reintenta", task_id, addr, code);
        }
        out.push(DriverUpcall::LaunchFailed {
            task: task_id,
            fatal,
            report: None,
        });
        out.push(DriverUpcall::CheckStartNewJobs);
        Ok(())
    }

    fn on_task_done(&mut self, id: ConnId, done: TaskDone) -> Result<(), ProtocolError> {
        let Some(w) = self.workers.get_mut(&id) else {
            return Ok(());
        };
        if w.report.is_some() {
            return Err(ProtocolError::Unexpected {
                got: "TaskDone",
                state: "reporte en curso",
            });
        }
        let a = w
            .assigned
            .iter()
            .find(|a| a.task == done.task_id && a.accepted)
            .ok_or(ProtocolError::Unexpected {
                got: "TaskDone",
                state: "tarea no asignada",
            })?;

        let expected: Vec<JobKind> = a
            .mask
            .kinds()
            .filter(|k| status_of(&done, *k).is_some_and(ExecStatus::is_success))
            .collect();
        debug!(
            "← {}: TaskDone {:?} de frame {} (tarea {}), {} outputs",
            w.addr,
            done.outcome,
            a.frame,
            done.task_id,
            expected.len()
        );

        w.report = Some(InboundReport {
            done,
            expected,
            received: Vec::new(),
            current: None,
            failed: Vec::new(),
        });
        Ok(())
    }

    fn on_file_upload(&mut self, id: ConnId, task_id: TaskId, kind: JobKind, size: u64) -> Result<(), ProtocolError> {
        let Some(w) = self.workers.get_mut(&id) else {
            return Ok(());
        };
        let unexpected = ProtocolError::Unexpected {
            got: "FileUpload",
            state: "output no esperado",
        };

        let dest = w
            .assigned
            .iter()
            .find(|a| a.task == task_id)
            .and_then(|a| a.output(kind))
            .map(|h| h.path().to_path_buf());
        let Some(report) = w.report.as_mut().filter(|r| r.done.task_id == task_id) else {
            return Err(unexpected);
        };
        let Some(dest) = dest else {
            return Err(unexpected);
        };
        if report.current.is_some()
            || !report.expected.contains(&kind)
            || report.received.iter().any(|u| u.kind == kind)
        {
            return Err(unexpected);
        }

        let part = part_path(&dest);
        debug!("← {}: {} ({} bytes)", w.addr, dest.display(), size);
        w.link.receive_body(BodySink::File {
            path: part.clone(),
            mtime: None,
        });
        report.current = Some(Upload { kind, part, dest });
        Ok(())
    }

    fn on_body(&mut self, id: ConnId, error: Option<String>) {
        let Some(w) = self.workers.get_mut(&id) else {
            return;
        };
        let Some(report) = w.report.as_mut() else {
            return;
        };
        let Some(up) = report.current.take() else {
            return;
        };
        match error {
            None => report.received.push(up),
            Some(e) => {
                warn!("no se pudo guardar {}: {}", up.dest.display(), e);
                let _ = std::fs::remove_file(&up.part);
                report.failed.push(up.kind);
            }
        }
    }

    fn on_done_complete(
        &mut self,
        id: ConnId,
        task_id: TaskId,
        out: &mut Vec<DriverUpcall>,
    ) -> Result<(), ProtocolError> {
        let Some(w) = self.workers.get_mut(&id) else {
            return Ok(());
        };
        let mut report = match w.report.take() {
            Some(r) if r.done.task_id == task_id && r.current.is_none() => r,
            other => {
                w.report = other;
                return Err(ProtocolError::Unexpected {
                    got: "DoneComplete",
                    state: "sin reporte completo",
                });
            }
        };
        let Some(a) = w.take_assignment(task_id) else {
            report.discard_parts();
            return Err(ProtocolError::Unexpected {
                got: "DoneComplete",
                state: "tarea no asignada",
            });
        };

        // 1) Outputs: .part → destino final
        let mut committed = Vec::new();
        for up in report.received.drain(..) {
            match std::fs::rename(&up.part, &up.dest) {
                Ok(()) => committed.push(up.kind),
                Err(e) => {
                    warn!("no se pudo mover {} a su lugar: {}", up.part.display(), e);
                    let _ = std::fs::remove_file(&up.part);
                }
            }
        }

        if !report.failed.is_empty() {
            let kinds: Vec<&str> = report.failed.iter().map(|k| k.as_str()).collect();
            warn!(
                "frame {} (tarea {}): no se pudo guardar el output de [{}] subido por {}",
                a.frame,
                task_id,
                kinds.join(", "),
                w.addr
            );
        }

        // 2) Estados, con los tiempos pasados a nuestro reloj
        let mut exec = ExecReport::default();
        for kind in a.mask.kinds() {
            let Some(mut st) = status_of(&report.done, kind).cloned() else {
                continue;
            };
            st.started_at = to_local(&w.skew, st.started_at);
            st.ended_at = to_local(&w.skew, st.ended_at);
            let lost = report.failed.contains(&kind)
                || (report.expected.contains(&kind) && !committed.contains(&kind));
            if lost {
                st.reason = TermReason::TransferFailed;
            }
            *exec.slot_mut(kind) = Some(st);
        }

        // 3) Veredicto
        let complete = a.mask.kinds().all(|k| exec.get(k).is_some_and(ExecStatus::is_success));
        let upcall = match report.done.outcome {
            DoneOutcome::GivenBack => {
                w.tasks_put_back += 1;
                info!("worker {} devolvió frame {} (tarea {})", w.addr, a.frame, task_id);
                DriverUpcall::PutBack { task: task_id, report: exec }
            }
            DoneOutcome::Processed if exec.has_hard_failure() => {
                w.tasks_failed += 1;
                warn!("frame {} (tarea {}) falló en {}", a.frame, task_id, w.addr);
                DriverUpcall::TaskFailed { task: task_id, report: exec }
            }
            DoneOutcome::Processed if complete => {
                w.tasks_succeeded += 1;
                info!(
                    "frame {} (tarea {}) terminado en {} en {:?}",
                    a.frame,
                    task_id,
                    w.addr,
                    a.since.elapsed()
                );
                DriverUpcall::JobSucceeded { task: task_id, report: exec }
            }
            DoneOutcome::Processed => {
                w.tasks_put_back += 1;
                warn!("frame {} (tarea {}) volvió incompleto de {}", a.frame, task_id, w.addr);
                DriverUpcall::PutBack { task: task_id, report: exec }
            }
        };

        // el worker terminó algo: los "busy" anteriores ya no valen
        self.refused.remove(&task_id);
        for set in self.refused.values_mut() {
            set.remove(&id);
        }
        self.refused.retain(|_, s| !s.is_empty());

        out.push(upcall);
        out.push(DriverUpcall::CheckStartNewJobs);
        Ok(())
    }

    fn on_worker_control(&mut self, id: ConnId, seq: u32, cmd: ControlCmd) {
        let Some(w) = self.workers.get_mut(&id) else {
            return;
        };
        let status = match cmd {
            ControlCmd::Ping => ControlStatus::Ok,
            ControlCmd::NoMoreTasks => {
                info!("worker {} no quiere más tareas", w.addr);
                w.no_more_tasks = true;
                ControlStatus::Ok
            }
            other => {
                warn!("worker {} pidió {}: no soportado", w.addr, other.name());
                ControlStatus::Unsupported
            }
        };
        w.link.send(Message::ControlResponse {
            seq,
            cmd,
            status,
            a: 0,
            b: 0,
        });
    }

    fn on_control_response(
        &mut self,
        id: ConnId,
        seq: u32,
        cmd: ControlCmd,
        status: ControlStatus,
        (a, b): (u32, u32),
        out: &mut Vec<DriverUpcall>,
    ) -> Result<(), ProtocolError> {
        let Some(w) = self.workers.get_mut(&id) else {
            return Ok(());
        };
        let pending = w.control.resolve(seq, cmd)?;
        debug!(
            "← {}: {} {:?} en {:?}",
            w.addr,
            cmd.name(),
            status,
            pending.sent_at.elapsed()
        );

        match cmd {
            ControlCmd::GiveBack { .. } => {
                w.give_back_pending = false;
                info!("worker {} devolvió tareas: quedan {} en cola y {} corriendo", w.addr, a, b);
                out.push(DriverUpcall::CheckStartNewJobs);
            }
            ControlCmd::Stop | ControlCmd::Continue => self.stop_ack(id, out),
            ControlCmd::KillUser | ControlCmd::KillServer => {
                info!("worker {} confirmó el kill ({:?})", w.addr, status);
            }
            _ => {}
        }
        Ok(())
    }
}

fn status_of(done: &TaskDone, kind: JobKind) -> Option<&ExecStatus> {
    match kind {
        JobKind::Render => done.render.as_ref(),
        JobKind::Filter => done.filter.as_ref(),
    }
}

fn to_local(skew: &ClockSkew, t: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    t.and_then(|t| clock::ms_to_datetime(skew.remote_to_local(t.timestamp_millis())))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_owned();
    s.push(".part");
    PathBuf::from(s)
}

/* --------- Armado del TaskRequest --------- */

/// Archivos que viajan con un TaskRequest; cada uno queda con su estado
/// fijo mientras dure el dispatch.
#[derive(Default)]
struct Manifest {
    files: Vec<FileHandle>,
    entries: Vec<ManifestEntry>,
    names: HashSet<String>,
}

impl Manifest {
    /// Un nombre por archivo del pedido; la misma ruta en dos papeles (un
    /// output que pisa un input) no se puede mandar.
    fn reserve(&mut self, names: &mut WireNames, path: &Path) -> Result<String, String> {
        let name = names
            .name_for(path)
            .ok_or_else(|| format!("nombre de archivo inválido: {}", path.display()))?;
        if !self.names.insert(name.clone()) {
            return Err(format!("{} aparece dos veces en el pedido", path.display()));
        }
        Ok(name)
    }

    fn add(&mut self, names: &mut WireNames, h: &FileHandle) -> Result<String, String> {
        if let Some(i) = self.files.iter().position(|f| f == h) {
            return Ok(self.entries[i].name.clone());
        }
        let meta = std::fs::metadata(h.path()).map_err(|e| format!("{}: {}", h.path().display(), e))?;
        let mtime = meta.modified().map_err(|e| format!("{}: {}", h.path().display(), e))?;
        let name = self.reserve(names, h.path())?;

        h.set_fixed_state(meta.len(), mtime);
        self.entries.push(ManifestEntry {
            name: name.clone(),
            size: meta.len(),
            mtime_ms: clock::system_time_to_ms(mtime),
        });
        self.files.push(h.clone());
        Ok(name)
    }

    fn abandon(self) {
        for h in &self.files {
            h.clear_fixed_state();
        }
    }
}

fn build_request(
    task: &Task,
    mask: JobMask,
    m: &mut Manifest,
    names: &mut WireNames,
) -> Result<Vec<JobRequest>, String> {
    let mut jobs = Vec::new();
    let mut render_output: Option<String> = None;

    for kind in mask.kinds() {
        let job = task
            .job(kind)
            .ok_or_else(|| format!("la tarea no tiene {kind}"))?;

        // si el render viaja en el mismo request, el filtro lee su output
        let input = match (&render_output, kind) {
            (Some(name), JobKind::Filter) => name.clone(),
            _ => m.add(names, &job.input)?,
        };
        let output = m.reserve(names, job.output.path())?;
        if kind == JobKind::Render {
            render_output = Some(output.clone());
        }
        let additional = job
            .additional
            .iter()
            .map(|h| m.add(names, h))
            .collect::<Result<Vec<_>, _>>()?;

        jobs.push(JobRequest {
            kind,
            desc: job.desc.clone(),
            input,
            output,
            format: job.format.clone(),
            timeout_ms: job
                .timeout
                .map_or(0, |t| t.as_millis().min(u32::MAX as u128) as u32),
            args: job.args.clone(),
            additional,
        });
    }
    Ok(jobs)
}

/* --------- TaskDriver --------- */

impl TaskDriver for RemoteDriver {
    type Io = DispatchIo;

    fn start(&mut self, _out: &mut Vec<DriverUpcall>) {
        info!("dispatcher: {} workers configurados", self.addrs.len());
        for addr in self.addrs.clone() {
            self.spawn_connect(addr);
        }
    }

    fn task_to_start(&mut self, todo: &[&Task], tight: bool) -> Option<TaskId> {
        self.tight = tight;
        self.planned = fitness::choose(todo, self.workers.values(), tight, &self.refused);
        if let Some(c) = self.planned {
            return Some(c.task);
        }
        // una tarea que nadie puede hacer se ofrece igual para que falle
        todo.iter().find(|t| self.hopeless(t)).map(|t| t.id)
    }

    fn launch_task(&mut self, task: &Task, out: &mut Vec<DriverUpcall>) -> LaunchResult {
        let choice = match self.planned.take() {
            Some(c) if c.task == task.id => Some(c),
            _ => fitness::choose(&[task], self.workers.values(), self.tight, &self.refused),
        };
        let Some(choice) = choice else {
            if self.hopeless(task) {
                let kind = task.next_kind().map_or("-", JobKind::as_str);
                error!("ningún worker puede ejecutar {} para {}", kind, task);
                return LaunchResult::Fatal;
            }
            return LaunchResult::Retry;
        };
        let Some(w) = self.workers.get_mut(&choice.conn) else {
            return LaunchResult::Retry;
        };

        let mut m = Manifest::default();
        let jobs = match build_request(task, choice.mask, &mut m, &mut self.wire_names) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("{}: no se puede armar el pedido: {}", task, e);
                m.abandon();
                return LaunchResult::Fatal;
            }
        };

        let descs: Vec<(JobKind, String)> = jobs.iter().map(|j| (j.kind, j.desc.clone())).collect();
        let outputs: Vec<(JobKind, FileHandle)> = choice
            .mask
            .kinds()
            .filter_map(|k| task.job(k).map(|j| (k, j.output.clone())))
            .collect();

        info!(
            "→ {}: {} [{}], {} archivos",
            w.addr,
            task,
            descs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join("+"),
            m.entries.len()
        );
        let req = TaskRequest {
            task_id: task.id,
            frame: task.frame,
            jobs,
            files: std::mem::take(&mut m.entries),
        };
        if !w.link.send(Message::TaskRequest(req)) {
            m.abandon();
            return LaunchResult::Retry;
        }

        let now = Instant::now();
        w.dispatch = Some(Dispatch {
            task: task.id,
            files: std::mem::take(&mut m.files),
            sent_at: now,
        });
        w.assigned.push(Assignment {
            task: task.id,
            frame: task.frame,
            mask: choice.mask,
            descs,
            outputs,
            accepted: false,
            since: now,
        });
        w.tasks_started += 1;

        out.push(DriverUpcall::Launched(task.id));
        LaunchResult::Ok(Owner::Worker(w.id))
    }

    fn term_all_jobs(&mut self, reason: KillReason, out: &mut Vec<DriverUpcall>) -> usize {
        self.end_kill_round();
        self.kills += 1;
        let busy: Vec<ConnId> = self
            .workers
            .values()
            .filter(|w| w.stage.is_session() && !w.assigned.is_empty())
            .map(|w| w.id)
            .collect();
        let n: usize = busy
            .iter()
            .filter_map(|id| self.workers.get(id))
            .map(|w| w.assigned.len())
            .sum();

        if self.kills == 1 {
            let cmd = match reason {
                KillReason::User => ControlCmd::KillUser,
                _ => ControlCmd::KillServer,
            };
            let now = Instant::now();
            for id in &busy {
                if let Some(w) = self.workers.get_mut(id) {
                    Self::send_control(w, cmd, now);
                    w.kill_sent = true;
                }
            }
            warn!("kill enviado a {} workers ({} tareas)", busy.len(), n);
        } else {
            warn!("kill sin respuesta: se cierran {} conexiones", busy.len());
            for id in busy {
                self.drop_link(id, out);
            }
        }
        n
    }

    fn stop_cont_tasks(&mut self, sc: StopCont, _out: &mut Vec<DriverUpcall>) -> StopContResult {
        let cmd = match sc {
            StopCont::Stop => ControlCmd::Stop,
            StopCont::Continue => ControlCmd::Continue,
        };
        let now = Instant::now();
        let mut waiting = HashSet::new();
        for w in self
            .workers
            .values_mut()
            .filter(|w| w.stage.is_session() && !w.assigned.is_empty())
        {
            Self::send_control(w, cmd, now);
            waiting.insert(w.id);
        }

        if waiting.is_empty() {
            return StopContResult::Done;
        }
        info!("{:?} enviado a {} workers", sc, waiting.len());
        self.stop_wait = Some((sc, waiting));
        StopContResult::InProgress
    }

    fn schedule_give_back(&mut self, keep: usize) {
        if keep == 0 {
            self.draining = true;
            for (_, h) in self.connecting.drain() {
                h.abort();
            }
        }
        let now = Instant::now();
        let keep = keep.min(u32::MAX as usize) as u32;
        for w in self
            .workers
            .values_mut()
            .filter(|w| w.is_ready() && !w.assigned.is_empty() && !w.give_back_pending)
        {
            Self::send_control(w, ControlCmd::GiveBack { keep }, now);
            w.give_back_pending = true;
        }
    }

    fn rebalance(&mut self, tight: bool, todo_len: usize) {
        if self.draining || !tight || todo_len > 0 {
            return;
        }
        let now = Instant::now();
        for id in fitness::overloaded(&self.workers) {
            if let Some(w) = self.workers.get_mut(&id) {
                info!(
                    "worker {} tiene {} tareas para {} slots y hay workers libres: se le pide la cola",
                    w.addr,
                    w.assigned.len(),
                    w.max_jobs
                );
                Self::send_control(w, ControlCmd::GiveBack { keep: 0 }, now);
                w.give_back_pending = true;
            }
        }
    }

    fn handle_io(&mut self, ev: DispatchIo, out: &mut Vec<DriverUpcall>) {
        match ev {
            DispatchIo::Connected { addr, stream } => self.on_connected(addr, stream, out),
            DispatchIo::ConnectFailed { addr, error } => {
                self.connecting.remove(&addr);
                warn!("no se pudo conectar a {}: {}; reintento en {:?}", addr, error, self.reconnect);
                self.retry_at.insert(addr, Instant::now() + self.reconnect);
            }
            DispatchIo::Link(id, LinkEvent::Message(msg)) => {
                let name = msg.name();
                if let Err(e) = self.on_message(id, msg, out) {
                    let addr = self.workers.get(&id).map_or("?", |w| w.addr.as_str());
                    error!("worker {}: error de protocolo en {}: {}", addr, name, e);
                    self.drop_link(id, out);
                }
            }
            DispatchIo::Link(id, LinkEvent::BodyReceived { error, .. }) => self.on_body(id, error),
            DispatchIo::Link(id, LinkEvent::Closed(err)) => {
                if let Some(w) = self.workers.get(&id) {
                    match err {
                        None => info!("worker {} cerró la conexión", w.addr),
                        Some(e) => warn!("worker {}: conexión caída: {}", w.addr, e),
                    }
                }
                self.drop_link(id, out);
            }
        }
    }

    fn on_tick(&mut self, now: Instant, out: &mut Vec<DriverUpcall>) {
        // 1) Reconexiones pendientes
        if !self.draining {
            let due: Vec<String> = self
                .addrs
                .iter()
                .filter(|a| !self.is_connected(a) && !self.connecting.contains_key(*a))
                .filter(|a| self.retry_at.get(*a).map_or(true, |t| *t <= now))
                .cloned()
                .collect();
            for addr in due {
                self.spawn_connect(addr);
            }
        }

        // 2) Keepalive y timeouts
        let mut dead = Vec::new();
        for w in self.workers.values_mut() {
            match failover::sweep_once(w, now, &self.cfg) {
                Verdict::Healthy => {}
                Verdict::Ping => Self::send_control(w, ControlCmd::Ping, now),
                Verdict::Dead(why) => {
                    warn!("worker {}: {}; se cierra la conexión", w.addr, why);
                    dead.push(w.id);
                }
            }
        }
        for id in dead {
            self.drop_link(id, out);
        }

        // 3) Ronda de kills
        self.end_kill_round();
    }

    fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        self.draining = true;
        for (_, h) in self.connecting.drain() {
            h.abort();
        }
        let now = Instant::now();
        let mut writers = Vec::new();
        for (_, mut w) in std::mem::take(&mut self.workers) {
            if w.stage.is_session() {
                Self::send_control(&mut w, ControlCmd::ClientQuit, now);
            }
            w.link.close();
            writers.extend(w.writer.take());
        }
        info!("dispatcher cerrado");
        writers
    }
}
