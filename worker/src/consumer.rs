//! Fuente activa: el dispatcher conectado empuja tareas y comandos de control.
//!
//! El worker escucha; cada conexión entrante es un candidato hasta que
//! responde el challenge. Hay a lo sumo una sesión: un segundo dispatcher
//! autenticado recibe `AlreadyConnected`. Si la sesión se cae con tareas en
//! vuelo el scheduler entra en recovery y, hasta que termina de vaciar las
//! colas, las conexiones nuevas reciben `Busy`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::clock::{self, ClockSkew};
use common::config::LinkConfig;
use common::files::FixedState;
use common::scheduler::{KillReason, QueueView, SourceControl, SourceUpcall, TaskSource};
use common::task::{ExecStatus, OutputState, TermReason};
use common::wire::control::{keepalive_check, ControlQueue, KeepAlive};
use common::wire::link::{spawn_link, BodySink, LinkEvent, LinkHandle};
use common::wire::manifest::needs_transfer;
use common::wire::{
    auth, Capability, ConnectCode, ControlCmd, ControlStatus, DoneOutcome, JobRequest, Message, TaskDone,
    TaskRequest, TaskResponseCode, CHALLENGE_LEN,
};
use common::{ConnId, DeletePolicy, FileRegistry, FileRole, JobKind, JobSpec, ProtocolError, Task, TaskId};

#[derive(Debug)]
pub enum ConsumerIo {
    Accepted { stream: TcpStream, peer: String },
    Link(ConnId, LinkEvent),
}

/// Lo que el worker anuncia en el handshake.
#[derive(Debug, Clone)]
pub struct Offer {
    pub max_jobs: u16,
    pub capacity: u16,
    pub caps: Vec<Capability>,
}

struct Candidate {
    link: LinkHandle,
    writer: JoinHandle<()>,
    challenge: [u8; CHALLENGE_LEN],
    sent_ms: i64,
    since: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    /// FileRequest enviado, falta el header
    Requested(u16),
    /// Header recibido, llegando el cuerpo
    Receiving(u16),
}

/// TaskRequest aceptable cuyos archivos se están bajando.
struct Inbound {
    req: TaskRequest,
    missing: VecDeque<u16>,
    transfer: Option<Transfer>,
    /// El cuerpo en curso se está descartando
    failed: Option<String>,
}

struct Session {
    id: ConnId,
    link: LinkHandle,
    writer: JoinHandle<()>,
    skew: ClockSkew,
    control: ControlQueue,
    /// Comandos del dispatcher que esperan respuesta del scheduler
    replies: HashMap<u32, ControlCmd>,
    inbound: Option<Inbound>,
    since: Instant,
    accepted: u64,
    reported: u64,
}

pub struct ConsumerSource {
    cfg: LinkConfig,
    offer: Offer,
    workdir: PathBuf,
    registry: FileRegistry,
    io_tx: mpsc::UnboundedSender<ConsumerIo>,

    next_conn: ConnId,
    candidates: HashMap<ConnId, Candidate>,
    session: Option<Session>,
    /// Tareas de esta sesión que tiene el scheduler
    held: HashSet<TaskId>,
    /// Escritores de conexiones cerradas que todavía pueden estar vaciando
    closing: Vec<JoinHandle<()>>,

    quitting: bool,
    recovering: bool,
    closed: bool,
}

impl ConsumerSource {
    pub fn new(
        cfg: LinkConfig,
        offer: Offer,
        workdir: PathBuf,
        registry: FileRegistry,
        io_tx: mpsc::UnboundedSender<ConsumerIo>,
    ) -> Self {
        Self {
            cfg,
            offer,
            workdir,
            registry,
            io_tx,
            next_conn: 1,
            candidates: HashMap::new(),
            session: None,
            held: HashSet::new(),
            closing: Vec::new(),
            quitting: false,
            recovering: false,
            closed: false,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn can_do(&self, kind: JobKind, desc: &str) -> bool {
        self.offer.caps.iter().any(|c| c.kind == kind && c.desc == desc)
    }

    fn linger(&mut self, writer: JoinHandle<()>) {
        self.closing.retain(|h| !h.is_finished());
        self.closing.push(writer);
    }

    /* --------- Conexiones --------- */

    fn on_accepted(&mut self, stream: TcpStream, peer: String) {
        if self.closed {
            debug!("conexión de {} descartada: cerrando", peer);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay({}): {}", peer, e);
        }
        let id = self.next_conn;
        self.next_conn += 1;
        let (link, writer) = spawn_link(
            id,
            stream,
            peer.clone(),
            self.cfg.max_message_len,
            self.io_tx.clone(),
            ConsumerIo::Link,
        );

        let challenge = auth::new_challenge();
        let sent_ms = clock::now_ms();
        link.send(Message::ChallengeRequest {
            challenge,
            now_ms: sent_ms,
            max_jobs: self.offer.max_jobs,
            task_capacity: self.offer.capacity,
        });
        debug!("conexión {} de {}: challenge enviado", id, peer);
        self.candidates.insert(
            id,
            Candidate {
                link,
                writer,
                challenge,
                sent_ms,
                since: Instant::now(),
            },
        );
    }

    fn on_candidate_message(&mut self, id: ConnId, msg: Message) {
        let Some(c) = self.candidates.remove(&id) else {
            return;
        };
        let got = msg.name();
        let Message::ChallengeResponse { response, now_ms } = msg else {
            let e = ProtocolError::Unexpected {
                got,
                state: "esperando ChallengeResponse",
            };
            warn!("{}: {}", c.link.peer(), e);
            c.link.close();
            self.linger(c.writer);
            return;
        };

        let code = if !auth::verify(&self.cfg.secret, &c.challenge, &response) {
            ConnectCode::AuthFailed
        } else if self.session.is_some() {
            ConnectCode::AlreadyConnected
        } else if self.quitting || self.recovering || self.closed {
            ConnectCode::Busy
        } else {
            ConnectCode::Accepted
        };
        let capabilities = if code == ConnectCode::Accepted {
            self.offer.caps.clone()
        } else {
            Vec::new()
        };
        c.link.send(Message::NowConnected {
            code,
            now_ms: clock::now_ms(),
            capabilities,
        });

        if code != ConnectCode::Accepted {
            warn!("dispatcher {} rechazado: {:?}", c.link.peer(), code);
            c.link.close();
            self.linger(c.writer);
            return;
        }

        let skew = ClockSkew::estimate(c.sent_ms, now_ms, clock::now_ms());
        info!(
            "dispatcher {} conectado (conexión {}), skew {} ms, rtt {} ms",
            c.link.peer(),
            id,
            skew.offset_ms,
            skew.rtt_ms
        );
        self.session = Some(Session {
            id,
            link: c.link,
            writer: c.writer,
            skew,
            control: ControlQueue::new(),
            replies: HashMap::new(),
            inbound: None,
            since: Instant::now(),
            accepted: 0,
            reported: 0,
        });
    }

    /// La sesión terminó. Lo que tenga el scheduler se tira: el dispatcher
    /// ya lo dio por perdido.
    fn lose_session(&mut self, why: &str, out: &mut Vec<SourceUpcall>) {
        let Some(s) = self.session.take() else {
            return;
        };
        s.link.close();
        info!(
            "sesión con {} terminada ({}): {} tareas aceptadas, {} reportadas en {:?}",
            s.link.peer(),
            why,
            s.accepted,
            s.reported,
            s.since.elapsed()
        );
        self.linger(s.writer);

        if self.quitting || self.closed {
            return;
        }
        if !self.held.is_empty() {
            warn!("se descartan {} tareas de la sesión perdida", self.held.len());
        }
        self.recovering = true;
        out.push(SourceUpcall::UpstreamLost);
    }

    /* --------- Mensajes de la sesión --------- */

    fn on_session_message(
        &mut self,
        msg: Message,
        view: &QueueView,
        out: &mut Vec<SourceUpcall>,
    ) -> Result<(), ProtocolError> {
        match msg {
            Message::TaskRequest(req) => self.on_task_request(req, view, out),
            Message::FileDownload { task_id, index, size } => self.on_file_download(task_id, index, size),
            Message::ControlRequest { seq, cmd } => {
                self.on_control(seq, cmd, out);
                Ok(())
            }
            Message::ControlResponse { seq, cmd, status, .. } => {
                let Some(s) = self.session.as_mut() else {
                    return Ok(());
                };
                let p = s.control.resolve(seq, cmd)?;
                debug!("← {}: {} {:?} en {:?}", s.link.peer(), cmd.name(), status, p.sent_at.elapsed());
                Ok(())
            }
            other => Err(ProtocolError::Unexpected {
                got: other.name(),
                state: "sesión",
            }),
        }
    }

    /// Código con el que rechazar el pedido, si hay que rechazarlo.
    fn refusal(&self, req: &TaskRequest, view: &QueueView) -> Option<TaskResponseCode> {
        if self.quitting {
            return Some(TaskResponseCode::Quitting);
        }
        if !view.accepting || self.recovering {
            return Some(TaskResponseCode::Busy);
        }
        let limit = self.offer.max_jobs as usize + self.offer.capacity as usize;
        if view.todo + view.proc >= limit {
            return Some(TaskResponseCode::Busy);
        }
        if req.jobs.iter().any(|j| !self.can_do(j.kind, &j.desc)) {
            return Some(TaskResponseCode::Unsupported);
        }
        None
    }

    fn on_task_request(
        &mut self,
        req: TaskRequest,
        view: &QueueView,
        out: &mut Vec<SourceUpcall>,
    ) -> Result<(), ProtocolError> {
        let Some(s) = self.session.as_ref() else {
            return Ok(());
        };
        if s.inbound.is_some() {
            return Err(ProtocolError::Unexpected {
                got: "TaskRequest",
                state: "otro TaskRequest pendiente",
            });
        }
        if self.held.contains(&req.task_id) {
            return Err(ProtocolError::Unexpected {
                got: "TaskRequest",
                state: "tarea ya recibida",
            });
        }
        validate_request(&req)?;

        if let Some(code) = self.refusal(&req, view) {
            info!("frame {} (tarea {}) rechazado: {:?}", req.frame, req.task_id, code);
            s.link.send(Message::TaskResponse {
                task_id: req.task_id,
                code,
            });
            return Ok(());
        }

        // 1) Qué archivos faltan o están viejos
        let mut missing = VecDeque::new();
        for (i, entry) in req.files.iter().enumerate() {
            let local = std::fs::metadata(self.workdir.join(&entry.name))
                .and_then(|m| {
                    Ok(FixedState {
                        size: m.len(),
                        mtime: m.modified()?,
                    })
                })
                .ok();
            if needs_transfer(local, entry, &s.skew, self.cfg.force_redownload) {
                missing.push_back(i as u16);
            }
        }
        debug!(
            "frame {} (tarea {}): {} de {} archivos a bajar",
            req.frame,
            req.task_id,
            missing.len(),
            req.files.len()
        );

        // 2) Pedirlos de a uno
        if let Some(s) = self.session.as_mut() {
            s.inbound = Some(Inbound {
                req,
                missing,
                transfer: None,
                failed: None,
            });
        }
        self.advance(view, out);
        Ok(())
    }

    fn on_file_download(&mut self, task_id: TaskId, index: u16, size: u64) -> Result<(), ProtocolError> {
        let Some(s) = self.session.as_mut() else {
            return Ok(());
        };
        let unexpected = ProtocolError::Unexpected {
            got: "FileDownload",
            state: "archivo no pedido",
        };
        let Some(inb) = s.inbound.as_mut().filter(|i| i.req.task_id == task_id) else {
            return Err(unexpected);
        };
        if inb.transfer != Some(Transfer::Requested(index)) {
            return Err(unexpected);
        }
        let Some(entry) = inb.req.files.get(index as usize) else {
            return Err(unexpected);
        };

        let path = self.workdir.join(&entry.name);
        let mtime = clock::ms_to_system_time(s.skew.remote_to_local(entry.mtime_ms));
        inb.transfer = Some(Transfer::Receiving(index));

        debug!("← {}: {} ({} bytes)", s.link.peer(), entry.name, size);
        let dir = path.parent().map(|d| (d.to_path_buf(), std::fs::create_dir_all(d)));
        match dir {
            Some((dir, Err(e))) => {
                // el cuerpo se consume igual; al terminar se rechaza la tarea
                inb.failed = Some(format!("no se pudo crear {}: {}", dir.display(), e));
                s.link.receive_body(BodySink::Discard);
            }
            _ => s.link.receive_body(BodySink::File {
                path,
                mtime: Some(mtime),
            }),
        }
        Ok(())
    }

    fn on_body(&mut self, error: Option<String>, view: &QueueView, out: &mut Vec<SourceUpcall>) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let Some(inb) = s.inbound.as_mut() else {
            return;
        };
        let Some(Transfer::Receiving(index)) = inb.transfer.take() else {
            return;
        };
        if let Some(e) = inb.failed.take().or(error) {
            let name = inb.req.files.get(index as usize).map_or("?", |f| f.name.as_str());
            warn!("frame {} (tarea {}): falló la bajada de {}: {}", inb.req.frame, inb.req.task_id, name, e);
            let task_id = inb.req.task_id;
            s.inbound = None;
            s.link.send(Message::TaskResponse {
                task_id,
                code: TaskResponseCode::TransferFailed,
            });
            return;
        }
        self.advance(view, out);
    }

    /// Pide el próximo archivo o, si no falta ninguno, entrega la tarea.
    fn advance(&mut self, view: &QueueView, out: &mut Vec<SourceUpcall>) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let Some(inb) = s.inbound.as_mut() else {
            return;
        };
        if inb.transfer.is_some() {
            return;
        }
        if let Some(index) = inb.missing.pop_front() {
            inb.transfer = Some(Transfer::Requested(index));
            s.link.send(Message::FileRequest {
                task_id: inb.req.task_id,
                index,
            });
            return;
        }
        let Some(inb) = s.inbound.take() else {
            return;
        };
        self.finish(inb.req, view, out);
    }

    fn finish(&mut self, req: TaskRequest, view: &QueueView, out: &mut Vec<SourceUpcall>) {
        // mientras se bajaban archivos pudo cambiar el estado del scheduler
        if let Some(code) = self.refusal(&req, view) {
            info!("frame {} (tarea {}) rechazado al final de la bajada: {:?}", req.frame, req.task_id, code);
            if let Some(s) = &self.session {
                s.link.send(Message::TaskResponse {
                    task_id: req.task_id,
                    code,
                });
            }
            return;
        }

        let task = self.build_task(&req);
        let Some(s) = self.session.as_mut() else {
            return;
        };
        s.link.send(Message::TaskResponse {
            task_id: req.task_id,
            code: TaskResponseCode::Accepted,
        });
        s.accepted += 1;
        let kinds: Vec<&str> = req.jobs.iter().map(|j| j.kind.as_str()).collect();
        info!("frame {} (tarea {}) aceptado [{}]", req.frame, req.task_id, kinds.join("+"));

        self.held.insert(task.id);
        out.push(SourceUpcall::NewTask(task));
    }

    fn build_task(&self, req: &TaskRequest) -> Task {
        let spec = |j: &JobRequest| {
            let (input_role, output_role) = match j.kind {
                JobKind::Render => (FileRole::RenderInput, FileRole::RenderOutput),
                JobKind::Filter => (FileRole::FilterInput, FileRole::FilterOutput),
            };
            // el output sólo vive hasta que se sube; los inputs quedan como caché
            let output = self.registry.get_or_create(self.workdir.join(&j.output), output_role);
            output.mark_for_deletion(DeletePolicy::OnFrameDone);
            JobSpec {
                desc: j.desc.clone(),
                input: self.registry.get_or_create(self.workdir.join(&j.input), input_role),
                output,
                format: j.format.clone(),
                args: j.args.clone(),
                additional: j
                    .additional
                    .iter()
                    .map(|n| self.registry.get_or_create(self.workdir.join(n), FileRole::Additional))
                    .collect(),
                timeout: (j.timeout_ms > 0).then(|| Duration::from_millis(j.timeout_ms as u64)),
                status: Default::default(),
            }
        };
        Task::new(
            req.task_id,
            req.frame,
            req.job(JobKind::Render).map(spec),
            req.job(JobKind::Filter).map(spec),
        )
    }

    /* --------- Control --------- */

    fn on_control(&mut self, seq: u32, cmd: ControlCmd, out: &mut Vec<SourceUpcall>) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        debug!("← {}: control {} (#{})", s.link.peer(), cmd.name(), seq);

        let ctl = match cmd {
            ControlCmd::Ping => None,
            ControlCmd::ClientQuit => {
                // lo que tenemos se sigue reportando mientras la sesión viva
                info!("el dispatcher {} se va; quedan {} tareas suyas", s.link.peer(), self.held.len());
                None
            }
            ControlCmd::KillUser => Some(SourceControl::Kill(KillReason::User)),
            ControlCmd::KillServer => Some(SourceControl::Kill(KillReason::Server)),
            ControlCmd::Stop => Some(SourceControl::Stop),
            ControlCmd::Continue => Some(SourceControl::Continue),
            ControlCmd::GiveBack { keep } => Some(SourceControl::GiveBack { keep }),
            ControlCmd::NoMoreTasks => {
                warn!("el dispatcher mandó {}: no soportado", cmd.name());
                s.link.send(Message::ControlResponse {
                    seq,
                    cmd,
                    status: ControlStatus::Unsupported,
                    a: 0,
                    b: 0,
                });
                return;
            }
        };

        match ctl {
            None => {
                s.link.send(Message::ControlResponse {
                    seq,
                    cmd,
                    status: ControlStatus::Ok,
                    a: 0,
                    b: 0,
                });
            }
            Some(ctl) => {
                s.replies.insert(seq, cmd);
                out.push(SourceUpcall::Control { reply: Some(seq), ctl });
            }
        }
    }

    fn reply(&mut self, reply: u32, a: u32, b: u32) {
        let Some(s) = self.session.as_mut() else {
            debug!("respuesta de control #{} sin sesión", reply);
            return;
        };
        let Some(cmd) = s.replies.remove(&reply) else {
            debug!("respuesta de control #{} que nadie pidió", reply);
            return;
        };
        debug!("→ {}: {} listo (#{}, {}, {})", s.link.peer(), cmd.name(), reply, a, b);
        s.link.send(Message::ControlResponse {
            seq: reply,
            cmd,
            status: ControlStatus::Ok,
            a,
            b,
        });
    }

    /// TaskDone + outputs + DoneComplete para una tarea de esta sesión. Una
    /// tarea que no llegó a correr vuelve como devuelta.
    fn report(&mut self, mut task: Task) {
        if !self.held.remove(&task.id) {
            debug!("{} no es de esta sesión; se descarta", task);
            return;
        }
        let Some(s) = self.session.as_mut() else {
            debug!("{} sin sesión; se descarta", task);
            return;
        };

        let mut given_back = never_ran(&task);
        if given_back && task.failed {
            // falló sin lanzar: que el dispatcher lo cuente como fallo
            if let Some(job) = task.next_kind().and_then(|k| task.job_mut(k)) {
                job.status = ExecStatus::launch_failed();
            }
            given_back = false;
        }

        // 1) Outputs a subir; si alguno no está el estado deja de ser éxito
        let mut uploads = Vec::new();
        if !given_back {
            for kind in JobKind::ALL {
                let Some(job) = task.job_mut(kind) else { continue };
                if !job.status.is_success() {
                    continue;
                }
                match job.output.stat() {
                    Ok(st) if st.size > 0 => uploads.push((kind, job.output.clone(), st.size)),
                    _ => {
                        warn!("{}: falta el output {}", kind, job.output.path().display());
                        job.status.output = OutputState::Bad;
                    }
                }
            }
        }

        // 2) Mensajes, en orden
        let outcome = if given_back {
            DoneOutcome::GivenBack
        } else {
            DoneOutcome::Processed
        };
        s.link.send(Message::TaskDone(TaskDone {
            task_id: task.id,
            outcome,
            render: task.render.as_ref().map(|j| j.status.clone()),
            filter: task.filter.as_ref().map(|j| j.status.clone()),
        }));
        for (kind, h, size) in uploads {
            let path = h.path().to_path_buf();
            s.link.send_file(
                Message::FileUpload {
                    task_id: task.id,
                    kind,
                    size,
                },
                path,
                size,
                Some(h),
            );
        }
        s.link.send(Message::DoneComplete { task_id: task.id });
        s.reported += 1;
        debug!("{} reportado ({:?})", task, outcome);
    }
}

/// Todo lo que nombra un job tiene que venir en el manifiesto, salvo el
/// input de un filtro que lee el output del render del mismo pedido.
fn validate_request(req: &TaskRequest) -> Result<(), ProtocolError> {
    let bad = |state| ProtocolError::Unexpected {
        got: "TaskRequest",
        state,
    };
    if req.jobs.is_empty() {
        return Err(bad("sin jobs"));
    }
    let mut kinds = HashSet::new();
    if !req.jobs.iter().all(|j| kinds.insert(j.kind)) {
        return Err(bad("job repetido"));
    }

    let mut names = HashSet::new();
    if !req.files.iter().all(|f| names.insert(f.name.as_str())) {
        return Err(bad("archivo repetido en el manifiesto"));
    }
    let render_out = req.job(JobKind::Render).map(|j| j.output.as_str());
    for j in &req.jobs {
        let chained = j.kind == JobKind::Filter && render_out == Some(j.input.as_str());
        if !chained && !names.contains(j.input.as_str()) {
            return Err(bad("input fuera del manifiesto"));
        }
        if j.additional.iter().any(|a| !names.contains(a.as_str())) {
            return Err(bad("archivo adicional fuera del manifiesto"));
        }
        if names.contains(j.output.as_str()) {
            return Err(bad("output pisa un input"));
        }
    }
    Ok(())
}

/// Sin ninguna mitad ejecutada: vuelve como devuelta.
fn never_ran(task: &Task) -> bool {
    JobKind::ALL
        .iter()
        .filter_map(|k| task.job(*k))
        .all(|j| j.status.reason == TermReason::Unset)
}

/* --------- TaskSource --------- */

impl TaskSource for ConsumerSource {
    type Io = ConsumerIo;

    fn is_active(&self) -> bool {
        true
    }

    fn connect(&mut self, out: &mut Vec<SourceUpcall>) {
        info!(
            "esperando dispatcher: {} jobs en paralelo, cola {}, {} capacidades",
            self.offer.max_jobs,
            self.offer.capacity,
            self.offer.caps.len()
        );
        out.push(SourceUpcall::Connected);
    }

    fn get_task(&mut self, _out: &mut Vec<SourceUpcall>) {
        debug!("get_task en una fuente activa: se ignora");
    }

    fn done_task(&mut self, task: Task, _out: &mut Vec<SourceUpcall>) {
        self.report(task);
    }

    fn give_back_tasks(&mut self, tasks: Vec<Task>, todo_after: usize, proc_after: usize, reply: u32) {
        // lo que ya tenía el render hecho vuelve procesado, con su output
        for t in tasks {
            self.report(t);
        }
        self.reply(reply, todo_after as u32, proc_after as u32);
    }

    fn control_done(&mut self, reply: u32, _ctl: SourceControl, a: u32, b: u32) {
        self.reply(reply, a, b);
    }

    fn quitting(&mut self) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        if let Some(s) = self.session.as_mut() {
            let seq = s.control.issue(ControlCmd::NoMoreTasks, Instant::now());
            info!("avisando a {} que no se aceptan más tareas", s.link.peer());
            s.link.send(Message::ControlRequest {
                seq,
                cmd: ControlCmd::NoMoreTasks,
            });
        }
    }

    fn disconnect(&mut self, out: &mut Vec<SourceUpcall>) {
        self.closed = true;
        if let Some(s) = self.session.take() {
            info!("cerrando la sesión con {}", s.link.peer());
            s.link.close();
            self.linger(s.writer);
        }
        for (_, c) in std::mem::take(&mut self.candidates) {
            c.link.close();
            self.linger(c.writer);
        }
        out.push(SourceUpcall::Disconnected);
    }

    fn recovery_complete(&mut self, _out: &mut Vec<SourceUpcall>) {
        if self.recovering {
            info!("recovery terminado: se aceptan dispatchers otra vez");
        }
        self.recovering = false;
        self.held.clear();
    }

    fn handle_io(&mut self, ev: ConsumerIo, view: &QueueView, out: &mut Vec<SourceUpcall>) {
        match ev {
            ConsumerIo::Accepted { stream, peer } => self.on_accepted(stream, peer),
            ConsumerIo::Link(id, LinkEvent::Message(msg)) => {
                if self.candidates.contains_key(&id) {
                    return self.on_candidate_message(id, msg);
                }
                if !self.session.as_ref().is_some_and(|s| s.id == id) {
                    return;
                }
                let name = msg.name();
                if let Err(e) = self.on_session_message(msg, view, out) {
                    error!("error de protocolo en {}: {}", name, e);
                    self.lose_session("error de protocolo", out);
                }
            }
            ConsumerIo::Link(id, LinkEvent::BodyReceived { error, .. }) => {
                if self.session.as_ref().is_some_and(|s| s.id == id) {
                    self.on_body(error, view, out);
                }
            }
            ConsumerIo::Link(id, LinkEvent::Closed(err)) => {
                if let Some(c) = self.candidates.remove(&id) {
                    debug!("{} se fue antes de autenticarse", c.link.peer());
                    return self.linger(c.writer);
                }
                if self.session.as_ref().is_some_and(|s| s.id == id) {
                    match &err {
                        None => self.lose_session("cierre del dispatcher", out),
                        Some(e) => {
                            warn!("conexión con el dispatcher caída: {}", e);
                            self.lose_session("conexión caída", out);
                        }
                    }
                }
            }
        }
    }

    fn on_tick(&mut self, now: Instant, out: &mut Vec<SourceUpcall>) {
        // 1) Handshakes colgados
        let limit = self.cfg.response_timeout;
        let stale: Vec<ConnId> = self
            .candidates
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.since) >= limit)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(c) = self.candidates.remove(&id) {
                warn!("{}: handshake sin respuesta; se cierra", c.link.peer());
                c.link.close();
                self.linger(c.writer);
            }
        }

        // 2) Keepalive de la sesión
        let Some(s) = self.session.as_mut() else {
            return;
        };
        match keepalive_check(s.link.idle_for(now), &s.control, now, &self.cfg) {
            KeepAlive::Nothing => {}
            KeepAlive::Ping => {
                let seq = s.control.issue(ControlCmd::Ping, now);
                s.link.send(Message::ControlRequest {
                    seq,
                    cmd: ControlCmd::Ping,
                });
            }
            KeepAlive::Close => {
                warn!("el dispatcher {} no responde; se cierra la sesión", s.link.peer());
                self.lose_session("sin respuesta", out);
            }
        }
    }

    fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        if let Some(s) = self.session.take() {
            s.link.close();
            self.closing.push(s.writer);
        }
        std::mem::take(&mut self.closing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::wire::codec::{read_message, write_message};
    use common::wire::{ManifestEntry, MAX_MESSAGE_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const SECRET: &str = "granja";
    /// mtime del dispatcher para archivos "viejos"
    const OLD_MS: i64 = 1_600_000_000_000;

    async fn recv(s: &mut TcpStream) -> Message {
        read_message(s, MAX_MESSAGE_LEN)
            .await
            .expect("lectura")
            .expect("conexión cerrada")
    }

    async fn send(s: &mut TcpStream, msg: Message) {
        write_message(s, &msg).await.expect("escritura");
    }

    fn request(task_id: TaskId, desc: &str) -> TaskRequest {
        TaskRequest {
            task_id,
            frame: task_id as i32,
            jobs: vec![JobRequest {
                kind: JobKind::Render,
                desc: desc.into(),
                input: "scene.blend".into(),
                output: format!("frame-{task_id}.png"),
                format: "png".into(),
                timeout_ms: 0,
                args: Vec::new(),
                additional: Vec::new(),
            }],
            files: vec![ManifestEntry {
                name: "scene.blend".into(),
                size: 6,
                mtime_ms: OLD_MS,
            }],
        }
    }

    fn take_task(out: &mut Vec<SourceUpcall>) -> Task {
        let pos = out
            .iter()
            .position(|u| matches!(u, SourceUpcall::NewTask(_)))
            .expect("sin NewTask");
        match out.remove(pos) {
            SourceUpcall::NewTask(t) => t,
            _ => unreachable!(),
        }
    }

    struct Harness {
        src: ConsumerSource,
        rx: mpsc::UnboundedReceiver<ConsumerIo>,
        out: Vec<SourceUpcall>,
        view: QueueView,
        listener: TcpListener,
        dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let offer = Offer {
                max_jobs: 1,
                capacity: 1,
                caps: vec![Capability {
                    kind: JobKind::Render,
                    desc: "blender".into(),
                }],
            };
            let mut src = ConsumerSource::new(
                LinkConfig::new(SECRET),
                offer,
                dir.path().to_path_buf(),
                FileRegistry::new(),
                tx,
            );
            let mut out = Vec::new();
            src.connect(&mut out);
            Self {
                src,
                rx,
                out,
                view: QueueView {
                    accepting: true,
                    ..QueueView::default()
                },
                listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
                dir,
            }
        }

        /// Conecta un dispatcher de prueba y se lo entrega al consumer.
        async fn dial(&mut self) -> TcpStream {
            let addr = self.listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (stream, peer) = self.listener.accept().await.unwrap();
            self.src.handle_io(
                ConsumerIo::Accepted {
                    stream,
                    peer: peer.to_string(),
                },
                &self.view,
                &mut self.out,
            );
            client
        }

        async fn step(&mut self) {
            let ev = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timeout esperando I/O")
                .expect("canal cerrado");
            self.src.handle_io(ev, &self.view, &mut self.out);
        }

        async fn pump_until(&mut self, pred: impl Fn(&ConsumerSource, &[SourceUpcall]) -> bool) {
            let Self { src, rx, out, view, .. } = self;
            tokio::time::timeout(Duration::from_secs(5), async {
                while !pred(src, out) {
                    let ev = rx.recv().await.expect("canal cerrado");
                    src.handle_io(ev, view, out);
                }
            })
            .await
            .expect("timeout esperando al consumer");
        }

        /// Handshake completo del lado dispatcher.
        async fn login(&mut self, secret: &str) -> (TcpStream, ConnectCode, Vec<Capability>) {
            let mut s = self.dial().await;
            let Message::ChallengeRequest { challenge, max_jobs, .. } = recv(&mut s).await else {
                panic!("se esperaba ChallengeRequest");
            };
            assert_eq!(max_jobs, 1);
            send(
                &mut s,
                Message::ChallengeResponse {
                    response: auth::keyed_response(secret, &challenge),
                    now_ms: clock::now_ms(),
                },
            )
            .await;
            self.pump_until(|src, _| src.candidates.is_empty()).await;
            let Message::NowConnected { code, capabilities, .. } = recv(&mut s).await else {
                panic!("se esperaba NowConnected");
            };
            (s, code, capabilities)
        }

        /// Manda un pedido cuyo input ya está al día y espera la tarea.
        async fn accept_task(&mut self, s: &mut TcpStream, task_id: TaskId) -> Task {
            std::fs::write(self.dir.path().join("scene.blend"), b"escena").unwrap();
            send(s, Message::TaskRequest(request(task_id, "blender"))).await;
            self.pump_until(|_, out| out.iter().any(|u| matches!(u, SourceUpcall::NewTask(_))))
                .await;
            assert_eq!(
                recv(s).await,
                Message::TaskResponse {
                    task_id,
                    code: TaskResponseCode::Accepted
                }
            );
            take_task(&mut self.out)
        }
    }

    #[tokio::test]
    async fn handshake_con_el_secreto_correcto_abre_sesion() {
        let mut h = Harness::new().await;
        let (_s, code, caps) = h.login(SECRET).await;
        assert_eq!(code, ConnectCode::Accepted);
        assert_eq!(caps, h.src.offer.caps);
        assert!(h.src.has_session());
    }

    #[tokio::test]
    async fn secreto_incorrecto_se_rechaza_y_se_cierra() {
        let mut h = Harness::new().await;
        let (mut s, code, caps) = h.login("otro").await;
        assert_eq!(code, ConnectCode::AuthFailed);
        assert!(caps.is_empty());
        assert!(!h.src.has_session());
        assert!(matches!(read_message(&mut s, MAX_MESSAGE_LEN).await, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn segundo_dispatcher_recibe_already_connected() {
        let mut h = Harness::new().await;
        let (_s1, code, _) = h.login(SECRET).await;
        assert_eq!(code, ConnectCode::Accepted);
        let (_s2, code, _) = h.login(SECRET).await;
        assert_eq!(code, ConnectCode::AlreadyConnected);
        assert!(h.src.has_session());
    }

    #[tokio::test]
    async fn task_request_baja_lo_que_falta_y_entrega_la_tarea() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;

        send(&mut s, Message::TaskRequest(request(7, "blender"))).await;
        assert_eq!(recv(&mut s).await, Message::FileRequest { task_id: 7, index: 0 });
        send(&mut s, Message::FileDownload { task_id: 7, index: 0, size: 6 }).await;
        s.write_all(b"escena").await.unwrap();

        h.pump_until(|_, out| out.iter().any(|u| matches!(u, SourceUpcall::NewTask(_))))
            .await;
        assert_eq!(
            recv(&mut s).await,
            Message::TaskResponse {
                task_id: 7,
                code: TaskResponseCode::Accepted
            }
        );

        let input = h.dir.path().join("scene.blend");
        assert_eq!(std::fs::read(&input).unwrap(), b"escena");
        // mtime del dispatcher pasado a nuestro reloj
        let skew = h.src.session.as_ref().unwrap().skew;
        let mtime = std::fs::metadata(&input).unwrap().modified().unwrap();
        assert_eq!(mtime, clock::ms_to_system_time(skew.remote_to_local(OLD_MS)));

        let t = take_task(&mut h.out);
        assert_eq!(t.id, 7);
        let render = t.render.as_ref().unwrap();
        assert_eq!(render.input.path(), input);
        assert_eq!(render.output.path(), h.dir.path().join("frame-7.png"));
        assert_eq!(render.output.policy(), DeletePolicy::OnFrameDone);
        assert!(t.filter.is_none());
    }

    #[tokio::test]
    async fn archivo_al_dia_no_se_pide() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;
        let t = h.accept_task(&mut s, 3).await;
        assert_eq!(t.frame, 3);
    }

    #[tokio::test]
    async fn rechazos_por_capacidad_y_por_estado() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;

        send(&mut s, Message::TaskRequest(request(1, "cycles"))).await;
        h.step().await;
        assert_eq!(
            recv(&mut s).await,
            Message::TaskResponse {
                task_id: 1,
                code: TaskResponseCode::Unsupported
            }
        );

        h.view.accepting = false;
        send(&mut s, Message::TaskRequest(request(2, "blender"))).await;
        h.step().await;
        assert_eq!(
            recv(&mut s).await,
            Message::TaskResponse {
                task_id: 2,
                code: TaskResponseCode::Busy
            }
        );

        // cola llena: concurrencia 1 + capacidad 1
        h.view = QueueView {
            todo: 1,
            proc: 1,
            done: 0,
            accepting: true,
        };
        send(&mut s, Message::TaskRequest(request(3, "blender"))).await;
        h.step().await;
        assert_eq!(
            recv(&mut s).await,
            Message::TaskResponse {
                task_id: 3,
                code: TaskResponseCode::Busy
            }
        );
        assert!(h.out.iter().all(|u| !matches!(u, SourceUpcall::NewTask(_))));
    }

    #[tokio::test]
    async fn reporte_sube_los_outputs_y_despues_cierra() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;
        let mut t = h.accept_task(&mut s, 4).await;

        let out_path = h.dir.path().join("frame-4.png");
        std::fs::write(&out_path, b"imagen").unwrap();
        t.render.as_mut().unwrap().status = ExecStatus {
            reason: TermReason::Exited,
            code: 0,
            output: OutputState::Complete,
            ..ExecStatus::default()
        };
        h.src.done_task(t, &mut h.out);

        let Message::TaskDone(done) = recv(&mut s).await else {
            panic!("se esperaba TaskDone");
        };
        assert_eq!(done.outcome, DoneOutcome::Processed);
        assert!(done.render.unwrap().is_success());
        assert_eq!(
            recv(&mut s).await,
            Message::FileUpload {
                task_id: 4,
                kind: JobKind::Render,
                size: 6
            }
        );
        let mut body = [0u8; 6];
        s.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"imagen");
        assert_eq!(recv(&mut s).await, Message::DoneComplete { task_id: 4 });

        // subido el output, ya no hace falta
        assert!(!out_path.exists());
    }

    #[tokio::test]
    async fn give_back_devuelve_y_contesta_con_las_colas() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;
        let t = h.accept_task(&mut s, 5).await;

        send(
            &mut s,
            Message::ControlRequest {
                seq: 9,
                cmd: ControlCmd::GiveBack { keep: 0 },
            },
        )
        .await;
        h.step().await;
        assert!(matches!(
            h.out.last(),
            Some(SourceUpcall::Control {
                reply: Some(9),
                ctl: SourceControl::GiveBack { keep: 0 }
            })
        ));

        h.src.give_back_tasks(vec![t], 0, 0, 9);
        let Message::TaskDone(done) = recv(&mut s).await else {
            panic!("se esperaba TaskDone");
        };
        assert_eq!(done.outcome, DoneOutcome::GivenBack);
        assert_eq!(recv(&mut s).await, Message::DoneComplete { task_id: 5 });
        assert_eq!(
            recv(&mut s).await,
            Message::ControlResponse {
                seq: 9,
                cmd: ControlCmd::GiveBack { keep: 0 },
                status: ControlStatus::Ok,
                a: 0,
                b: 0
            }
        );
    }

    #[tokio::test]
    async fn ping_del_dispatcher_se_contesta_en_el_momento() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;
        send(&mut s, Message::ControlRequest { seq: 1, cmd: ControlCmd::Ping }).await;
        h.step().await;
        assert_eq!(
            recv(&mut s).await,
            Message::ControlResponse {
                seq: 1,
                cmd: ControlCmd::Ping,
                status: ControlStatus::Ok,
                a: 0,
                b: 0
            }
        );
        assert!(h.out.iter().all(|u| !matches!(u, SourceUpcall::Control { .. })));
    }

    #[tokio::test]
    async fn no_more_tasks_del_dispatcher_no_se_soporta() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;
        send(&mut s, Message::ControlRequest { seq: 4, cmd: ControlCmd::NoMoreTasks }).await;
        h.step().await;
        assert_eq!(
            recv(&mut s).await,
            Message::ControlResponse {
                seq: 4,
                cmd: ControlCmd::NoMoreTasks,
                status: ControlStatus::Unsupported,
                a: 0,
                b: 0
            }
        );
        assert!(h.out.iter().all(|u| !matches!(u, SourceUpcall::Control { .. })));
        assert!(h.src.has_session());
    }

    #[tokio::test]
    async fn client_quit_con_tareas_en_vuelo_no_las_suelta() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;
        let t = h.accept_task(&mut s, 8).await;

        send(&mut s, Message::ControlRequest { seq: 2, cmd: ControlCmd::ClientQuit }).await;
        h.step().await;
        assert_eq!(
            recv(&mut s).await,
            Message::ControlResponse {
                seq: 2,
                cmd: ControlCmd::ClientQuit,
                status: ControlStatus::Ok,
                a: 0,
                b: 0
            }
        );
        assert!(h
            .out
            .iter()
            .all(|u| !matches!(u, SourceUpcall::Control { .. } | SourceUpcall::UpstreamLost)));
        assert!(h.src.held.contains(&8));

        // la sesión sigue: la tarea se reporta igual
        h.src.done_task(t, &mut h.out);
        let Message::TaskDone(done) = recv(&mut s).await else {
            panic!("se esperaba TaskDone");
        };
        assert_eq!(done.task_id, 8);
        assert_eq!(done.outcome, DoneOutcome::GivenBack);
        assert_eq!(recv(&mut s).await, Message::DoneComplete { task_id: 8 });
    }

    #[tokio::test]
    async fn caida_de_la_sesion_entra_en_recovery() {
        let mut h = Harness::new().await;
        let (mut s, _, _) = h.login(SECRET).await;
        let t = h.accept_task(&mut s, 6).await;
        drop(s);

        h.pump_until(|_, out| out.iter().any(|u| matches!(u, SourceUpcall::UpstreamLost)))
            .await;
        assert!(!h.src.has_session());

        // hasta que el scheduler vacía las colas no entra nadie
        let (_s, code, _) = h.login(SECRET).await;
        assert_eq!(code, ConnectCode::Busy);

        h.src.done_task(t, &mut h.out);
        h.src.recovery_complete(&mut h.out);
        let (_s, code, _) = h.login(SECRET).await;
        assert_eq!(code, ConnectCode::Accepted);
    }

    #[test]
    fn pedido_con_input_fuera_del_manifiesto_es_invalido() {
        let mut req = request(1, "blender");
        assert!(validate_request(&req).is_ok());

        // filtro encadenado al render del mismo pedido
        req.jobs.push(JobRequest {
            kind: JobKind::Filter,
            desc: "denoise".into(),
            input: "frame-1.png".into(),
            output: "frame-1-clean.png".into(),
            format: "png".into(),
            timeout_ms: 0,
            args: Vec::new(),
            additional: Vec::new(),
        });
        assert!(validate_request(&req).is_ok());

        req.jobs[1].input = "otro.png".into();
        assert!(validate_request(&req).is_err());

        let mut req = request(1, "blender");
        req.jobs[0].additional.push("tex.png".into());
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn manifiesto_con_nombre_repetido_es_invalido() {
        let mut req = request(1, "blender");
        req.files.push(ManifestEntry {
            name: "scene.blend".into(),
            size: 9,
            mtime_ms: OLD_MS,
        });
        assert!(matches!(
            validate_request(&req),
            Err(ProtocolError::Unexpected { state: "archivo repetido en el manifiesto", .. })
        ));
    }
}
