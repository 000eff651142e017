//! El scheduler: dueño único de las colas todo/proc/done.
//!
//! `TaskManager` es una máquina de estados sincrónica. Cada evento (I/O de la
//! fuente o del driver, señales, tick) entra por un `on_*`, que deja upcalls
//! en dos vectores; `settle` los aplica en orden y vuelve a decidir hasta que
//! no queda nada pendiente. Nada bloquea: toda espera es un estado explícito.

pub mod load;
pub mod runtime;
pub mod state;
pub mod traits;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::task::{ExecReport, Task, TaskId};

use load::{system_load_sampler, LoadMonitor, LoadSampler};
pub use state::{QueueSnapshot, RunState, RunStats, SourcePhase, StopState};
pub use traits::*;

/// Control del proceso (señales).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessControl {
    /// Primera vez: terminar lo que corre y salir. Segunda: matar y salir.
    Interrupt,
    /// No pedir más tareas, terminar las que hay en todo y salir.
    Drain,
    Stop,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Todo,
    Proc,
    Done,
}

fn take_from(q: &mut VecDeque<TaskId>, id: TaskId) -> bool {
    match q.iter().position(|x| *x == id) {
        Some(pos) => {
            q.remove(pos);
            true
        }
        None => false,
    }
}

pub struct TaskManager {
    cfg: SchedulerConfig,

    tasks: HashMap<TaskId, Task>,
    todo: VecDeque<TaskId>,
    proc: VecDeque<TaskId>,
    done: VecDeque<TaskId>,

    run: RunState,
    stop: StopState,
    source: SourcePhase,
    source_active: bool,

    // admisión
    fetching: bool,
    get_pending: bool,
    exhausted: bool,

    // arranques
    launch_pending: Option<TaskId>,
    retry_blocked: bool,
    load: LoadMonitor,

    // fallos
    failed_in_sequence: u32,
    breaker_tripped: bool,

    kill_started: Option<Instant>,
    kill_escalated: bool,
    stop_reply: Option<(u32, SourceControl)>,

    stats: RunStats,
}

impl TaskManager {
    pub fn new(cfg: SchedulerConfig) -> Self {
        let sampler = system_load_sampler();
        Self::with_load_sampler(cfg, sampler)
    }

    pub fn with_load_sampler(cfg: SchedulerConfig, sampler: LoadSampler) -> Self {
        let load = LoadMonitor::new(cfg.load_gate, cfg.load_check_interval, sampler);
        Self {
            cfg,
            tasks: HashMap::new(),
            todo: VecDeque::new(),
            proc: VecDeque::new(),
            done: VecDeque::new(),
            run: RunState::Running,
            stop: StopState::Running,
            source: SourcePhase::Disconnected,
            source_active: false,
            fetching: false,
            get_pending: false,
            exhausted: false,
            launch_pending: None,
            retry_blocked: false,
            load,
            failed_in_sequence: 0,
            breaker_tripped: false,
            kill_started: None,
            kill_escalated: false,
            stop_reply: None,
            stats: RunStats::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn run_state(&self) -> RunState {
        self.run
    }

    pub fn stop_state(&self) -> StopState {
        self.stop
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn todo_ids(&self) -> Vec<TaskId> {
        self.todo.iter().copied().collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            todo: self.todo.len(),
            proc: self.proc.len(),
            done: self.done.len(),
            run: self.run,
            stop: self.stop,
            source: self.source,
            failed_in_sequence: self.failed_in_sequence,
            stats: self.stats,
        }
    }

    /// Terminó: se pidió salir, la fuente cerró y no queda nada corriendo.
    pub fn is_finished(&self) -> bool {
        self.run.is_quitting() && self.source == SourcePhase::Closed && self.proc.is_empty()
    }

    fn view(&self) -> QueueView {
        QueueView {
            todo: self.todo.len(),
            proc: self.proc.len(),
            done: self.done.len(),
            accepting: self.run == RunState::Running
                && self.stop == StopState::Running
                && !self.breaker_tripped,
        }
    }

    /// Cada tarea está en exactamente una cola; en proc tiene dueño, fuera de
    /// proc no; en done está terminada y en todo no.
    pub fn check_invariants(&self) {
        assert_eq!(
            self.todo.len() + self.proc.len() + self.done.len(),
            self.tasks.len(),
            "las colas no particionan las tareas"
        );
        let mut seen = HashSet::new();
        for (q, ids) in [
            (Queue::Todo, &self.todo),
            (Queue::Proc, &self.proc),
            (Queue::Done, &self.done),
        ] {
            for id in ids {
                assert!(seen.insert(*id), "tarea {id} en más de una cola");
                let t = &self.tasks[id];
                match q {
                    Queue::Todo => {
                        assert!(t.owner.is_none(), "{t} en todo con dueño");
                        assert!(!t.is_finished(), "{t} terminada en todo");
                    }
                    Queue::Proc => assert!(t.owner.is_some(), "{t} en proc sin dueño"),
                    Queue::Done => {
                        assert!(t.owner.is_none(), "{t} en done con dueño");
                        assert!(t.is_finished(), "{t} sin terminar en done");
                    }
                }
            }
        }
    }

    /* --------- Entradas --------- */

    pub fn start<S: TaskSource, D: TaskDriver>(&mut self, src: &mut S, drv: &mut D) {
        self.source_active = src.is_active();
        let mut su = Vec::new();
        let mut du = Vec::new();

        drv.start(&mut du);
        self.source = SourcePhase::Connecting;
        src.connect(&mut su);

        self.settle(src, drv, su, du);
    }

    pub fn on_source_io<S: TaskSource, D: TaskDriver>(&mut self, src: &mut S, drv: &mut D, ev: S::Io) {
        let view = self.view();
        let mut su = Vec::new();
        src.handle_io(ev, &view, &mut su);
        self.settle(src, drv, su, Vec::new());
    }

    pub fn on_driver_io<S: TaskSource, D: TaskDriver>(&mut self, src: &mut S, drv: &mut D, ev: D::Io) {
        let mut du = Vec::new();
        drv.handle_io(ev, &mut du);
        self.settle(src, drv, Vec::new(), du);
    }

    pub fn on_control<S: TaskSource, D: TaskDriver>(
        &mut self,
        src: &mut S,
        drv: &mut D,
        ctl: ProcessControl,
        now: Instant,
    ) {
        let mut du = Vec::new();

        match ctl {
            ProcessControl::Interrupt => match self.run {
                RunState::Running | RunState::Recovering => {
                    info!("interrupción: se terminan las tareas en curso y se sale");
                    self.schedule_quit(src, drv);
                }
                RunState::QuitAfterDrain if !self.todo.is_empty() => {
                    info!("interrupción durante el drenaje: quedan {} sin arrancar", self.todo.len());
                    self.run = RunState::QuitScheduled;
                    drv.schedule_give_back(0);
                }
                RunState::QuitScheduled | RunState::QuitAfterDrain => {
                    warn!("segunda interrupción: se matan las tareas en curso");
                    self.kill_and_quit(drv, &mut du, now);
                }
                RunState::KillAndQuitNow => {
                    warn!("ya se está saliendo; se escala el kill");
                    self.escalate_kill(drv, &mut du);
                }
            },
            ProcessControl::Drain => self.schedule_drain(src),
            ProcessControl::Stop => self.request_stop(src, drv, None, &mut du),
            ProcessControl::Continue => self.request_continue(src, drv, None, &mut du),
        }

        self.settle(src, drv, Vec::new(), du);
    }

    pub fn on_tick<S: TaskSource, D: TaskDriver>(&mut self, src: &mut S, drv: &mut D, now: Instant) {
        let mut su = Vec::new();
        let mut du = Vec::new();

        if self.load.poll(now) && !self.load.blocked() {
            self.retry_blocked = false;
        }

        if let Some(started) = self.kill_started {
            if !self.kill_escalated
                && !self.proc.is_empty()
                && now.saturating_duration_since(started) >= self.cfg.kill_grace
            {
                warn!(
                    "{} tareas siguen corriendo después de {:?}; se escala el kill",
                    self.proc.len(),
                    self.cfg.kill_grace
                );
                self.escalate_kill(drv, &mut du);
            }
        }

        src.on_tick(now, &mut su);
        drv.on_tick(now, &mut du);
        if matches!(self.run, RunState::Running | RunState::QuitAfterDrain) {
            drv.rebalance(self.tight(), self.todo.len());
        }
        // reintento periódico de arranques que dieron Retry
        self.retry_blocked = false;

        self.settle(src, drv, su, du);
    }

    /* --------- Bucle de upcalls --------- */

    fn settle<S: TaskSource, D: TaskDriver>(
        &mut self,
        src: &mut S,
        drv: &mut D,
        mut su: Vec<SourceUpcall>,
        mut du: Vec<DriverUpcall>,
    ) {
        loop {
            while !su.is_empty() || !du.is_empty() {
                for u in std::mem::take(&mut su) {
                    self.apply_source(src, drv, u, &mut du);
                }
                for u in std::mem::take(&mut du) {
                    self.apply_driver(src, drv, u);
                }
            }

            self.decide(src, drv, &mut su, &mut du);
            if su.is_empty() && du.is_empty() {
                break;
            }
        }

        if cfg!(debug_assertions) {
            self.check_invariants();
        }
    }

    fn apply_source<S: TaskSource, D: TaskDriver>(
        &mut self,
        src: &mut S,
        drv: &mut D,
        u: SourceUpcall,
        du: &mut Vec<DriverUpcall>,
    ) {
        match u {
            SourceUpcall::Connected => {
                info!("fuente de tareas conectada");
                self.source = SourcePhase::Connected;
            }
            SourceUpcall::ConnectFailed(why) => {
                error!("no se pudo conectar la fuente de tareas: {}", why);
                self.source = SourcePhase::Closed;
                if !self.run.is_quitting() {
                    self.run = RunState::QuitAfterDrain;
                }
            }
            SourceUpcall::NewTask(mut task) => {
                self.get_pending = false;
                assert!(
                    !self.tasks.contains_key(&task.id),
                    "tarea {} duplicada",
                    task.id
                );
                task.owner = None;
                debug!("nueva tarea: {}", task);
                self.todo.push_back(task.id);
                self.tasks.insert(task.id, task);
                self.retry_blocked = false;
            }
            SourceUpcall::NoMoreTasks => {
                self.get_pending = false;
                if !self.exhausted {
                    info!("la fuente no tiene más tareas");
                    self.exhausted = true;
                }
            }
            SourceUpcall::Disconnected => {
                info!("fuente de tareas desconectada");
                self.source = SourcePhase::Closed;
            }
            SourceUpcall::Control { reply, ctl } => self.source_control(src, drv, reply, ctl, du),
            SourceUpcall::UpstreamLost => self.enter_recovery(drv, du, false),
        }
    }

    fn apply_driver<S: TaskSource, D: TaskDriver>(
        &mut self,
        src: &mut S,
        drv: &mut D,
        u: DriverUpcall,
    ) {
        match u {
            DriverUpcall::Launched(id) => {
                if self.launch_pending == Some(id) {
                    self.launch_pending = None;
                }
                if let Some(t) = self.tasks.get(&id) {
                    debug!("{} lanzada", t);
                }
            }
            DriverUpcall::LaunchFailed { task, fatal, report } => {
                if self.launch_pending == Some(task) {
                    self.launch_pending = None;
                }
                if !self.proc.contains(&task) {
                    debug!("launch fallido de la tarea {} que ya no está en proc", task);
                    return;
                }
                if let (Some(r), Some(t)) = (report.as_ref(), self.tasks.get_mut(&task)) {
                    t.commit_report(r);
                }
                if fatal {
                    self.fail_task(src, drv, task);
                } else {
                    self.requeue(task, false);
                }
                self.retry_blocked = false;
            }
            DriverUpcall::JobSucceeded { task, report } => {
                if !self.begin_completion(task, "éxito") {
                    return;
                }
                let hard = self.commit(task, &report);
                if hard {
                    self.fail_task(src, drv, task);
                } else {
                    self.failed_in_sequence = 0;
                    self.requeue(task, false);
                }
            }
            DriverUpcall::TaskFailed { task, report } => {
                if !self.begin_completion(task, "fallo") {
                    return;
                }
                self.commit(task, &report);
                self.fail_task(src, drv, task);
            }
            DriverUpcall::PutBack { task, report } => {
                if !self.begin_completion(task, "put-back") {
                    return;
                }
                if self.commit(task, &report) {
                    self.fail_task(src, drv, task);
                } else {
                    self.requeue(task, true);
                }
            }
            DriverUpcall::CheckStartNewJobs => self.retry_blocked = false,
            DriverUpcall::StopContDone(sc) => self.finish_stop_cont(src, sc),
        }
    }

    /* --------- Transiciones de tareas --------- */

    /// `false` si la tarea no está en proc (reporte repetido o tardío).
    fn begin_completion(&mut self, id: TaskId, what: &str) -> bool {
        if self.launch_pending == Some(id) {
            self.launch_pending = None;
        }
        if self.proc.contains(&id) {
            self.retry_blocked = false;
            return true;
        }
        debug!("{} de la tarea {} que no está en proc; se ignora", what, id);
        false
    }

    fn commit(&mut self, id: TaskId, report: &ExecReport) -> bool {
        self.tasks.get_mut(&id).is_some_and(|t| t.commit_report(report))
    }

    /// Sale de proc: a done si terminó, si no al frente de todo.
    fn requeue(&mut self, id: TaskId, put_back: bool) {
        take_from(&mut self.proc, id);
        let Some(t) = self.tasks.get_mut(&id) else {
            return;
        };
        t.owner = None;

        if t.is_finished() {
            info!("{} terminada", t);
            self.stats.completed += 1;
            self.done.push_back(id);
            return;
        }

        if put_back {
            t.put_backs += 1;
            self.stats.put_back += 1;
            debug!("{} vuelve a todo (put-back #{})", t, t.put_backs);
        } else {
            debug!("{} vuelve a todo (falta {:?})", t, t.next_kind());
        }
        self.todo.push_front(id);
    }

    fn fail_task<S: TaskSource, D: TaskDriver>(&mut self, src: &mut S, drv: &mut D, id: TaskId) {
        if !take_from(&mut self.proc, id) {
            take_from(&mut self.todo, id);
        }
        let Some(t) = self.tasks.get_mut(&id) else {
            return;
        };
        t.owner = None;
        t.failed = true;
        self.done.push_back(id);
        self.stats.failed += 1;
        self.failed_in_sequence += 1;
        warn!("{} falló ({} fallos seguidos)", t, self.failed_in_sequence);

        let max = self.cfg.max_failed_in_sequence;
        if max > 0 && self.failed_in_sequence >= max && !self.breaker_tripped {
            self.breaker_tripped = true;
            error!("{} fallos seguidos: no se arrancan más tareas y se sale", self.failed_in_sequence);
            self.schedule_quit(src, drv);
        }
    }

    /* --------- Quit / recovery --------- */

    fn schedule_quit<S: TaskSource, D: TaskDriver>(&mut self, src: &mut S, drv: &mut D) {
        if self.run.is_quitting() {
            return;
        }
        self.run = RunState::QuitScheduled;
        self.fetching = false;
        drv.schedule_give_back(0);
        src.quitting();
    }

    /// Quit "después de vaciar": lo que ya está en todo se ejecuta igual.
    fn schedule_drain<S: TaskSource>(&mut self, src: &mut S) {
        if self.run != RunState::Running {
            debug!("drenaje pedido en {:?}: se ignora", self.run);
            return;
        }
        info!("drenaje: no se piden más tareas; se terminan las {} de todo y se sale", self.todo.len());
        self.run = RunState::QuitAfterDrain;
        self.fetching = false;
        src.quitting();
    }

    /// Sin más tareas por venir: se reparte para terminar cuanto antes.
    fn tight(&self) -> bool {
        self.exhausted || self.run == RunState::QuitAfterDrain
    }

    fn kill_and_quit<D: TaskDriver>(&mut self, drv: &mut D, du: &mut Vec<DriverUpcall>, now: Instant) {
        self.run = RunState::KillAndQuitNow;
        let n = drv.term_all_jobs(KillReason::Quit, du);
        info!("kill enviado a {} tareas", n);
        self.kill_started = Some(now);
        self.kill_escalated = false;
    }

    fn escalate_kill<D: TaskDriver>(&mut self, drv: &mut D, du: &mut Vec<DriverUpcall>) {
        let reason = if self.run == RunState::Recovering {
            KillReason::Recovery
        } else {
            KillReason::Quit
        };
        drv.term_all_jobs(reason, du);
        self.kill_escalated = true;
    }

    fn enter_recovery<D: TaskDriver>(&mut self, drv: &mut D, du: &mut Vec<DriverUpcall>, already_killed: bool) {
        if self.run.is_quitting() || self.run == RunState::Recovering {
            return;
        }
        warn!("se perdió la fuente de tareas: recovery");
        self.run = RunState::Recovering;
        self.fetching = false;
        if !already_killed && !self.proc.is_empty() {
            let n = drv.term_all_jobs(KillReason::Recovery, du);
            debug!("recovery: kill a {} tareas", n);
        }
        self.kill_started = Some(Instant::now());
        self.kill_escalated = false;
    }

    fn finish_recovery(&mut self) {
        info!("recovery completo");
        self.run = RunState::Running;
        self.stop = StopState::Running;
        self.stop_reply = None;
        self.failed_in_sequence = 0;
        self.breaker_tripped = false;
        self.kill_started = None;
        self.kill_escalated = false;
        self.launch_pending = None;
        self.retry_blocked = false;
        self.exhausted = false;
        self.get_pending = false;
    }

    /// Devuelve done y después todo a la fuente.
    fn drain_all<S: TaskSource>(&mut self, src: &mut S, su: &mut Vec<SourceUpcall>) {
        while let Some(id) = self.done.pop_front() {
            if let Some(t) = self.tasks.remove(&id) {
                src.done_task(t, su);
            }
        }
        while let Some(id) = self.todo.pop_front() {
            if let Some(mut t) = self.tasks.remove(&id) {
                debug!("{} se devuelve sin terminar", t);
                t.owner = None;
                self.stats.given_back += 1;
                src.done_task(t, su);
            }
        }
    }

    /* --------- Control desde la fuente --------- */

    fn source_control<S: TaskSource, D: TaskDriver>(
        &mut self,
        src: &mut S,
        drv: &mut D,
        reply: Option<u32>,
        ctl: SourceControl,
        du: &mut Vec<DriverUpcall>,
    ) {
        match ctl {
            SourceControl::Kill(reason) => {
                let n = drv.term_all_jobs(reason, du);
                warn!("kill remoto ({:?}): {} tareas", reason, n);
                if let Some(r) = reply {
                    src.control_done(r, ctl, n as u32, 0);
                }
                // lo matado vuelve a la fuente
                self.enter_recovery(drv, du, true);
            }
            SourceControl::Stop => self.request_stop(src, drv, reply, du),
            SourceControl::Continue => self.request_continue(src, drv, reply, du),
            SourceControl::GiveBack { keep } => {
                let keep = keep as usize;
                let mut back = Vec::new();
                while self.todo.len() > keep {
                    let Some(id) = self.todo.pop_back() else { break };
                    if let Some(mut t) = self.tasks.remove(&id) {
                        t.given_back = true;
                        back.push(t);
                    }
                }
                back.reverse();
                self.stats.given_back += back.len() as u64;
                info!(
                    "give-back: se devuelven {} tareas (quedan {} en todo, {} en proc)",
                    back.len(),
                    self.todo.len(),
                    self.proc.len()
                );
                src.give_back_tasks(back, self.todo.len(), self.proc.len(), reply.unwrap_or(0));
            }
        }
    }

    fn request_stop<S: TaskSource, D: TaskDriver>(
        &mut self,
        src: &mut S,
        drv: &mut D,
        reply: Option<u32>,
        du: &mut Vec<DriverUpcall>,
    ) {
        match self.stop {
            StopState::Stopped | StopState::Stopping => {
                if let Some(r) = reply {
                    src.control_done(r, SourceControl::Stop, 0, 0);
                }
            }
            StopState::Running | StopState::Continuing => {
                self.answer_pending_stop_cont(src);
                info!("stop: se suspenden las tareas en curso");
                self.stop = StopState::Stopping;
                self.stop_reply = reply.map(|r| (r, SourceControl::Stop));
                if drv.stop_cont_tasks(StopCont::Stop, du) == StopContResult::Done {
                    self.finish_stop_cont(src, StopCont::Stop);
                }
            }
        }
    }

    fn request_continue<S: TaskSource, D: TaskDriver>(
        &mut self,
        src: &mut S,
        drv: &mut D,
        reply: Option<u32>,
        du: &mut Vec<DriverUpcall>,
    ) {
        match self.stop {
            StopState::Running | StopState::Continuing => {
                if let Some(r) = reply {
                    src.control_done(r, SourceControl::Continue, 0, 0);
                }
            }
            StopState::Stopped | StopState::Stopping => {
                self.answer_pending_stop_cont(src);
                info!("continue: se reanudan las tareas");
                self.stop = StopState::Continuing;
                self.stop_reply = reply.map(|r| (r, SourceControl::Continue));
                if drv.stop_cont_tasks(StopCont::Continue, du) == StopContResult::Done {
                    self.finish_stop_cont(src, StopCont::Continue);
                }
            }
        }
    }

    fn answer_pending_stop_cont<S: TaskSource>(&mut self, src: &mut S) {
        if let Some((r, ctl)) = self.stop_reply.take() {
            src.control_done(r, ctl, 0, 0);
        }
    }

    fn finish_stop_cont<S: TaskSource>(&mut self, src: &mut S, sc: StopCont) {
        match (sc, self.stop) {
            (StopCont::Stop, StopState::Stopping) => {
                info!("todas las tareas suspendidas");
                self.stop = StopState::Stopped;
            }
            (StopCont::Continue, StopState::Continuing) => {
                info!("todas las tareas reanudadas");
                self.stop = StopState::Running;
                self.retry_blocked = false;
            }
            _ => {
                debug!("fin de {:?} fuera de tiempo (estado {:?})", sc, self.stop);
                return;
            }
        }
        self.answer_pending_stop_cont(src);
    }

    /* --------- Decisiones --------- */

    fn decide<S: TaskSource, D: TaskDriver>(
        &mut self,
        src: &mut S,
        drv: &mut D,
        su: &mut Vec<SourceUpcall>,
        du: &mut Vec<DriverUpcall>,
    ) {
        // 1) colas de salida
        match self.run {
            RunState::QuitAfterDrain if !self.todo.is_empty() && !self.breaker_tripped => {
                self.report_done(src, su);
                self.try_start(src, drv, du);
                return;
            }
            RunState::QuitScheduled | RunState::QuitAfterDrain | RunState::KillAndQuitNow => {
                self.quit_tail(src, su);
                return;
            }
            RunState::Recovering => {
                if !self.proc.is_empty() {
                    return;
                }
                self.drain_all(src, su);
                src.recovery_complete(su);
                self.finish_recovery();
            }
            RunState::Running => {}
        }

        // 2) fin natural: fuente pasiva agotada y nada pendiente
        if !self.source_active
            && self.exhausted
            && !self.get_pending
            && self.todo.is_empty()
            && self.proc.is_empty()
        {
            info!("no quedan tareas: se vacía done y se sale");
            self.run = RunState::QuitAfterDrain;
            src.quitting();
            self.quit_tail(src, su);
            return;
        }

        // 3) reportar done
        self.report_done(src, su);

        // 4) admisión
        self.admit(src, su);

        // 5) arranque
        self.try_start(src, drv, du);
    }

    fn quit_tail<S: TaskSource>(&mut self, src: &mut S, su: &mut Vec<SourceUpcall>) {
        if !self.proc.is_empty() {
            // mientras tanto lo terminado se puede ir reportando
            if self.source == SourcePhase::Connected {
                while let Some(id) = self.done.pop_front() {
                    if let Some(t) = self.tasks.remove(&id) {
                        src.done_task(t, su);
                    }
                }
            }
            return;
        }
        self.drain_all(src, su);
        if matches!(self.source, SourcePhase::Connected | SourcePhase::Connecting) {
            info!("cola vacía: se desconecta la fuente");
            self.source = SourcePhase::Disconnecting;
            src.disconnect(su);
        }
    }

    fn report_done<S: TaskSource>(&mut self, src: &mut S, su: &mut Vec<SourceUpcall>) {
        if self.source != SourcePhase::Connected {
            return;
        }
        let limit = if self.source_active || self.exhausted {
            0
        } else if self.done.len() > self.cfg.done_high {
            self.cfg.done_low
        } else {
            return;
        };
        while self.done.len() > limit {
            let Some(id) = self.done.pop_front() else { break };
            if let Some(t) = self.tasks.remove(&id) {
                src.done_task(t, su);
            }
        }
    }

    fn admit<S: TaskSource>(&mut self, src: &mut S, su: &mut Vec<SourceUpcall>) {
        if self.source_active
            || self.source != SourcePhase::Connected
            || self.run != RunState::Running
            || self.breaker_tripped
            || self.exhausted
            || self.get_pending
        {
            return;
        }
        if self.todo.len() < self.cfg.todo_low {
            self.fetching = true;
        }
        if self.todo.len() >= self.cfg.todo_high {
            self.fetching = false;
        }
        if self.fetching {
            self.get_pending = true;
            src.get_task(su);
        }
    }

    fn can_start(&self) -> bool {
        matches!(self.run, RunState::Running | RunState::QuitAfterDrain)
            && self.stop == StopState::Running
            && !self.breaker_tripped
            && self.launch_pending.is_none()
            && !self.retry_blocked
            && !self.load.blocked()
            && !self.todo.is_empty()
    }

    fn try_start<S: TaskSource, D: TaskDriver>(&mut self, src: &mut S, drv: &mut D, du: &mut Vec<DriverUpcall>) {
        if !self.can_start() {
            return;
        }

        let chosen = {
            let todo: Vec<&Task> = self.todo.iter().filter_map(|id| self.tasks.get(id)).collect();
            drv.task_to_start(&todo, self.tight())
        };
        let Some(id) = chosen else {
            return;
        };
        let Some(task) = self.tasks.get(&id) else {
            error!("el driver eligió la tarea {} que no existe", id);
            return;
        };
        assert!(self.todo.contains(&id), "el driver eligió {task} que no está en todo");

        match drv.launch_task(task, du) {
            LaunchResult::Ok(owner) => {
                take_from(&mut self.todo, id);
                self.proc.push_back(id);
                self.launch_pending = Some(id);
                if let Some(t) = self.tasks.get_mut(&id) {
                    t.owner = Some(owner);
                    debug!("{} pasa a proc ({:?})", t, owner);
                }
            }
            LaunchResult::Retry => {
                self.retry_blocked = true;
            }
            LaunchResult::Fatal => {
                error!("{} no se puede lanzar", task);
                self.fail_task(src, drv, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileRegistry;
    use crate::task::tests::{failed_status, ok_status, task};
    use crate::task::{ExecStatus, JobKind, Owner, TaskState};
    use std::collections::HashSet;

    /* --------- Fuente y driver de juguete --------- */

    #[derive(Default)]
    struct FakeSource {
        active: bool,
        pending: VecDeque<Task>,
        returned: Vec<Task>,
        given_back: Vec<(Vec<TaskId>, usize, usize, u32)>,
        replies: Vec<(u32, SourceControl, u32, u32)>,
        quitting: u32,
        disconnects: u32,
        recoveries: u32,
    }

    impl TaskSource for FakeSource {
        type Io = SourceUpcall;

        fn is_active(&self) -> bool {
            self.active
        }

        fn connect(&mut self, out: &mut Vec<SourceUpcall>) {
            out.push(SourceUpcall::Connected);
        }

        fn get_task(&mut self, out: &mut Vec<SourceUpcall>) {
            match self.pending.pop_front() {
                Some(t) => out.push(SourceUpcall::NewTask(t)),
                None => out.push(SourceUpcall::NoMoreTasks),
            }
        }

        fn done_task(&mut self, task: Task, _out: &mut Vec<SourceUpcall>) {
            self.returned.push(task);
        }

        fn give_back_tasks(&mut self, tasks: Vec<Task>, todo_after: usize, proc_after: usize, reply: u32) {
            let ids = tasks.iter().map(|t| t.id).collect();
            self.given_back.push((ids, todo_after, proc_after, reply));
        }

        fn control_done(&mut self, reply: u32, ctl: SourceControl, a: u32, b: u32) {
            self.replies.push((reply, ctl, a, b));
        }

        fn quitting(&mut self) {
            self.quitting += 1;
        }

        fn disconnect(&mut self, out: &mut Vec<SourceUpcall>) {
            self.disconnects += 1;
            out.push(SourceUpcall::Disconnected);
        }

        fn recovery_complete(&mut self, _out: &mut Vec<SourceUpcall>) {
            self.recoveries += 1;
        }

        fn handle_io(&mut self, ev: SourceUpcall, _view: &QueueView, out: &mut Vec<SourceUpcall>) {
            out.push(ev);
        }

        fn on_tick(&mut self, _now: Instant, _out: &mut Vec<SourceUpcall>) {}
    }

    struct FakeDriver {
        slots: usize,
        running: Vec<TaskId>,
        launches: Vec<(TaskId, Option<JobKind>)>,
        kills: Vec<KillReason>,
        give_backs: Vec<usize>,
        stop_cont_async: bool,
        fatal: HashSet<TaskId>,
    }

    impl Default for FakeDriver {
        fn default() -> Self {
            Self {
                slots: 1,
                running: Vec::new(),
                launches: Vec::new(),
                kills: Vec::new(),
                give_backs: Vec::new(),
                stop_cont_async: false,
                fatal: HashSet::new(),
            }
        }
    }

    impl TaskDriver for FakeDriver {
        type Io = DriverUpcall;

        fn start(&mut self, _out: &mut Vec<DriverUpcall>) {}

        fn task_to_start(&mut self, todo: &[&Task], _tight: bool) -> Option<TaskId> {
            if self.running.len() >= self.slots {
                return None;
            }
            todo.first().map(|t| t.id)
        }

        fn launch_task(&mut self, task: &Task, out: &mut Vec<DriverUpcall>) -> LaunchResult {
            if self.fatal.contains(&task.id) {
                return LaunchResult::Fatal;
            }
            self.running.push(task.id);
            self.launches.push((task.id, task.next_kind()));
            out.push(DriverUpcall::Launched(task.id));
            LaunchResult::Ok(Owner::Local)
        }

        fn term_all_jobs(&mut self, reason: KillReason, _out: &mut Vec<DriverUpcall>) -> usize {
            self.kills.push(reason);
            self.running.len()
        }

        fn stop_cont_tasks(&mut self, _sc: StopCont, _out: &mut Vec<DriverUpcall>) -> StopContResult {
            if self.stop_cont_async {
                StopContResult::InProgress
            } else {
                StopContResult::Done
            }
        }

        fn schedule_give_back(&mut self, keep: usize) {
            self.give_backs.push(keep);
        }

        fn rebalance(&mut self, _tight: bool, _todo_len: usize) {}

        fn handle_io(&mut self, ev: DriverUpcall, out: &mut Vec<DriverUpcall>) {
            match &ev {
                DriverUpcall::JobSucceeded { task, .. }
                | DriverUpcall::TaskFailed { task, .. }
                | DriverUpcall::PutBack { task, .. } => self.running.retain(|x| x != task),
                _ => {}
            }
            out.push(ev);
        }

        fn on_tick(&mut self, _now: Instant, _out: &mut Vec<DriverUpcall>) {}

        fn shutdown(&mut self) -> Vec<tokio::task::JoinHandle<()>> {
            Vec::new()
        }
    }

    fn cfg() -> SchedulerConfig {
        SchedulerConfig {
            todo_low: 2,
            todo_high: 4,
            done_low: 0,
            done_high: 100,
            max_failed_in_sequence: 3,
            ..SchedulerConfig::default()
        }
    }

    fn manager(cfg: SchedulerConfig) -> TaskManager {
        TaskManager::with_load_sampler(cfg, Box::new(|| None))
    }

    fn ok(id: TaskId, kind: JobKind) -> DriverUpcall {
        DriverUpcall::JobSucceeded {
            task: id,
            report: ExecReport::single(kind, ok_status()),
        }
    }

    fn failed(id: TaskId) -> DriverUpcall {
        DriverUpcall::TaskFailed {
            task: id,
            report: ExecReport::single(JobKind::Render, failed_status()),
        }
    }

    fn put_back(id: TaskId) -> DriverUpcall {
        DriverUpcall::PutBack {
            task: id,
            report: ExecReport::single(JobKind::Render, ExecStatus::killed()),
        }
    }

    fn passive(reg: &FileRegistry, specs: &[(TaskId, bool, bool)]) -> FakeSource {
        FakeSource {
            pending: specs.iter().map(|(id, r, f)| task(reg, *id, *r, *f)).collect(),
            ..FakeSource::default()
        }
    }

    /* --------- Escenarios --------- */

    #[test]
    fn render_ok_vuelve_al_frente_para_filtrar() {
        let reg = FileRegistry::new();
        let mut src = passive(&reg, &[(1, true, true), (2, true, true)]);
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());

        tm.start(&mut src, &mut drv);
        assert_eq!(drv.launches, vec![(1, Some(JobKind::Render))]);

        // render de la 1 terminó: vuelve al frente de todo y arranca el filtro
        // antes que la tarea 2
        tm.on_driver_io(&mut src, &mut drv, ok(1, JobKind::Render));
        assert_eq!(drv.launches[1], (1, Some(JobKind::Filter)));
        assert_eq!(tm.task(1).unwrap().state, TaskState::ToBeFiltered);

        tm.on_driver_io(&mut src, &mut drv, ok(1, JobKind::Filter));
        assert_eq!(drv.launches[2], (2, Some(JobKind::Render)));
        // fuente agotada: lo terminado se reporta enseguida
        assert_eq!(src.returned.len(), 1);
        assert_eq!(src.returned[0].state, TaskState::Done);
        assert_eq!(tm.stats().completed, 1);
        tm.check_invariants();
    }

    #[test]
    fn put_backs_dejan_la_mas_reciente_al_frente() {
        let reg = FileRegistry::new();
        let mut src = passive(&reg, &[(1, true, false), (2, true, false), (3, true, false), (4, true, false)]);
        let mut drv = FakeDriver {
            slots: 3,
            ..FakeDriver::default()
        };
        let mut tm = manager(cfg());

        tm.start(&mut src, &mut drv);
        assert_eq!(drv.running, vec![1, 2, 3]);

        // se cae la conexión: se devuelven de la más vieja a la más nueva
        drv.slots = 0;
        for id in [1, 2, 3] {
            tm.on_driver_io(&mut src, &mut drv, put_back(id));
        }

        assert_eq!(tm.todo_ids(), vec![3, 2, 1, 4]);
        assert!(tm.todo_ids().iter().all(|id| tm.task(*id).unwrap().owner.is_none()));
        assert_eq!(tm.task(1).unwrap().put_backs, 1);
        assert_eq!(tm.stats().put_back, 3);
        tm.check_invariants();
    }

    #[test]
    fn put_back_repetido_se_ignora() {
        let reg = FileRegistry::new();
        let mut src = passive(&reg, &[(1, true, false)]);
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());

        tm.start(&mut src, &mut drv);
        drv.slots = 0;
        tm.on_driver_io(&mut src, &mut drv, put_back(1));
        tm.on_driver_io(&mut src, &mut drv, put_back(1));

        assert_eq!(tm.todo_ids(), vec![1]);
        assert_eq!(tm.task(1).unwrap().put_backs, 1);
        tm.check_invariants();
    }

    #[test]
    fn tres_fallos_seguidos_disparan_quit_una_sola_vez() {
        let reg = FileRegistry::new();
        let specs: Vec<_> = (1..=5).map(|id| (id, true, false)).collect();
        let mut src = passive(&reg, &specs);
        let mut drv = FakeDriver {
            slots: 5,
            ..FakeDriver::default()
        };
        let mut tm = manager(cfg());

        tm.start(&mut src, &mut drv);
        let running = drv.running.clone();
        assert!(running.len() >= 4);

        for id in &running[..3] {
            tm.on_driver_io(&mut src, &mut drv, failed(*id));
        }
        assert_eq!(tm.run_state(), RunState::QuitScheduled);
        assert_eq!(src.quitting, 1);
        assert_eq!(drv.give_backs, vec![0]);

        tm.on_driver_io(&mut src, &mut drv, failed(running[3]));
        assert_eq!(src.quitting, 1);
        assert_eq!(drv.give_backs, vec![0]);
        assert_eq!(tm.stats().failed, 4);
        tm.check_invariants();
    }

    #[test]
    fn un_exito_reinicia_el_contador_de_fallos() {
        let reg = FileRegistry::new();
        let specs: Vec<_> = (1..=6).map(|id| (id, true, false)).collect();
        let mut src = passive(&reg, &specs);
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());

        tm.start(&mut src, &mut drv);
        for step in [false, false, true, false, false] {
            let id = *drv.running.first().unwrap();
            let ev = if step { ok(id, JobKind::Render) } else { failed(id) };
            tm.on_driver_io(&mut src, &mut drv, ev);
        }

        assert_eq!(tm.run_state(), RunState::Running);
        assert_eq!(tm.snapshot().failed_in_sequence, 2);
    }

    #[test]
    fn launch_fatal_cuenta_como_fallo() {
        let reg = FileRegistry::new();
        let mut src = passive(&reg, &[(1, true, false), (2, true, false)]);
        let mut drv = FakeDriver::default();
        drv.fatal.insert(1);
        let mut tm = manager(cfg());

        tm.start(&mut src, &mut drv);

        assert!(src.returned.iter().any(|t| t.id == 1 && t.failed));
        assert_eq!(drv.running, vec![2]);
        assert_eq!(tm.stats().failed, 1);
    }

    #[test]
    fn fin_natural_vacia_done_y_desconecta() {
        let reg = FileRegistry::new();
        let mut src = passive(&reg, &[(1, true, false), (2, true, false)]);
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());

        tm.start(&mut src, &mut drv);
        tm.on_driver_io(&mut src, &mut drv, ok(1, JobKind::Render));
        tm.on_driver_io(&mut src, &mut drv, ok(2, JobKind::Render));

        assert_eq!(tm.run_state(), RunState::QuitAfterDrain);
        assert!(tm.is_finished());
        assert_eq!(src.disconnects, 1);
        assert_eq!(
            src.returned.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(tm.stats().completed, 2);
    }

    #[test]
    fn drenaje_ejecuta_lo_que_queda_en_todo_antes_de_salir() {
        let reg = FileRegistry::new();
        let specs: Vec<_> = (1..=10).map(|id| (id, true, false)).collect();
        let mut src = passive(&reg, &specs);
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());
        let now = Instant::now();

        tm.start(&mut src, &mut drv);
        let queued = tm.todo_ids();
        assert!(queued.len() >= 3);
        let left = src.pending.len();

        tm.on_control(&mut src, &mut drv, ProcessControl::Drain, now);
        assert_eq!(tm.run_state(), RunState::QuitAfterDrain);
        assert_eq!(src.quitting, 1);
        assert!(drv.give_backs.is_empty());

        while let Some(id) = drv.running.first().copied() {
            assert_eq!(src.disconnects, 0);
            tm.on_driver_io(&mut src, &mut drv, ok(id, JobKind::Render));
        }

        assert!(tm.is_finished());
        assert_eq!(src.disconnects, 1);
        // no se pidió nada nuevo a la fuente
        assert_eq!(src.pending.len(), left);
        for id in &queued {
            let t = src.returned.iter().find(|t| t.id == *id).unwrap();
            assert_eq!(t.state, TaskState::Done);
            assert!(!t.failed);
        }
        assert_eq!(tm.stats().completed as usize, queued.len() + 1);
        assert_eq!(tm.stats().given_back, 0);
    }

    #[test]
    fn interrupcion_durante_el_drenaje_devuelve_lo_pendiente() {
        let reg = FileRegistry::new();
        let specs: Vec<_> = (1..=10).map(|id| (id, true, false)).collect();
        let mut src = passive(&reg, &specs);
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());
        let now = Instant::now();

        tm.start(&mut src, &mut drv);
        let queued = tm.todo_ids();
        tm.on_control(&mut src, &mut drv, ProcessControl::Drain, now);
        tm.on_control(&mut src, &mut drv, ProcessControl::Interrupt, now);
        assert_eq!(tm.run_state(), RunState::QuitScheduled);
        assert!(drv.kills.is_empty());

        tm.on_driver_io(&mut src, &mut drv, ok(1, JobKind::Render));
        assert!(tm.is_finished());
        assert_eq!(tm.stats().completed, 1);
        assert_eq!(tm.stats().given_back as usize, queued.len());
    }

    #[test]
    fn doble_interrupcion_mata_y_devuelve_todo() {
        let reg = FileRegistry::new();
        let mut src = passive(&reg, &[(1, true, false), (2, true, false), (3, true, false)]);
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());
        let now = Instant::now();

        tm.start(&mut src, &mut drv);
        tm.on_control(&mut src, &mut drv, ProcessControl::Interrupt, now);
        assert_eq!(tm.run_state(), RunState::QuitScheduled);
        assert!(drv.kills.is_empty());

        tm.on_control(&mut src, &mut drv, ProcessControl::Interrupt, now);
        assert_eq!(tm.run_state(), RunState::KillAndQuitNow);
        assert_eq!(drv.kills, vec![KillReason::Quit]);
        assert!(!tm.is_finished());

        // la tarea matada vuelve; con proc vacío se vacía todo y se desconecta
        tm.on_driver_io(&mut src, &mut drv, put_back(1));
        assert!(tm.is_finished());
        assert_eq!(src.disconnects, 1);
        let mut ids: Vec<_> = src.returned.iter().map(|t| t.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(tm.stats().given_back, 3);
    }

    #[test]
    fn kill_sin_respuesta_escala_despues_del_grace() {
        let reg = FileRegistry::new();
        let mut src = passive(&reg, &[(1, true, false)]);
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());
        let t0 = Instant::now();

        tm.start(&mut src, &mut drv);
        tm.on_control(&mut src, &mut drv, ProcessControl::Interrupt, t0);
        tm.on_control(&mut src, &mut drv, ProcessControl::Interrupt, t0);
        assert_eq!(drv.kills.len(), 1);

        tm.on_tick(&mut src, &mut drv, t0 + std::time::Duration::from_secs(1));
        assert_eq!(drv.kills.len(), 1);
        tm.on_tick(&mut src, &mut drv, t0 + tm.config().kill_grace);
        assert_eq!(drv.kills.len(), 2);
    }

    #[test]
    fn give_back_respeta_keep() {
        let reg = FileRegistry::new();
        let mut src = FakeSource {
            active: true,
            ..FakeSource::default()
        };
        let mut drv = FakeDriver {
            slots: 0,
            ..FakeDriver::default()
        };
        let mut tm = manager(cfg());
        tm.start(&mut src, &mut drv);

        for id in 1..=5 {
            tm.on_source_io(&mut src, &mut drv, SourceUpcall::NewTask(task(&reg, id, true, false)));
        }
        tm.on_source_io(
            &mut src,
            &mut drv,
            SourceUpcall::Control {
                reply: Some(7),
                ctl: SourceControl::GiveBack { keep: 2 },
            },
        );
        assert_eq!(src.given_back, vec![(vec![3, 4, 5], 2, 0, 7)]);

        tm.on_source_io(
            &mut src,
            &mut drv,
            SourceUpcall::Control {
                reply: Some(8),
                ctl: SourceControl::GiveBack { keep: 0 },
            },
        );
        assert_eq!(src.given_back[1], (vec![1, 2], 0, 0, 8));
        assert_eq!(tm.snapshot().todo, 0);
        tm.check_invariants();
    }

    #[test]
    fn stop_y_continue_esperan_al_driver() {
        let reg = FileRegistry::new();
        let mut src = FakeSource {
            active: true,
            ..FakeSource::default()
        };
        let mut drv = FakeDriver {
            stop_cont_async: true,
            ..FakeDriver::default()
        };
        let mut tm = manager(cfg());
        tm.start(&mut src, &mut drv);
        tm.on_source_io(&mut src, &mut drv, SourceUpcall::NewTask(task(&reg, 1, true, false)));

        tm.on_source_io(
            &mut src,
            &mut drv,
            SourceUpcall::Control {
                reply: Some(1),
                ctl: SourceControl::Stop,
            },
        );
        assert_eq!(tm.stop_state(), StopState::Stopping);
        assert!(src.replies.is_empty());

        // mientras está frenado no arranca nada nuevo
        tm.on_source_io(&mut src, &mut drv, SourceUpcall::NewTask(task(&reg, 2, true, false)));
        tm.on_driver_io(&mut src, &mut drv, ok(1, JobKind::Render));
        assert_eq!(drv.launches.len(), 1);

        tm.on_driver_io(&mut src, &mut drv, DriverUpcall::StopContDone(StopCont::Stop));
        assert_eq!(tm.stop_state(), StopState::Stopped);
        assert_eq!(src.replies, vec![(1, SourceControl::Stop, 0, 0)]);

        drv.stop_cont_async = false;
        tm.on_source_io(
            &mut src,
            &mut drv,
            SourceUpcall::Control {
                reply: Some(2),
                ctl: SourceControl::Continue,
            },
        );
        assert_eq!(tm.stop_state(), StopState::Running);
        assert_eq!(src.replies[1], (2, SourceControl::Continue, 0, 0));
        assert_eq!(drv.launches.len(), 2);
    }

    #[test]
    fn upstream_perdido_mata_vacia_y_vuelve_a_correr() {
        let reg = FileRegistry::new();
        let mut src = FakeSource {
            active: true,
            ..FakeSource::default()
        };
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());
        tm.start(&mut src, &mut drv);
        tm.on_source_io(&mut src, &mut drv, SourceUpcall::NewTask(task(&reg, 1, true, false)));
        tm.on_source_io(&mut src, &mut drv, SourceUpcall::NewTask(task(&reg, 2, true, false)));

        tm.on_source_io(&mut src, &mut drv, SourceUpcall::UpstreamLost);
        assert_eq!(tm.run_state(), RunState::Recovering);
        assert_eq!(drv.kills, vec![KillReason::Recovery]);
        assert_eq!(src.recoveries, 0);

        tm.on_driver_io(&mut src, &mut drv, put_back(1));
        assert_eq!(tm.run_state(), RunState::Running);
        assert_eq!(src.recoveries, 1);
        assert_eq!(src.returned.len(), 2);
        assert_eq!(tm.snapshot().todo + tm.snapshot().proc + tm.snapshot().done, 0);
    }

    #[test]
    fn kill_remoto_pasa_por_recovery() {
        let reg = FileRegistry::new();
        let mut src = FakeSource {
            active: true,
            ..FakeSource::default()
        };
        let mut drv = FakeDriver::default();
        let mut tm = manager(cfg());
        tm.start(&mut src, &mut drv);
        tm.on_source_io(&mut src, &mut drv, SourceUpcall::NewTask(task(&reg, 1, true, false)));

        tm.on_source_io(
            &mut src,
            &mut drv,
            SourceUpcall::Control {
                reply: Some(4),
                ctl: SourceControl::Kill(KillReason::User),
            },
        );
        assert_eq!(drv.kills, vec![KillReason::User]);
        assert_eq!(src.replies, vec![(4, SourceControl::Kill(KillReason::User), 1, 0)]);
        assert_eq!(tm.run_state(), RunState::Recovering);

        tm.on_driver_io(&mut src, &mut drv, put_back(1));
        assert_eq!(tm.run_state(), RunState::Running);
        assert_eq!(src.returned.len(), 1);
    }

    #[test]
    fn admision_respeta_watermarks() {
        let reg = FileRegistry::new();
        let specs: Vec<_> = (1..=10).map(|id| (id, true, false)).collect();
        let mut src = passive(&reg, &specs);
        let mut drv = FakeDriver {
            slots: 0,
            ..FakeDriver::default()
        };
        let mut tm = manager(cfg());

        tm.start(&mut src, &mut drv);
        // llena hasta todo_high
        assert_eq!(tm.snapshot().todo, 4);
        assert_eq!(src.pending.len(), 6);
    }
}
