//! Fuente pasiva: un job en JSON y los frames que matchea su glob de entrada.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::scheduler::{QueueView, SourceControl, SourceUpcall, TaskSource};
use common::task::ExecStatus;
use common::{DeletePolicy, FileRegistry, FileRole, FrameNo, JobSpec, SourceError, Task, TaskId, TaskState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Renderer o filtro; tiene que coincidir con una capacidad de algún worker
    pub desc: String,

    /// Formato de salida; también es la extensión del output
    pub format: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Archivos que acompañan a cada frame (texturas, presets...)
    #[serde(default)]
    pub additional: Vec<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// El output queda como `<stem><suffix>.<format>`
    #[serde(default)]
    pub suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    pub name: String,

    /// Patrón de archivos de entrada, ej: "/data/scenes/*.blend"
    pub input_glob: String,

    /// Directorio de salida, ej: "/data/output"
    pub output_dir: String,

    #[serde(default)]
    pub first_frame: FrameNo,

    #[serde(default)]
    pub render: Option<JobTemplate>,

    #[serde(default)]
    pub filter: Option<JobTemplate>,

    /// No encolar frames cuyo output final ya existe
    #[serde(default)]
    pub skip_existing: bool,

    /// Conservar el output del render cuando después se filtra
    #[serde(default)]
    pub keep_intermediate: bool,
}

impl JobFile {
    fn filter_suffix(&self) -> &str {
        match &self.filter {
            Some(f) if f.suffix.is_empty() && self.render.is_some() => "-filtered",
            Some(f) => &f.suffix,
            None => "",
        }
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        if self.name.trim().is_empty() {
            return Err(SourceError::InvalidJob("el job no tiene nombre".into()));
        }
        if self.render.is_none() && self.filter.is_none() {
            return Err(SourceError::InvalidJob(format!("'{}' no tiene render ni filtro", self.name)));
        }
        for t in self.render.iter().chain(self.filter.iter()) {
            if t.desc.trim().is_empty() || t.format.trim().is_empty() {
                return Err(SourceError::InvalidJob(format!("'{}': desc y format son obligatorios", self.name)));
            }
        }
        if let (Some(r), Some(f)) = (&self.render, &self.filter) {
            if r.suffix == self.filter_suffix() && r.format == f.format {
                return Err(SourceError::InvalidJob(format!(
                    "'{}': render y filtro escribirían el mismo archivo",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameOutcome {
    Done,
    Failed,
    Unfinished,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub frame: FrameNo,
    pub task_id: Option<TaskId>,
    pub input: String,
    pub outcome: FrameOutcome,
    pub put_backs: u32,
    pub render: Option<ExecStatus>,
    pub filter: Option<ExecStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub session: String,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_frames: usize,
    pub done: usize,
    pub failed: usize,
    pub unfinished: usize,
    pub skipped: usize,
    pub frames: Vec<FrameRecord>,
}

pub struct JobFileSource {
    job: JobFile,
    registry: FileRegistry,
    session: String,
    started_at: DateTime<Utc>,
    inputs: VecDeque<(FrameNo, PathBuf)>,
    next_id: TaskId,
    records: Vec<FrameRecord>,
    quitting: bool,
}

impl JobFileSource {
    pub fn load(path: &Path, registry: FileRegistry) -> Result<Self, SourceError> {
        let raw = fs::read_to_string(path).map_err(|source| SourceError::JobFile {
            path: path.display().to_string(),
            source,
        })?;
        let job: JobFile = serde_json::from_str(&raw).map_err(|e| SourceError::InvalidJob(e.to_string()))?;
        Self::new(job, registry)
    }

    pub fn new(job: JobFile, registry: FileRegistry) -> Result<Self, SourceError> {
        job.validate()?;
        Ok(Self {
            job,
            registry,
            session: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            inputs: VecDeque::new(),
            next_id: 1,
            records: Vec::new(),
            quitting: false,
        })
    }

    pub fn summary_path(&self) -> PathBuf {
        Path::new(&self.job.output_dir).join(format!("{}-summary.json", self.job.name))
    }

    /// Expande el glob y prepara el directorio de salida.
    fn scan(&mut self) -> Result<usize, SourceError> {
        fs::create_dir_all(&self.job.output_dir).map_err(|source| SourceError::Io {
            path: self.job.output_dir.clone(),
            source,
        })?;

        let paths = glob::glob(&self.job.input_glob).map_err(|e| SourceError::Pattern(e.to_string()))?;
        let mut files: Vec<PathBuf> = paths
            .filter_map(|p| match p {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("no se pudo leer {}: {}", e.path().display(), e);
                    None
                }
            })
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        let first = self.job.first_frame;
        self.inputs = files
            .into_iter()
            .enumerate()
            .map(|(i, p)| (first + i as FrameNo, p))
            .collect();
        Ok(self.inputs.len())
    }

    fn job_spec(&self, t: &JobTemplate, input: &Path, in_role: FileRole, output: &Path, out_role: FileRole) -> JobSpec {
        JobSpec {
            desc: t.desc.clone(),
            input: self.registry.get_or_create(input, in_role),
            output: self.registry.get_or_create(output, out_role),
            format: t.format.clone(),
            args: t.args.clone(),
            additional: t
                .additional
                .iter()
                .map(|p| self.registry.get_or_create(p, FileRole::Additional))
                .collect(),
            timeout: t.timeout_secs.map(Duration::from_secs),
            status: ExecStatus::default(),
        }
    }

    fn record(&mut self, frame: FrameNo, input: &Path, outcome: FrameOutcome) {
        self.records.push(FrameRecord {
            frame,
            task_id: None,
            input: input.display().to_string(),
            outcome,
            put_backs: 0,
            render: None,
            filter: None,
        });
    }

    /// `None` si el frame no hace falta (output ya existe o pisaría la entrada).
    fn make_task(&mut self, frame: FrameNo, input: &Path) -> Option<Task> {
        let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("frame");
        let out_dir = Path::new(&self.job.output_dir);

        let render_out = self
            .job
            .render
            .as_ref()
            .map(|t| out_dir.join(format!("{stem}{}.{}", t.suffix, t.format)));
        let filter_out = self
            .job
            .filter
            .as_ref()
            .map(|t| out_dir.join(format!("{stem}{}.{}", self.job.filter_suffix(), t.format)));

        let final_out = filter_out.as_ref().or(render_out.as_ref())?;
        if final_out == input {
            warn!("frame {}: el output pisaría la entrada {}; se saltea", frame, input.display());
            self.record(frame, input, FrameOutcome::Skipped);
            return None;
        }
        if self.job.skip_existing && final_out.exists() {
            debug!("frame {}: {} ya existe", frame, final_out.display());
            self.record(frame, input, FrameOutcome::Skipped);
            return None;
        }

        let render = match (&self.job.render, &render_out) {
            (Some(t), Some(out)) => Some(self.job_spec(t, input, FileRole::RenderInput, out, FileRole::RenderOutput)),
            _ => None,
        };
        let filter_in = render_out.clone().unwrap_or_else(|| input.to_path_buf());
        let filter = match (&self.job.filter, &filter_out) {
            (Some(t), Some(out)) => Some(self.job_spec(t, &filter_in, FileRole::FilterInput, out, FileRole::FilterOutput)),
            _ => None,
        };

        if let (Some(r), Some(_)) = (&render, &filter) {
            if !self.job.keep_intermediate {
                r.output.mark_for_deletion(DeletePolicy::OnFrameDone);
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        Some(Task::new(id, frame, render, filter))
    }

    pub fn summary(&self) -> JobSummary {
        let count = |o: FrameOutcome| self.records.iter().filter(|r| r.outcome == o).count();
        let mut frames = self.records.clone();
        frames.sort_by_key(|r| r.frame);
        JobSummary {
            session: self.session.clone(),
            job: self.job.name.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            total_frames: frames.len(),
            done: count(FrameOutcome::Done),
            failed: count(FrameOutcome::Failed),
            unfinished: count(FrameOutcome::Unfinished),
            skipped: count(FrameOutcome::Skipped),
            frames,
        }
    }

    fn write_summary(&self) -> Result<PathBuf, SourceError> {
        let path = self.summary_path();
        let io_err = |source: std::io::Error| SourceError::Io {
            path: path.display().to_string(),
            source,
        };
        let json = serde_json::to_vec_pretty(&self.summary()).map_err(|e| io_err(e.into()))?;
        fs::write(&path, json).map_err(io_err)?;
        Ok(path)
    }
}

impl TaskSource for JobFileSource {
    type Io = Infallible;

    fn is_active(&self) -> bool {
        false
    }

    fn connect(&mut self, out: &mut Vec<SourceUpcall>) {
        match self.scan() {
            Ok(n) => {
                info!(
                    "job '{}' (sesión {}): {} frames desde {}",
                    self.job.name, self.session, n, self.job.input_glob
                );
                out.push(SourceUpcall::Connected);
            }
            Err(e) => {
                error!("job '{}': {}", self.job.name, e);
                out.push(SourceUpcall::ConnectFailed(e.to_string()));
            }
        }
    }

    fn get_task(&mut self, out: &mut Vec<SourceUpcall>) {
        while let Some((frame, input)) = self.inputs.pop_front() {
            if let Some(task) = self.make_task(frame, &input) {
                debug!("{} encolado ({})", task, input.display());
                out.push(SourceUpcall::NewTask(task));
                return;
            }
        }
        out.push(SourceUpcall::NoMoreTasks);
    }

    fn done_task(&mut self, task: Task, _out: &mut Vec<SourceUpcall>) {
        let outcome = if task.failed {
            FrameOutcome::Failed
        } else if task.state == TaskState::Done {
            FrameOutcome::Done
        } else {
            FrameOutcome::Unfinished
        };
        match outcome {
            FrameOutcome::Done => info!("{} terminado", task),
            FrameOutcome::Failed => warn!("{} falló", task),
            _ => info!("{} vuelve sin terminar", task),
        }

        let input = task
            .render
            .as_ref()
            .or(task.filter.as_ref())
            .map(|j| j.input.path().display().to_string())
            .unwrap_or_default();
        self.records.push(FrameRecord {
            frame: task.frame,
            task_id: Some(task.id),
            input,
            outcome,
            put_backs: task.put_backs,
            render: task.render.as_ref().map(|j| j.status.clone()),
            filter: task.filter.as_ref().map(|j| j.status.clone()),
        });
        // soltar la tarea libera sus archivos
    }

    fn give_back_tasks(&mut self, tasks: Vec<Task>, _todo_after: usize, _proc_after: usize, _reply: u32) {
        debug!("give-back en una fuente pasiva: {} tareas ignoradas", tasks.len());
    }

    fn control_done(&mut self, _reply: u32, _ctl: SourceControl, _a: u32, _b: u32) {}

    fn quitting(&mut self) {
        if !self.quitting {
            self.quitting = true;
            info!("job '{}': no se piden más frames ({} sin empezar)", self.job.name, self.inputs.len());
        }
    }

    fn disconnect(&mut self, out: &mut Vec<SourceUpcall>) {
        for (frame, input) in std::mem::take(&mut self.inputs) {
            self.record(frame, &input, FrameOutcome::Unfinished);
        }
        let s = self.summary();
        info!(
            "job '{}': {} ok, {} fallidos, {} sin terminar, {} salteados",
            s.job, s.done, s.failed, s.unfinished, s.skipped
        );
        match self.write_summary() {
            Ok(path) => info!("resumen en {}", path.display()),
            Err(e) => error!("no se pudo escribir el resumen: {}", e),
        }
        let removed = self.registry.end_cycle();
        if removed > 0 {
            debug!("{} archivos temporales borrados", removed);
        }
        out.push(SourceUpcall::Disconnected);
    }

    fn recovery_complete(&mut self, _out: &mut Vec<SourceUpcall>) {}

    fn handle_io(&mut self, ev: Infallible, _view: &QueueView, _out: &mut Vec<SourceUpcall>) {
        match ev {}
    }

    fn on_tick(&mut self, _now: Instant, _out: &mut Vec<SourceUpcall>) {}
}
