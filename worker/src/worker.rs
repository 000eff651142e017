use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use common::config::{env_or, LinkConfig, SchedulerConfig};
use common::scheduler::runtime::{spawn_signal_listener, Runtime};
use common::scheduler::TaskManager;
use common::FileRegistry;

use crate::consumer::{ConsumerIo, ConsumerSource, Offer};
use crate::local::{LocalDriver, ToolSpec};

const DEFAULT_WORKER_CONCURRENCY: u16 = 2;
const DEFAULT_WORKER_CAPACITY: u16 = 2;
const DEFAULT_WORKER_LISTEN: &str = "0.0.0.0:3104";
const DEFAULT_WORKER_WORKDIR: &str = "/data/tmp";
const DEFAULT_WORKER_CAPS: &str = "/data/tools.json";

/// Lo que se puede pisar desde la línea de comandos.
#[derive(Debug, Default)]
pub struct Overrides {
    pub listen: Option<SocketAddr>,
    pub workdir: Option<PathBuf>,
    pub caps: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Settings {
    pub concurrency: u16,
    pub capacity: u16,
    pub listen: SocketAddr,
    pub workdir: PathBuf,
    pub tools: Vec<ToolSpec>,
}

impl Settings {
    pub fn from_env(over: Overrides) -> Result<Self> {
        let listen = match over.listen {
            Some(addr) => addr,
            None => {
                let raw = env_or("WORKER_LISTEN", DEFAULT_WORKER_LISTEN.to_string());
                raw.parse()
                    .with_context(|| format!("WORKER_LISTEN inválido: {raw}"))?
            }
        };
        let workdir = over
            .workdir
            .unwrap_or_else(|| PathBuf::from(env_or("WORKER_WORKDIR", DEFAULT_WORKER_WORKDIR.to_string())));
        let caps = over
            .caps
            .unwrap_or_else(|| PathBuf::from(env_or("WORKER_CAPS", DEFAULT_WORKER_CAPS.to_string())));

        Ok(Self {
            concurrency: env_or("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY).max(1),
            capacity: env_or("WORKER_CAPACITY", DEFAULT_WORKER_CAPACITY),
            listen,
            workdir,
            tools: load_tools(&caps)?,
        })
    }
}

/// Lee el JSON con las herramientas que este worker sabe correr.
pub fn load_tools(path: &Path) -> Result<Vec<ToolSpec>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("leyendo {}", path.display()))?;
    let tools: Vec<ToolSpec> =
        serde_json::from_str(&raw).with_context(|| format!("parseando {}", path.display()))?;
    if tools.is_empty() {
        bail!("{} no declara ninguna herramienta", path.display());
    }
    for (i, t) in tools.iter().enumerate() {
        if tools[..i].iter().any(|o| o.kind == t.kind && o.desc == t.desc) {
            bail!("{}: herramienta repetida {}:{}", path.display(), t.kind, t.desc);
        }
    }
    Ok(tools)
}

/// Acepta conexiones y se las pasa a la fuente. Termina cuando la fuente ya
/// no escucha.
fn spawn_acceptor(listener: TcpListener, tx: mpsc::UnboundedSender<ConsumerIo>) {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("accept falló: {}", e);
                    sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let ev = ConsumerIo::Accepted {
                stream,
                peer: peer.to_string(),
            };
            if tx.send(ev).is_err() {
                break;
            }
        }
    });
}

/// Loop principal del worker.
/// - Escucha conexiones de un dispatcher.
/// - Recibe tareas y sus archivos, las corre con las herramientas locales.
/// - Devuelve estados y outputs; sobrevive a que el dispatcher se caiga.
pub async fn run(over: Overrides) -> Result<()> {
    // 1) Configuración
    let settings = Settings::from_env(over)?;
    let link_cfg = LinkConfig::from_env().context("configuración de conexiones")?;
    let sched_cfg = SchedulerConfig::from_env().context("configuración del scheduler")?;

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    std::fs::create_dir_all(&settings.workdir)
        .with_context(|| format!("creando {}", settings.workdir.display()))?;

    // 2) Listener
    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("escuchando en {}", settings.listen))?;
    let (src_tx, src_rx) = mpsc::unbounded_channel();
    spawn_acceptor(listener, src_tx.clone());

    // 3) Fuente y driver
    let registry = FileRegistry::new();
    let offer = Offer {
        max_jobs: settings.concurrency,
        capacity: settings.capacity,
        caps: settings.tools.iter().map(ToolSpec::capability).collect(),
    };
    let source = ConsumerSource::new(link_cfg, offer, settings.workdir.clone(), registry.clone(), src_tx);

    let (drv_tx, drv_rx) = mpsc::unbounded_channel();
    let driver = LocalDriver::new(settings.tools, settings.concurrency as usize, drv_tx);

    info!(
        "worker {} escuchando en {}: concurrency={}, capacity={}, workdir {}",
        hostname,
        settings.listen,
        settings.concurrency,
        settings.capacity,
        settings.workdir.display()
    );

    // 4) Scheduler
    let tm = TaskManager::new(sched_cfg);
    let (runtime, ctl_tx) = Runtime::new(tm, source, driver, src_rx, drv_rx);
    spawn_signal_listener(ctl_tx).context("instalando handlers de señales")?;

    let stats = runtime.run().await;

    let removed = registry.shutdown();
    info!(
        "worker {} terminado: {} completas, {} fallidas, {} archivos temporales borrados",
        hostname, stats.completed, stats.failed, removed
    );
    Ok(())
}
