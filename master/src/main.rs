mod dispatcher;
mod failover;
mod fitness;
mod job_source;
mod state;

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use common::config::{env_or, LinkConfig, SchedulerConfig};
use common::scheduler::runtime::{spawn_signal_listener, Runtime};
use common::scheduler::TaskManager;
use common::FileRegistry;

use crate::dispatcher::RemoteDriver;
use crate::job_source::JobFileSource;

pub const RECONNECT_SECS: u64 = 10;

/// Dispatcher de la granja: reparte los frames de un job entre los workers.
#[derive(Debug, Parser)]
#[command(name = "master", version)]
struct Args {
    /// Archivo JSON con la descripción del job
    job: PathBuf,

    /// Worker al que conectarse (host:puerto); se puede repetir.
    /// Si no se da ninguno se usa WORKER_ADDRS (separados por coma).
    #[arg(short, long = "worker")]
    workers: Vec<String>,
}

fn worker_addrs(cli: Vec<String>) -> Vec<String> {
    if !cli.is_empty() {
        return cli;
    }
    std::env::var("WORKER_ADDRS")
        .ok()
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    common::logging::init_tracing("master=debug,common=info");
    let args = Args::parse();

    // 1) Configuración
    let sched_cfg = SchedulerConfig::from_env().context("configuración del scheduler")?;
    let link_cfg = LinkConfig::from_env().context("configuración de conexiones")?;
    let reconnect = Duration::from_secs(env_or("RECONNECT_SECS", RECONNECT_SECS));
    let addrs = worker_addrs(args.workers);
    if addrs.is_empty() {
        bail!("no hay workers: usar --worker o WORKER_ADDRS");
    }

    // 2) Fuente y driver
    let registry = FileRegistry::new();
    let source = JobFileSource::load(&args.job, registry.clone())
        .with_context(|| format!("cargando {}", args.job.display()))?;

    let (drv_tx, drv_rx) = mpsc::unbounded_channel();
    let (_src_tx, src_rx) = mpsc::unbounded_channel::<Infallible>();
    let driver = RemoteDriver::new(addrs.clone(), link_cfg, reconnect, drv_tx);

    info!(
        "master arrancando: job {}, workers [{}], todo {}..{}, done {}..{}",
        args.job.display(),
        addrs.join(", "),
        sched_cfg.todo_low,
        sched_cfg.todo_high,
        sched_cfg.done_low,
        sched_cfg.done_high
    );

    // 3) Scheduler
    let tm = TaskManager::new(sched_cfg);
    let (runtime, ctl_tx) = Runtime::new(tm, source, driver, src_rx, drv_rx);
    spawn_signal_listener(ctl_tx).context("instalando handlers de señales")?;

    let stats = runtime.run().await;

    let removed = registry.shutdown();
    info!(
        "master terminado: {} completas, {} fallidas, {} archivos temporales borrados",
        stats.completed, stats.failed, removed
    );
    if stats.failed > 0 {
        std::process::exit(2);
    }
    Ok(())
}
