mod consumer;
mod local;
mod worker;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

/// Worker de la granja: corre los frames que le manda un dispatcher.
#[derive(Debug, Parser)]
#[command(name = "worker", version)]
struct Args {
    /// Dirección donde escuchar (pisa WORKER_LISTEN)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Directorio de trabajo (pisa WORKER_WORKDIR)
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// JSON con las herramientas disponibles (pisa WORKER_CAPS)
    #[arg(short, long)]
    caps: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    common::logging::init_tracing("worker=debug,common=info");
    let args = Args::parse();

    worker::run(worker::Overrides {
        listen: args.listen,
        workdir: args.workdir,
        caps: args.caps,
    })
    .await
}
