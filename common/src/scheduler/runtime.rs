//! Bucle async dueño del `TaskManager`, la fuente y el driver.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ProcessControl, RunStats, TaskDriver, TaskManager, TaskSource};

pub struct Runtime<S: TaskSource, D: TaskDriver> {
    tm: TaskManager,
    source: S,
    driver: D,
    source_rx: mpsc::UnboundedReceiver<S::Io>,
    driver_rx: mpsc::UnboundedReceiver<D::Io>,
    ctl_rx: mpsc::UnboundedReceiver<ProcessControl>,
}

impl<S: TaskSource, D: TaskDriver> Runtime<S, D> {
    /// Devuelve también el canal por el que llegan señales / pedidos de control.
    pub fn new(
        tm: TaskManager,
        source: S,
        driver: D,
        source_rx: mpsc::UnboundedReceiver<S::Io>,
        driver_rx: mpsc::UnboundedReceiver<D::Io>,
    ) -> (Self, mpsc::UnboundedSender<ProcessControl>) {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        (
            Self {
                tm,
                source,
                driver,
                source_rx,
                driver_rx,
                ctl_rx,
            },
            ctl_tx,
        )
    }

    pub async fn run(self) -> RunStats {
        let Self {
            mut tm,
            mut source,
            mut driver,
            mut source_rx,
            mut driver_rx,
            mut ctl_rx,
        } = self;

        tm.start(&mut source, &mut driver);

        let mut tick = tokio::time::interval(tm.config().tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !tm.is_finished() {
            tokio::select! {
                Some(ev) = source_rx.recv() => tm.on_source_io(&mut source, &mut driver, ev),
                Some(ev) = driver_rx.recv() => tm.on_driver_io(&mut source, &mut driver, ev),
                Some(ctl) = ctl_rx.recv() => {
                    debug!("control de proceso: {:?}", ctl);
                    tm.on_control(&mut source, &mut driver, ctl, Instant::now());
                }
                _ = tick.tick() => tm.on_tick(&mut source, &mut driver, Instant::now()),
            }
        }

        for h in driver.shutdown().into_iter().chain(source.shutdown()) {
            let _ = h.await;
        }

        let stats = tm.stats();
        info!(
            "fin: {} completas, {} fallidas, {} devueltas, {} put-backs",
            stats.completed, stats.failed, stats.given_back, stats.put_back
        );
        stats
    }
}

/// SIGINT/SIGTERM → `Interrupt`, SIGHUP → `Drain`, SIGUSR1 → `Stop`,
/// SIGUSR2 → `Continue`.
#[cfg(unix)]
pub fn spawn_signal_listener(tx: mpsc::UnboundedSender<ProcessControl>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            let ctl = tokio::select! {
                _ = int.recv() => ProcessControl::Interrupt,
                _ = term.recv() => ProcessControl::Interrupt,
                _ = hup.recv() => ProcessControl::Drain,
                _ = usr1.recv() => ProcessControl::Stop,
                _ = usr2.recv() => ProcessControl::Continue,
            };
            if tx.send(ctl).is_err() {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(tx: mpsc::UnboundedSender<ProcessControl>) -> std::io::Result<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(ProcessControl::Interrupt).is_err() {
                break;
            }
        }
    });
    Ok(())
}
