//! Periodic mail drains
//!
//! Runs as a tokio event loop with two cadences: a short one for forced
//! events and a longer one for ordinary events. Each drain runs on the
//! blocking pool because the queue talks to SQLite synchronously.

use super::queue::{DrainReport, MailQueue, ProcessMode};
use crate::config::MailQueueConfig;
use crate::store::Store;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Commands accepted while the scheduler runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Drain now instead of waiting for the next tick
    DrainNow(ProcessMode),
    Shutdown,
}

/// Totals over the scheduler's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs: usize,
    pub errors: usize,
    pub totals: DrainReport,
}

pub struct MailScheduler {
    store: Arc<Store>,
    queue: Arc<MailQueue>,
    forced_every: Duration,
    ordinary_every: Duration,
    command_tx: mpsc::Sender<SchedulerCommand>,
    command_rx: Option<mpsc::Receiver<SchedulerCommand>>,
    stats: SchedulerStats,
}

impl MailScheduler {
    pub fn new(store: Arc<Store>, queue: Arc<MailQueue>, config: &MailQueueConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            store,
            queue,
            forced_every: config.forced_interval(),
            ordinary_every: config.ordinary_interval(),
            command_tx,
            command_rx: Some(command_rx),
            stats: SchedulerStats::default(),
        }
    }

    /// Handle for sending commands to a running scheduler
    pub fn command_sender(&self) -> mpsc::Sender<SchedulerCommand> {
        self.command_tx.clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Run until a shutdown command, SIGTERM or SIGINT
    pub async fn run(&mut self) -> Result<SchedulerStats> {
        let mut command_rx = self.command_rx.take().ok_or_else(|| {
            crate::CourierError::Config("Scheduler already running".to_string())
        })?;

        let mut forced = tokio::time::interval(self.forced_every);
        let mut ordinary = tokio::time::interval(self.ordinary_every);
        forced.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ordinary.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            forced_secs = self.forced_every.as_secs(),
            ordinary_secs = self.ordinary_every.as_secs(),
            "Mail scheduler started"
        );

        #[cfg(unix)]
        self.run_with_signals(&mut forced, &mut ordinary, &mut command_rx)
            .await?;

        #[cfg(not(unix))]
        self.run_without_signals(&mut forced, &mut ordinary, &mut command_rx)
            .await;

        tracing::info!(
            runs = self.stats.runs,
            sent = self.stats.totals.sent,
            failed = self.stats.totals.failed,
            "Mail scheduler stopped"
        );
        Ok(self.stats)
    }

    #[cfg(unix)]
    async fn run_with_signals(
        &mut self,
        forced: &mut tokio::time::Interval,
        ordinary: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<SchedulerCommand>,
    ) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            crate::CourierError::Other(format!("Failed to set up SIGTERM handler: {}", e))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            crate::CourierError::Other(format!("Failed to set up SIGINT handler: {}", e))
        })?;

        loop {
            tokio::select! {
                _ = forced.tick() => self.drain(ProcessMode::Forced).await,
                _ = ordinary.tick() => self.drain(ProcessMode::Ordinary).await,
                command = command_rx.recv() => {
                    match command {
                        Some(SchedulerCommand::DrainNow(mode)) => self.drain(mode).await,
                        Some(SchedulerCommand::Shutdown) | None => {
                            tracing::info!("Received shutdown command");
                            break;
                        }
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn run_without_signals(
        &mut self,
        forced: &mut tokio::time::Interval,
        ordinary: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<SchedulerCommand>,
    ) {
        loop {
            tokio::select! {
                _ = forced.tick() => self.drain(ProcessMode::Forced).await,
                _ = ordinary.tick() => self.drain(ProcessMode::Ordinary).await,
                command = command_rx.recv() => {
                    match command {
                        Some(SchedulerCommand::DrainNow(mode)) => self.drain(mode).await,
                        Some(SchedulerCommand::Shutdown) | None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl-C, initiating graceful shutdown");
                    break;
                }
            }
        }
    }

    async fn drain(&mut self, mode: ProcessMode) {
        let store = Arc::clone(&self.store);
        let queue = Arc::clone(&self.queue);
        let result =
            tokio::task::spawn_blocking(move || queue.process(&store, mode, false)).await;

        self.stats.runs += 1;
        match result {
            Ok(Ok(report)) => self.stats.totals += report,
            Ok(Err(e)) => {
                self.stats.errors += 1;
                tracing::error!(mode = %mode, error = %e, "Mail drain failed");
            }
            Err(e) => {
                self.stats.errors += 1;
                tracing::error!(mode = %mode, error = %e, "Mail drain task panicked");
            }
        }
    }
}
