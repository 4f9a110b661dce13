use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::refresher::HistoryRefresher;
use crate::core::runner::BackupRunner;
use crate::web::{ApiState, WebServer};

#[derive(Debug, Error)]
#[error("backup runner is no longer accepting work")]
pub struct RunnerGone;

/// The single backup slot.
///
/// The mutex is the orchestration lock; its content is the label of the
/// backup in flight. Raising the run-signal and setting the in-flight label
/// happen under the same guard, so callers always see both or neither.
#[derive(Clone)]
pub struct BackupSlot {
    active: Arc<Mutex<Option<String>>>,
    run_tx: mpsc::Sender<String>,
}

impl BackupSlot {
    pub fn new(run_tx: mpsc::Sender<String>) -> Self {
        Self {
            active: Arc::new(Mutex::new(None)),
            run_tx,
        }
    }

    pub async fn lock(&self) -> SlotGuard<'_> {
        SlotGuard {
            active: self.active.lock().await,
            run_tx: &self.run_tx,
        }
    }

    /// Label of the backup in flight, if any.
    pub async fn active(&self) -> Option<String> {
        self.active.lock().await.clone()
    }

    /// Free the slot once the backup labelled `label` is done.
    pub async fn release(&self, label: &str) {
        let mut active = self.active.lock().await;
        if active.as_deref() == Some(label) {
            *active = None;
        }
    }
}

pub struct SlotGuard<'a> {
    active: MutexGuard<'a, Option<String>>,
    run_tx: &'a mpsc::Sender<String>,
}

impl SlotGuard<'_> {
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Mark `label` as in flight and wake the runner.
    pub fn trigger(&mut self, label: &str) -> Result<(), RunnerGone> {
        self.run_tx
            .try_send(label.to_string())
            .map_err(|_| RunnerGone)?;
        *self.active = Some(label.to_string());
        Ok(())
    }

    /// Free the slot early for a backup already known to be finished, so
    /// a follow-up request does not race the runner's own release.
    pub fn clear(&mut self, label: &str) {
        if self.active.as_deref() == Some(label) {
            *self.active = None;
        }
    }
}

/// Owns the coordination signals and the background tasks.
pub struct Orchestrator {
    ctx: AppContext,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the HTTP listener and spawn the runner, refresher and server.
    ///
    /// Failing to bind is the only error; everything after that degrades
    /// to logged failures.
    pub async fn start(self) -> Result<Running> {
        info!(stanza = %self.ctx.config.stanza, "Backup sidecar starting");

        let (run_tx, run_rx) = mpsc::channel(1);
        let slot = BackupSlot::new(run_tx);
        let refresh = Arc::new(Notify::new());

        let state = ApiState {
            ctx: self.ctx.clone(),
            slot: slot.clone(),
            shutdown: self.shutdown.clone(),
        };
        let server = WebServer::bind(state, self.ctx.config.bind_addr())
            .await
            .with_context(|| format!("Failed to bind {}", self.ctx.config.bind_addr()))?;
        let local_addr = server.local_addr()?;

        let runner = BackupRunner::new(self.ctx.clone(), slot.clone(), refresh.clone());
        let runner_task = tokio::spawn(runner.run_loop(run_rx, self.shutdown.clone()));

        // Populate the history right away instead of after the first interval.
        refresh.notify_one();
        let refresher = HistoryRefresher::new(self.ctx.clone(), refresh);
        let refresher_task = tokio::spawn(refresher.run_loop(self.shutdown.clone()));

        let server_shutdown = self.shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.serve(server_shutdown.clone()).await {
                error!(error = %e, "HTTP server failed");
                server_shutdown.cancel();
            }
        });

        Ok(Running {
            local_addr,
            slot,
            shutdown: self.shutdown,
            tasks: vec![
                ("backup", runner_task),
                ("history", refresher_task),
                ("http", server_task),
            ],
        })
    }
}

/// Handle to a started orchestrator.
pub struct Running {
    local_addr: SocketAddr,
    slot: BackupSlot,
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Running {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves once shutdown has been requested from anywhere, including
    /// the HTTP server failing.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// Signal every loop to stop and wait until all of them have exited.
    ///
    /// A backup that is already running is not interrupted; the runner
    /// finishes it before exiting.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        if let Some(label) = self.slot.active().await {
            warn!(label = %label, "Waiting for running backup to finish before exiting");
        }

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }

        info!("Backup sidecar stopped");
    }
}
