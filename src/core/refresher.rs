//! Periodic reconciliation with `pgbackrest info`.
//!
//! The repository is shared between replicas, so the listing pgBackRest
//! reports includes backups taken by other pods and by earlier runs of this
//! process. See <https://pgbackrest.org/command.html#command-info> for the
//! JSON layout.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::history::{ExternalBackup, ReconcileStats};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("failed to run pgbackrest info: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("pgbackrest info exited with {code:?}: {stderr}")]
    ToolFailed { code: Option<i32>, stderr: String },
    #[error("unparsable pgbackrest info output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("backup timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

#[derive(Deserialize)]
struct StanzaInfo {
    #[serde(default)]
    backup: Vec<Map<String, Value>>,
}

#[derive(Deserialize)]
struct Timestamps {
    start: i64,
    stop: i64,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, RefreshError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(RefreshError::InvalidTimestamp(secs))
}

/// Parse `pgbackrest info --output=json`. Only the first stanza is read,
/// since the command is always run for a single stanza.
pub fn parse_info(output: &[u8]) -> Result<Vec<ExternalBackup>, RefreshError> {
    let stanzas: Vec<StanzaInfo> = serde_json::from_slice(output)?;
    let Some(stanza) = stanzas.into_iter().next() else {
        return Ok(Vec::new());
    };

    stanza
        .backup
        .into_iter()
        .map(|metadata| -> Result<ExternalBackup, RefreshError> {
            let raw = metadata.get("timestamp").cloned().unwrap_or(Value::Null);
            let times: Timestamps = serde_json::from_value(raw)?;
            Ok(ExternalBackup {
                started: timestamp(times.start)?,
                finished: timestamp(times.stop)?,
                metadata,
            })
        })
        .collect()
}

pub struct HistoryRefresher {
    ctx: AppContext,
    trigger: Arc<Notify>,
    interval: Duration,
}

impl HistoryRefresher {
    pub fn new(ctx: AppContext, trigger: Arc<Notify>) -> Self {
        let interval = ctx.config.history_interval();
        Self {
            ctx,
            trigger,
            interval,
        }
    }

    /// Refresh whenever triggered, or after `interval` without a trigger.
    /// Errors are logged and never end the loop.
    pub async fn run_loop(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.trigger.notified() => debug!("History refresh requested"),
                _ = tokio::time::sleep(self.interval) => debug!("History refresh interval elapsed"),
            }

            // A slow `info` is abandoned on shutdown; dropping it kills the process.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.refresh() => {
                    if let Err(e) = result {
                        error!(error = %e, "Failed to refresh backup history");
                    }
                }
            }
        }

        warn!("History refresher shutting down");
    }

    pub async fn refresh(&self) -> Result<ReconcileStats, RefreshError> {
        info!("Refreshing backup history using pgbackrest");
        let config = &self.ctx.config;

        let output = Command::new(&config.pgbackrest_bin)
            .arg(format!("--stanza={}", config.stanza))
            .arg("info")
            .arg("--output=json")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RefreshError::ToolFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let backups = parse_info(&output.stdout)?;
        let stats = self.ctx.history.reconcile(backups).await;
        info!(
            reported = stats.merged,
            discovered = stats.discovered,
            "Backup history refreshed"
        );
        Ok(stats)
    }
}
