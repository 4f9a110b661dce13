//! Executes pgBackRest backups, one at a time.
//!
//! Output of the backup process is forwarded to the log as it is produced,
//! classified by the level marker pgBackRest puts at the start of a line.

use anyhow::{Context, Result, anyhow};
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::context::AppContext;
use crate::core::models::{BackupRequest, BackupStatus, SPAWN_FAILURE_RETURNCODE};
use crate::core::orchestrator::BackupSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    Info,
    Warning,
    Error,
}

pub fn classify_line(line: &str) -> LineLevel {
    if line.starts_with("WARN") {
        LineLevel::Warning
    } else if line.starts_with("ERROR") {
        LineLevel::Error
    } else {
        LineLevel::Info
    }
}

fn log_line(label: &str, line: &str) {
    match classify_line(line) {
        LineLevel::Info => info!(label = %label, "{}", line),
        LineLevel::Warning => warn!(label = %label, "{}", line),
        LineLevel::Error => error!(label = %label, "{}", line),
    }
}

/// Arguments for `pgbackrest` to run `request` against `stanza`.
pub fn backup_args(stanza: &str, request: &BackupRequest) -> Vec<String> {
    vec![
        format!("--stanza={}", stanza),
        "--log-level-console=off".to_string(),
        "--log-level-stderr=warn".to_string(),
        request.command.clone(),
        format!("--type={}", request.backup_type),
    ]
}

/// Exit code of a finished process. A process killed by a signal reports
/// the negated signal number.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    SPAWN_FAILURE_RETURNCODE
}

pub struct BackupRunner {
    ctx: AppContext,
    slot: BackupSlot,
    refresh: Arc<Notify>,
}

impl BackupRunner {
    pub fn new(ctx: AppContext, slot: BackupSlot, refresh: Arc<Notify>) -> Self {
        Self { ctx, slot, refresh }
    }

    /// Run a backup every time a label arrives on `run_rx`.
    ///
    /// Shutdown is checked before every label, so a wake-up caused by
    /// shutdown never starts a backup.
    pub async fn run_loop(self, mut run_rx: mpsc::Receiver<String>, shutdown: CancellationToken) {
        info!("Waiting for backup requests");

        loop {
            let label = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                label = run_rx.recv() => match label {
                    Some(label) => label,
                    None => break,
                },
            };

            self.run(&label).await;
            self.refresh.notify_one();
            self.slot.release(&label).await;
        }

        warn!("Backup runner shutting down");
    }

    /// Execute the backup for the record labelled `label` and finalize it.
    ///
    /// Never fails: any problem ends up as an ERROR status on the record.
    pub async fn run(&self, label: &str) {
        info!(label = %label, "Starting backup");

        let returncode = match self.execute(label).await {
            Ok(code) => code,
            Err(e) => {
                error!(label = %label, error = %format!("{e:#}"), "Could not run backup");
                self.ctx
                    .history
                    .update(label, |record| {
                        if !record.status().is_terminal() {
                            let _ = record.fail_to_start();
                        }
                    })
                    .await;
                SPAWN_FAILURE_RETURNCODE
            }
        };

        let Some(record) = self.ctx.history.get(label).await else {
            error!(label = %label, "Backup record disappeared");
            return;
        };

        match serde_json::to_string_pretty(&record.details()) {
            Ok(details) => debug!(label = %label, "Backup details\n{}", details),
            Err(e) => debug!(label = %label, error = %e, "Could not serialize backup details"),
        }

        if record.status() == BackupStatus::Finished {
            info!(label = %label, "Backup successful");
        } else {
            error!(label = %label, returncode, "Backup failed");
        }
    }

    async fn execute(&self, label: &str) -> Result<i32> {
        let record = self
            .ctx
            .history
            .get(label)
            .await
            .ok_or_else(|| anyhow!("no backup record labelled {}", label))?;
        let request = record.request.unwrap_or_default();
        let config = &self.ctx.config;

        let (mut child, output) = spawn_backup(config, &request)?;

        let pid = child.id();
        let marked = self
            .ctx
            .history
            .update(label, |record| record.mark_running(pid))
            .await
            .transpose();
        if let Err(e) = marked {
            if let Err(kill_err) = child.kill().await {
                warn!(label = %label, error = %kill_err, "Failed to stop backup process");
            }
            return Err(e.into());
        }
        debug!(label = %label, pid, "Backup process spawned");

        forward_lines(label, output).await;

        let status = child
            .wait()
            .await
            .context("Failed to wait for backup process")?;
        let code = exit_code(status);

        self.ctx
            .history
            .update(label, |record| record.complete(code))
            .await
            .transpose()?;

        Ok(code)
    }
}

/// Spawn the backup with stdout and stderr sharing one pipe, so the log
/// keeps the order in which pgBackRest wrote its lines.
fn spawn_backup(config: &AppConfig, request: &BackupRequest) -> Result<(Child, pipe::Receiver)> {
    let (reader, writer) = std::io::pipe().context("Failed to create output pipe")?;

    // The command holds the write ends; it is dropped at the end of the
    // statement so the reader sees EOF once the process exits.
    let child = Command::new(&config.pgbackrest_bin)
        .args(backup_args(&config.stanza, request))
        .stdin(Stdio::null())
        .stdout(writer.try_clone().context("Failed to duplicate output pipe")?)
        .stderr(writer)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", config.pgbackrest_bin.display()))?;

    let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
        .context("Failed to read backup output")?;
    Ok((child, output))
}

async fn forward_lines(label: &str, stream: impl AsyncRead + Unpin) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    log_line(label, line);
                }
            }
            Err(e) => {
                warn!(label = %label, error = %e, "Failed reading backup output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("pgbackrest");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn runner(pgbackrest_bin: PathBuf) -> BackupRunner {
        let config = AppConfig {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            log_level: LogLevel::Debug,
            json_logs: false,
            stanza: "poddb".to_string(),
            pgbackrest_bin,
            history_interval_secs: 3600,
        };
        let (tx, _rx) = mpsc::channel(1);
        BackupRunner::new(
            AppContext::new(config),
            BackupSlot::new(tx),
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn run_records_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(script(dir.path(), "echo 'WARN: test'; exit 4"));
        let record = runner.ctx.history.register(BackupRequest::default()).await;

        runner.run(record.label()).await;

        let record = runner.ctx.history.get(record.label()).await.unwrap();
        assert_eq!(record.status(), BackupStatus::Error);
        assert_eq!(record.returncode(), Some(4));
        assert!(record.process_id.is_some());
    }

    #[tokio::test]
    async fn process_is_stopped_when_record_cannot_start() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-running");
        let runner = runner(script(
            dir.path(),
            &format!("sleep 1; touch \"{}\"", marker.display()),
        ));

        // A record that is already RUNNING refuses another start.
        let record = runner.ctx.history.register(BackupRequest::default()).await;
        runner
            .ctx
            .history
            .update(record.label(), |r| r.mark_running(None))
            .await
            .unwrap()
            .unwrap();

        runner.run(record.label()).await;

        let record = runner.ctx.history.get(record.label()).await.unwrap();
        assert_eq!(record.status(), BackupStatus::Error);
        assert_eq!(record.returncode(), Some(SPAWN_FAILURE_RETURNCODE));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn classifies_by_leading_marker() {
        assert_eq!(
            classify_line("WARN: option repo1-retention-full is not set"),
            LineLevel::Warning
        );
        assert_eq!(
            classify_line("ERROR: [056]: unable to find primary cluster"),
            LineLevel::Error
        );
        assert_eq!(classify_line("INFO: backup command begin"), LineLevel::Info);
        assert_eq!(classify_line("  WARN indented is not a marker"), LineLevel::Info);
        assert_eq!(classify_line(""), LineLevel::Info);
    }

    #[test]
    fn backup_args_follow_request() {
        let request = BackupRequest {
            command: "backup".into(),
            backup_type: "diff".into(),
        };
        assert_eq!(
            backup_args("poddb", &request),
            vec![
                "--stanza=poddb",
                "--log-level-console=off",
                "--log-level-stderr=warn",
                "backup",
                "--type=diff",
            ]
        );
    }
}
