/// Restic engine driver
///
/// Runs inside the agent. Sequences the restic invocations of a backup or a
/// restore, records every step's combined output and exit code, and turns
/// the result into an `Envelope`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::core::envelope::{Envelope, Step, StepOutput, Steps};
use crate::error::{BivacError, Result};

pub const RESTIC_BINARY: &str = "restic";

/// Retention applied when neither `--retention` nor `RESTIC_FORGET_ARGS` is set
pub const DEFAULT_RETENTION: &str = "--group-by host --keep-daily 15 --prune";

/// Written into the backup path after a successful repository check
pub const CHECK_SENTINEL: &str = ".bivac_last_check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub rc: i32,
}

/// Seam between the engine and the process table
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands as local subprocesses
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            output: combined,
            // killed by a signal
            rc: output.status.code().unwrap_or(-1),
        })
    }
}

/// Split a retention string the way a shell would for simple flags
pub fn retention_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotDates {
    pub latest: DateTime<Utc>,
    pub oldest: DateTime<Utc>,
    pub count: usize,
}

impl SnapshotDates {
    /// Summarize a `restic snapshots --json` listing. `None` when the
    /// repository holds no snapshot.
    pub fn from_json(raw: &str) -> Result<Option<SnapshotDates>> {
        let mut snapshots: Vec<Snapshot> = serde_json::from_str(raw.trim())?;
        if snapshots.is_empty() {
            return Ok(None);
        }
        snapshots.sort_by_key(|s| s.time);
        Ok(Some(SnapshotDates {
            oldest: snapshots[0].time,
            latest: snapshots[snapshots.len() - 1].time,
            count: snapshots.len(),
        }))
    }
}

pub struct Engine {
    runner: Arc<dyn CommandRunner>,
    default_args: Vec<String>,
    steps: Steps,
    listener: Option<UnboundedSender<Envelope>>,
}

impl Engine {
    pub fn new(repository: &str) -> Self {
        Self::with_runner(repository, Arc::new(ProcessRunner))
    }

    pub fn with_runner(repository: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            default_args: vec![
                "--no-cache".to_string(),
                "--json".to_string(),
                "-r".to_string(),
                repository.to_string(),
            ],
            steps: Steps::new(),
            listener: None,
        }
    }

    /// Every completed step is also sent on `listener` as a one-step envelope
    pub fn with_listener(mut self, listener: UnboundedSender<Envelope>) -> Self {
        self.listener = Some(listener);
        self
    }

    async fn run_step(&mut self, step: Step, args: &[&str]) -> Result<i32> {
        let mut full = self.default_args.clone();
        full.extend(args.iter().map(|a| a.to_string()));

        debug!(%step, args = ?args, "Running restic");
        let out = self
            .runner
            .run(RESTIC_BINARY, &full)
            .await
            .map_err(|e| BivacError::Engine(format!("failed to run restic {}: {}", step, e)))?;

        let output = StepOutput {
            stdout: out.output,
            rc: out.rc,
        };
        if let Some(listener) = &self.listener {
            // receiver gone means the agent stopped listening; keep going
            let _ = listener.send(Envelope::single(step, output.clone()));
        }
        self.steps.insert(step, output);
        Ok(out.rc)
    }

    fn finish(&mut self, result: Result<()>) -> Envelope {
        let steps = std::mem::take(&mut self.steps);
        match result {
            Ok(()) => Envelope::Success(steps),
            Err(e) => Envelope::error(e),
        }
    }

    /// testInit → [init] → [unlock] → backup → forget → snapshots → [verify]
    pub async fn backup(
        &mut self,
        backup_path: &str,
        hostname: &str,
        force: bool,
        retention: &[String],
        verify: bool,
    ) -> Envelope {
        let result = self
            .backup_steps(backup_path, hostname, force, retention, verify)
            .await;
        self.finish(result)
    }

    async fn backup_steps(
        &mut self,
        backup_path: &str,
        hostname: &str,
        force: bool,
        retention: &[String],
        verify: bool,
    ) -> Result<()> {
        if self.run_step(Step::TestInit, &["snapshots"]).await? != 0
            && self.run_step(Step::Init, &["init"]).await? != 0
        {
            return Ok(());
        }

        if force && self.run_step(Step::Unlock, &["unlock", "--remove-all"]).await? != 0 {
            return Ok(());
        }

        self.run_step(Step::Backup, &["--host", hostname, "backup", backup_path])
            .await?;

        let mut forget = vec!["forget"];
        forget.extend(retention.iter().map(String::as_str));
        self.run_step(Step::Forget, &forget).await?;

        self.run_step(Step::Snapshots, &["snapshots"]).await?;

        if verify && self.run_step(Step::Verify, &["check"]).await? == 0 {
            write_check_sentinel(Path::new(backup_path));
        }
        Ok(())
    }

    /// testInit → [unlock] → restore
    pub async fn restore(
        &mut self,
        backup_path: &str,
        hostname: &str,
        force: bool,
        snapshot: &str,
    ) -> Envelope {
        let result = self.restore_steps(backup_path, hostname, force, snapshot).await;
        self.finish(result)
    }

    async fn restore_steps(
        &mut self,
        backup_path: &str,
        hostname: &str,
        force: bool,
        snapshot: &str,
    ) -> Result<()> {
        // nothing to restore from an uninitialized repository
        if self.run_step(Step::TestInit, &["snapshots"]).await? != 0 {
            return Ok(());
        }

        if force && self.run_step(Step::Unlock, &["unlock", "--remove-all"]).await? != 0 {
            return Ok(());
        }

        self.run_step(
            Step::Restore,
            &[
                "--host",
                hostname,
                "restore",
                snapshot,
                "--target",
                "/",
                "--include",
                backup_path,
            ],
        )
        .await?;
        Ok(())
    }

    /// `restic <default args> <argv>`, recorded as the `raw` step
    pub async fn raw(&mut self, argv: &[String]) -> Envelope {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        let result = self.run_step(Step::Raw, &args).await.map(|_| ());
        self.finish(result)
    }

    /// Dates of the latest and oldest snapshots of the repository
    pub async fn backup_dates(&self) -> Result<Option<SnapshotDates>> {
        let mut args = self.default_args.clone();
        args.push("snapshots".to_string());
        let out = self.runner.run(RESTIC_BINARY, &args).await?;
        if out.rc != 0 {
            return Err(BivacError::Engine(format!(
                "restic snapshots exited with {}: {}",
                out.rc,
                out.output.trim()
            )));
        }
        SnapshotDates::from_json(&out.output)
    }
}

fn write_check_sentinel(backup_path: &Path) {
    let sentinel = backup_path.join(CHECK_SENTINEL);
    if let Err(e) = std::fs::write(&sentinel, Utc::now().to_rfc3339()) {
        warn!("Failed to write {}: {}", sentinel.display(), e);
    }
}
