/// Backup manager
///
/// Keeps the set of managed volumes in sync with the orchestrator, decides
/// which ones are due and runs one agent at a time per volume.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::engine::{CommandRunner, Engine, SnapshotDates};
use crate::core::envelope::{Envelope, Step, Steps};
use crate::core::filters::Filters;
use crate::core::metrics::VolumeMetrics;
use crate::core::providers::{run_cmd, Providers, POST_CMD_KEY, PRE_CMD_KEY};
use crate::core::volume::{BackupStatus, Volume};
use crate::error::{BivacError, Result};
use crate::orchestrators::Orchestrator;

pub const DEFAULT_REFRESH_RATE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(23 * 60 * 60);

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub target_url: String,
    pub agent_image: String,
    /// Base URL agents post their steps to; agents print the envelope when unset
    pub log_server: Option<String>,
    pub backup_interval: Duration,
    pub refresh_rate: Duration,
    /// Accepted for compatibility, scheduling only uses `backup_interval`
    pub default_preferred_time: Option<String>,
    pub agent_env: Vec<(String, String)>,
    pub server_address: String,
    /// Seed the last backup date of new volumes from their repository
    pub seed_from_repository: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            agent_image: "camptocamp/bivac:2.5".to_string(),
            log_server: None,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            refresh_rate: DEFAULT_REFRESH_RATE,
            default_preferred_time: None,
            agent_env: Vec::new(),
            server_address: "0.0.0.0:8182".to_string(),
            seed_from_repository: true,
        }
    }
}

/// Result of asking for a run on a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(BackupStatus),
    /// Another run holds the volume
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerInfo {
    pub version: String,
    pub build_date: String,
    pub orchestrator: String,
    pub address: String,
    pub managed_volumes: usize,
}

/// A volume under management: its record, its run lock and the steps
/// received from the current agent
pub struct ManagedVolume {
    mux: Mutex<()>,
    state: StdRwLock<Volume>,
    received: StdMutex<Option<Envelope>>,
}

impl ManagedVolume {
    fn new(volume: Volume) -> Self {
        Self {
            mux: Mutex::new(()),
            state: StdRwLock::new(volume),
            received: StdMutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Volume {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update<F: FnOnce(&mut Volume)>(&self, f: F) -> Volume {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
        state.clone()
    }

    fn start_receiving(&self) {
        *self.received.lock().unwrap_or_else(|e| e.into_inner()) = Some(Envelope::Success(Steps::new()));
    }

    fn take_received(&self) -> Option<Envelope> {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn receive(&self, envelope: Envelope) {
        let mut received = self.received.lock().unwrap_or_else(|e| e.into_inner());
        match received.as_mut() {
            Some(current) => current.merge(envelope),
            None => *received = Some(envelope),
        }
    }
}

/// Clears `backing_up` when a run ends, including when it is cancelled
struct Running<'a>(&'a ManagedVolume);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.update(|v| v.backing_up = false);
    }
}

/// A volume is due when no run is in progress and it either never
/// succeeded, failed last time, or its last backup is older than `interval`
pub fn is_due(v: &Volume, interval: Duration, now: DateTime<Local>) -> bool {
    if v.backing_up {
        return false;
    }
    if v.last_backup_status == BackupStatus::Failed {
        return true;
    }
    match v.last_backup_date {
        None => true,
        Some(last) => {
            let interval = chrono::Duration::from_std(interval)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
            now - last > interval
        }
    }
}

enum RunKind {
    Backup { force: bool },
    Restore { force: bool, snapshot: String },
}

pub struct Manager {
    orchestrator: Arc<dyn Orchestrator>,
    providers: Providers,
    filters: Filters,
    config: ManagerConfig,
    runner: Arc<dyn CommandRunner>,
    metrics: VolumeMetrics,
    volumes: RwLock<Vec<Arc<ManagedVolume>>>,
}

impl Manager {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        providers: Providers,
        filters: Filters,
        config: ManagerConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        Ok(Self {
            orchestrator,
            providers,
            filters,
            config,
            runner,
            metrics: VolumeMetrics::new()?,
            volumes: RwLock::new(Vec::new()),
        })
    }

    pub fn metrics(&self) -> &VolumeMetrics {
        &self.metrics
    }

    pub async fn volumes(&self) -> Vec<Volume> {
        self.volumes.read().await.iter().map(|v| v.snapshot()).collect()
    }

    async fn find(&self, reference: &str) -> Result<Arc<ManagedVolume>> {
        self.volumes
            .read()
            .await
            .iter()
            .find(|v| v.snapshot().matches(reference))
            .cloned()
            .ok_or_else(|| BivacError::VolumeNotFound(reference.to_string()))
    }

    fn info_with_count(&self, managed_volumes: usize) -> ManagerInfo {
        ManagerInfo {
            version: VERSION.to_string(),
            build_date: BUILD_TIMESTAMP.to_string(),
            orchestrator: self.orchestrator.name().to_string(),
            address: self.config.server_address.clone(),
            managed_volumes,
        }
    }

    pub async fn info(&self) -> ManagerInfo {
        let count = self.volumes.read().await.len();
        self.info_with_count(count)
    }

    fn repository_url(&self, v: &Volume) -> String {
        format!(
            "{}/{}/{}",
            self.config.target_url.trim_end_matches('/'),
            self.orchestrator.path(v),
            v.name
        )
    }

    /// Replace the managed set with the orchestrator's current view.
    /// Known volumes keep their state and metric series.
    pub async fn refresh(&self) -> Result<()> {
        let discovered = self.orchestrator.get_volumes(&self.filters).await?;

        let mut added = Vec::new();
        {
            let mut volumes = self.volumes.write().await;
            let mut next: Vec<Arc<ManagedVolume>> = Vec::with_capacity(discovered.len());
            let mut seen = HashSet::new();

            for found in discovered {
                if !seen.insert(found.id.clone()) {
                    warn!(volume = %found.name, "Duplicate volume id {}, ignoring", found.id);
                    continue;
                }
                let existing = volumes.iter().find(|v| v.snapshot().id == found.id).cloned();
                match existing {
                    Some(managed) => {
                        // series follow the labels, under the record lock so
                        // a finishing run cannot recreate the old ones
                        managed.update(|v| {
                            let before = v.clone();
                            v.refresh_from(&found);
                            if let Err(e) = self.metrics.relabel(&before, v) {
                                warn!(volume = %v.name, "Failed to relabel metrics: {}", e);
                            }
                        });
                        next.push(managed);
                    }
                    None => {
                        debug!(volume = %found.name, hostname = %found.hostname, "New volume");
                        self.metrics.register(&found);
                        let managed = Arc::new(ManagedVolume::new(found));
                        added.push(managed.clone());
                        next.push(managed);
                    }
                }
            }

            for gone in volumes.iter().filter(|v| !seen.contains(&v.snapshot().id)) {
                let v = gone.snapshot();
                debug!(volume = %v.name, hostname = %v.hostname, "Volume disappeared");
                if let Err(e) = self.metrics.unregister(&v) {
                    warn!(volume = %v.name, "Failed to unregister metrics: {}", e);
                }
            }

            *volumes = next;
        }

        if self.config.seed_from_repository {
            for managed in added {
                self.seed_backup_dates(&managed).await;
            }
        }
        Ok(())
    }

    async fn seed_backup_dates(&self, managed: &ManagedVolume) {
        let v = managed.snapshot();
        let engine = Engine::with_runner(&self.repository_url(&v), self.runner.clone());
        match engine.backup_dates().await {
            Ok(Some(dates)) => {
                managed.update(|v| {
                    v.last_backup_date = Some(dates.latest.with_timezone(&Local));
                    self.metrics.set_snapshots(
                        v,
                        dates.latest.timestamp(),
                        dates.oldest.timestamp(),
                        dates.count,
                    );
                });
            }
            Ok(None) => {}
            Err(e) => debug!(volume = %v.name, "Failed to read backup dates from repository: {}", e),
        }
    }

    /// One scheduler pass: refresh the set and start a backup for every due
    /// volume whose node is available
    pub async fn tick(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.refresh().await {
            error!("Failed to retrieve volumes: {}", e);
        }

        let now = Local::now();
        let volumes: Vec<Arc<ManagedVolume>> = self.volumes.read().await.clone();
        let mut handles = Vec::new();
        for managed in volumes {
            let v = managed.snapshot();
            if !is_due(&v, self.config.backup_interval, now) {
                continue;
            }
            match self.orchestrator.is_node_available(&v.host_bind).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(volume = %v.name, node = %v.host_bind, "Node unavailable");
                    continue;
                }
                Err(e) => {
                    warn!(volume = %v.name, node = %v.host_bind, "Failed to check node: {}", e);
                    continue;
                }
            }

            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                debug!(volume = %v.name, hostname = %v.hostname, "Backing up volume");
                if let Err(e) = manager.backup_volume(&managed, false).await {
                    error!(volume = %v.name, hostname = %v.hostname, "Failed to backup volume: {}", e);
                }
            }));
        }
        handles
    }

    /// Scheduler loop, first pass immediately
    pub async fn run(self: Arc<Self>) {
        info!("Starting backup manager...");
        let mut ticker = tokio::time::interval(self.config.refresh_rate);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    pub async fn backup_volume(&self, managed: &Arc<ManagedVolume>, force: bool) -> Result<RunOutcome> {
        self.run_exclusive(managed, RunKind::Backup { force }).await
    }

    pub async fn backup(self: &Arc<Self>, reference: &str, force: bool) -> Result<RunOutcome> {
        let managed = self.find(reference).await?;
        debug!(volume = %reference, "Backup manually requested");
        self.spawn_exclusive(managed, RunKind::Backup { force }).await
    }

    pub async fn restore(self: &Arc<Self>, reference: &str, force: bool, snapshot: &str) -> Result<RunOutcome> {
        let managed = self.find(reference).await?;
        debug!(volume = %reference, snapshot, "Restore requested");
        self.spawn_exclusive(
            managed,
            RunKind::Restore {
                force,
                snapshot: snapshot.to_string(),
            },
        )
        .await
    }

    /// Requested runs get a task of their own: a caller that stops waiting
    /// does not cancel the agent or skip its cleanup
    async fn spawn_exclusive(self: &Arc<Self>, managed: Arc<ManagedVolume>, kind: RunKind) -> Result<RunOutcome> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_exclusive(&managed, kind).await })
            .await
            .map_err(|e| BivacError::Agent(format!("run interrupted: {}", e)))?
    }

    async fn run_exclusive(&self, managed: &Arc<ManagedVolume>, kind: RunKind) -> Result<RunOutcome> {
        let Ok(_guard) = managed.mux.try_lock() else {
            return Ok(RunOutcome::Busy);
        };

        managed.update(|v| v.backing_up = true);
        let _running = Running(managed);
        let status = self.run_agent(managed, &kind).await;
        Ok(RunOutcome::Completed(status))
    }

    fn agent_argv(&self, v: &Volume, kind: &RunKind) -> Vec<String> {
        let path = self.orchestrator.path(v);
        let (action, force, receiver_kind) = match kind {
            RunKind::Backup { force } => ("backup", *force, "backup"),
            RunKind::Restore { force, .. } => ("restore", *force, "restore"),
        };
        let mut argv: Vec<String> = vec![
            "agent".into(),
            action.into(),
            "-p".into(),
            v.backup_path(),
            "-r".into(),
            self.repository_url(v),
            "--host".into(),
            path,
        ];
        if force {
            argv.push("--force".into());
        }
        if let RunKind::Restore { snapshot, .. } = kind {
            argv.push("-s".into());
            argv.push(snapshot.clone());
        }
        if let Some(server) = &self.config.log_server {
            argv.push("--log.receiver".into());
            argv.push(format!(
                "{}/{}/{}/logs",
                server.trim_end_matches('/'),
                receiver_kind,
                v.id
            ));
        }
        argv
    }

    async fn run_agent(&self, managed: &Arc<ManagedVolume>, kind: &RunKind) -> BackupStatus {
        let orchestrator = self.orchestrator.as_ref();
        let mut logs = BTreeMap::new();

        let provider = self
            .providers
            .get_provider(orchestrator, &managed.snapshot())
            .await;
        let v = managed.update(|v| v.backup_dir = provider.backup_dir.clone());

        let (pre_cmd, post_cmd) = match kind {
            RunKind::Backup { .. } => (&provider.pre_cmd, &provider.post_cmd),
            RunKind::Restore { .. } => (&provider.restore_pre_cmd, &provider.restore_post_cmd),
        };

        if !pre_cmd.is_empty() {
            if let Err(e) = run_cmd(orchestrator, &v, pre_cmd, PRE_CMD_KEY, &mut logs).await {
                warn!(volume = %v.name, hostname = %v.hostname, "Failed to run pre-command: {}", e);
            }
        }

        let argv = self.agent_argv(&v, kind);
        if self.config.log_server.is_some() {
            managed.start_receiving();
        }
        let dispatched = orchestrator
            .deploy_agent(&self.config.agent_image, &argv, &self.config.agent_env, &v)
            .await;
        let (envelope, status) = self.collect(managed, &v, dispatched);

        if !post_cmd.is_empty() {
            if let Err(e) = run_cmd(orchestrator, &v, post_cmd, POST_CMD_KEY, &mut logs).await {
                warn!(volume = %v.name, hostname = %v.hostname, "Failed to run post-command: {}", e);
            }
        }

        logs.extend(envelope.log_lines());
        match kind {
            RunKind::Backup { .. } => self.record_backup(managed, &envelope, status, logs),
            RunKind::Restore { .. } => {
                managed.update(|v| v.logs = logs);
            }
        }
        info!(volume = %v.name, hostname = %v.hostname, %status, "Agent finished");
        status
    }

    /// Envelope of the run and its status
    fn collect(
        &self,
        managed: &ManagedVolume,
        v: &Volume,
        dispatched: Result<(bool, String)>,
    ) -> (Envelope, BackupStatus) {
        let (success, output) = match dispatched {
            Ok(result) => result,
            Err(e) => {
                error!(volume = %v.name, hostname = %v.hostname, "Failed to deploy agent: {}", e);
                managed.take_received();
                return (Envelope::error(format!("failed to deploy agent: {}", e)), BackupStatus::Failed);
            }
        };

        let envelope = if self.config.log_server.is_some() {
            if !output.trim().is_empty() {
                warn!(volume = %v.name, "Unexpected agent output: {}", output.trim());
            }
            match managed.take_received() {
                Some(Envelope::Success(steps)) if steps.is_empty() => {
                    Envelope::error("no step received from agent")
                }
                Some(env) => env,
                None => Envelope::error("no step received from agent"),
            }
        } else {
            match Envelope::from_agent_output(&output) {
                Some(env) => env,
                None => {
                    warn!(volume = %v.name, hostname = %v.hostname, "Failed to parse agent output: `{}`", output.trim());
                    Envelope::error("failed to parse agent output")
                }
            }
        };

        let status = if success { envelope.status() } else { BackupStatus::Failed };
        (envelope, status)
    }

    fn record_backup(
        &self,
        managed: &ManagedVolume,
        envelope: &Envelope,
        status: BackupStatus,
        logs: BTreeMap<String, String>,
    ) {
        let dates = match envelope.step(Step::Snapshots) {
            Some(snapshots) if status == BackupStatus::Success => {
                SnapshotDates::from_json(&snapshots.stdout).unwrap_or_else(|e| {
                    debug!(volume = %managed.snapshot().name, "Failed to read snapshot list: {}", e);
                    None
                })
            }
            _ => None,
        };

        managed.update(|v| {
            v.logs = logs;
            v.last_backup_status = status;
            v.last_backup_date = Some(Local::now());
            self.metrics.update(v);
            if let Some(dates) = &dates {
                self.metrics.set_snapshots(
                    v,
                    dates.latest.timestamp(),
                    dates.oldest.timestamp(),
                    dates.count,
                );
            }
        });
    }

    /// Steps posted by an agent to the log receiver
    pub async fn receive_logs(&self, id: &str, envelope: Envelope) -> Result<()> {
        let managed = self.find(id).await?;
        managed.receive(envelope);
        Ok(())
    }

    /// Run `restic <argv>` against the volume's repository in a fresh agent
    pub async fn run_restic(&self, reference: &str, argv: &[String]) -> Result<String> {
        let managed = self.find(reference).await?;
        let Ok(_guard) = managed.mux.try_lock() else {
            return Err(BivacError::VolumeBusy(reference.to_string()));
        };

        let v = managed.snapshot();
        let mut agent_argv: Vec<String> = vec![
            "agent".into(),
            "restic".into(),
            "-r".into(),
            self.repository_url(&v),
            "--host".into(),
            self.orchestrator.path(&v),
            "--".into(),
        ];
        agent_argv.extend(argv.iter().cloned());

        let (_, output) = self
            .orchestrator
            .deploy_agent(&self.config.agent_image, &agent_argv, &self.config.agent_env, &v)
            .await?;

        match Envelope::from_agent_output(&output) {
            Some(Envelope::Success(steps)) => Ok(steps
                .get(&Step::Raw)
                .map(|s| s.stdout.clone())
                .unwrap_or_default()),
            Some(Envelope::Error(msg)) => Err(BivacError::Agent(msg)),
            None => Err(BivacError::Agent(format!(
                "failed to parse agent output: {}",
                output.trim()
            ))),
        }
    }
}
