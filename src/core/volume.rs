/// Volume model shared by the orchestrator drivers, the manager and the API
///
/// A `Volume` is the manager's view of one persistent volume: where it lives,
/// where it is mounted and how its last backup went.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mountpoint used when no running container mounts the volume
pub const DEFAULT_MOUNTPOINT: &str = "/data";

/// Host binding for volumes not attached to any node yet
pub const UNBOUND_HOST: &str = "unbound";

/// Textual format of backup dates, both in the API and in logs
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackupStatus {
    Success,
    Failed,
    #[default]
    Unknown,
}

impl BackupStatus {
    /// Value exported through the `bivac_last_backup_status` gauge
    pub fn gauge_value(self) -> f64 {
        match self {
            BackupStatus::Success => 0.0,
            BackupStatus::Failed => 1.0,
            BackupStatus::Unknown => -1.0,
        }
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupStatus::Success => write!(f, "Success"),
            BackupStatus::Failed => write!(f, "Failed"),
            BackupStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub host_bind: String,
    pub hostname: String,
    pub namespace: String,
    pub mountpoint: String,
    #[serde(default)]
    pub backup_dir: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub backing_up: bool,
    #[serde(default, with = "backup_date")]
    pub last_backup_date: Option<DateTime<Local>>,
    #[serde(default)]
    pub last_backup_status: BackupStatus,
    #[serde(default)]
    pub logs: BTreeMap<String, String>,
}

impl Volume {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mountpoint: DEFAULT_MOUNTPOINT.to_string(),
            ..Default::default()
        }
    }

    /// Path handed to the agent, `<mountpoint>/<backup_dir>`
    pub fn backup_path(&self) -> String {
        format!("{}/{}", self.mountpoint.trim_end_matches('/'), self.backup_dir)
    }

    /// True when `reference` names this volume, either by id or by the id
    /// prefix before a `:` separator
    pub fn matches(&self, reference: &str) -> bool {
        self.id == reference
            || self.id.split(':').next() == Some(reference)
            || self.name == reference
    }

    /// The identity part of the record, used to refresh a managed volume
    /// without losing its backup state
    pub fn refresh_from(&mut self, discovered: &Volume) {
        self.name = discovered.name.clone();
        self.host_bind = discovered.host_bind.clone();
        self.hostname = discovered.hostname.clone();
        self.namespace = discovered.namespace.clone();
        self.mountpoint = discovered.mountpoint.clone();
        self.read_only = discovered.read_only;
        self.labels = discovered.labels.clone();
    }
}

/// A volume as seen from inside one running container
#[derive(Debug, Clone, PartialEq)]
pub struct MountedVolume {
    pub pod_id: Option<String>,
    pub container_id: String,
    pub host_id: String,
    pub volume: Volume,
    pub path: String,
}

mod backup_date {
    use super::DATE_FORMAT;
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        date: &Option<DateTime<Local>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match date {
            Some(d) => serializer.serialize_str(&d.format(DATE_FORMAT).to_string()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Local>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        if raw.is_empty() {
            return Ok(None);
        }
        let naive = NaiveDateTime::parse_from_str(&raw, DATE_FORMAT)
            .map_err(serde::de::Error::custom)?;
        Ok(Local.from_local_datetime(&naive).single())
    }
}
