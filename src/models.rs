use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

// ── Identity ───────────────────────────────────────────────────

pub type CloneId = String;
pub type SnapshotId = String;

/// Prefix of every clone container name. The container name is the clone id
/// under this namespace, which makes containers discoverable after restart.
pub const CLONE_CONTAINER_PREFIX: &str = "dblab_clone_";

/// Substring marking clone datasets; retention cleanup skips any dataset
/// whose name contains it.
pub const CLONE_DATASET_MARKER: &str = "clone";

/// Label marking a user clone container.
pub const LABEL_CLONE: &str = "dblab_clone";

/// Label marking an engine-internal control container.
pub const LABEL_CONTROL: &str = "dblab_control";

/// Label carrying the engine instance id on containers it owns.
pub const LABEL_INSTANCE_ID: &str = "dblab_instance_id";

pub fn new_clone_id() -> CloneId {
    format!(
        "clone_{}",
        &Uuid::new_v4().to_string().replace('-', "")[..12]
    )
}

pub fn container_name(clone_id: &str) -> String {
    format!("{CLONE_CONTAINER_PREFIX}{clone_id}")
}

// ── Clone ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneStatus {
    Creating,
    Ready,
    Resetting,
    Deleting,
    Fatal,
}

impl CloneStatus {
    /// Transitional states have an operation in flight; every mutating
    /// request against them is a conflict.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Creating | Self::Resetting | Self::Deleting)
    }
}

/// Connection descriptor of the Postgres instance backing a clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub db_name: String,
    #[serde(default)]
    pub restricted: bool,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            username: "postgres".into(),
            password_hash: None,
            db_name: "postgres".into(),
            restricted: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub clone_diff_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clone {
    pub id: CloneId,
    pub snapshot_id: SnapshotId,
    pub database: Database,
    pub port: u16,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
    pub status: CloneStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
    pub pool: String,
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub session_state: SessionState,
}

impl Clone {
    pub fn container_name(&self) -> String {
        container_name(&self.id)
    }
}

// ── Snapshot ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub pool: String,
    pub created_at: DateTime<Utc>,
    /// Logical point-in-time of the captured data, distinct from the
    /// physical creation timestamp.
    pub data_state_at: DateTime<Utc>,
    #[serde(default)]
    pub num_clones: usize,
    /// True when `data_state_at` is a wall-clock fallback rather than
    /// derived from the data.
    #[serde(default)]
    pub rough: bool,
}

impl Snapshot {
    /// Snapshots are ordered by `(data_state_at, created_at)`; lists are
    /// served in descending order of this key.
    pub fn sort_key(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.data_state_at, self.created_at)
    }
}

// ── Pool ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Active,
    Inactive,
    Empty,
}

/// Filesystem capacity of a pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Disk {
    pub size: u64,
    pub free: u64,
    pub used: u64,
    pub data_size: u64,
}

/// A top-level storage dataset owning clones and snapshots. Never mutated
/// after discovery except for status and stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub mount_dir: PathBuf,
    pub clones_subdir: String,
    pub data_subdir: String,
    pub socket_subdir: String,
    pub status: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<Disk>,
}

impl Pool {
    pub fn new(name: &str, mount_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            mount_dir,
            clones_subdir: "clones".into(),
            data_subdir: "data".into(),
            socket_subdir: "sockets".into(),
            status: PoolStatus::Inactive,
            disk: None,
        }
    }

    pub fn clones_dir(&self) -> PathBuf {
        self.mount_dir.join(&self.clones_subdir)
    }

    pub fn clone_mountpoint(&self, clone_name: &str) -> PathBuf {
        self.clones_dir().join(clone_name)
    }

    /// PGDATA of a clone container.
    pub fn clone_data_dir(&self, clone_name: &str) -> PathBuf {
        self.clone_mountpoint(clone_name).join(&self.data_subdir)
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.mount_dir.join(&self.socket_subdir)
    }

    pub fn socket_clone_dir(&self, clone_name: &str) -> PathBuf {
        self.socket_dir().join(clone_name)
    }

    /// Data directory of the pool itself (used by control containers).
    pub fn data_dir(&self) -> PathBuf {
        self.mount_dir.join(&self.data_subdir)
    }
}

// ── Requests ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateCloneRequest {
    /// Caller-supplied clone id; generated when absent.
    pub id: Option<CloneId>,
    /// Snapshot to clone from; the latest snapshot when absent.
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub database: Option<Database>,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCloneRequest {
    pub protected: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetCloneRequest {
    /// Snapshot to reset onto; the clone's current snapshot when absent.
    pub snapshot_id: Option<SnapshotId>,
}

// ── Instance status ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PoolEntry {
    pub name: String,
    pub status: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_state_at: Option<DateTime<Utc>>,
    pub clone_list: Vec<CloneId>,
    pub file_system: Disk,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub started_at: DateTime<Utc>,
    pub num_clones: usize,
    pub clones: Vec<Clone>,
    pub snapshots: Vec<Snapshot>,
    pub pools: Vec<PoolEntry>,
    pub expected_cloning_time_sec: f64,
}
