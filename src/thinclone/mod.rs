//! Abstract thin-clone filesystem operations. One implementation per
//! copy-on-write backend; variants are tagged by backend name in config.
//! Output parsing lives entirely inside the backend so a future
//! direct-library implementation can replace shell plumbing without
//! touching the state machine.

pub mod zfs;

use crate::error::EngineError;
use crate::models::{Disk, Pool, SessionState, Snapshot, SnapshotId};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Timestamp format used in snapshot names and data-state labels.
pub const DATA_STATE_AT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Builds a snapshot name: `<pool>[/<suffix>]@snapshot_<data_state_at>`.
pub fn snapshot_name(dataset: &str, data_state_at: &str) -> String {
    format!("{dataset}@snapshot_{data_state_at}")
}

/// Extracts the data-state timestamp encoded in a snapshot name.
pub fn parse_data_state_at(snapshot_id: &str) -> Option<DateTime<Utc>> {
    let (_, dsa) = snapshot_id.split_once("@snapshot_")?;
    NaiveDateTime::parse_from_str(dsa, DATA_STATE_AT_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// One row of the backend's list output.
#[derive(Debug, Clone, Default)]
pub struct ListEntry {
    pub name: String,
    pub used: u64,
    pub mountpoint: String,
    pub compress_ratio: f64,
    pub available: u64,
    pub dataset_type: String,
    pub origin: String,
    pub creation: Option<DateTime<Utc>>,
    pub referenced: u64,
    pub logical_referenced: u64,
    pub logical_used: u64,
    /// Custom label; absent when the backend never had it set.
    pub data_state_at: Option<DateTime<Utc>>,
}

pub trait ThinCloneManager: Send + Sync {
    /// The pool this manager operates on.
    fn pool(&self) -> Pool;

    /// Create a writable clone of `snapshot_id` mounted under the pool's
    /// clones directory. Idempotent: succeeds without touching an existing
    /// dataset of the same name.
    fn create_clone(
        &self,
        clone_name: &str,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    /// Destroy a user clone recursively, taking dependent snapshots and
    /// clones with it. Idempotent: a missing dataset is not an error.
    fn destroy_user_clone(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    /// Destroy a snapshot-preparation clone non-recursively. Recursive
    /// destroy is unsafe here: it would take user clones down with it.
    fn destroy_preparation_clone(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    /// Names of clone datasets under the pool.
    fn list_clone_names(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EngineError>> + Send + '_>>;

    /// Take a recursive snapshot of the pool (or `<pool>/<suffix>`); empty
    /// `data_state_at` falls back to wall-clock time and marks the snapshot
    /// rough. Returns the snapshot id.
    fn create_snapshot(
        &self,
        pool_suffix: &str,
        data_state_at: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SnapshotId, EngineError>> + Send + '_>>;

    fn destroy_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    /// Force rollback, discarding snapshots later than `snapshot_id`.
    fn rollback_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    /// Destroy old snapshots, keeping the `retention_limit` most recent by
    /// `(data_state_at, created_at)` plus everything in `keep`. Datasets
    /// whose names contain the clone marker are skipped. Returns the names
    /// destroyed.
    fn cleanup_snapshots(
        &self,
        retention_limit: usize,
        keep: &[SnapshotId],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EngineError>> + Send + '_>>;

    /// Snapshots available for cloning, sorted by
    /// `(data_state_at DESC, created_at DESC)`.
    fn snapshots(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Snapshot>, EngineError>> + Send + '_>>;

    fn list_filesystems(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ListEntry>, EngineError>> + Send + '_>>;

    /// Raw snapshot list entries, sorted by
    /// `(data_state_at DESC, created_at DESC)`.
    fn list_snapshot_entries(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ListEntry>, EngineError>> + Send + '_>>;

    /// Clone-diff usage of a live clone dataset. `NotFound` when the pool
    /// exists but the clone dataset does not.
    fn session_state(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionState, EngineError>> + Send + '_>>;

    fn disk_state(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Disk, EngineError>> + Send + '_>>;
}

// ── Test support ───────────────────────────────────────────────

/// In-memory manager for tests: tracks datasets and snapshots without
/// touching a real filesystem, with the same retention and idempotency
/// semantics as the ZFS backend.
pub struct StubFsManager {
    pool: Pool,
    pub datasets: std::sync::Mutex<std::collections::HashSet<String>>,
    pub snapshots: std::sync::Mutex<Vec<Snapshot>>,
    pub destroyed_clones: std::sync::Mutex<Vec<String>>,
    pub destroyed_snapshots: std::sync::Mutex<Vec<String>>,
    pub fail_next_create_clone: std::sync::atomic::AtomicBool,
}

impl StubFsManager {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            datasets: Default::default(),
            snapshots: Default::default(),
            destroyed_clones: Default::default(),
            destroyed_snapshots: Default::default(),
            fail_next_create_clone: Default::default(),
        }
    }

    /// Register a snapshot as if the retrieval pipeline had produced it.
    pub fn add_snapshot(&self, data_state_at: &str, created_at: &str) -> Snapshot {
        let dsa = NaiveDateTime::parse_from_str(data_state_at, "%Y-%m-%d %H:%M:%S")
            .expect("valid data_state_at")
            .and_utc();
        let created = NaiveDateTime::parse_from_str(created_at, "%Y-%m-%d %H:%M:%S")
            .expect("valid created_at")
            .and_utc();
        let snapshot = Snapshot {
            id: snapshot_name(&self.pool.name, &dsa.format(DATA_STATE_AT_FORMAT).to_string()),
            pool: self.pool.name.clone(),
            created_at: created,
            data_state_at: dsa,
            num_clones: 0,
            rough: false,
        };
        self.snapshots.lock().unwrap().push(snapshot.clone());
        snapshot
    }

    fn has_snapshot(&self, id: &str) -> bool {
        self.snapshots.lock().unwrap().iter().any(|s| s.id == id)
    }
}

impl ThinCloneManager for StubFsManager {
    fn pool(&self) -> Pool {
        self.pool.clone()
    }

    fn create_clone(
        &self,
        clone_name: &str,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let clone_name = clone_name.to_string();
        let snapshot_id = snapshot_id.to_string();
        Box::pin(async move {
            if self
                .fail_next_create_clone
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(EngineError::Backend("injected clone failure".into()));
            }
            if !self.has_snapshot(&snapshot_id) {
                return Err(EngineError::Backend(format!(
                    "snapshot {snapshot_id} does not exist"
                )));
            }
            self.datasets.lock().unwrap().insert(clone_name);
            Ok(())
        })
    }

    fn destroy_user_clone(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let clone_name = clone_name.to_string();
        Box::pin(async move {
            if self.datasets.lock().unwrap().remove(&clone_name) {
                self.destroyed_clones.lock().unwrap().push(clone_name);
            }
            Ok(())
        })
    }

    fn destroy_preparation_clone(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        self.destroy_user_clone(clone_name)
    }

    fn list_clone_names(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            let mut names: Vec<String> = self.datasets.lock().unwrap().iter().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn create_snapshot(
        &self,
        pool_suffix: &str,
        data_state_at: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SnapshotId, EngineError>> + Send + '_>> {
        let pool_suffix = pool_suffix.to_string();
        let data_state_at = data_state_at.to_string();
        Box::pin(async move {
            let dataset = if pool_suffix.is_empty() {
                self.pool.name.clone()
            } else {
                format!("{}/{}", self.pool.name, pool_suffix)
            };
            let rough = data_state_at.is_empty();
            let dsa_str = if rough {
                Utc::now().format(DATA_STATE_AT_FORMAT).to_string()
            } else {
                data_state_at
            };
            let id = snapshot_name(&dataset, &dsa_str);
            let dsa = parse_data_state_at(&id).ok_or_else(|| {
                EngineError::InvalidArgument(format!("bad data_state_at {dsa_str:?}"))
            })?;
            self.snapshots.lock().unwrap().push(Snapshot {
                id: id.clone(),
                pool: self.pool.name.clone(),
                created_at: Utc::now(),
                data_state_at: dsa,
                num_clones: 0,
                rough,
            });
            Ok(id)
        })
    }

    fn destroy_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let snapshot_id = snapshot_id.to_string();
        Box::pin(async move {
            let mut snapshots = self.snapshots.lock().unwrap();
            let before = snapshots.len();
            snapshots.retain(|s| s.id != snapshot_id);
            if snapshots.len() == before {
                return Err(EngineError::Backend(format!(
                    "snapshot {snapshot_id} does not exist"
                )));
            }
            self.destroyed_snapshots.lock().unwrap().push(snapshot_id);
            Ok(())
        })
    }

    fn rollback_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let snapshot_id = snapshot_id.to_string();
        Box::pin(async move {
            if !self.has_snapshot(&snapshot_id) {
                return Err(EngineError::Backend(format!(
                    "snapshot {snapshot_id} does not exist"
                )));
            }
            Ok(())
        })
    }

    fn cleanup_snapshots(
        &self,
        retention_limit: usize,
        keep: &[SnapshotId],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EngineError>> + Send + '_>> {
        let keep: Vec<SnapshotId> = keep.to_vec();
        Box::pin(async move {
            let mut snapshots = self.snapshots.lock().unwrap();
            let mut ordered: Vec<Snapshot> = snapshots
                .iter()
                .filter(|s| !s.id.contains(crate::models::CLONE_DATASET_MARKER))
                .cloned()
                .collect();
            ordered.sort_by_key(|s| s.sort_key());

            let deletable = ordered.len().saturating_sub(retention_limit);
            let mut destroyed = Vec::new();
            for snapshot in ordered.into_iter().take(deletable) {
                if keep.contains(&snapshot.id) {
                    continue;
                }
                snapshots.retain(|s| s.id != snapshot.id);
                destroyed.push(snapshot.id);
            }
            self.destroyed_snapshots
                .lock()
                .unwrap()
                .extend(destroyed.clone());
            Ok(destroyed)
        })
    }

    fn snapshots(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Snapshot>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            let mut list = self.snapshots.lock().unwrap().clone();
            list.sort_by_key(|s| std::cmp::Reverse(s.sort_key()));
            Ok(list)
        })
    }

    fn list_filesystems(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ListEntry>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            let datasets = self.datasets.lock().unwrap();
            let mut entries = vec![ListEntry {
                name: self.pool.name.clone(),
                ..ListEntry::default()
            }];
            entries.extend(datasets.iter().map(|name| ListEntry {
                name: format!("{}/{}", self.pool.name, name),
                used: 1024,
                ..ListEntry::default()
            }));
            Ok(entries)
        })
    }

    fn list_snapshot_entries(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ListEntry>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            let mut snapshots = self.snapshots.lock().unwrap().clone();
            snapshots.sort_by_key(|s| std::cmp::Reverse(s.sort_key()));
            Ok(snapshots
                .into_iter()
                .map(|s| ListEntry {
                    name: s.id,
                    dataset_type: "snapshot".into(),
                    creation: Some(s.created_at),
                    data_state_at: Some(s.data_state_at),
                    ..ListEntry::default()
                })
                .collect())
        })
    }

    fn session_state(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionState, EngineError>> + Send + '_>> {
        let clone_name = clone_name.to_string();
        Box::pin(async move {
            if !self.datasets.lock().unwrap().contains(&clone_name) {
                return Err(EngineError::NotFound(format!(
                    "clone dataset {clone_name} not found"
                )));
            }
            Ok(SessionState {
                clone_diff_size: 1024,
                last_observed: None,
            })
        })
    }

    fn disk_state(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Disk, EngineError>> + Send + '_>> {
        Box::pin(async move {
            Ok(Disk {
                size: 100 << 30,
                free: 80 << 30,
                used: 20 << 30,
                data_size: 10 << 30,
            })
        })
    }
}
