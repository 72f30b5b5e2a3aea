//! In-memory authoritative registry of clones and snapshots, persisted as a
//! single JSON document in the active pool's root. Every clone-status
//! mutation triggers an atomic write (temp file + rename); unknown fields of
//! the state file survive a read-modify-write cycle.

use crate::error::EngineError;
use crate::models::{Clone, CloneId, CloneStatus, Snapshot, SnapshotId};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

pub const STATE_FILE_NAME: &str = "dblab_state.json";

const STATE_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    clones: Vec<Clone>,
    #[serde(default)]
    snapshots_pinned: Vec<SnapshotId>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Default)]
pub struct Registry {
    clones: DashMap<CloneId, Clone>,
    snapshots: RwLock<HashMap<SnapshotId, Snapshot>>,
    state_path: RwLock<Option<PathBuf>>,
    extra_fields: Mutex<serde_json::Map<String, serde_json::Value>>,
    // Single writer for the state file.
    persist_gate: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state_path(&self, path: PathBuf) {
        *self.state_path.write().unwrap() = Some(path);
    }

    // ── Clones ─────────────────────────────────────────────────

    pub fn add_clone(&self, clone: Clone) -> Result<(), EngineError> {
        if self.clones.contains_key(&clone.id) {
            return Err(EngineError::AlreadyExists(format!(
                "clone {} already exists",
                clone.id
            )));
        }
        self.clones.insert(clone.id.clone(), clone);
        self.persist()
    }

    pub fn get_clone(&self, id: &str) -> Option<Clone> {
        self.clones.get(id).map(|c| c.clone())
    }

    pub fn list_clones(&self) -> Vec<Clone> {
        let mut clones: Vec<Clone> = self.clones.iter().map(|c| c.value().clone()).collect();
        clones.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        clones
    }

    pub fn num_clones(&self) -> usize {
        self.clones.len()
    }

    pub fn remove_clone(&self, id: &str) -> Result<(), EngineError> {
        self.clones.remove(id);
        self.persist()
    }

    /// Transition a clone's status, stamping `status_updated_at` and
    /// persisting the registry.
    pub fn set_clone_status(
        &self,
        id: &str,
        status: CloneStatus,
        message: Option<String>,
    ) -> Result<Clone, EngineError> {
        self.update_clone(id, |clone| {
            clone.status = status;
            clone.status_message = message;
            clone.status_updated_at = Utc::now();
        })
    }

    /// Apply an in-place mutation and persist. Status transitions go through
    /// `set_clone_status`, which also stamps `status_updated_at`.
    pub fn update_clone(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Clone),
    ) -> Result<Clone, EngineError> {
        let updated = {
            let mut entry = self
                .clones
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(format!("clone {id} not found")))?;
            mutate(entry.value_mut());
            entry.value().clone()
        };
        self.persist()?;
        Ok(updated)
    }

    // ── Snapshots ──────────────────────────────────────────────

    pub fn add_snapshot(&self, snapshot: Snapshot) {
        self.snapshots
            .write()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn snapshot_by_id(&self, id: &str) -> Result<Snapshot, EngineError> {
        self.snapshots
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {id} not found")))
    }

    /// Snapshots sorted by `(data_state_at DESC, created_at DESC)`.
    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> =
            self.snapshots.read().unwrap().values().cloned().collect();
        snapshots.sort_by_key(|s| std::cmp::Reverse(s.sort_key()));
        snapshots
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.snapshots
            .read()
            .unwrap()
            .values()
            .max_by_key(|s| s.sort_key())
            .cloned()
    }

    pub fn remove_snapshot(&self, id: &str) {
        self.snapshots.write().unwrap().remove(id);
    }

    pub fn reset_snapshots(&self, snapshots: HashMap<SnapshotId, Snapshot>) {
        *self.snapshots.write().unwrap() = snapshots;
    }

    /// Merge a fresh backend listing, preserving refcounts and rough flags
    /// of snapshots the registry already knows.
    pub fn refresh_snapshots(&self, fresh: Vec<Snapshot>) {
        let mut snapshots = self.snapshots.write().unwrap();
        let mut merged = HashMap::with_capacity(fresh.len());
        for mut snapshot in fresh {
            if let Some(existing) = snapshots.get(&snapshot.id) {
                snapshot.num_clones = existing.num_clones;
                snapshot.rough = existing.rough;
            }
            merged.insert(snapshot.id.clone(), snapshot);
        }
        *snapshots = merged;
    }

    pub fn increment_clone_number(&self, id: &str) -> Result<(), EngineError> {
        let mut snapshots = self.snapshots.write().unwrap();
        let snapshot = snapshots
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {id} not found")))?;
        snapshot.num_clones += 1;
        Ok(())
    }

    pub fn decrement_clone_number(&self, id: &str) -> Result<(), EngineError> {
        let mut snapshots = self.snapshots.write().unwrap();
        let snapshot = snapshots
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {id} not found")))?;
        if snapshot.num_clones == 0 {
            tracing::warn!(snapshot = %id, "Snapshot refcount is already zero");
        } else {
            snapshot.num_clones -= 1;
        }
        Ok(())
    }

    /// Move a clone reference between snapshots under one lock, so the old
    /// refcount is never observably below its prior value minus one.
    pub fn retarget_clone_number(&self, old_id: &str, new_id: &str) -> Result<(), EngineError> {
        let mut snapshots = self.snapshots.write().unwrap();
        if !snapshots.contains_key(new_id) {
            return Err(EngineError::NotFound(format!("snapshot {new_id} not found")));
        }
        if let Some(old) = snapshots.get_mut(old_id) {
            if old.num_clones > 0 {
                old.num_clones -= 1;
            }
        } else {
            tracing::warn!(snapshot = %old_id, "Old snapshot is unknown, skipping refcount decrement");
        }
        let new = snapshots.get_mut(new_id).expect("checked above");
        new.num_clones += 1;
        Ok(())
    }

    /// Snapshot ids retention cleanup must never destroy: the pinned latest
    /// plus every snapshot with live clones.
    pub fn protected_snapshot_ids(&self) -> Vec<SnapshotId> {
        let snapshots = self.snapshots.read().unwrap();
        let mut keep: Vec<SnapshotId> = snapshots
            .values()
            .filter(|s| s.num_clones > 0)
            .map(|s| s.id.clone())
            .collect();
        if let Some(latest) = snapshots.values().max_by_key(|s| s.sort_key()) {
            if !keep.contains(&latest.id) {
                keep.push(latest.id.clone());
            }
        }
        keep
    }

    /// Recompute snapshot refcounts from the clone set (after replaying the
    /// state file, counts are authoritative in the clone records).
    pub fn recount_clone_numbers(&self) {
        let mut counts: HashMap<SnapshotId, usize> = HashMap::new();
        for clone in self.clones.iter() {
            *counts.entry(clone.snapshot_id.clone()).or_default() += 1;
        }
        let mut snapshots = self.snapshots.write().unwrap();
        for snapshot in snapshots.values_mut() {
            snapshot.num_clones = counts.get(&snapshot.id).copied().unwrap_or(0);
        }
    }

    // ── Persistence ────────────────────────────────────────────

    pub fn load(&self) -> Result<usize, EngineError> {
        let path = match self.state_path.read().unwrap().clone() {
            Some(path) => path,
            None => return Ok(0),
        };
        if !path.exists() {
            return Ok(0);
        }

        let data = std::fs::read_to_string(&path)?;
        let doc: StateFile = serde_json::from_str(&data)?;

        *self.extra_fields.lock().unwrap() = doc.extra;

        let count = doc.clones.len();
        for clone in doc.clones {
            self.clones.insert(clone.id.clone(), clone);
        }
        Ok(count)
    }

    pub fn persist(&self) -> Result<(), EngineError> {
        let path = match self.state_path.read().unwrap().clone() {
            Some(path) => path,
            None => {
                tracing::debug!("State path is not set yet, skipping persistence");
                return Ok(());
            }
        };

        let _gate = self.persist_gate.lock().unwrap();

        let doc = StateFile {
            version: STATE_FILE_VERSION,
            clones: self.list_clones(),
            snapshots_pinned: self
                .latest_snapshot()
                .map(|s| vec![s.id])
                .unwrap_or_default(),
            extra: self.extra_fields.lock().unwrap().clone(),
        };

        let dir = path
            .parent()
            .ok_or_else(|| EngineError::Internal(format!("state path {path:?} has no parent")))?;
        std::fs::create_dir_all(dir)?;

        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file(), &doc)?;
        tmp.persist(&path)
            .map_err(|e| EngineError::Io(e.error))?;

        Ok(())
    }

    /// Forget everything in memory. Used by tests and full reloads; does not
    /// touch the state file.
    pub fn reset(&self) {
        self.clones.clear();
        self.snapshots.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{new_clone_id, Database, SessionState};
    use chrono::NaiveDateTime;
    use tempfile::TempDir;

    fn snapshot(id: &str, created_at: &str, data_state_at: &str) -> Snapshot {
        Snapshot {
            id: id.into(),
            pool: "dblab_pool".into(),
            created_at: parse(created_at),
            data_state_at: parse(data_state_at),
            num_clones: 0,
            rough: false,
        }
    }

    fn parse(s: &str) -> chrono::DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn clone_record(id: &str, snapshot_id: &str) -> Clone {
        Clone {
            id: id.into(),
            snapshot_id: snapshot_id.into(),
            database: Database::default(),
            port: 6000,
            protected: false,
            extra_config: HashMap::new(),
            status: CloneStatus::Ready,
            status_message: None,
            created_at: Utc::now(),
            status_updated_at: Utc::now(),
            pool: "dblab_pool".into(),
            mountpoint: PathBuf::from("/var/lib/dblab/dblab_pool/clones").join(id),
            session_state: SessionState::default(),
        }
    }

    #[test]
    fn test_latest_snapshot() {
        let registry = Registry::new();
        registry.reset_snapshots(HashMap::new());

        assert!(registry.latest_snapshot().is_none());

        // The snapshot with the most recent data state wins regardless of
        // insertion order and physical creation time.
        registry.add_snapshot(snapshot(
            "TestSnapshotID2",
            "2020-02-20 05:43:21",
            "2020-02-20 00:00:00",
        ));
        registry.add_snapshot(snapshot(
            "TestSnapshotID1",
            "2020-02-20 01:23:45",
            "2020-02-19 00:00:00",
        ));

        let latest = registry.latest_snapshot().unwrap();
        assert_eq!(latest.id, "TestSnapshotID2");
    }

    #[test]
    fn test_snapshot_by_id_and_reset() {
        let registry = Registry::new();
        registry.add_snapshot(snapshot(
            "TestSnapshotID1",
            "2020-02-20 01:23:45",
            "2020-02-19 00:00:00",
        ));

        assert_eq!(
            registry.snapshot_by_id("TestSnapshotID1").unwrap().id,
            "TestSnapshotID1"
        );
        assert!(registry.snapshot_by_id("unknown").is_err());

        registry.reset_snapshots(HashMap::new());
        assert!(registry.latest_snapshot().is_none());
    }

    #[test]
    fn test_clone_counter() {
        let registry = Registry::new();
        registry.add_snapshot(snapshot(
            "testSnapshotID",
            "2020-02-20 01:23:45",
            "2020-02-19 00:00:00",
        ));

        assert_eq!(registry.snapshot_by_id("testSnapshotID").unwrap().num_clones, 0);

        registry.increment_clone_number("testSnapshotID").unwrap();
        assert_eq!(registry.snapshot_by_id("testSnapshotID").unwrap().num_clones, 1);

        registry.decrement_clone_number("testSnapshotID").unwrap();
        assert_eq!(registry.snapshot_by_id("testSnapshotID").unwrap().num_clones, 0);

        // Saturates at zero instead of underflowing.
        registry.decrement_clone_number("testSnapshotID").unwrap();
        assert_eq!(registry.snapshot_by_id("testSnapshotID").unwrap().num_clones, 0);
    }

    #[test]
    fn test_retarget_clone_number() {
        let registry = Registry::new();
        registry.add_snapshot(snapshot("S1", "2020-02-19 00:00:00", "2020-02-19 00:00:00"));
        registry.add_snapshot(snapshot("S2", "2020-02-20 00:00:00", "2020-02-20 00:00:00"));
        registry.increment_clone_number("S1").unwrap();

        registry.retarget_clone_number("S1", "S2").unwrap();
        assert_eq!(registry.snapshot_by_id("S1").unwrap().num_clones, 0);
        assert_eq!(registry.snapshot_by_id("S2").unwrap().num_clones, 1);

        assert!(registry.retarget_clone_number("S2", "unknown").is_err());
        // Failed retarget leaves counts untouched.
        assert_eq!(registry.snapshot_by_id("S2").unwrap().num_clones, 1);
    }

    #[test]
    fn test_list_snapshots_sorted_desc() {
        let registry = Registry::new();
        registry.add_snapshot(snapshot("old", "2020-02-18 00:00:00", "2020-02-18 00:00:00"));
        registry.add_snapshot(snapshot("new", "2020-02-20 00:00:00", "2020-02-20 00:00:00"));
        registry.add_snapshot(snapshot("mid", "2020-02-19 00:00:00", "2020-02-19 00:00:00"));

        let ids: Vec<String> = registry.list_snapshots().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_protected_snapshot_ids() {
        let registry = Registry::new();
        registry.add_snapshot(snapshot("S1", "2020-02-18 00:00:00", "2020-02-18 00:00:00"));
        registry.add_snapshot(snapshot("S2", "2020-02-19 00:00:00", "2020-02-19 00:00:00"));
        registry.add_snapshot(snapshot("S3", "2020-02-20 00:00:00", "2020-02-20 00:00:00"));
        registry.increment_clone_number("S1").unwrap();

        let mut keep = registry.protected_snapshot_ids();
        keep.sort();
        // Referenced snapshot plus the pinned latest.
        assert_eq!(keep, vec!["S1", "S3"]);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(STATE_FILE_NAME);

        let registry = Registry::new();
        registry.set_state_path(path.clone());
        registry.add_snapshot(snapshot("S1", "2020-02-19 00:00:00", "2020-02-19 00:00:00"));
        registry.add_clone(clone_record("clone_persisted", "S1")).unwrap();
        registry
            .set_clone_status("clone_persisted", CloneStatus::Ready, None)
            .unwrap();

        let restored = Registry::new();
        restored.set_state_path(path);
        assert_eq!(restored.load().unwrap(), 1);

        let clone = restored.get_clone("clone_persisted").unwrap();
        assert_eq!(clone.status, CloneStatus::Ready);
        assert_eq!(clone.snapshot_id, "S1");
    }

    #[test]
    fn test_persist_records_pinned_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(STATE_FILE_NAME);

        let registry = Registry::new();
        registry.set_state_path(path.clone());
        registry.add_snapshot(snapshot("S1", "2020-02-19 00:00:00", "2020-02-19 00:00:00"));
        registry.add_snapshot(snapshot("S2", "2020-02-20 00:00:00", "2020-02-20 00:00:00"));
        registry.persist().unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["snapshots_pinned"][0], "S2");
    }

    #[test]
    fn test_unknown_fields_survive_rewrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(STATE_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"version": 1, "clones": [], "snapshots_pinned": [], "future_field": {"a": 1}}"#,
        )
        .unwrap();

        let registry = Registry::new();
        registry.set_state_path(path.clone());
        registry.load().unwrap();
        registry.persist().unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["future_field"]["a"], 1);
    }

    #[test]
    fn test_persist_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(STATE_FILE_NAME);

        let registry = Registry::new();
        registry.set_state_path(path);
        registry.add_clone(clone_record(&new_clone_id(), "S1")).unwrap();

        let entries: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec![STATE_FILE_NAME.to_string()]);
    }

    #[test]
    fn test_recount_clone_numbers() {
        let registry = Registry::new();
        registry.add_snapshot(snapshot("S1", "2020-02-19 00:00:00", "2020-02-19 00:00:00"));
        registry.add_snapshot(snapshot("S2", "2020-02-20 00:00:00", "2020-02-20 00:00:00"));
        registry.add_clone(clone_record("clone_a", "S1")).unwrap();
        registry.add_clone(clone_record("clone_b", "S1")).unwrap();

        registry.recount_clone_numbers();
        assert_eq!(registry.snapshot_by_id("S1").unwrap().num_clones, 2);
        assert_eq!(registry.snapshot_by_id("S2").unwrap().num_clones, 0);
    }

    #[test]
    fn test_status_transitions_stamp_time_but_updates_do_not() {
        let registry = Registry::new();
        let record = clone_record("clone_u", "S1");
        let before = record.status_updated_at;
        registry.add_clone(record).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let updated = registry
            .update_clone("clone_u", |c| c.protected = true)
            .unwrap();
        assert!(updated.protected);
        assert_eq!(updated.status_updated_at, before);

        let transitioned = registry
            .set_clone_status("clone_u", CloneStatus::Resetting, None)
            .unwrap();
        assert!(transitioned.status_updated_at > before);
    }
}
