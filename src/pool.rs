//! Pool discovery and tracking. The manager owns one thin-clone manager per
//! pool and designates exactly one pool as active; clone creation targets
//! only the active pool.

use crate::config::PoolsConfig;
use crate::error::EngineError;
use crate::models::{Pool, PoolStatus};
use crate::thinclone::ThinCloneManager;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Builds a thin-clone manager for a discovered pool. Injected so tests can
/// run the manager over in-memory backends.
pub type ManagerFactory = Box<dyn Fn(&Pool) -> Arc<dyn ThinCloneManager> + Send + Sync>;

struct ManagedPool {
    pool: Pool,
    manager: Arc<dyn ThinCloneManager>,
}

struct PoolsState {
    config: PoolsConfig,
    entries: Vec<ManagedPool>,
    active: Option<String>,
}

pub struct PoolManager {
    factory: ManagerFactory,
    state: RwLock<PoolsState>,
}

impl PoolManager {
    pub fn new(config: PoolsConfig, factory: ManagerFactory) -> Self {
        let entries = config
            .pool_names
            .iter()
            .map(|name| {
                let pool = Pool::new(name, config.mount_dir.join(name));
                let manager = factory(&pool);
                ManagedPool { pool, manager }
            })
            .collect();

        Self {
            factory,
            state: RwLock::new(PoolsState {
                config,
                entries,
                active: None,
            }),
        }
    }

    /// Classify pools and select the active one: the explicitly configured
    /// pool when present, otherwise the pool with the most recent snapshot.
    pub async fn discover(&self) -> Result<(), EngineError> {
        let latest = self.latest_snapshot_keys().await;

        let mut state = self.state.write().unwrap();

        let selected = state.config.selected_pool.clone().filter(|name| {
            state.entries.iter().any(|e| e.pool.name == *name)
        });

        let active = selected.or_else(|| {
            state
                .entries
                .iter()
                .filter_map(|e| {
                    latest
                        .get(&e.pool.name)
                        .copied()
                        .flatten()
                        .map(|key| (e.pool.name.clone(), key))
                })
                .max_by_key(|(_, key)| *key)
                .map(|(name, _)| name)
        });

        let active = match active {
            Some(name) => name,
            None => {
                return Err(EngineError::PreconditionFailed(
                    "no pool with snapshots available to activate".into(),
                ))
            }
        };

        let configured: HashSet<String> = state.config.pool_names.iter().cloned().collect();
        for entry in &mut state.entries {
            entry.pool.status = if entry.pool.name == active {
                PoolStatus::Active
            } else if !configured.contains(&entry.pool.name) {
                // Retained only because it still has live clones.
                PoolStatus::Inactive
            } else if latest.get(&entry.pool.name).copied().flatten().is_none() {
                PoolStatus::Empty
            } else {
                PoolStatus::Inactive
            };
        }

        tracing::info!(pool = %active, "Active pool selected");
        state.active = Some(active);

        Ok(())
    }

    pub fn active(&self) -> Result<Arc<dyn ThinCloneManager>, EngineError> {
        let state = self.state.read().unwrap();
        let name = state
            .active
            .clone()
            .ok_or_else(|| EngineError::Internal("no active pool".into()))?;
        state
            .entries
            .iter()
            .find(|e| e.pool.name == name)
            .map(|e| e.manager.clone())
            .ok_or_else(|| EngineError::Internal(format!("active pool {name} disappeared")))
    }

    pub fn active_pool(&self) -> Result<Pool, EngineError> {
        let state = self.state.read().unwrap();
        let name = state
            .active
            .clone()
            .ok_or_else(|| EngineError::Internal("no active pool".into()))?;
        state
            .entries
            .iter()
            .find(|e| e.pool.name == name)
            .map(|e| e.pool.clone())
            .ok_or_else(|| EngineError::Internal(format!("active pool {name} disappeared")))
    }

    pub fn pools(&self) -> Vec<Pool> {
        self.state
            .read()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.pool.clone())
            .collect()
    }

    pub fn manager_for(&self, name: &str) -> Option<Arc<dyn ThinCloneManager>> {
        self.state
            .read()
            .unwrap()
            .entries
            .iter()
            .find(|e| e.pool.name == name)
            .map(|e| e.manager.clone())
    }

    /// Refresh filesystem stats of every pool from its backend.
    pub async fn refresh_stats(&self) {
        let managers: Vec<(String, Arc<dyn ThinCloneManager>)> = {
            let state = self.state.read().unwrap();
            state
                .entries
                .iter()
                .map(|e| (e.pool.name.clone(), e.manager.clone()))
                .collect()
        };

        let mut disks = HashMap::new();
        for (name, manager) in managers {
            match manager.disk_state().await {
                Ok(disk) => {
                    disks.insert(name, disk);
                }
                Err(e) => {
                    tracing::warn!(pool = %name, error = %e, "Failed to refresh pool stats");
                }
            }
        }

        let mut state = self.state.write().unwrap();
        for entry in &mut state.entries {
            if let Some(disk) = disks.get(&entry.pool.name) {
                entry.pool.disk = Some(*disk);
            }
        }
    }

    /// Diff-and-merge reload. Pools present in the new configuration keep
    /// their managers (in-flight clones are undisturbed); pools missing from
    /// it are marked inactive and retained while `in_use` still names them,
    /// dropped otherwise.
    pub async fn reload(
        &self,
        new_config: &PoolsConfig,
        in_use: &HashSet<String>,
    ) -> Result<(), EngineError> {
        {
            let mut state = self.state.write().unwrap();

            let mut old_entries = std::mem::take(&mut state.entries);
            let mut new_entries = Vec::with_capacity(new_config.pool_names.len());

            for name in &new_config.pool_names {
                match old_entries.iter().position(|e| e.pool.name == *name) {
                    Some(idx) => new_entries.push(old_entries.remove(idx)),
                    None => {
                        let pool = Pool::new(name, new_config.mount_dir.join(name));
                        let manager = (self.factory)(&pool);
                        new_entries.push(ManagedPool { pool, manager });
                    }
                }
            }

            for mut entry in old_entries {
                if in_use.contains(&entry.pool.name) {
                    tracing::warn!(
                        pool = %entry.pool.name,
                        "Pool removed from configuration but still has live clones; keeping it inactive"
                    );
                    entry.pool.status = PoolStatus::Inactive;
                    new_entries.push(entry);
                } else {
                    tracing::info!(pool = %entry.pool.name, "Dropping pool removed from configuration");
                }
            }

            state.entries = new_entries;
            state.config = new_config.clone();

            // Retained-only pools are not eligible for activation.
            if let Some(active) = &state.active {
                if !new_config.pool_names.contains(active) {
                    state.active = None;
                }
            }
        }

        self.discover().await
    }

    async fn latest_snapshot_keys(
        &self,
    ) -> HashMap<String, Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let managers: Vec<(String, Arc<dyn ThinCloneManager>)> = {
            let state = self.state.read().unwrap();
            state
                .entries
                .iter()
                .filter(|e| {
                    // Only configured pools compete for activation.
                    state.config.pool_names.contains(&e.pool.name)
                })
                .map(|e| (e.pool.name.clone(), e.manager.clone()))
                .collect()
        };

        let mut keys = HashMap::new();
        for (name, manager) in managers {
            let key = match manager.snapshots().await {
                Ok(snapshots) => snapshots.first().map(|s| s.sort_key()),
                Err(e) => {
                    tracing::warn!(pool = %name, error = %e, "Failed to list snapshots");
                    None
                }
            };
            keys.insert(name, key);
        }
        keys
    }
}
