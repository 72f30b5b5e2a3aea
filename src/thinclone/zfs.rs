//! ZFS thin-clone backend. Builds the `zfs` command lines and parses their
//! output; the persisted engine state relies on this parsing, so the list
//! contract is strict: 12 columns, or 11 when the custom data-state label
//! was never set on a dataset.

use crate::error::EngineError;
use crate::models::{Disk, Pool, SessionState, Snapshot, SnapshotId};
use crate::runner::CommandRunner;
use crate::thinclone::{
    parse_data_state_at, snapshot_name, ListEntry, ThinCloneManager, DATA_STATE_AT_FORMAT,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub const DATA_STATE_AT_LABEL: &str = "dblab:datastateat";
pub const IS_ROUGH_STATE_AT_LABEL: &str = "dblab:isroughdsa";

/// Columns requested from `zfs list`.
const NUMBER_FIELDS: usize = 12;

#[derive(Debug, Clone)]
pub struct ZfsConfig {
    pub pool: Pool,
    pub pre_snapshot_suffix: String,
    pub os_username: String,
}

pub struct ZfsManager {
    runner: Arc<dyn CommandRunner>,
    config: ZfsConfig,
}

impl ZfsManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ZfsConfig) -> Self {
        Self { runner, config }
    }

    async fn clone_exists(&self, name: &str) -> Result<bool, EngineError> {
        let out = self
            .runner
            .run("zfs list", false)
            .await
            .map_err(|e| e.backend_context("failed to list clones"))?;
        Ok(out.contains(name))
    }

    async fn list_details(
        &self,
        dataset: &str,
        dataset_type: &str,
    ) -> Result<Vec<ListEntry>, EngineError> {
        let cmd = format!(
            "zfs list -po name,used,mountpoint,compressratio,available,type,\
             origin,creation,referenced,logicalreferenced,logicalused,{label} \
             -S {label} -S creation -t {dataset_type} -r {dataset}",
            label = DATA_STATE_AT_LABEL,
        );

        let out = self
            .runner
            .run(&cmd, true)
            .await
            .map_err(|e| e.backend_context("failed to list details"))?;

        parse_list_output(&out, dataset, dataset_type)
    }
}

impl ThinCloneManager for ZfsManager {
    fn pool(&self) -> Pool {
        self.config.pool.clone()
    }

    fn create_clone(
        &self,
        clone_name: &str,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let clone_name = clone_name.to_string();
        let snapshot_id = snapshot_id.to_string();
        Box::pin(async move {
            if self.clone_exists(&clone_name).await? {
                tracing::info!(clone = %clone_name, "Clone dataset already exists, skipping creation");
                return Ok(());
            }

            let clones_dir = self.config.pool.clones_dir();
            let cmd = format!(
                "zfs clone -o mountpoint={mount}/{name} {snapshot} {pool}/{name} && \
                 chown -R {user} {mount}/{name}",
                mount = clones_dir.display(),
                name = clone_name,
                snapshot = snapshot_id,
                pool = self.config.pool.name,
                user = self.config.os_username,
            );

            self.runner
                .run(&cmd, false)
                .await
                .map_err(|e| e.backend_context("zfs clone error"))?;

            Ok(())
        })
    }

    fn destroy_user_clone(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let clone_name = clone_name.to_string();
        Box::pin(async move {
            if !self.clone_exists(&clone_name).await? {
                tracing::info!(clone = %clone_name, "Clone dataset does not exist, skipping deletion");
                return Ok(());
            }

            // Recursive: takes snapshots and clones depending on the user
            // clone down with it. Never use this for preparation clones.
            let cmd = format!("zfs destroy -R {}/{}", self.config.pool.name, clone_name);
            self.runner
                .run(&cmd, false)
                .await
                .map_err(|e| e.backend_context("failed to destroy clone"))?;
            Ok(())
        })
    }

    fn destroy_preparation_clone(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let clone_name = clone_name.to_string();
        Box::pin(async move {
            if !self.clone_exists(&clone_name).await? {
                return Ok(());
            }

            let cmd = format!("zfs destroy {}/{}", self.config.pool.name, clone_name);
            self.runner
                .run(&cmd, false)
                .await
                .map_err(|e| e.backend_context("failed to destroy preparation clone"))?;
            Ok(())
        })
    }

    fn list_clone_names(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            let out = self
                .runner
                .run("zfs list -o name -H", false)
                .await
                .map_err(|e| e.backend_context("failed to list clones"))?;

            let pool_prefix = format!("{}/", self.config.pool.name);
            let clone_pool_prefix = format!("{}/clone_", self.config.pool.name);

            let names: BTreeSet<String> = out
                .trim()
                .lines()
                .filter(|line| line.starts_with(&clone_pool_prefix))
                .map(|line| line.trim_start_matches(&pool_prefix).to_string())
                .collect();

            Ok(names.into_iter().collect())
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
            let mut dataset = self.config.pool.name.clone();
            if !pool_suffix.is_empty() {
                dataset.push('/');
                dataset.push_str(&pool_suffix);
            }

            let rough = data_state_at.is_empty();
            let dsa = if rough {
                Utc::now().format(DATA_STATE_AT_FORMAT).to_string()
            } else {
                data_state_at
            };

            let name = snapshot_name(&dataset, &dsa);

            let cmd = format!("zfs snapshot -r {name}");
            self.runner
                .run(&cmd, true)
                .await
                .map_err(|e| e.backend_context("failed to create snapshot"))?;

            let label_value = dsa
                .strip_suffix(&self.config.pre_snapshot_suffix)
                .unwrap_or(&dsa);
            let cmd = format!("zfs set {DATA_STATE_AT_LABEL}=\"{label_value}\" {name}");
            self.runner.run(&cmd, true).await.map_err(|e| {
                e.backend_context("failed to set the dataStateAt option for snapshot")
            })?;

            if rough {
                let cmd = format!("zfs set {IS_ROUGH_STATE_AT_LABEL}=\"1\" {name}");
                self.runner.run(&cmd, true).await.map_err(|e| {
                    e.backend_context("failed to set the rough flag of dataStateAt option for snapshot")
                })?;
            }

            Ok(name)
        })
    }

    fn destroy_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let snapshot_id = snapshot_id.to_string();
        Box::pin(async move {
            let cmd = format!("zfs destroy -R {snapshot_id}");
            self.runner
                .run(&cmd, false)
                .await
                .map_err(|e| e.backend_context("failed to destroy snapshot"))?;
            Ok(())
        })
    }

    fn rollback_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let snapshot_id = snapshot_id.to_string();
        Box::pin(async move {
            let cmd = format!("zfs rollback -f -r {snapshot_id}");
            self.runner
                .run(&cmd, true)
                .await
                .map_err(|e| e.backend_context("failed to rollback a snapshot"))?;
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
            let entries = self
                .list_details(&self.config.pool.name, "snapshot")
                .await?;

            // The list command orders DESC; retention walks ASC, sparing the
            // newest `retention_limit` plus the caller's keep-set.
            let ordered: Vec<&ListEntry> = entries
                .iter()
                .rev()
                .filter(|e| !e.name.contains(crate::models::CLONE_DATASET_MARKER))
                .collect();

            let deletable = ordered.len().saturating_sub(retention_limit);
            let mut destroyed = Vec::new();

            for entry in ordered.into_iter().take(deletable) {
                if keep.contains(&entry.name) {
                    continue;
                }
                let cmd = format!("zfs destroy -R {}", entry.name);
                self.runner
                    .run(&cmd, false)
                    .await
                    .map_err(|e| e.backend_context("failed to clean up snapshots"))?;
                destroyed.push(entry.name.clone());
            }

            Ok(destroyed)
        })
    }

    fn snapshots(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Snapshot>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            let entries = self
                .list_details(&self.config.pool.name, "snapshot")
                .await?;
            let suffix = &self.config.pre_snapshot_suffix;

            let snapshots = entries
                .into_iter()
                // Pre-snapshots are not allowed to be used for cloning.
                .filter(|e| suffix.is_empty() || !e.name.ends_with(suffix.as_str()))
                .map(|e| {
                    let created_at = e.creation.unwrap_or(DateTime::UNIX_EPOCH);
                    Snapshot {
                        data_state_at: e
                            .data_state_at
                            .or_else(|| parse_data_state_at(&e.name))
                            .unwrap_or(created_at),
                        id: e.name,
                        pool: self.config.pool.name.clone(),
                        created_at,
                        num_clones: 0,
                        rough: false,
                    }
                })
                .collect();

            Ok(snapshots)
        })
    }

    fn list_filesystems(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ListEntry>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            self.list_details(&self.config.pool.name, "filesystem").await
        })
    }

    fn list_snapshot_entries(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ListEntry>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            self.list_details(&self.config.pool.name, "snapshot").await
        })
    }

    fn session_state(
        &self,
        clone_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionState, EngineError>> + Send + '_>> {
        let clone_name = clone_name.to_string();
        Box::pin(async move {
            let entries = self
                .list_details(&self.config.pool.name, "filesystem")
                .await?;

            let entry_name = format!("{}/{}", self.config.pool.name, clone_name);
            let entry = entries
                .iter()
                .find(|e| e.name == entry_name)
                .ok_or_else(|| {
                    EngineError::NotFound(format!("clone dataset {entry_name} not found"))
                })?;

            Ok(SessionState {
                clone_diff_size: entry.used,
                last_observed: None,
            })
        })
    }

    fn disk_state(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Disk, EngineError>> + Send + '_>> {
        Box::pin(async move {
            let parent_pool = self
                .config
                .pool
                .name
                .split('/')
                .next()
                .ok_or_else(|| EngineError::Internal("failed to get a filesystem pool name".into()))?
                .to_string();

            let entries = self.list_details(&parent_pool, "filesystem").await?;

            let parent_entry = entries.iter().find(|e| e.name == parent_pool);
            let pool_entry = entries.iter().find(|e| e.name == self.config.pool.name);

            match (parent_entry, pool_entry) {
                (Some(parent), Some(pool)) => Ok(Disk {
                    size: parent.available + parent.used,
                    free: parent.available,
                    used: parent.used,
                    data_size: pool.logical_referenced,
                }),
                _ => Err(EngineError::Backend(
                    "cannot get disk state: pool entries not found".into(),
                )),
            }
        })
    }
}

/// Parses `zfs list` output. The first line is a header. A row with one
/// missing column lacks only the custom data-state label (empty custom
/// properties print nothing, unlike the `-` of standard ones); any other
/// column count means the output format is broken.
pub fn parse_list_output(
    out: &str,
    dataset: &str,
    dataset_type: &str,
) -> Result<Vec<ListEntry>, EngineError> {
    let lines: Vec<&str> = out.trim().lines().collect();

    if lines.len() <= 1 {
        return Err(EngineError::Backend(format!(
            "zfs error: no available {dataset_type} for dataset {dataset:?}"
        )));
    }

    let mut entries = Vec::with_capacity(lines.len() - 1);

    for line in &lines[1..] {
        let mut fields: Vec<&str> = line.split_whitespace().collect();

        if fields.len() == NUMBER_FIELDS - 1 {
            tracing::debug!(
                "Probably {DATA_STATE_AT_LABEL:?} is not set. Manually check ZFS snapshots."
            );
            fields.push("-");
        }

        if fields.len() != NUMBER_FIELDS {
            return Err(EngineError::Backend(format!(
                "zfs error: some fields are empty. First of all, check {DATA_STATE_AT_LABEL}"
            )));
        }

        let entry = ListEntry {
            name: fields[0].to_string(),
            used: parse_bytes(fields[1])?,
            mountpoint: fields[2].to_string(),
            compress_ratio: parse_ratio(fields[3])?,
            available: parse_bytes(fields[4])?,
            dataset_type: fields[5].to_string(),
            origin: fields[6].to_string(),
            creation: parse_unix_time(fields[7])?,
            referenced: parse_bytes(fields[8])?,
            logical_referenced: parse_bytes(fields[9])?,
            logical_used: parse_bytes(fields[10])?,
            data_state_at: parse_custom_time(fields[11])?,
        };

        entries.push(entry);
    }

    Ok(entries)
}

fn parse_bytes(field: &str) -> Result<u64, EngineError> {
    if field.is_empty() || field == "-" {
        return Ok(0);
    }
    field.parse().map_err(|e| {
        EngineError::Backend(format!("zfs error: cannot parse byte value {field:?}: {e}"))
    })
}

fn parse_ratio(field: &str) -> Result<f64, EngineError> {
    if field.is_empty() || field == "-" {
        return Ok(0.0);
    }
    field.trim_end_matches('x').parse().map_err(|e| {
        EngineError::Backend(format!("zfs error: cannot parse ratio {field:?}: {e}"))
    })
}

fn parse_unix_time(field: &str) -> Result<Option<DateTime<Utc>>, EngineError> {
    if field.is_empty() || field == "-" {
        return Ok(None);
    }
    let secs: i64 = field.parse().map_err(|e| {
        EngineError::Backend(format!("zfs error: cannot parse timestamp {field:?}: {e}"))
    })?;
    Ok(DateTime::from_timestamp(secs, 0))
}

fn parse_custom_time(field: &str) -> Result<Option<DateTime<Utc>>, EngineError> {
    if field.is_empty() || field == "-" {
        return Ok(None);
    }
    NaiveDateTime::parse_from_str(field, DATA_STATE_AT_FORMAT)
        .map(|naive| Some(naive.and_utc()))
        .map_err(|e| {
            EngineError::Backend(format!(
                "zfs error: cannot parse {DATA_STATE_AT_LABEL} value {field:?}: {e}"
            ))
        })
}
