//! The cloning service: turns create/reset/destroy/update requests into
//! ordered operations against the thin-clone manager, the container backend,
//! and the registry. Each clone moves through
//! `CREATING → READY → (RESETTING → READY)* → DELETING`, with `FATAL`
//! retained for inspection until an explicit destroy. At most one transition
//! is in flight per clone; async variants commit the transitional status and
//! return immediately, progress is observed by re-reading the clone record.

pub mod reconcile;

use crate::config::{CloningConfig, GlobalConfig, ProvisionConfig};
use crate::error::EngineError;
use crate::models::{
    new_clone_id, Clone, CloneStatus, CreateCloneRequest, InstanceStatus, Pool, PoolEntry,
    ResetCloneRequest, Snapshot, UpdateCloneRequest,
};
use crate::pool::PoolManager;
use crate::provision::{wait_for_postgres, ContainerBackend, ContainerSpec, PortAllocator};
use crate::registry::{Registry, STATE_FILE_NAME};
use crate::thinclone::parse_data_state_at;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Number of recent clone creations averaged into the expected cloning time.
const CREATE_DURATION_WINDOW: usize = 10;

struct Inner {
    global: GlobalConfig,
    cloning: RwLock<CloningConfig>,
    provision: RwLock<ProvisionConfig>,
    registry: Arc<Registry>,
    pools: Arc<PoolManager>,
    containers: Arc<dyn ContainerBackend>,
    ports: PortAllocator,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    observer_unwatch: mpsc::UnboundedSender<String>,
    started_at: chrono::DateTime<Utc>,
    create_durations: Mutex<VecDeque<f64>>,
}

#[derive(Clone)]
pub struct CloningService {
    inner: Arc<Inner>,
}

impl CloningService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        global: GlobalConfig,
        cloning: CloningConfig,
        provision: ProvisionConfig,
        registry: Arc<Registry>,
        pools: Arc<PoolManager>,
        containers: Arc<dyn ContainerBackend>,
        observer_unwatch: mpsc::UnboundedSender<String>,
    ) -> Self {
        let ports = PortAllocator::new(provision.port_from, provision.port_to);
        Self {
            inner: Arc::new(Inner {
                global,
                cloning: RwLock::new(cloning),
                provision: RwLock::new(provision),
                registry,
                pools,
                containers,
                ports,
                locks: DashMap::new(),
                observer_unwatch,
                started_at: Utc::now(),
                create_durations: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Load persisted state, refresh snapshots from the backend, and
    /// reconcile the registry with the filesystem and container engine.
    pub async fn run(&self) -> Result<(), EngineError> {
        let pool = self.inner.pools.active_pool()?;
        self.inner
            .registry
            .set_state_path(pool.mount_dir.join(STATE_FILE_NAME));

        let loaded = self.inner.registry.load()?;
        if loaded > 0 {
            tracing::info!(count = loaded, "Loaded persisted clones");
        }

        let image = self.inner.provision.read().unwrap().docker_image.clone();
        if !self.inner.containers.image_exists(&image).await? {
            tracing::info!(image = %image, "Pulling Docker image");
            self.inner.containers.pull_image(&image).await?;
        }

        let fsm = self.inner.pools.active()?;
        let snapshots = fsm.snapshots().await?;
        self.inner.registry.refresh_snapshots(snapshots);
        self.inner.registry.recount_clone_numbers();

        reconcile::reconcile(self).await?;

        self.inner.registry.persist()?;
        Ok(())
    }

    // ── Create ─────────────────────────────────────────────────

    pub async fn create_clone(&self, req: CreateCloneRequest) -> Result<Clone, EngineError> {
        let clone = self.start_create(req)?;
        self.run_create(clone).await
    }

    /// Commit the `CREATING` transition and return immediately; completion
    /// is observable by polling `get_clone`.
    pub fn create_clone_async(&self, req: CreateCloneRequest) -> Result<Clone, EngineError> {
        let clone = self.start_create(req)?;
        let svc = self.clone();
        let task_clone = clone.clone();
        tokio::spawn(async move {
            if let Err(e) = svc.run_create(task_clone).await {
                tracing::error!(error = %e, "Async clone creation failed");
            }
        });
        Ok(clone)
    }

    fn start_create(&self, req: CreateCloneRequest) -> Result<Clone, EngineError> {
        let id = match req.id {
            Some(id) => {
                validate_clone_id(&id)?;
                id
            }
            None => new_clone_id(),
        };

        if self.inner.registry.get_clone(&id).is_some() {
            return Err(EngineError::AlreadyExists(format!(
                "clone {id} already exists"
            )));
        }

        let snapshot = self.resolve_snapshot(req.snapshot_id.as_deref())?;
        let pool = self.inner.pools.active_pool()?;
        let port = self.inner.ports.allocate()?;

        let now = Utc::now();
        let clone = Clone {
            id: id.clone(),
            snapshot_id: snapshot.id.clone(),
            database: req.database.unwrap_or_default(),
            port,
            protected: req.protected,
            extra_config: req.extra_config,
            status: CloneStatus::Creating,
            status_message: None,
            created_at: now,
            status_updated_at: now,
            pool: pool.name.clone(),
            mountpoint: pool.clone_mountpoint(&id),
            session_state: Default::default(),
        };

        self.inner
            .registry
            .increment_clone_number(&snapshot.id)?;

        if let Err(e) = self.inner.registry.add_clone(clone.clone()) {
            let _ = self.inner.registry.decrement_clone_number(&snapshot.id);
            self.inner.ports.release(port);
            return Err(e);
        }

        tracing::info!(clone_id = %id, snapshot = %snapshot.id, port, "Clone creation started");
        Ok(clone)
    }

    async fn run_create(&self, clone: Clone) -> Result<Clone, EngineError> {
        let lock = self.lock_for(&clone.id);
        let _guard = lock.lock().await;

        let started = std::time::Instant::now();
        let pool = self.inner.pools.active_pool()?;
        let spec = self.container_spec(&clone, &pool);

        match self.provision_clone(&clone, &spec).await {
            Ok(()) => {
                let ready = self.inner.registry.set_clone_status(
                    &clone.id,
                    CloneStatus::Ready,
                    None,
                )?;
                self.record_create_duration(started.elapsed().as_secs_f64());
                tracing::info!(clone_id = %clone.id, port = clone.port, "Clone is ready");
                Ok(ready)
            }
            Err(e) => {
                tracing::error!(clone_id = %clone.id, error = %e, "Clone creation failed, rolling back");
                self.rollback_create(&clone, &spec).await;
                if let Err(persist_err) = self.inner.registry.set_clone_status(
                    &clone.id,
                    CloneStatus::Fatal,
                    Some(e.to_string()),
                ) {
                    tracing::error!(clone_id = %clone.id, error = %persist_err, "Failed to record fatal state");
                }
                Err(e)
            }
        }
    }

    async fn provision_clone(
        &self,
        clone: &Clone,
        spec: &ContainerSpec,
    ) -> Result<(), EngineError> {
        let fsm = self.inner.pools.active()?;
        fsm.create_clone(&clone.id, &clone.snapshot_id).await?;

        self.inner.containers.run_container(spec).await?;

        let (retries, interval) = self.healthcheck_budget();
        wait_for_postgres(self.inner.containers.as_ref(), spec, retries, interval).await
    }

    /// Reverse order of acquisition: container, filesystem clone, refcount,
    /// port. Failures are logged and never mask the originating error.
    async fn rollback_create(&self, clone: &Clone, spec: &ContainerSpec) {
        if let Err(e) = self.inner.containers.remove_container(&spec.name).await {
            tracing::warn!(clone_id = %clone.id, error = %e, "Rollback: failed to remove container");
        }
        match self.inner.pools.active() {
            Ok(fsm) => {
                if let Err(e) = fsm.destroy_user_clone(&clone.id).await {
                    tracing::warn!(clone_id = %clone.id, error = %e, "Rollback: failed to destroy clone dataset");
                }
            }
            Err(e) => {
                tracing::warn!(clone_id = %clone.id, error = %e, "Rollback: active pool unavailable");
            }
        }
        if let Err(e) = self
            .inner
            .registry
            .decrement_clone_number(&clone.snapshot_id)
        {
            tracing::warn!(clone_id = %clone.id, error = %e, "Rollback: failed to decrement refcount");
        }
        self.inner.ports.release(clone.port);
    }

    // ── Reset ──────────────────────────────────────────────────

    pub async fn reset_clone(
        &self,
        id: &str,
        req: ResetCloneRequest,
    ) -> Result<Clone, EngineError> {
        let (clone, target) = self.start_reset(id, req)?;
        self.run_reset(clone, target).await
    }

    pub fn reset_clone_async(
        &self,
        id: &str,
        req: ResetCloneRequest,
    ) -> Result<Clone, EngineError> {
        let (clone, target) = self.start_reset(id, req)?;
        let svc = self.clone();
        let resetting = clone.clone();
        tokio::spawn(async move {
            if let Err(e) = svc.run_reset(resetting, target).await {
                tracing::error!(error = %e, "Async clone reset failed");
            }
        });
        Ok(clone)
    }

    fn start_reset(
        &self,
        id: &str,
        req: ResetCloneRequest,
    ) -> Result<(Clone, Snapshot), EngineError> {
        let clone = self.get_clone(id)?;

        match clone.status {
            CloneStatus::Ready => {}
            CloneStatus::Fatal => {
                return Err(EngineError::PreconditionFailed(format!(
                    "clone {id} is in a fatal state and only supports destroy"
                )))
            }
            status if status.is_transitional() => {
                return Err(EngineError::Conflict(format!(
                    "clone {id} has an operation in flight"
                )))
            }
            _ => unreachable!(),
        }

        // Default target: the clone's current snapshot.
        let target = match req.snapshot_id.as_deref() {
            Some(snapshot_id) => self.resolve_snapshot(Some(snapshot_id))?,
            None => self.inner.registry.snapshot_by_id(&clone.snapshot_id)?,
        };

        let resetting =
            self.inner
                .registry
                .set_clone_status(id, CloneStatus::Resetting, None)?;
        self.unwatch(id);

        tracing::info!(clone_id = %id, snapshot = %target.id, "Clone reset started");
        Ok((resetting, target))
    }

    async fn run_reset(&self, clone: Clone, target: Snapshot) -> Result<Clone, EngineError> {
        let lock = self.lock_for(&clone.id);
        let _guard = lock.lock().await;

        let pool = self.inner.pools.active_pool()?;
        let spec = self.container_spec(&clone, &pool);

        let result = self.do_reset(&clone, &target, &spec).await;
        match result {
            Ok(()) => {
                let ready = self.inner.registry.set_clone_status(
                    &clone.id,
                    CloneStatus::Ready,
                    None,
                )?;
                tracing::info!(clone_id = %clone.id, snapshot = %target.id, "Clone reset complete");
                Ok(ready)
            }
            Err(e) => {
                tracing::error!(clone_id = %clone.id, error = %e, "Clone reset failed");
                if let Err(persist_err) = self.inner.registry.set_clone_status(
                    &clone.id,
                    CloneStatus::Fatal,
                    Some(e.to_string()),
                ) {
                    tracing::error!(clone_id = %clone.id, error = %persist_err, "Failed to record fatal state");
                }
                Err(e)
            }
        }
    }

    async fn do_reset(
        &self,
        clone: &Clone,
        target: &Snapshot,
        spec: &ContainerSpec,
    ) -> Result<(), EngineError> {
        let fsm = self.inner.pools.active()?;

        if let Err(e) = self.inner.containers.stop_container(&spec.name).await {
            tracing::warn!(clone_id = %clone.id, error = %e, "Failed to stop container before reset");
        }
        if let Err(e) = self.inner.containers.remove_container(&spec.name).await {
            tracing::warn!(clone_id = %clone.id, error = %e, "Failed to remove container before reset");
        }

        fsm.destroy_user_clone(&clone.id).await?;

        // Both refcounts move under one registry lock.
        self.inner
            .registry
            .retarget_clone_number(&clone.snapshot_id, &target.id)?;
        self.inner.registry.update_clone(&clone.id, |c| {
            c.snapshot_id = target.id.clone();
        })?;

        fsm.create_clone(&clone.id, &target.id).await?;
        self.inner.containers.run_container(spec).await?;

        let (retries, interval) = self.healthcheck_budget();
        wait_for_postgres(self.inner.containers.as_ref(), spec, retries, interval).await
    }

    // ── Destroy ────────────────────────────────────────────────

    pub async fn destroy_clone(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let clone = self.start_destroy(id, force)?;
        self.run_destroy(clone).await
    }

    pub fn destroy_clone_async(&self, id: &str, force: bool) -> Result<Clone, EngineError> {
        let clone = self.start_destroy(id, force)?;
        let svc = self.clone();
        let deleting = clone.clone();
        tokio::spawn(async move {
            if let Err(e) = svc.run_destroy(deleting).await {
                tracing::error!(error = %e, "Async clone destroy failed");
            }
        });
        Ok(clone)
    }

    fn start_destroy(&self, id: &str, force: bool) -> Result<Clone, EngineError> {
        let clone = self.get_clone(id)?;

        if clone.protected && !force {
            return Err(EngineError::PreconditionFailed(format!(
                "clone {id} is protected"
            )));
        }
        if clone.status.is_transitional() {
            return Err(EngineError::Conflict(format!(
                "clone {id} has an operation in flight"
            )));
        }

        let deleting =
            self.inner
                .registry
                .set_clone_status(id, CloneStatus::Deleting, None)?;
        self.unwatch(id);

        tracing::info!(clone_id = %id, "Clone destroy started");
        Ok(deleting)
    }

    pub(crate) async fn run_destroy(&self, clone: Clone) -> Result<(), EngineError> {
        let lock = self.lock_for(&clone.id);
        let _guard = lock.lock().await;
        self.destroy_locked(&clone).await
    }

    /// Destroy body shared with reconciliation, which already holds the
    /// per-clone lock. A failure leaves the clone in `DELETING`; the next
    /// reconciliation scan completes it.
    pub(crate) async fn destroy_locked(&self, clone: &Clone) -> Result<(), EngineError> {
        if let Err(e) = self
            .inner
            .containers
            .remove_container(&clone.container_name())
            .await
        {
            tracing::warn!(clone_id = %clone.id, error = %e, "Failed to remove clone container");
        }

        let fsm = self.inner.pools.active()?;
        fsm.destroy_user_clone(&clone.id).await?;

        if let Err(e) = self
            .inner
            .registry
            .decrement_clone_number(&clone.snapshot_id)
        {
            tracing::warn!(clone_id = %clone.id, error = %e, "Failed to decrement refcount");
        }
        self.inner.ports.release(clone.port);
        self.inner.registry.remove_clone(&clone.id)?;

        tracing::info!(clone_id = %clone.id, "Clone destroyed");
        Ok(())
    }

    // ── Update / read ──────────────────────────────────────────

    pub fn update_clone(&self, id: &str, req: UpdateCloneRequest) -> Result<Clone, EngineError> {
        let updated = self.inner.registry.update_clone(id, |clone| {
            clone.protected = req.protected;
        })?;
        tracing::info!(clone_id = %id, protected = req.protected, "Clone updated");
        Ok(updated)
    }

    pub fn get_clone(&self, id: &str) -> Result<Clone, EngineError> {
        self.inner
            .registry
            .get_clone(id)
            .ok_or_else(|| EngineError::NotFound(format!("clone {id} not found")))
    }

    pub fn list_clones(&self) -> Vec<Clone> {
        self.inner.registry.list_clones()
    }

    // ── Snapshots ──────────────────────────────────────────────

    /// Take a snapshot of the active pool on behalf of the retrieval
    /// pipeline, then apply retention.
    pub async fn create_snapshot(
        &self,
        pool_suffix: &str,
        data_state_at: &str,
    ) -> Result<Snapshot, EngineError> {
        let fsm = self.inner.pools.active()?;
        let id = fsm.create_snapshot(pool_suffix, data_state_at).await?;

        let created_at = Utc::now();
        let snapshot = Snapshot {
            data_state_at: parse_data_state_at(&id).unwrap_or(created_at),
            id: id.clone(),
            pool: self.inner.pools.active_pool()?.name,
            created_at,
            num_clones: 0,
            rough: data_state_at.is_empty(),
        };
        self.inner.registry.add_snapshot(snapshot.clone());
        self.inner.registry.persist()?;

        if let Err(e) = self.cleanup_snapshots().await {
            tracing::warn!(error = %e, "Snapshot retention cleanup failed");
        }

        Ok(snapshot)
    }

    /// Destroy a snapshot explicitly. Refused while clones reference it or
    /// while it is the newest snapshot of its pool (the latest is pinned).
    pub async fn destroy_snapshot(&self, id: &str) -> Result<(), EngineError> {
        let snapshot = self.inner.registry.snapshot_by_id(id)?;
        if snapshot.num_clones > 0 {
            return Err(EngineError::PreconditionFailed(format!(
                "snapshot {id} has {} live clones",
                snapshot.num_clones
            )));
        }
        if let Some(latest) = self.inner.registry.latest_snapshot() {
            if latest.id == id {
                return Err(EngineError::PreconditionFailed(format!(
                    "snapshot {id} is the latest snapshot and is pinned"
                )));
            }
        }

        let fsm = self.inner.pools.active()?;
        fsm.destroy_snapshot(id).await?;
        self.inner.registry.remove_snapshot(id);
        self.inner.registry.persist()?;
        Ok(())
    }

    /// Retention: keep the configured number of most recent snapshots, the
    /// pinned latest, and every snapshot with live clones. The refcount map
    /// is captured under the registry lock before any destroy is issued.
    pub async fn cleanup_snapshots(&self) -> Result<Vec<String>, EngineError> {
        let retention_limit = self.inner.cloning.read().unwrap().retention_limit;
        let keep = self.inner.registry.protected_snapshot_ids();

        let fsm = self.inner.pools.active()?;
        let destroyed = fsm.cleanup_snapshots(retention_limit, &keep).await?;

        for id in &destroyed {
            self.inner.registry.remove_snapshot(id);
        }
        if !destroyed.is_empty() {
            tracing::info!(count = destroyed.len(), "Snapshots cleaned up");
            self.inner.registry.persist()?;
        }
        Ok(destroyed)
    }

    pub fn get_snapshots(&self) -> Vec<Snapshot> {
        self.inner.registry.list_snapshots()
    }

    pub fn get_latest_snapshot(&self) -> Result<Snapshot, EngineError> {
        self.inner
            .registry
            .latest_snapshot()
            .ok_or_else(|| EngineError::NotFound("no snapshot found".into()))
    }

    // ── Status ─────────────────────────────────────────────────

    pub async fn instance_status(&self) -> InstanceStatus {
        self.inner.pools.refresh_stats().await;

        let mut clones = self.list_clones();
        let snapshots = self.get_snapshots();

        // Clone-diff sizes come straight from the backend; the registry copy
        // is not mutated for a read-only status request.
        if let Ok(fsm) = self.inner.pools.active() {
            let active_pool = fsm.pool().name;
            for clone in &mut clones {
                if clone.status == CloneStatus::Ready && clone.pool == active_pool {
                    if let Ok(state) = fsm.session_state(&clone.id).await {
                        clone.session_state.clone_diff_size = state.clone_diff_size;
                    }
                }
            }
        }

        let pools = self
            .inner
            .pools
            .pools()
            .into_iter()
            .map(|pool| {
                let clone_list: Vec<String> = clones
                    .iter()
                    .filter(|c| c.pool == pool.name)
                    .map(|c| c.id.clone())
                    .collect();
                let data_state_at = snapshots
                    .iter()
                    .filter(|s| s.pool == pool.name)
                    .map(|s| s.data_state_at)
                    .max();
                PoolEntry {
                    name: pool.name.clone(),
                    status: pool.status,
                    data_state_at,
                    clone_list,
                    file_system: pool.disk.unwrap_or_default(),
                }
            })
            .collect();

        InstanceStatus {
            started_at: self.inner.started_at,
            num_clones: clones.len(),
            clones,
            snapshots,
            pools,
            expected_cloning_time_sec: self.expected_cloning_time(),
        }
    }

    // ── Idle policy ────────────────────────────────────────────

    /// One pass of the idle scan: destroy non-protected `READY` clones
    /// untouched longer than the configured TTL. Returns how many destroys
    /// were started.
    pub async fn scan_idle_clones(&self) -> usize {
        let max_idle_minutes = self.inner.cloning.read().unwrap().max_idle_minutes;
        if max_idle_minutes == 0 {
            return 0;
        }

        let cutoff = Utc::now() - chrono::Duration::minutes(max_idle_minutes as i64);
        let mut destroyed = 0;

        for clone in self.list_clones() {
            if clone.status != CloneStatus::Ready || clone.protected {
                continue;
            }
            let last_touched = clone
                .session_state
                .last_observed
                .map_or(clone.status_updated_at, |observed| {
                    observed.max(clone.status_updated_at)
                });
            if last_touched >= cutoff {
                continue;
            }

            tracing::info!(clone_id = %clone.id, "Destroying idle clone");
            match self.destroy_clone(&clone.id, false).await {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    tracing::warn!(clone_id = %clone.id, error = %e, "Failed to destroy idle clone")
                }
            }
        }
        destroyed
    }

    pub async fn run_idle_scan(self) {
        loop {
            let interval = self.inner.cloning.read().unwrap().idle_scan_interval_secs;
            tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
            self.scan_idle_clones().await;
        }
    }

    // ── Reload / shutdown ──────────────────────────────────────

    /// Atomic config swap; in-flight operations continue under the old
    /// config they copied.
    pub fn reload(&self, cloning: CloningConfig, provision: ProvisionConfig) {
        self.inner
            .ports
            .set_range(provision.port_from, provision.port_to);
        *self.inner.cloning.write().unwrap() = cloning;
        *self.inner.provision.write().unwrap() = provision;
        tracing::info!("Cloning service configuration reloaded");
    }

    pub fn save_state(&self) -> Result<(), EngineError> {
        self.inner.registry.persist()
    }

    // ── Internals ──────────────────────────────────────────────

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub(crate) fn pools(&self) -> &Arc<PoolManager> {
        &self.inner.pools
    }

    pub(crate) fn containers(&self) -> &Arc<dyn ContainerBackend> {
        &self.inner.containers
    }

    pub(crate) fn claim_port(&self, port: u16) -> Result<(), EngineError> {
        self.inner.ports.claim(port)
    }

    pub(crate) fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub(crate) fn healthcheck_budget(&self) -> (u32, Duration) {
        let provision = self.inner.provision.read().unwrap();
        (
            provision.healthcheck_retries,
            Duration::from_secs(provision.healthcheck_interval_secs),
        )
    }

    pub(crate) fn container_spec(&self, clone: &Clone, pool: &Pool) -> ContainerSpec {
        let provision = self.inner.provision.read().unwrap();
        ContainerSpec {
            name: clone.container_name(),
            clone_id: clone.id.clone(),
            port: clone.port,
            data_dir: pool.clone_data_dir(&clone.id),
            socket_dir: pool.socket_clone_dir(&clone.id),
            username: clone.database.username.clone(),
            db_name: clone.database.db_name.clone(),
            docker_image: provision.docker_image.clone(),
            container_config: clone.extra_config.clone(),
            pool_name: pool.name.clone(),
            instance_id: self.inner.global.instance_id.clone(),
        }
    }

    fn resolve_snapshot(&self, requested: Option<&str>) -> Result<Snapshot, EngineError> {
        match requested {
            Some(id) => {
                let snapshot = self.inner.registry.snapshot_by_id(id)?;
                let allow_rough = self.inner.cloning.read().unwrap().allow_rough_snapshots;
                if snapshot.rough && !allow_rough {
                    return Err(EngineError::NotFound(format!(
                        "snapshot {id} has a rough data state and rough snapshots are disabled"
                    )));
                }
                Ok(snapshot)
            }
            None => self
                .inner
                .registry
                .latest_snapshot()
                .ok_or_else(|| EngineError::NotFound("no snapshot found".into())),
        }
    }

    fn unwatch(&self, id: &str) {
        let _ = self.inner.observer_unwatch.send(id.to_string());
    }

    fn record_create_duration(&self, secs: f64) {
        let mut durations = self.inner.create_durations.lock().unwrap();
        durations.push_back(secs);
        while durations.len() > CREATE_DURATION_WINDOW {
            durations.pop_front();
        }
    }

    fn expected_cloning_time(&self) -> f64 {
        let durations = self.inner.create_durations.lock().unwrap();
        if durations.is_empty() {
            return 0.0;
        }
        durations.iter().sum::<f64>() / durations.len() as f64
    }
}

fn validate_clone_id(id: &str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::InvalidArgument("clone id cannot be empty".into()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(EngineError::InvalidArgument(format!(
            "clone id {id:?} may only contain alphanumerics, '_' and '-'"
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testutil::engine;
    use super::*;
    use crate::error::ErrorKind;
    use crate::thinclone::ThinCloneManager;

    const S1: &str = "dblab_pool@snapshot_20200219000000";
    const S2: &str = "dblab_pool@snapshot_20200220000000";

    fn two_snapshots() -> Vec<(&'static str, &'static str)> {
        vec![
            ("2020-02-19 00:00:00", "2020-02-19 00:10:00"),
            ("2020-02-20 00:00:00", "2020-02-20 00:10:00"),
        ]
    }

    #[tokio::test]
    async fn test_create_clone_reaches_ready() {
        let env = engine(&two_snapshots()).await;

        let clone = env
            .svc
            .create_clone(CreateCloneRequest {
                snapshot_id: Some(S1.into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(clone.status, CloneStatus::Ready);
        assert_eq!(clone.snapshot_id, S1);
        assert_eq!(clone.port, 6000);
        assert_eq!(env.registry.snapshot_by_id(S1).unwrap().num_clones, 1);
        assert!(env.fsm.datasets.lock().unwrap().contains(&clone.id));
        assert!(env.containers.running(&clone.container_name()));
    }

    #[tokio::test]
    async fn test_create_clone_defaults_to_latest_snapshot() {
        let env = engine(&two_snapshots()).await;
        let clone = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap();
        assert_eq!(clone.snapshot_id, S2);
    }

    #[tokio::test]
    async fn test_create_clone_no_snapshots() {
        let env = engine(&[("2020-02-19 00:00:00", "2020-02-19 00:10:00")]).await;
        env.registry.reset_snapshots(Default::default());

        let err = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not found: no snapshot found");
    }

    #[tokio::test]
    async fn test_create_destroy_roundtrip_restores_initial_state() {
        let env = engine(&two_snapshots()).await;

        let clone = env
            .svc
            .create_clone(CreateCloneRequest {
                snapshot_id: Some(S1.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = clone.id.clone();

        env.svc.destroy_clone(&id, false).await.unwrap();

        assert!(env.svc.get_clone(&id).is_err());
        assert_eq!(env.registry.snapshot_by_id(S1).unwrap().num_clones, 0);
        assert!(env.fsm.datasets.lock().unwrap().is_empty());

        // The released port is handed out again.
        let clone2 = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap();
        assert_eq!(clone2.port, 6000);
    }

    #[tokio::test]
    async fn test_reset_retargets_refcounts_atomically() {
        let env = engine(&two_snapshots()).await;

        let clone = env
            .svc
            .create_clone(CreateCloneRequest {
                snapshot_id: Some(S1.into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let reset = env
            .svc
            .reset_clone(
                &clone.id,
                ResetCloneRequest {
                    snapshot_id: Some(S2.into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(reset.status, CloneStatus::Ready);
        assert_eq!(reset.snapshot_id, S2);
        assert_eq!(env.registry.snapshot_by_id(S1).unwrap().num_clones, 0);
        assert_eq!(env.registry.snapshot_by_id(S2).unwrap().num_clones, 1);
        assert!(env.containers.running(&clone.container_name()));
    }

    #[tokio::test]
    async fn test_reset_without_snapshot_keeps_current() {
        let env = engine(&two_snapshots()).await;
        let clone = env
            .svc
            .create_clone(CreateCloneRequest {
                snapshot_id: Some(S1.into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let reset = env
            .svc
            .reset_clone(&clone.id, ResetCloneRequest::default())
            .await
            .unwrap();
        assert_eq!(reset.snapshot_id, S1);
        assert_eq!(env.registry.snapshot_by_id(S1).unwrap().num_clones, 1);
    }

    #[tokio::test]
    async fn test_protected_clone_refuses_destroy() {
        let env = engine(&two_snapshots()).await;
        let clone = env
            .svc
            .create_clone(CreateCloneRequest {
                protected: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let err = env.svc.destroy_clone(&clone.id, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        env.svc
            .update_clone(&clone.id, UpdateCloneRequest { protected: false })
            .unwrap();
        env.svc.destroy_clone(&clone.id, false).await.unwrap();
        assert!(env.svc.get_clone(&clone.id).is_err());
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back() {
        let env = engine(&two_snapshots()).await;
        env.fsm
            .fail_next_create_clone
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = env
            .svc
            .create_clone(CreateCloneRequest {
                id: Some("clone_doomed".into()),
                snapshot_id: Some(S1.into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);

        let clone = env.svc.get_clone("clone_doomed").unwrap();
        assert_eq!(clone.status, CloneStatus::Fatal);
        assert!(clone.status_message.unwrap().contains("injected"));
        assert_eq!(env.registry.snapshot_by_id(S1).unwrap().num_clones, 0);

        // Port was released: a fresh clone gets the first port again.
        let next = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap();
        assert_eq!(next.port, 6000);
    }

    #[tokio::test]
    async fn test_healthcheck_failure_rolls_back_container() {
        let env = engine(&two_snapshots()).await;
        env.containers
            .fail_exec
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = env
            .svc
            .create_clone(CreateCloneRequest {
                id: Some("clone_sick".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let clone = env.svc.get_clone("clone_sick").unwrap();
        assert_eq!(clone.status, CloneStatus::Fatal);
        assert!(env
            .containers
            .removed
            .lock()
            .unwrap()
            .contains(&clone.container_name()));
        assert!(env.fsm.datasets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_clone_refuses_reset_but_allows_destroy() {
        let env = engine(&two_snapshots()).await;
        env.fsm
            .fail_next_create_clone
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = env
            .svc
            .create_clone(CreateCloneRequest {
                id: Some("clone_f".into()),
                ..Default::default()
            })
            .await;

        let err = env
            .svc
            .reset_clone("clone_f", ResetCloneRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        env.svc.destroy_clone("clone_f", false).await.unwrap();
        assert!(env.svc.get_clone("clone_f").is_err());
    }

    #[tokio::test]
    async fn test_async_create_is_observable_by_polling() {
        let env = engine(&two_snapshots()).await;

        let creating = env
            .svc
            .create_clone_async(CreateCloneRequest {
                id: Some("clone_async".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(creating.status, CloneStatus::Creating);

        let mut status = creating.status;
        for _ in 0..100 {
            status = env.svc.get_clone("clone_async").unwrap().status;
            if status == CloneStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, CloneStatus::Ready);
    }

    #[tokio::test]
    async fn test_duplicate_clone_id_rejected() {
        let env = engine(&two_snapshots()).await;
        env.svc
            .create_clone(CreateCloneRequest {
                id: Some("clone_dup".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = env
            .svc
            .create_clone(CreateCloneRequest {
                id: Some("clone_dup".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        // The failed request must not disturb the existing refcount.
        assert_eq!(env.registry.snapshot_by_id(S2).unwrap().num_clones, 1);
    }

    #[tokio::test]
    async fn test_invalid_clone_id_rejected() {
        let env = engine(&two_snapshots()).await;
        let err = env
            .svc
            .create_clone(CreateCloneRequest {
                id: Some("bad/id".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_rough_snapshot_rejected_unless_enabled() {
        let env = engine(&two_snapshots()).await;
        let rough_id = env.fsm.create_snapshot("", "").await.unwrap();
        let snapshots = env.fsm.snapshots().await.unwrap();
        env.registry.refresh_snapshots(snapshots);

        let err = env
            .svc
            .create_clone(CreateCloneRequest {
                snapshot_id: Some(rough_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let base = crate::config::Config::from_env();
        let mut cloning = base.cloning.clone();
        cloning.allow_rough_snapshots = true;
        let mut provision = base.provision.clone();
        provision.healthcheck_retries = 2;
        provision.healthcheck_interval_secs = 0;
        env.svc.reload(cloning, provision);

        let clone = env
            .svc
            .create_clone(CreateCloneRequest {
                snapshot_id: Some(rough_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(clone.snapshot_id, rough_id);
    }

    #[tokio::test]
    async fn test_in_flight_transition_conflicts() {
        let env = engine(&two_snapshots()).await;
        let clone = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap();
        env.registry
            .set_clone_status(&clone.id, CloneStatus::Resetting, None)
            .unwrap();

        let err = env.svc.destroy_clone(&clone.id, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_port_exhaustion_fails_creation() {
        let env = engine(&two_snapshots()).await;
        let base = crate::config::Config::from_env();
        let mut provision = base.provision.clone();
        provision.port_from = 6000;
        provision.port_to = 6001;
        provision.healthcheck_retries = 2;
        provision.healthcheck_interval_secs = 0;
        env.svc.reload(base.cloning.clone(), provision);

        env.svc.create_clone(CreateCloneRequest::default()).await.unwrap();
        env.svc.create_clone(CreateCloneRequest::default()).await.unwrap();

        let err = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_refcount_sum_matches_clone_count() {
        let env = engine(&two_snapshots()).await;

        for i in 0..3 {
            env.svc
                .create_clone(CreateCloneRequest {
                    id: Some(format!("clone-prop-{i}")),
                    snapshot_id: Some(if i % 2 == 0 { S1.into() } else { S2.into() }),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        env.svc.destroy_clone("clone-prop-1", false).await.unwrap();

        let total: usize = env
            .svc
            .get_snapshots()
            .iter()
            .map(|s| s.num_clones)
            .sum();
        assert_eq!(total, env.svc.list_clones().len());
    }

    #[tokio::test]
    async fn test_snapshot_destroy_guards() {
        let env = engine(&two_snapshots()).await;

        // Latest snapshot is pinned.
        let err = env.svc.destroy_snapshot(S2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        // Referenced snapshot is protected.
        env.svc
            .create_clone(CreateCloneRequest {
                snapshot_id: Some(S1.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = env.svc.destroy_snapshot(S1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        // Unreferenced, non-latest snapshot goes away.
        let clones = env.svc.list_clones();
        env.svc.destroy_clone(&clones[0].id, false).await.unwrap();
        env.svc.destroy_snapshot(S1).await.unwrap();
        assert!(env.registry.snapshot_by_id(S1).is_err());
    }

    #[tokio::test]
    async fn test_retention_preserves_pinned_and_referenced() {
        let env = engine(&[
            ("2020-02-17 00:00:00", "2020-02-17 00:00:00"),
            ("2020-02-18 00:00:00", "2020-02-18 00:00:00"),
            ("2020-02-19 00:00:00", "2020-02-19 00:10:00"),
            ("2020-02-20 00:00:00", "2020-02-20 00:10:00"),
        ])
        .await;

        env.svc
            .create_clone(CreateCloneRequest {
                snapshot_id: Some("dblab_pool@snapshot_20200217000000".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let base = crate::config::Config::from_env();
        let mut cloning = base.cloning.clone();
        cloning.retention_limit = 1;
        env.svc.reload(cloning, base.provision.clone());

        let mut destroyed = env.svc.cleanup_snapshots().await.unwrap();
        destroyed.sort();
        assert_eq!(
            destroyed,
            vec![
                "dblab_pool@snapshot_20200218000000",
                "dblab_pool@snapshot_20200219000000",
            ]
        );

        let remaining: Vec<String> = env
            .svc
            .get_snapshots()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(
            remaining,
            vec![
                "dblab_pool@snapshot_20200220000000",
                "dblab_pool@snapshot_20200217000000",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_snapshot_records_rough_state() {
        let env = engine(&two_snapshots()).await;
        let snapshot = env.svc.create_snapshot("", "").await.unwrap();
        assert!(snapshot.rough);
        let age = Utc::now() - snapshot.data_state_at;
        assert!(age.num_seconds() >= 0 && age.num_seconds() < 60);
        assert!(env.registry.snapshot_by_id(&snapshot.id).is_ok());
    }

    #[tokio::test]
    async fn test_idle_scan_destroys_stale_unprotected_clones() {
        let env = engine(&two_snapshots()).await;

        let stale = env
            .svc
            .create_clone(CreateCloneRequest {
                id: Some("clone_stale".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let protected = env
            .svc
            .create_clone(CreateCloneRequest {
                id: Some("clone_guarded".into()),
                protected: true,
                ..Default::default()
            })
            .await
            .unwrap();

        // Backdate both; only the unprotected one may be collected.
        for id in [&stale.id, &protected.id] {
            env.registry
                .update_clone(id, |c| {
                    c.status_updated_at = Utc::now() - chrono::Duration::hours(2);
                })
                .unwrap();
        }

        let base = crate::config::Config::from_env();
        let mut cloning = base.cloning.clone();
        cloning.max_idle_minutes = 30;
        env.svc.reload(cloning, base.provision.clone());

        let destroyed = env.svc.scan_idle_clones().await;
        assert_eq!(destroyed, 1);
        assert!(env.svc.get_clone("clone_stale").is_err());
        assert!(env.svc.get_clone("clone_guarded").is_ok());
    }

    #[tokio::test]
    async fn test_reset_notifies_observer_unwatch() {
        let mut env = engine(&two_snapshots()).await;
        let clone = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap();

        env.svc
            .reset_clone(&clone.id, ResetCloneRequest::default())
            .await
            .unwrap();

        assert_eq!(env.unwatch_rx.try_recv().unwrap(), clone.id);
    }

    #[tokio::test]
    async fn test_instance_status_aggregates() {
        let env = engine(&two_snapshots()).await;
        env.svc.create_clone(CreateCloneRequest::default()).await.unwrap();

        let status = env.svc.instance_status().await;
        assert_eq!(status.num_clones, 1);
        assert_eq!(status.pools.len(), 1);
        assert_eq!(status.pools[0].clone_list.len(), 1);
        assert_eq!(status.clones[0].session_state.clone_diff_size, 1024);
        assert!(status.expected_cloning_time_sec >= 0.0);
        assert_eq!(
            status.pools[0].data_state_at.unwrap(),
            env.registry.latest_snapshot().unwrap().data_state_at
        );
    }

    #[test]
    fn test_validate_clone_id() {
        assert!(validate_clone_id("clone_ok-1").is_ok());
        assert!(validate_clone_id("").is_err());
        assert!(validate_clone_id("bad/id").is_err());
        assert!(validate_clone_id("bad id").is_err());
        assert!(validate_clone_id("bad@id").is_err());
    }
}
