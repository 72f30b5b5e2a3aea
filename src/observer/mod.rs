//! Bounded observation sessions against live clones. A session polls
//! `pg_stat_activity` through the clone's container on a fixed interval,
//! attributes elapsed time to wait-event categories, and ends with a
//! `pass`/`fail`/`inconclusive` verdict. Raw samples and a rendered summary
//! are written under a per-session directory.

use crate::config::ObserverConfig;
use crate::error::EngineError;
use crate::models::{Clone, CloneStatus};
use crate::pool::PoolManager;
use crate::provision::ContainerBackend;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Activity rows attributed to no wait event are on-CPU.
const CPU_WAIT_EVENT: &str = "CPU";

const ACTIVITY_QUERY: &str = "SELECT \
     coalesce(extract(epoch from clock_timestamp() - query_start), 0) || '|' || \
     coalesce(wait_event_type || '.' || wait_event, 'CPU') || '|' || \
     coalesce(state, '') \
     FROM pg_stat_activity \
     WHERE state <> 'idle' AND pid <> pg_backend_pid()";

pub fn new_session_id() -> String {
    format!(
        "session_{}",
        &Uuid::new_v4().to_string().replace('-', "")[..12]
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactType {
    RawSamples,
    Summary,
}

impl ArtifactType {
    pub fn filename(self) -> &'static str {
        match self {
            Self::RawSamples => "samples.jsonl",
            Self::Summary => "summary.json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "samples" => Some(Self::RawSamples),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationConfig {
    pub observation_interval_secs: u64,
    pub max_lock_duration_secs: u64,
    pub max_duration_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartObservationRequest {
    pub clone_id: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub config: Option<ObservationConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservationSession {
    pub session_id: String,
    pub clone_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config: ObservationConfig,
    pub tags: HashMap<String, String>,
    pub sample_count: u64,
    pub dropped_samples: u64,
    /// Percent of observed time per wait event, rendered at session end.
    pub wait_event_ratios: HashMap<String, f64>,
    pub max_lock_duration_sec: f64,
    pub verdict: Option<Verdict>,
    pub artifacts_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActivityRow {
    duration_sec: f64,
    wait_event: String,
    state: String,
}

#[derive(Debug, Serialize)]
struct Sample {
    ts: DateTime<Utc>,
    rows: Vec<ActivityRow>,
}

struct ActiveSession {
    state: Arc<Mutex<ObservationSession>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ObsInner {
    containers: Arc<dyn ContainerBackend>,
    pools: Arc<PoolManager>,
    registry: Arc<Registry>,
    config: RwLock<ObserverConfig>,
    active: DashMap<String, ActiveSession>,
    finished: DashMap<String, ObservationSession>,
}

#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObsInner>,
}

impl Observer {
    pub fn new(
        containers: Arc<dyn ContainerBackend>,
        pools: Arc<PoolManager>,
        registry: Arc<Registry>,
        config: ObserverConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ObsInner {
                containers,
                pools,
                registry,
                config: RwLock::new(config),
                active: DashMap::new(),
                finished: DashMap::new(),
            }),
        }
    }

    /// Start a session on a `READY` clone. One active session per clone.
    pub fn start_session(
        &self,
        req: StartObservationRequest,
    ) -> Result<ObservationSession, EngineError> {
        let clone = self
            .inner
            .registry
            .get_clone(&req.clone_id)
            .ok_or_else(|| EngineError::NotFound(format!("clone {} not found", req.clone_id)))?;
        if clone.status != CloneStatus::Ready {
            return Err(EngineError::PreconditionFailed(format!(
                "clone {} is not ready for observation",
                req.clone_id
            )));
        }
        if self.inner.active.contains_key(&req.clone_id) {
            return Err(EngineError::Conflict(format!(
                "clone {} already has an active observation session",
                req.clone_id
            )));
        }

        let observer_config = self.inner.config.read().unwrap().clone();
        let config = req.config.unwrap_or(ObservationConfig {
            observation_interval_secs: observer_config.default_interval_secs,
            max_lock_duration_secs: observer_config.default_max_lock_duration_secs,
            max_duration_secs: observer_config.default_max_duration_secs,
        });

        let session_id = new_session_id();
        let artifacts_dir = observer_config
            .artifacts_dir
            .join(&req.clone_id)
            .join(&session_id);
        std::fs::create_dir_all(&artifacts_dir)?;

        let session = ObservationSession {
            session_id: session_id.clone(),
            clone_id: req.clone_id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            config: config.clone(),
            tags: req.tags,
            sample_count: 0,
            dropped_samples: 0,
            wait_event_ratios: HashMap::new(),
            max_lock_duration_sec: 0.0,
            verdict: None,
            artifacts_dir: artifacts_dir.clone(),
        };

        let psql_cmd = self.psql_command(&clone)?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(session.clone()));

        self.inner.active.insert(
            req.clone_id.clone(),
            ActiveSession {
                state: state.clone(),
                stop_tx: Mutex::new(Some(stop_tx)),
                handle: Mutex::new(None),
            },
        );

        let _ = self.inner.registry.update_clone(&req.clone_id, |c| {
            c.session_state.last_observed = Some(Utc::now());
        });

        let runner = SessionRunner {
            observer: self.clone(),
            clone_id: req.clone_id.clone(),
            container: clone.container_name(),
            psql_cmd,
            state,
            config,
            wait_durations: HashMap::new(),
            lock_exceeded: false,
        };
        let handle = tokio::spawn(runner.run(stop_rx));

        if let Some(entry) = self.inner.active.get(&req.clone_id) {
            *entry.handle.lock().unwrap() = Some(handle);
        }

        tracing::info!(clone_id = %req.clone_id, session_id = %session_id, "Observation session started");
        Ok(session)
    }

    /// Stop the active session of a clone and return its verdict.
    pub async fn stop_session(&self, clone_id: &str) -> Result<ObservationSession, EngineError> {
        let (session_id, stop_tx, handle) = {
            let entry = self.inner.active.get(clone_id).ok_or_else(|| {
                EngineError::NotFound(format!("no active observation session for clone {clone_id}"))
            })?;
            let session_id = entry.state.lock().unwrap().session_id.clone();
            let stop_tx = entry.stop_tx.lock().unwrap().take();
            let handle = entry.handle.lock().unwrap().take();
            (session_id, stop_tx, handle)
        };

        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.session_summary(clone_id, &session_id)
    }

    /// Observer-side handler for clones leaving `READY`: end the session if
    /// one is active.
    pub async fn remove_observing_clone(&self, clone_id: &str) {
        if self.inner.active.contains_key(clone_id) {
            tracing::info!(clone_id = %clone_id, "Clone left ready state, stopping its observation session");
            if let Err(e) = self.stop_session(clone_id).await {
                tracing::warn!(clone_id = %clone_id, error = %e, "Failed to stop observation session");
            }
        }
    }

    pub fn session_summary(
        &self,
        clone_id: &str,
        session_id: &str,
    ) -> Result<ObservationSession, EngineError> {
        if let Some(active) = self.inner.active.get(clone_id) {
            let session = active.state.lock().unwrap();
            if session.session_id == session_id {
                return Ok(session.clone());
            }
        }
        self.inner
            .finished
            .get(&finished_key(clone_id, session_id))
            .map(|s| s.clone())
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "observation session {session_id} of clone {clone_id} not found"
                ))
            })
    }

    pub fn artifact(
        &self,
        clone_id: &str,
        session_id: &str,
        artifact: ArtifactType,
    ) -> Result<String, EngineError> {
        let session = self.session_summary(clone_id, session_id)?;
        let path = session.artifacts_dir.join(artifact.filename());
        if !path.exists() {
            return Err(EngineError::NotFound(format!(
                "artifact {} of session {session_id} not found",
                artifact.filename()
            )));
        }
        Ok(std::fs::read_to_string(path)?)
    }

    /// Stop every active session; called by the shutdown coordinator so all
    /// artifacts are flushed before the engine exits.
    pub async fn flush_all(&self) {
        let clone_ids: Vec<String> = self
            .inner
            .active
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for clone_id in clone_ids {
            if let Err(e) = self.stop_session(&clone_id).await {
                tracing::warn!(clone_id = %clone_id, error = %e, "Failed to flush observation session");
            }
        }
    }

    pub fn reload(&self, config: ObserverConfig) {
        *self.inner.config.write().unwrap() = config;
        tracing::info!("Observer configuration reloaded");
    }

    fn psql_command(&self, clone: &Clone) -> Result<String, EngineError> {
        let pool = self
            .inner
            .pools
            .manager_for(&clone.pool)
            .ok_or_else(|| EngineError::Internal(format!("pool {} is unknown", clone.pool)))?
            .pool();
        Ok(format!(
            "psql -U {} -d {} -h {} -p {} -XAtc \"{ACTIVITY_QUERY}\"",
            clone.database.username,
            clone.database.db_name,
            pool.socket_clone_dir(&clone.id).display(),
            clone.port,
        ))
    }
}

struct SessionRunner {
    observer: Observer,
    clone_id: String,
    container: String,
    psql_cmd: String,
    state: Arc<Mutex<ObservationSession>>,
    config: ObservationConfig,
    wait_durations: HashMap<String, f64>,
    lock_exceeded: bool,
}

impl SessionRunner {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let interval = Duration::from_secs(self.config.observation_interval_secs.max(1));
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.max_duration_secs);
        let mut duration_exceeded = false;

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep(interval) => {
                    if tokio::time::Instant::now() >= deadline {
                        duration_exceeded = true;
                        break;
                    }
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(clone_id = %self.clone_id, error = %e, "Observation poll failed");
                    }
                    if self.lock_exceeded {
                        break;
                    }
                }
            }
        }

        self.finish(duration_exceeded);
    }

    async fn poll_once(&mut self) -> Result<(), EngineError> {
        let out = self
            .observer
            .inner
            .containers
            .exec(&self.container, &self.psql_cmd)
            .await?;

        let rows = parse_activity_rows(&out);
        let interval_secs = self.config.observation_interval_secs.max(1) as f64;

        // Rows with a zero query duration carry no attributable time; a poll
        // yielding none of them counts as dropped, not sampled.
        let valid: Vec<&ActivityRow> = rows.iter().filter(|r| r.duration_sec > 0.0).collect();

        let mut state = self.state.lock().unwrap();
        if valid.is_empty() {
            state.dropped_samples += 1;
        } else {
            state.sample_count += 1;
            for row in &valid {
                *self
                    .wait_durations
                    .entry(row.wait_event.clone())
                    .or_default() += interval_secs;

                if row.wait_event.starts_with("Lock")
                    && row.duration_sec > self.config.max_lock_duration_secs as f64
                {
                    state.max_lock_duration_sec =
                        state.max_lock_duration_sec.max(row.duration_sec);
                    self.lock_exceeded = true;
                }
            }
        }
        drop(state);

        let sample = Sample {
            ts: Utc::now(),
            rows,
        };
        self.append_raw_sample(&sample);

        Ok(())
    }

    fn append_raw_sample(&self, sample: &Sample) {
        use std::io::Write;

        let path = {
            let state = self.state.lock().unwrap();
            state.artifacts_dir.join(ArtifactType::RawSamples.filename())
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                let line = serde_json::to_string(sample).unwrap_or_default();
                writeln!(file, "{line}")
            });
        if let Err(e) = result {
            tracing::warn!(clone_id = %self.clone_id, error = %e, "Failed to append raw sample");
        }
    }

    fn finish(self, duration_exceeded: bool) {
        let min_samples = self
            .observer
            .inner
            .config
            .read()
            .unwrap()
            .min_sample_count;

        let session = {
            let mut state = self.state.lock().unwrap();
            state.finished_at = Some(Utc::now());
            state.wait_event_ratios = render_ratios(&self.wait_durations);
            state.verdict = Some(compute_verdict(
                state.sample_count,
                min_samples,
                self.lock_exceeded,
                duration_exceeded,
            ));
            state.clone()
        };

        let summary_path = session
            .artifacts_dir
            .join(ArtifactType::Summary.filename());
        match serde_json::to_string_pretty(&session) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&summary_path, json) {
                    tracing::warn!(clone_id = %self.clone_id, error = %e, "Failed to write session summary");
                }
            }
            Err(e) => {
                tracing::warn!(clone_id = %self.clone_id, error = %e, "Failed to render session summary")
            }
        }

        let _ = self
            .observer
            .inner
            .registry
            .update_clone(&self.clone_id, |c| {
                c.session_state.last_observed = Some(Utc::now());
            });

        self.observer.inner.active.remove(&self.clone_id);
        self.observer.inner.finished.insert(
            finished_key(&self.clone_id, &session.session_id),
            session.clone(),
        );

        tracing::info!(
            clone_id = %self.clone_id,
            session_id = %session.session_id,
            verdict = ?session.verdict,
            samples = session.sample_count,
            "Observation session finished"
        );
    }
}

fn finished_key(clone_id: &str, session_id: &str) -> String {
    format!("{clone_id}/{session_id}")
}

fn parse_activity_rows(out: &str) -> Vec<ActivityRow> {
    out.trim()
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '|');
            let duration_sec: f64 = parts.next()?.trim().parse().ok()?;
            let wait_event = parts.next()?.trim();
            let state = parts.next().unwrap_or("").trim();
            Some(ActivityRow {
                duration_sec,
                wait_event: if wait_event.is_empty() {
                    CPU_WAIT_EVENT.to_string()
                } else {
                    wait_event.to_string()
                },
                state: state.to_string(),
            })
        })
        .collect()
}

fn render_ratios(durations: &HashMap<String, f64>) -> HashMap<String, f64> {
    let total: f64 = durations.values().sum();
    if total <= 0.0 {
        return HashMap::new();
    }
    durations
        .iter()
        .map(|(event, dur)| (event.clone(), dur / total * 100.0))
        .collect()
}

fn compute_verdict(
    sample_count: u64,
    min_samples: u64,
    lock_exceeded: bool,
    duration_exceeded: bool,
) -> Verdict {
    if lock_exceeded || duration_exceeded {
        Verdict::Fail
    } else if sample_count >= min_samples {
        Verdict::Pass
    } else {
        Verdict::Inconclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloning::testutil::engine;
    use crate::models::CreateCloneRequest;
    use tempfile::TempDir;

    fn snapshots() -> Vec<(&'static str, &'static str)> {
        vec![("2020-02-20 00:00:00", "2020-02-20 00:10:00")]
    }

    struct ObserverEnv {
        env: crate::cloning::testutil::TestEngine,
        observer: Observer,
        clone_id: String,
        _artifacts: TempDir,
    }

    async fn observer_env(min_samples: u64) -> ObserverEnv {
        let env = engine(&snapshots()).await;
        let clone = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap();

        let artifacts = TempDir::new().unwrap();
        let config = ObserverConfig {
            artifacts_dir: artifacts.path().to_path_buf(),
            default_interval_secs: 10,
            default_max_lock_duration_secs: 10,
            default_max_duration_secs: 3600,
            min_sample_count: min_samples,
        };
        let observer = Observer::new(
            env.containers.clone(),
            env.pools.clone(),
            env.registry.clone(),
            config,
        );
        ObserverEnv {
            clone_id: clone.id,
            env,
            observer,
            _artifacts: artifacts,
        }
    }

    async fn wait_finished(observer: &Observer, clone_id: &str, session_id: &str) -> ObservationSession {
        for _ in 0..200 {
            let session = observer.session_summary(clone_id, session_id).unwrap();
            if session.finished_at.is_some() {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("session did not finish");
    }

    #[test]
    fn test_compute_verdict() {
        assert_eq!(compute_verdict(10, 3, false, false), Verdict::Pass);
        assert_eq!(compute_verdict(1, 3, false, false), Verdict::Inconclusive);
        assert_eq!(compute_verdict(10, 3, true, false), Verdict::Fail);
        assert_eq!(compute_verdict(10, 3, false, true), Verdict::Fail);
        assert_eq!(compute_verdict(0, 3, true, false), Verdict::Fail);
    }

    #[test]
    fn test_parse_activity_rows() {
        let rows = parse_activity_rows("1.5|IO.DataFileRead|active\n0|CPU|active\n2.0|Lock.relation|active\n");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].wait_event, "IO.DataFileRead");
        assert_eq!(rows[0].duration_sec, 1.5);
        assert_eq!(rows[2].wait_event, "Lock.relation");
        assert!(parse_activity_rows("garbage\n").is_empty());
    }

    #[test]
    fn test_render_ratios() {
        let mut durations = HashMap::new();
        durations.insert("CPU".to_string(), 30.0);
        durations.insert("IO.DataFileRead".to_string(), 10.0);
        let ratios = render_ratios(&durations);
        assert_eq!(ratios["CPU"], 75.0);
        assert_eq!(ratios["IO.DataFileRead"], 25.0);
        assert!(render_ratios(&HashMap::new()).is_empty());
    }

    #[tokio::test]
    async fn test_session_requires_ready_clone() {
        let env = observer_env(1).await;
        env.env
            .registry
            .set_clone_status(&env.clone_id, CloneStatus::Resetting, None)
            .unwrap();

        let err = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn test_session_unknown_clone() {
        let env = observer_env(1).await;
        let err = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: "clone_missing".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_one_session_per_clone() {
        let env = observer_env(1).await;
        env.observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                ..Default::default()
            })
            .unwrap();

        let err = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);

        env.observer.stop_session(&env.clone_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_immediate_stop_is_inconclusive() {
        let env = observer_env(3).await;
        let session = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                ..Default::default()
            })
            .unwrap();

        let stopped = env.observer.stop_session(&env.clone_id).await.unwrap();
        assert_eq!(stopped.session_id, session.session_id);
        assert_eq!(stopped.verdict, Some(Verdict::Inconclusive));
        assert!(stopped.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_exceeded_fails_session() {
        let env = observer_env(1).await;
        env.env
            .containers
            .push_exec_response(Ok("15.0|Lock.relation|active".into()));

        let session = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                config: Some(ObservationConfig {
                    observation_interval_secs: 1,
                    max_lock_duration_secs: 10,
                    max_duration_secs: 3600,
                }),
                ..Default::default()
            })
            .unwrap();

        let finished = wait_finished(&env.observer, &env.clone_id, &session.session_id).await;
        assert_eq!(finished.verdict, Some(Verdict::Fail));
        assert!(finished.max_lock_duration_sec >= 15.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_fails_session() {
        let env = observer_env(1).await;
        let session = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                config: Some(ObservationConfig {
                    observation_interval_secs: 10,
                    max_lock_duration_secs: 10,
                    max_duration_secs: 25,
                }),
                ..Default::default()
            })
            .unwrap();

        let finished = wait_finished(&env.observer, &env.clone_id, &session.session_id).await;
        assert_eq!(finished.verdict, Some(Verdict::Fail));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_samples_are_dropped() {
        let env = observer_env(1).await;
        env.env
            .containers
            .push_exec_response(Ok("0|CPU|active".into()));
        env.env
            .containers
            .push_exec_response(Ok("0|CPU|active".into()));

        let session = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                config: Some(ObservationConfig {
                    observation_interval_secs: 10,
                    max_lock_duration_secs: 10,
                    max_duration_secs: 25,
                }),
                ..Default::default()
            })
            .unwrap();

        let finished = wait_finished(&env.observer, &env.clone_id, &session.session_id).await;
        assert_eq!(finished.sample_count, 0);
        assert!(finished.dropped_samples >= 1);
    }

    #[tokio::test]
    async fn test_pass_after_enough_samples() {
        let env = observer_env(1).await;
        let session = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                config: Some(ObservationConfig {
                    observation_interval_secs: 1,
                    max_lock_duration_secs: 1000,
                    max_duration_secs: 3600,
                }),
                ..Default::default()
            })
            .unwrap();

        // Default scripted exec output is a valid busy row.
        env.env
            .containers
            .push_exec_response(Ok("1.0|CPU|active".into()));

        for _ in 0..400 {
            let summary = env
                .observer
                .session_summary(&env.clone_id, &session.session_id)
                .unwrap();
            if summary.sample_count >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stopped = env.observer.stop_session(&env.clone_id).await.unwrap();
        assert_eq!(stopped.verdict, Some(Verdict::Pass));
        assert!(stopped.wait_event_ratios.contains_key("CPU"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_artifacts_written() {
        let env = observer_env(1).await;
        env.env
            .containers
            .push_exec_response(Ok("1.0|IO.DataFileRead|active".into()));

        let session = env
            .observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                config: Some(ObservationConfig {
                    observation_interval_secs: 10,
                    max_lock_duration_secs: 10,
                    max_duration_secs: 25,
                }),
                ..Default::default()
            })
            .unwrap();

        let finished = wait_finished(&env.observer, &env.clone_id, &session.session_id).await;

        let raw = env
            .observer
            .artifact(&env.clone_id, &finished.session_id, ArtifactType::RawSamples)
            .unwrap();
        assert!(raw.contains("IO.DataFileRead"));

        let summary = env
            .observer
            .artifact(&env.clone_id, &finished.session_id, ArtifactType::Summary)
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(doc["session_id"], finished.session_id.as_str());
        assert_eq!(doc["verdict"], "fail"); // ended by max_duration
    }

    #[tokio::test]
    async fn test_remove_observing_clone_stops_session() {
        let env = observer_env(5).await;
        env.observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                ..Default::default()
            })
            .unwrap();

        env.observer.remove_observing_clone(&env.clone_id).await;
        assert!(!env.observer.inner.active.contains_key(&env.clone_id));

        // Removing again is a no-op.
        env.observer.remove_observing_clone(&env.clone_id).await;
    }

    #[tokio::test]
    async fn test_flush_all_finishes_sessions() {
        let env = observer_env(1).await;
        env.observer
            .start_session(StartObservationRequest {
                clone_id: env.clone_id.clone(),
                ..Default::default()
            })
            .unwrap();

        env.observer.flush_all().await;
        assert!(env.observer.inner.active.is_empty());
        assert_eq!(env.observer.inner.finished.len(), 1);
    }

    #[test]
    fn test_artifact_type_parse() {
        assert_eq!(ArtifactType::parse("samples"), Some(ArtifactType::RawSamples));
        assert_eq!(ArtifactType::parse("summary"), Some(ArtifactType::Summary));
        assert_eq!(ArtifactType::parse("other"), None);
    }
}
