//! Container provisioning for clone Postgres instances: the backend trait,
//! the port pool, and the readiness probe shared by creation, reset, and
//! startup reconciliation.

pub mod docker;

use crate::config::ProvisionConfig;
use crate::error::EngineError;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// Everything the backend needs to launch one clone container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name: the clone id under the fixed prefix.
    pub name: String,
    pub clone_id: String,
    pub port: u16,
    /// PGDATA inside the clone's mounted dataset.
    pub data_dir: PathBuf,
    /// Per-clone UNIX socket directory.
    pub socket_dir: PathBuf,
    pub username: String,
    pub db_name: String,
    pub docker_image: String,
    pub container_config: HashMap<String, String>,
    pub pool_name: String,
    pub instance_id: String,
}

pub trait ContainerBackend: Send + Sync {
    fn run_container(
        &self,
        spec: &ContainerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    fn stop_container(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    fn remove_container(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    /// `Some(running)` when the container exists, `None` when it does not.
    fn container_running(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<bool>, EngineError>> + Send + '_>>;

    /// Names of clone containers labeled with the given pool.
    fn list_containers(
        &self,
        pool_label: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EngineError>> + Send + '_>>;

    fn logs(
        &self,
        name: &str,
        since_minutes: u64,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>>;

    fn exec(
        &self,
        name: &str,
        cmd: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>>;

    fn image_exists(
        &self,
        image: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EngineError>> + Send + '_>>;

    fn pull_image(
        &self,
        image: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    /// Stop engine-internal control containers; user clone containers are
    /// never touched here.
    fn stop_control_containers(
        &self,
        instance_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;

    fn reload(&self, _config: ProvisionConfig) {}
}

// ── Port allocation ────────────────────────────────────────────

/// Mutex-guarded pool of clone ports. Ports in use by existing clones are
/// claimed during reconciliation so restarts never double-assign.
pub struct PortAllocator {
    range: Mutex<(u16, u16)>,
    taken: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(from: u16, to: u16) -> Self {
        Self {
            range: Mutex::new((from, to)),
            taken: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<u16, EngineError> {
        let (from, to) = *self.range.lock().unwrap();
        let mut taken = self.taken.lock().unwrap();
        for port in from..=to {
            if !taken.contains(&port) {
                taken.insert(port);
                return Ok(port);
            }
        }
        Err(EngineError::ResourceExhausted(format!(
            "no free ports in range {from}..{to}"
        )))
    }

    /// Mark a specific port as in use (an adopted clone already owns it).
    pub fn claim(&self, port: u16) -> Result<(), EngineError> {
        let mut taken = self.taken.lock().unwrap();
        if !taken.insert(port) {
            return Err(EngineError::Conflict(format!("port {port} is already in use")));
        }
        Ok(())
    }

    pub fn release(&self, port: u16) {
        self.taken.lock().unwrap().remove(&port);
    }

    pub fn set_range(&self, from: u16, to: u16) {
        *self.range.lock().unwrap() = (from, to);
    }
}

// ── Readiness ──────────────────────────────────────────────────

/// Poll Postgres inside a freshly started container until it accepts
/// connections. On exhausting the retry budget, container logs and the
/// Postgres log tail are dumped into the engine log before failing.
pub async fn wait_for_postgres(
    backend: &dyn ContainerBackend,
    spec: &ContainerSpec,
    retries: u32,
    interval: Duration,
) -> Result<(), EngineError> {
    let probe = format!(
        "pg_isready -h {} -p {} -U {}",
        spec.socket_dir.display(),
        spec.port,
        spec.username
    );

    for attempt in 1..=retries {
        match backend.exec(&spec.name, &probe).await {
            Ok(_) => {
                tracing::info!(container = %spec.name, attempt, "Postgres is ready");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(container = %spec.name, attempt, error = %e, "Postgres not ready yet");
            }
        }
        tokio::time::sleep(interval).await;
    }

    match backend.logs(&spec.name, 5).await {
        Ok(logs) => tracing::error!(container = %spec.name, %logs, "Container logs before readiness failure"),
        Err(e) => tracing::error!(container = %spec.name, error = %e, "Failed to fetch container logs"),
    }

    let tail_cmd = format!(
        "sh -c 'tail -n 50 {}/log/*.log 2>/dev/null || true'",
        spec.data_dir.display()
    );
    if let Ok(tail) = backend.exec(&spec.name, &tail_cmd).await {
        tracing::error!(container = %spec.name, postgres_log = %tail, "Postgres log tail before readiness failure");
    }

    Err(EngineError::Timeout(format!(
        "Postgres in container {} did not become ready after {} attempts",
        spec.name, retries
    )))
}

// ── Test support ───────────────────────────────────────────────

/// In-memory container backend: tracks container state, records exec calls,
/// and replays scripted exec responses.
#[derive(Default)]
pub struct StubContainerBackend {
    /// name → running
    pub containers: Mutex<HashMap<String, bool>>,
    pub removed: Mutex<Vec<String>>,
    pub exec_log: Mutex<Vec<(String, String)>>,
    exec_responses: Mutex<std::collections::VecDeque<Result<String, EngineError>>>,
    pub fail_next_run: std::sync::atomic::AtomicBool,
    pub fail_exec: std::sync::atomic::AtomicBool,
}

impl StubContainerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exec_response(&self, response: Result<String, EngineError>) {
        self.exec_responses.lock().unwrap().push_back(response);
    }

    pub fn running(&self, name: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(false)
    }
}

impl ContainerBackend for StubContainerBackend {
    fn run_container(
        &self,
        spec: &ContainerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let name = spec.name.clone();
        Box::pin(async move {
            if self
                .fail_next_run
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(EngineError::Backend("injected container failure".into()));
            }
            self.containers.lock().unwrap().insert(name, true);
            Ok(())
        })
    }

    fn stop_container(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            match self.containers.lock().unwrap().get_mut(&name) {
                Some(running) => {
                    *running = false;
                    Ok(())
                }
                None => Err(EngineError::Backend(format!("no such container: {name}"))),
            }
        })
    }

    fn remove_container(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            self.containers.lock().unwrap().remove(&name);
            self.removed.lock().unwrap().push(name);
            Ok(())
        })
    }

    fn container_running(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<bool>, EngineError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.containers.lock().unwrap().get(&name).copied()) })
    }

    fn list_containers(
        &self,
        _pool_label: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EngineError>> + Send + '_>> {
        Box::pin(async move {
            let mut names: Vec<String> =
                self.containers.lock().unwrap().keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn logs(
        &self,
        _name: &str,
        _since_minutes: u64,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>> {
        Box::pin(async move { Ok(String::new()) })
    }

    fn exec(
        &self,
        name: &str,
        cmd: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>> {
        let name = name.to_string();
        let cmd = cmd.to_string();
        Box::pin(async move {
            self.exec_log.lock().unwrap().push((name, cmd));
            if self.fail_exec.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(EngineError::CommandFailed {
                    exit_code: 2,
                    stderr: "no response".into(),
                });
            }
            self.exec_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("accepting connections".into()))
        })
    }

    fn image_exists(
        &self,
        _image: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EngineError>> + Send + '_>> {
        Box::pin(async move { Ok(true) })
    }

    fn pull_image(
        &self,
        _image: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        Box::pin(async move { Ok(()) })
    }

    fn stop_control_containers(
        &self,
        _instance_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        Box::pin(async move { Ok(()) })
    }
}
