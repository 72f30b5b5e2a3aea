use crate::error::EngineError;
use std::collections::HashMap;
use std::path::PathBuf;

/// Engine configuration, assembled from environment variables. Reload builds
/// a fresh `Config`, validates every section, and fans it out to the
/// services; a single invalid section rejects the whole reload.
#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub pools: PoolsConfig,
    pub provision: ProvisionConfig,
    pub cloning: CloningConfig,
    pub observer: ObserverConfig,
}

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub instance_id: String,
    pub engine: String,
    pub debug: bool,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PoolsConfig {
    /// Directory under which every pool is mounted.
    pub mount_dir: PathBuf,
    /// Pool dataset names, in configuration order.
    pub pool_names: Vec<String>,
    /// Explicitly selected active pool; when absent the pool with the most
    /// recent snapshot becomes active.
    pub selected_pool: Option<String>,
    /// Suffix of intermediate pre-snapshots; stripped from data-state
    /// labels and filtered out of snapshot listings.
    pub pre_snapshot_suffix: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub docker_image: String,
    pub use_sudo: bool,
    pub os_username: String,
    pub port_from: u16,
    pub port_to: u16,
    /// Extra `--<flag>=<value>` pairs passed to `docker run`.
    pub container_config: HashMap<String, String>,
    pub healthcheck_retries: u32,
    pub healthcheck_interval_secs: u64,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CloningConfig {
    /// Non-protected clones untouched for this long are destroyed; zero
    /// disables the idle scan.
    pub max_idle_minutes: u64,
    pub idle_scan_interval_secs: u64,
    /// Number of most recent snapshots preserved by retention cleanup.
    pub retention_limit: usize,
    /// Allow cloning from snapshots whose data-state timestamp is a
    /// wall-clock fallback.
    pub allow_rough_snapshots: bool,
}

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub artifacts_dir: PathBuf,
    pub default_interval_secs: u64,
    pub default_max_lock_duration_secs: u64,
    pub default_max_duration_secs: u64,
    /// Sessions with fewer samples than this are inconclusive.
    pub min_sample_count: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            global: GlobalConfig {
                instance_id: env_str("DBLAB_INSTANCE_ID", "local"),
                engine: env_str("DBLAB_ENGINE", "postgres"),
                debug: env_bool("DBLAB_DEBUG", false),
                shutdown_timeout_secs: env_u64("DBLAB_SHUTDOWN_TIMEOUT_SECS", 30),
            },
            pools: PoolsConfig {
                mount_dir: PathBuf::from(env_str("DBLAB_MOUNT_DIR", "/var/lib/dblab")),
                pool_names: env_str("DBLAB_POOLS", "dblab_pool")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                selected_pool: std::env::var("DBLAB_SELECTED_POOL").ok().filter(|s| !s.is_empty()),
                pre_snapshot_suffix: env_str("DBLAB_PRE_SNAPSHOT_SUFFIX", "_pre"),
            },
            provision: ProvisionConfig {
                docker_image: env_str("DBLAB_DOCKER_IMAGE", "postgresai/extended-postgres:14"),
                use_sudo: env_bool("DBLAB_USE_SUDO", false),
                os_username: env_str("DBLAB_OS_USERNAME", "postgres"),
                port_from: env_u64("DBLAB_PORT_FROM", 6000) as u16,
                port_to: env_u64("DBLAB_PORT_TO", 6100) as u16,
                container_config: HashMap::new(),
                healthcheck_retries: env_u64("DBLAB_HEALTHCHECK_RETRIES", 15) as u32,
                healthcheck_interval_secs: env_u64("DBLAB_HEALTHCHECK_INTERVAL_SECS", 2),
                command_timeout_secs: env_u64("DBLAB_COMMAND_TIMEOUT_SECS", 60),
            },
            cloning: CloningConfig {
                max_idle_minutes: env_u64("DBLAB_MAX_IDLE_MINUTES", 0),
                idle_scan_interval_secs: env_u64("DBLAB_IDLE_SCAN_INTERVAL_SECS", 60),
                retention_limit: env_u64("DBLAB_SNAPSHOT_RETENTION", 30) as usize,
                allow_rough_snapshots: env_bool("DBLAB_ALLOW_ROUGH_SNAPSHOTS", false),
            },
            observer: ObserverConfig {
                artifacts_dir: PathBuf::from(env_str(
                    "DBLAB_OBSERVER_ARTIFACTS_DIR",
                    "/var/lib/dblab/observer",
                )),
                default_interval_secs: env_u64("DBLAB_OBSERVER_INTERVAL_SECS", 10),
                default_max_lock_duration_secs: env_u64("DBLAB_OBSERVER_MAX_LOCK_SECS", 10),
                default_max_duration_secs: env_u64("DBLAB_OBSERVER_MAX_DURATION_SECS", 3600),
                min_sample_count: env_u64("DBLAB_OBSERVER_MIN_SAMPLES", 3),
            },
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.global.validate()?;
        self.pools.validate()?;
        self.provision.validate()?;
        self.cloning.validate()?;
        self.observer.validate()?;
        Ok(())
    }
}

impl GlobalConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.instance_id.is_empty() {
            return Err(EngineError::InvalidArgument(
                "global: instance id cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

impl PoolsConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.pool_names.is_empty() {
            return Err(EngineError::InvalidArgument(
                "pools: at least one pool must be configured".into(),
            ));
        }
        if let Some(selected) = &self.selected_pool {
            if !self.pool_names.contains(selected) {
                return Err(EngineError::InvalidArgument(format!(
                    "pools: selected pool {selected:?} is not in the pool list"
                )));
            }
        }
        Ok(())
    }
}

impl ProvisionConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.port_from >= self.port_to {
            return Err(EngineError::InvalidArgument(format!(
                "provision: invalid port range {}..{}",
                self.port_from, self.port_to
            )));
        }
        if self.docker_image.is_empty() {
            return Err(EngineError::InvalidArgument(
                "provision: docker image cannot be empty".into(),
            ));
        }
        if self.os_username.is_empty() {
            return Err(EngineError::InvalidArgument(
                "provision: OS username cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

impl CloningConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.retention_limit == 0 {
            return Err(EngineError::InvalidArgument(
                "cloning: snapshot retention limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl ObserverConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.default_interval_secs == 0 {
            return Err(EngineError::InvalidArgument(
                "observer: observation interval must be positive".into(),
            ));
        }
        if self.default_max_duration_secs == 0 {
            return Err(EngineError::InvalidArgument(
                "observer: max duration must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
