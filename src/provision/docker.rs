//! Docker implementation of the container backend. All operations go
//! through the command runner; mounts for child containers are derived from
//! the engine's own mounts when it is itself containerized, because
//! `--volumes-from` would remove the copy-on-write mount point.

use crate::config::ProvisionConfig;
use crate::error::EngineError;
use crate::models::{LABEL_CLONE, LABEL_CONTROL, LABEL_INSTANCE_ID};
use crate::provision::{ContainerBackend, ContainerSpec};
use crate::runner::CommandRunner;
use serde::Deserialize;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Mount sources never forwarded into a clone container.
const SYSTEM_VOLUMES: &[&str] = &["/sys", "/lib", "/proc"];

#[derive(Debug, Deserialize)]
struct MountPoint {
    #[serde(rename = "Source")]
    source: String,
    #[serde(rename = "Destination")]
    destination: String,
    #[serde(default, rename = "Propagation")]
    propagation: String,
}

pub struct DockerBackend {
    runner: Arc<dyn CommandRunner>,
    config: RwLock<ProvisionConfig>,
    instance_id: String,
    inside_container: bool,
}

impl DockerBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ProvisionConfig, instance_id: &str) -> Self {
        Self {
            runner,
            config: RwLock::new(config),
            instance_id: instance_id.to_string(),
            inside_container: Path::new("/.dockerenv").exists(),
        }
    }

    #[cfg(test)]
    pub fn with_inside_container(mut self, inside: bool) -> Self {
        self.inside_container = inside;
        self
    }

    async fn build_volumes(&self, spec: &ContainerSpec) -> Result<Vec<String>, EngineError> {
        if !self.inside_container {
            // Direct mounts: the engine sees the same paths the container will.
            return Ok(vec![
                format!("--volume {0}:{0}", spec.data_dir.display()),
                format!("--volume {0}:{0}:rshared", spec.socket_dir.display()),
            ]);
        }

        let hostname = std::env::var("HOSTNAME").map_err(|_| {
            EngineError::Internal("HOSTNAME is empty, cannot inspect own container mounts".into())
        })?;

        let inspect_cmd = format!("docker inspect -f '{{{{ json .Mounts }}}}' {hostname}");
        let out = self
            .runner
            .run(&inspect_cmd, true)
            .await
            .map_err(|e| e.backend_context("failed to get container mounts"))?;

        build_mount_volumes(out.trim(), spec)
    }
}

/// Derive child-container volumes from the engine's own mount points:
/// forward the mount containing the clone's data directory (preserving bind
/// propagation) and re-root the socket directory mount as `rshared`.
fn build_mount_volumes(
    inspect_json: &str,
    spec: &ContainerSpec,
) -> Result<Vec<String>, EngineError> {
    let mount_points: Vec<MountPoint> = serde_json::from_str(inspect_json)
        .map_err(|e| EngineError::Backend(format!("failed to interpret mount paths: {e}")))?;

    let data_dir = spec.data_dir.to_string_lossy().to_string();
    let socket_dir = spec.socket_dir.to_string_lossy().to_string();
    let mut volumes = Vec::new();

    for mount in &mount_points {
        if is_system_volume(&mount.source) {
            continue;
        }

        if let Some(socket_path) = socket_dir.strip_prefix(&mount.destination) {
            let host_socket_dir = join_host_path(&mount.source, socket_path);
            volumes.push(format!("--volume {host_socket_dir}:{socket_dir}:rshared"));
            break;
        }
    }

    for mount in &mount_points {
        if is_system_volume(&mount.source) {
            continue;
        }

        if let Some(data_path) = data_dir.strip_prefix(&mount.destination) {
            let host_data_dir = join_host_path(&mount.source, data_path);
            let mut volume = format!("--volume {host_data_dir}:{data_dir}");
            if !mount.propagation.is_empty() {
                volume.push(':');
                volume.push_str(&mount.propagation);
            }
            volumes.push(volume);
        }
    }

    Ok(volumes)
}

fn is_system_volume(source: &str) -> bool {
    SYSTEM_VOLUMES.iter().any(|sys| source.starts_with(sys))
}

fn join_host_path(source: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        source.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

/// The per-clone socket directory is wiped and recreated world-writable
/// before each launch so a fresh postmaster can always bind its socket.
fn create_socket_clone_dir(dir: &Path) -> Result<(), EngineError> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}

fn build_run_command(spec: &ContainerSpec, volumes: &[String]) -> String {
    let mut container_flags: Vec<String> = spec
        .container_config
        .iter()
        .map(|(flag, value)| format!("--{flag}={value}"))
        .collect();
    container_flags.sort();

    let port = spec.port.to_string();
    let mut parts = vec![
        "docker run".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--detach".to_string(),
        "--publish".to_string(),
        format!("{port}:{port}"),
        "--env".to_string(),
        format!("PGDATA={}", spec.data_dir.display()),
        volumes.join(" "),
        "--label".to_string(),
        LABEL_CLONE.to_string(),
        "--label".to_string(),
        spec.pool_name.clone(),
        "--label".to_string(),
        format!("{LABEL_INSTANCE_ID}={}", spec.instance_id),
        container_flags.join(" "),
        spec.docker_image.clone(),
        "-p".to_string(),
        port,
        "-k".to_string(),
        spec.socket_dir.display().to_string(),
    ];
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

impl ContainerBackend for DockerBackend {
    fn run_container(
        &self,
        spec: &ContainerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let mut spec = spec.clone();
        Box::pin(async move {
            // Engine-level container flags apply under per-clone overrides.
            let defaults = self.config.read().unwrap().container_config.clone();
            for (flag, value) in defaults {
                spec.container_config.entry(flag).or_insert(value);
            }

            let volumes = self.build_volumes(&spec).await?;

            create_socket_clone_dir(&spec.socket_dir)
                .map_err(|e| e.backend_context("failed to create socket clone directory"))?;

            let cmd = build_run_command(&spec, &volumes);
            self.runner
                .run(&cmd, true)
                .await
                .map_err(|e| e.backend_context("failed to run container"))?;

            Ok(())
        })
    }

    fn stop_container(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let cmd = format!("docker container stop {name}");
            self.runner
                .run(&cmd, false)
                .await
                .map_err(|e| e.backend_context("failed to stop container"))?;
            Ok(())
        })
    }

    fn remove_container(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let cmd = format!("docker container rm --force --volumes {name}");
            self.runner
                .run(&cmd, false)
                .await
                .map_err(|e| e.backend_context("failed to remove container"))?;
            Ok(())
        })
    }

    fn container_running(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<bool>, EngineError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let cmd = format!("docker container inspect -f '{{{{.State.Running}}}}' {name}");
            match self.runner.run(&cmd, false).await {
                Ok(out) => Ok(Some(out.trim() == "true")),
                Err(EngineError::CommandFailed { .. }) => Ok(None),
                Err(e) => Err(e.backend_context("failed to inspect container")),
            }
        })
    }

    fn list_containers(
        &self,
        pool_label: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, EngineError>> + Send + '_>> {
        let pool_label = pool_label.to_string();
        Box::pin(async move {
            let cmd = format!(
                "docker container ls --filter \"label={LABEL_CLONE}\" \
                 --filter \"label={pool_label}\" \
                 --filter \"label={LABEL_INSTANCE_ID}={}\" \
                 --all --format '{{{{.Names}}}}'",
                self.instance_id
            );

            let out = self
                .runner
                .run(&cmd, false)
                .await
                .map_err(|e| e.backend_context("failed to list containers"))?;

            Ok(out
                .trim()
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect())
        })
    }

    fn logs(
        &self,
        name: &str,
        since_minutes: u64,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let cmd = format!("docker logs {name} --since {since_minutes}m --timestamps");
            self.runner
                .run(&cmd, true)
                .await
                .map_err(|e| e.backend_context("failed to get container logs"))
        })
    }

    fn exec(
        &self,
        name: &str,
        cmd: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>> {
        let line = format!("docker exec {name} {cmd}");
        Box::pin(async move { self.runner.run(&line, true).await })
    }

    fn image_exists(
        &self,
        image: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EngineError>> + Send + '_>> {
        let image = image.to_string();
        Box::pin(async move {
            let cmd = format!("docker images {image} --quiet");
            let out = self
                .runner
                .run(&cmd, true)
                .await
                .map_err(|e| e.backend_context("failed to list images"))?;
            Ok(!out.trim().is_empty())
        })
    }

    fn pull_image(
        &self,
        image: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let image = image.to_string();
        Box::pin(async move {
            let cmd = format!("docker pull {image}");
            self.runner
                .run(&cmd, true)
                .await
                .map_err(|e| e.backend_context("failed to pull image"))?;
            Ok(())
        })
    }

    fn stop_control_containers(
        &self,
        instance_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            let list_cmd = format!(
                "docker container ls --filter \"label={LABEL_CONTROL}\" \
                 --filter \"label={LABEL_INSTANCE_ID}={instance_id}\" --all --quiet"
            );
            let out = self
                .runner
                .run(&list_cmd, false)
                .await
                .map_err(|e| e.backend_context("failed to list control containers"))?;

            for id in out.trim().lines().filter(|l| !l.trim().is_empty()) {
                let stop_cmd = format!("docker container stop {}", id.trim());
                if let Err(e) = self.runner.run(&stop_cmd, false).await {
                    tracing::warn!(container = %id, error = %e, "Failed to stop control container");
                }
            }
            Ok(())
        })
    }

    fn reload(&self, config: ProvisionConfig) {
        *self.config.write().unwrap() = config;
    }
}
