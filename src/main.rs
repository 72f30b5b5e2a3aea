use dblab_engine::cloning::CloningService;
use dblab_engine::config::Config;
use dblab_engine::observer::Observer;
use dblab_engine::pool::{ManagerFactory, PoolManager};
use dblab_engine::provision::docker::DockerBackend;
use dblab_engine::provision::ContainerBackend;
use dblab_engine::registry::Registry;
use dblab_engine::reload::ReloadCoordinator;
use dblab_engine::runner::{CommandRunner, LocalRunner};
use dblab_engine::thinclone::zfs::{ZfsConfig, ZfsManager};
use dblab_engine::thinclone::ThinCloneManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dblab_engine=info")),
        )
        .init();

    let config = Config::from_env();
    config.validate()?;

    tracing::info!(
        instance_id = %config.global.instance_id,
        engine = %config.global.engine,
        "Starting Database Lab Engine"
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(LocalRunner::new(
        config.provision.use_sudo,
        Duration::from_secs(config.provision.command_timeout_secs),
    ));

    let pools = Arc::new(PoolManager::new(
        config.pools.clone(),
        zfs_factory(runner.clone(), &config),
    ));
    pools.discover().await?;

    let registry = Arc::new(Registry::new());
    let containers: Arc<dyn ContainerBackend> = Arc::new(DockerBackend::new(
        runner.clone(),
        config.provision.clone(),
        &config.global.instance_id,
    ));

    let (unwatch_tx, mut unwatch_rx) = mpsc::unbounded_channel();

    let cloning = CloningService::new(
        config.global.clone(),
        config.cloning.clone(),
        config.provision.clone(),
        registry.clone(),
        pools.clone(),
        containers.clone(),
        unwatch_tx,
    );

    // Load persisted state and reconcile with the filesystem and containers.
    cloning.run().await?;

    let observer = Observer::new(
        containers.clone(),
        pools.clone(),
        registry.clone(),
        config.observer.clone(),
    );

    // Clones leaving the ready state take their observation sessions down.
    {
        let observer = observer.clone();
        tokio::spawn(async move {
            while let Some(clone_id) = unwatch_rx.recv().await {
                observer.remove_observing_clone(&clone_id).await;
            }
        });
    }

    tokio::spawn(cloning.clone().run_idle_scan());

    let coordinator = ReloadCoordinator::new(
        pools.clone(),
        containers.clone(),
        cloning.clone(),
        observer.clone(),
        registry.clone(),
    );
    tokio::spawn(reload_listener(coordinator));

    tracing::info!("Database Lab Engine is running");
    shutdown_signal().await;

    let deadline = Duration::from_secs(config.global.shutdown_timeout_secs);
    if tokio::time::timeout(
        deadline,
        shutdown_engine(&observer, &cloning, containers.as_ref(), &config),
    )
    .await
    .is_err()
    {
        tracing::warn!("Shutdown deadline exceeded");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn zfs_factory(runner: Arc<dyn CommandRunner>, config: &Config) -> ManagerFactory {
    let pre_snapshot_suffix = config.pools.pre_snapshot_suffix.clone();
    let os_username = config.provision.os_username.clone();
    Box::new(move |pool| {
        Arc::new(ZfsManager::new(
            runner.clone(),
            ZfsConfig {
                pool: pool.clone(),
                pre_snapshot_suffix: pre_snapshot_suffix.clone(),
                os_username: os_username.clone(),
            },
        )) as Arc<dyn ThinCloneManager>
    })
}

/// Deadline-bounded teardown: flush observer artifacts, persist the
/// registry, stop control containers. User clone containers stay running so
/// they outlive engine restarts; reconciliation re-adopts them.
async fn shutdown_engine(
    observer: &Observer,
    cloning: &CloningService,
    containers: &dyn ContainerBackend,
    config: &Config,
) {
    tracing::info!("Flushing observation sessions");
    observer.flush_all().await;

    tracing::info!("Saving state of running clones");
    if let Err(e) = cloning.save_state() {
        tracing::error!(error = %e, "Failed to save clone state");
    }

    tracing::info!("Stopping control containers");
    if let Err(e) = containers
        .stop_control_containers(&config.global.instance_id)
        .await
    {
        tracing::error!(error = %e, "Failed to stop control containers");
    }
}

async fn reload_listener(coordinator: ReloadCoordinator) {
    #[cfg(unix)]
    {
        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        while hangup.recv().await.is_some() {
            tracing::info!("Reloading configuration");
            match coordinator.reload(Config::from_env()).await {
                Ok(()) => tracing::info!("Configuration has been reloaded"),
                Err(e) => tracing::error!(error = %e, "Failed to reload configuration"),
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = coordinator;
        std::future::pending::<()>().await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}
