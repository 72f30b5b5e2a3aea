//! Configuration reload fan-out. A reload signal builds a fresh config,
//! validates every section (one invalid section rejects the whole reload),
//! then swaps the config into each service in a fixed order: pools,
//! container provisioner, cloning service, observer. In-flight operations
//! finish under the config they copied.

use crate::cloning::CloningService;
use crate::config::Config;
use crate::error::EngineError;
use crate::observer::Observer;
use crate::pool::PoolManager;
use crate::provision::ContainerBackend;
use crate::registry::Registry;
use std::collections::HashSet;
use std::sync::Arc;

pub struct ReloadCoordinator {
    pools: Arc<PoolManager>,
    containers: Arc<dyn ContainerBackend>,
    cloning: CloningService,
    observer: Observer,
    registry: Arc<Registry>,
}

impl ReloadCoordinator {
    pub fn new(
        pools: Arc<PoolManager>,
        containers: Arc<dyn ContainerBackend>,
        cloning: CloningService,
        observer: Observer,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            pools,
            containers,
            cloning,
            observer,
            registry,
        }
    }

    pub async fn reload(&self, new: Config) -> Result<(), EngineError> {
        new.validate()?;

        let in_use: HashSet<String> = self
            .registry
            .list_clones()
            .into_iter()
            .map(|c| c.pool)
            .collect();

        self.pools.reload(&new.pools, &in_use).await?;
        self.containers.reload(new.provision.clone());
        self.cloning
            .reload(new.cloning.clone(), new.provision.clone());
        self.observer.reload(new.observer.clone());

        tracing::info!("Configuration has been reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloning::testutil::engine;
    use crate::models::CreateCloneRequest;

    fn snapshots() -> Vec<(&'static str, &'static str)> {
        vec![("2020-02-20 00:00:00", "2020-02-20 00:10:00")]
    }

    fn coordinator(env: &crate::cloning::testutil::TestEngine) -> ReloadCoordinator {
        let observer = Observer::new(
            env.containers.clone(),
            env.pools.clone(),
            env.registry.clone(),
            crate::config::Config::from_env().observer,
        );
        ReloadCoordinator::new(
            env.pools.clone(),
            env.containers.clone(),
            env.svc.clone(),
            observer,
            env.registry.clone(),
        )
    }

    #[tokio::test]
    async fn test_invalid_section_rejects_whole_reload() {
        let env = engine(&snapshots()).await;
        let coordinator = coordinator(&env);

        let mut bad = crate::config::Config::from_env();
        bad.pools.pool_names = vec!["dblab_pool".into()];
        bad.provision.port_from = 9000;
        bad.provision.port_to = 8000; // invalid range

        assert!(coordinator.reload(bad).await.is_err());

        // Nothing was applied: new clones still draw from the old range.
        let clone = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap();
        assert_eq!(clone.port, 6000);
    }

    #[tokio::test]
    async fn test_reload_applies_new_port_range() {
        let env = engine(&snapshots()).await;
        let coordinator = coordinator(&env);

        let mut new = crate::config::Config::from_env();
        new.pools.pool_names = vec!["dblab_pool".into()];
        new.provision.port_from = 7000;
        new.provision.port_to = 7010;

        coordinator.reload(new).await.unwrap();

        let clone = env
            .svc
            .create_clone(CreateCloneRequest::default())
            .await
            .unwrap();
        assert_eq!(clone.port, 7000);
        assert_eq!(env.pools.active_pool().unwrap().name, "dblab_pool");
    }
}
