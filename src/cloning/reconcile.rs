//! Startup reconciliation: aligns the persisted registry with the
//! filesystem datasets and the container engine. Clones whose dataset and
//! container both survive are re-adopted; a missing container is re-launched
//! over the surviving dataset; a missing dataset is fatal. Datasets and
//! containers carrying the engine's labels but unknown to the registry are
//! destroyed as orphans, and interrupted destroys are completed.

use crate::cloning::CloningService;
use crate::error::EngineError;
use crate::models::{CloneStatus, CLONE_CONTAINER_PREFIX};
use crate::provision::wait_for_postgres;
use std::collections::HashSet;

pub(crate) async fn reconcile(svc: &CloningService) -> Result<(), EngineError> {
    let fsm = svc.pools().active()?;
    let pool = svc.pools().active_pool()?;

    let datasets: HashSet<String> = fsm.list_clone_names().await?.into_iter().collect();

    for clone in svc.registry().list_clones() {
        let lock = svc.lock_for(&clone.id);
        let _guard = lock.lock().await;

        // An interrupted destroy is completed, not resurrected.
        if clone.status == CloneStatus::Deleting {
            tracing::info!(clone_id = %clone.id, "Completing interrupted destroy");
            if let Err(e) = svc.destroy_locked(&clone).await {
                tracing::warn!(clone_id = %clone.id, error = %e, "Failed to complete interrupted destroy");
            }
            continue;
        }

        if !datasets.contains(&clone.id) {
            tracing::error!(clone_id = %clone.id, "Clone dataset is missing");
            svc.registry().set_clone_status(
                &clone.id,
                CloneStatus::Fatal,
                Some("clone dataset is missing".into()),
            )?;
            continue;
        }

        if let Err(e) = svc.claim_port(clone.port) {
            tracing::warn!(clone_id = %clone.id, port = clone.port, error = %e, "Port already claimed");
        }

        let spec = svc.container_spec(&clone, &pool);
        let (retries, interval) = svc.healthcheck_budget();

        let running = svc.containers().container_running(&spec.name).await?;
        let healthy = match running {
            Some(true) => {
                wait_for_postgres(svc.containers().as_ref(), &spec, retries, interval)
                    .await
                    .is_ok()
            }
            _ => false,
        };

        if healthy {
            tracing::info!(clone_id = %clone.id, "Clone re-adopted");
            svc.registry()
                .set_clone_status(&clone.id, CloneStatus::Ready, None)?;
            continue;
        }

        // Dataset survived but the container is gone or unresponsive:
        // re-launch over the existing mount.
        if running.is_some() {
            if let Err(e) = svc.containers().remove_container(&spec.name).await {
                tracing::warn!(clone_id = %clone.id, error = %e, "Failed to remove stale container");
            }
        }

        let relaunch = async {
            svc.containers().run_container(&spec).await?;
            wait_for_postgres(svc.containers().as_ref(), &spec, retries, interval).await
        };

        match relaunch.await {
            Ok(()) => {
                tracing::info!(clone_id = %clone.id, "Clone container re-launched");
                svc.registry()
                    .set_clone_status(&clone.id, CloneStatus::Ready, None)?;
            }
            Err(e) => {
                tracing::error!(clone_id = %clone.id, error = %e, "Failed to re-launch clone container");
                svc.registry().set_clone_status(
                    &clone.id,
                    CloneStatus::Fatal,
                    Some(e.to_string()),
                )?;
            }
        }
    }

    // Orphan datasets: clone datasets with no registry entry.
    for dataset in &datasets {
        if svc.registry().get_clone(dataset).is_none() {
            tracing::info!(dataset = %dataset, "Destroying orphan clone dataset");
            if let Err(e) = fsm.destroy_user_clone(dataset).await {
                tracing::warn!(dataset = %dataset, error = %e, "Failed to destroy orphan dataset");
            }
        }
    }

    // Orphan containers: labeled with this engine's instance id but unknown
    // to the registry.
    let containers = svc.containers().list_containers(&pool.name).await?;
    for name in containers {
        let Some(clone_id) = name.strip_prefix(CLONE_CONTAINER_PREFIX) else {
            continue;
        };
        if svc.registry().get_clone(clone_id).is_none() {
            tracing::info!(container = %name, "Removing orphan clone container");
            if let Err(e) = svc.containers().remove_container(&name).await {
                tracing::warn!(container = %name, error = %e, "Failed to remove orphan container");
            }
        }
    }

    Ok(())
}
