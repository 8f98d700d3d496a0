//! Reconciliation loop for DatabaseCluster.
//!
//! Drives the full lifecycle of a cluster CR: finalizer management,
//! dependency installs, per-component workload convergence, and an
//! immediate status cycle after each pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use crate::{
    controller::{
        component::{enabled_components, verify_acyclic},
        context::{Context, FIELD_MANAGER},
        deployment_updater::{DeploymentUpdater, update_deployment},
        error::Error,
        installer::reconcile_dependencies,
        status_syncer::StatusSyncer,
    },
    crd::{ClusterHealth, DatabaseCluster},
    resources,
};

/// Finalizer name for graceful deletion
pub const FINALIZER: &str = "databases.example.com/finalizer";

/// Reconcile a DatabaseCluster
///
/// This is the main reconciliation function called by the controller.
/// It handles the full lifecycle: creation, updates, and deletion.
pub async fn reconcile(obj: Arc<DatabaseCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling DatabaseCluster");

    let api: Api<DatabaseCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    // Handle deletion
    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &namespace).await;
    }

    // Ensure finalizer is present
    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        info!(name = %name, "Adding finalizer");
        add_finalizer(&api, &obj).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // The rolling-update graph must stay a DAG; a cycle would deadlock every
    // image change.
    if let Err(e) = verify_acyclic() {
        error!(name = %name, error = %e, "Dependency graph validation failed");
        ctx.publish_warning_event(&obj, "ValidationFailed", "Validating", Some(e.to_string()))
            .await;
        return Err(e);
    }

    // Install or update managed third-party dependencies; a no-op when the
    // deployed values already match.
    reconcile_dependencies(ctx.installer.as_ref(), &obj).await?;

    // Converge every enabled component workload.
    for component in enabled_components(&obj).iter().copied() {
        let deploy_name = resources::common::deploy_name(&obj, component);
        let deploy_api: Api<k8s_openapi::api::apps::v1::Deployment> =
            Api::namespaced(ctx.client.clone(), &namespace);

        let existing = deploy_api.get_opt(&deploy_name).await?;
        let is_new = existing.is_none();
        let mut deployment = existing
            .unwrap_or_else(|| resources::common::new_component_deployment(&obj, component));

        let mut updater = DeploymentUpdater::new(&obj, component);
        if let Ok(image) = std::env::var("CONFIG_TOOL_IMAGE") {
            updater = updater.with_tool_image(&image);
        }
        let changed = update_deployment(&mut deployment, &updater)?;
        if !changed && !is_new {
            continue;
        }
        // Server-side apply keeps the write idempotent for create and update.
        deployment.metadata.managed_fields = None;
        deploy_api
            .patch(
                &deploy_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&deployment),
            )
            .await?;
        if is_new {
            ctx.publish_normal_event(
                &obj,
                "ComponentCreated",
                "CreateResources",
                Some(format!("Created component workload {}", deploy_name)),
            )
            .await;
        }
        debug!(name = %name, component = component.name(), "Applied component workload");
    }

    // Client-facing ingress, when configured.
    if let Some(ingress) = resources::ingress::desired_ingress(&obj)? {
        let ingress_name = ingress.name_any();
        let ingress_api: Api<k8s_openapi::api::networking::v1::Ingress> =
            Api::namespaced(ctx.client.clone(), &namespace);
        ingress_api
            .patch(
                &ingress_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&ingress),
            )
            .await?;
        debug!(name = %name, ingress = %ingress_name, "Applied ingress");
    }

    // Fold the freshly converged state into status right away instead of
    // waiting for the next periodic resync.
    let syncer = StatusSyncer::new((*ctx).clone());
    syncer.sync_cluster(&obj).await?;

    // Record metrics
    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
        health_state.last_reconcile.store(
            jiff::Timestamp::now().as_second() as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
    }

    let current_health = obj
        .status
        .as_ref()
        .map(|s| s.status)
        .unwrap_or(ClusterHealth::Pending);
    Ok(Action::requeue(requeue_for(current_health)))
}

/// Requeue interval per health bucket: settled clusters wait longer.
fn requeue_for(health: ClusterHealth) -> Duration {
    match health {
        ClusterHealth::Healthy => Duration::from_secs(60),
        ClusterHealth::Stopped => Duration::from_secs(60),
        _ => Duration::from_secs(30),
    }
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<DatabaseCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    // Record error metric
    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Cluster not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(Duration::from_secs(300))
    }
}

/// Handle deletion of a DatabaseCluster
async fn handle_deletion(
    obj: &DatabaseCluster,
    ctx: &Context,
    namespace: &str,
) -> Result<Action, Error> {
    let name = obj.name_any();
    info!(name = %name, "Handling deletion");

    let api: Api<DatabaseCluster> = Api::namespaced(ctx.client.clone(), namespace);

    // Surface the Deleting bucket while the finalizer is still held. Owned
    // workloads are garbage collected via owner references.
    if obj
        .status
        .as_ref()
        .map(|s| s.status != ClusterHealth::Deleting)
        .unwrap_or(true)
    {
        let patch = serde_json::json!({
            "status": { "status": ClusterHealth::Deleting }
        });
        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
    }

    remove_finalizer(&api, obj).await?;
    ctx.publish_normal_event(obj, "Deleted", "Deleting", None).await;

    Ok(Action::await_change())
}

/// Our finalizer appended to the object's current list, without duplicates.
fn finalizers_with(obj: &DatabaseCluster) -> Vec<String> {
    let mut finalizers = obj.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == FINALIZER) {
        finalizers.push(FINALIZER.to_string());
    }
    finalizers
}

/// The object's current finalizer list with ours removed. Finalizers held by
/// other controllers stay untouched.
fn finalizers_without(obj: &DatabaseCluster) -> Vec<String> {
    obj.finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect()
}

/// Merge patch replacing the finalizer list, fenced with the observed
/// resourceVersion so a concurrent writer turns this into a retryable
/// conflict instead of a lost update.
fn finalizer_patch(obj: &DatabaseCluster, finalizers: Vec<String>) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "finalizers": finalizers });
    if let Some(rv) = obj.resource_version() {
        metadata["resourceVersion"] = serde_json::Value::String(rv);
    }
    serde_json::json!({ "metadata": metadata })
}

/// Add our finalizer to the resource
async fn add_finalizer(api: &Api<DatabaseCluster>, obj: &DatabaseCluster) -> Result<(), Error> {
    let patch = finalizer_patch(obj, finalizers_with(obj));
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Remove our finalizer from the resource
async fn remove_finalizer(api: &Api<DatabaseCluster>, obj: &DatabaseCluster) -> Result<(), Error> {
    let patch = finalizer_patch(obj, finalizers_without(obj));
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DatabaseClusterSpec;

    fn cluster_with_finalizers(finalizers: &[&str]) -> DatabaseCluster {
        let mut cluster = DatabaseCluster::new("db", DatabaseClusterSpec::default());
        cluster.metadata.namespace = Some("ns".to_string());
        cluster.metadata.resource_version = Some("42".to_string());
        if !finalizers.is_empty() {
            cluster.metadata.finalizers =
                Some(finalizers.iter().map(|f| f.to_string()).collect());
        }
        cluster
    }

    #[test]
    fn test_finalizer_add_preserves_foreign_entries() {
        let cluster = cluster_with_finalizers(&["other.io/keep"]);
        assert_eq!(
            finalizers_with(&cluster),
            vec!["other.io/keep".to_string(), FINALIZER.to_string()]
        );

        // Already present: no duplicate.
        let cluster = cluster_with_finalizers(&["other.io/keep", FINALIZER]);
        assert_eq!(finalizers_with(&cluster).len(), 2);
    }

    #[test]
    fn test_finalizer_removal_keeps_foreign_entries() {
        let cluster = cluster_with_finalizers(&["other.io/keep", FINALIZER]);
        assert_eq!(
            finalizers_without(&cluster),
            vec!["other.io/keep".to_string()]
        );
    }

    #[test]
    fn test_finalizer_removal_patch_builds_a_valid_request() {
        let cluster = cluster_with_finalizers(&[FINALIZER]);
        let patch = finalizer_patch(&cluster, finalizers_without(&cluster));
        assert_eq!(patch["metadata"]["resourceVersion"], "42");

        // Merge patches must not carry force; kube rejects that combination
        // before the request reaches the API server.
        let request = kube::core::Request::new(
            "/apis/databases.example.com/v1alpha1/namespaces/ns/databaseclusters",
        )
        .patch("db", &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch));
        assert!(request.is_ok());
    }

    #[test]
    fn test_requeue_intervals() {
        assert_eq!(requeue_for(ClusterHealth::Healthy), Duration::from_secs(60));
        assert_eq!(requeue_for(ClusterHealth::Stopped), Duration::from_secs(60));
        assert_eq!(requeue_for(ClusterHealth::Pending), Duration::from_secs(30));
        assert_eq!(
            requeue_for(ClusterHealth::Unhealthy),
            Duration::from_secs(30)
        );
    }
}
