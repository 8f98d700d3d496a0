//! Periodic status syncer.
//!
//! Recomputes every cluster's status from asynchronous signals: dependency
//! probes, workload rollout facts, and the rolling-update graph. Clusters are
//! bucketed into a fast resync loop (unhealthy or mid-update) and a slow loop
//! (healthy and fully updated), biasing attention toward clusters that need
//! it. A separate loop republishes per-health-bucket gauges.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::controller::component::{Component, enabled_components};
use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::deploy_status::{aggregate_deploy_status, list_owned_deployments};
use crate::controller::error::Result;
use crate::crd::{
    CONDITION_META_STORE, CONDITION_MSG_STREAM, CONDITION_OBJECT_STORAGE, CONDITION_READY,
    CONDITION_UPDATED, ClusterCondition, ClusterHealth, ComponentDeployStatus, DatabaseCluster,
    DatabaseClusterStatus, ImageUpdateMode,
};
use crate::resources::common::{cluster_selector, deploy_name};

/// Resync interval for unhealthy or mid-update clusters.
pub const FAST_RESYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Resync interval for healthy, fully updated clusters.
pub const SLOW_RESYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Interval for republishing health-bucket gauges.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Reasons attached to the Ready and Updated conditions.
pub const REASON_COMPONENTS_READY: &str = "ComponentsReady";
pub const REASON_COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
pub const REASON_ALL_UPDATED: &str = "AllComponentsUpdated";
pub const REASON_COMPONENTS_UPDATING: &str = "ComponentsUpdating";
pub const REASON_UPGRADING: &str = "Upgrading";
pub const REASON_DOWNGRADING: &str = "Downgrading";
pub const REASON_UPDATE_DISABLED: &str = "ImageUpdateDisabled";

/// Health transition function, recomputed every cycle. Stop intent always
/// wins; a cluster that has never been ready stays Pending rather than
/// flapping to Unhealthy; a stopped cluster resumes through Pending.
pub fn health(last: ClusterHealth, is_healthy: bool, is_stopping: bool) -> ClusterHealth {
    if is_stopping {
        return ClusterHealth::Stopped;
    }
    if is_healthy {
        return ClusterHealth::Healthy;
    }
    match last {
        ClusterHealth::Pending | ClusterHealth::Stopped => ClusterHealth::Pending,
        _ => ClusterHealth::Unhealthy,
    }
}

/// First enabled component whose recorded deploy status does not yet show
/// the desired image fully rolled out.
fn first_blocking_component(
    cluster: &DatabaseCluster,
    deploy_status: &std::collections::BTreeMap<String, ComponentDeployStatus>,
) -> Option<Component> {
    let desired = &cluster.spec.components.image;
    enabled_components(cluster).iter().copied().find(|component| {
        if cluster.is_component_rolling(component.name()) {
            return true;
        }
        match deploy_status.get(component.name()) {
            None => true,
            Some(s) => s.image != *desired || !s.is_ready(),
        }
    })
}

/// Ready condition: every enabled component reports a complete rollout.
pub fn ready_condition(
    cluster: &DatabaseCluster,
    deploy_status: &std::collections::BTreeMap<String, ComponentDeployStatus>,
) -> ClusterCondition {
    let not_ready: Vec<&str> = enabled_components(cluster)
        .iter()
        .copied()
        .filter(|c| {
            deploy_status
                .get(c.name())
                .map(|s| !s.is_ready())
                .unwrap_or(true)
        })
        .map(|c| c.name())
        .collect();
    if not_ready.is_empty() {
        ClusterCondition::new(
            CONDITION_READY,
            true,
            REASON_COMPONENTS_READY,
            "all components are ready",
        )
    } else {
        ClusterCondition::new(
            CONDITION_READY,
            false,
            REASON_COMPONENTS_NOT_READY,
            &format!("components not ready: [{}]", not_ready.join(", ")),
        )
    }
}

/// Updated condition: whether every enabled component runs the desired image
/// with a complete rollout. The message names the component blocking an
/// in-progress change; the reason distinguishes initial creation from an
/// upgrade or downgrade in flight.
pub fn updated_condition(
    cluster: &DatabaseCluster,
    status: &DatabaseClusterStatus,
) -> ClusterCondition {
    if cluster.spec.components.image_update_mode == ImageUpdateMode::Disabled {
        return ClusterCondition::new(
            CONDITION_UPDATED,
            true,
            REASON_UPDATE_DISABLED,
            "image updates are disabled",
        );
    }
    let desired = &cluster.spec.components.image;
    match first_blocking_component(cluster, &status.components_deploy_status) {
        None => ClusterCondition::new(
            CONDITION_UPDATED,
            true,
            REASON_ALL_UPDATED,
            &format!("all components are running image {}", desired),
        ),
        Some(blocking) => {
            let rolled_out = &status.current_image;
            let reason = if rolled_out.is_empty() || rolled_out == desired {
                REASON_COMPONENTS_UPDATING
            } else if cluster.spec.components.image_update_mode
                == ImageUpdateMode::RollingDowngrade
            {
                REASON_DOWNGRADING
            } else {
                REASON_UPGRADING
            };
            ClusterCondition::new(
                CONDITION_UPDATED,
                false,
                reason,
                &format!(
                    "component {} is updating to image {}",
                    blocking.name(),
                    desired
                ),
            )
        }
    }
}

/// Stop detection: every enabled component is explicitly scaled to zero and
/// no owned pod is still running. Terminating pods count as stopping.
pub fn is_stopping(cluster: &DatabaseCluster, pods: &[Pod]) -> bool {
    if !cluster.spec.is_stop_intended(enabled_components(cluster)) {
        return false;
    }
    pods.iter()
        .all(|p| p.metadata.deletion_timestamp.is_some())
}

/// Whether the cluster belongs in the fast resync bucket.
pub fn needs_fast_resync(cluster: &DatabaseCluster) -> bool {
    let Some(status) = cluster.status.as_ref() else {
        return true;
    };
    status.status != ClusterHealth::Healthy || !status.is_condition_true(CONDITION_UPDATED)
}

/// Count clusters per health bucket. Every bucket appears, so gauges for
/// empty buckets reset to zero.
pub fn count_health_buckets(clusters: &[DatabaseCluster]) -> HashMap<ClusterHealth, i64> {
    let mut counts: HashMap<ClusterHealth, i64> = [
        (ClusterHealth::Pending, 0),
        (ClusterHealth::Healthy, 0),
        (ClusterHealth::Unhealthy, 0),
        (ClusterHealth::Stopped, 0),
        (ClusterHealth::Deleting, 0),
    ]
    .into_iter()
    .collect();
    for cluster in clusters {
        let bucket = if cluster.metadata.deletion_timestamp.is_some() {
            ClusterHealth::Deleting
        } else {
            cluster
                .status
                .as_ref()
                .map(|s| s.status)
                .unwrap_or_default()
        };
        *counts.entry(bucket).or_insert(0) += 1;
    }
    counts
}

/// Drives the periodic status recomputation for all clusters.
#[derive(Clone)]
pub struct StatusSyncer {
    ctx: Context,
    fast_interval: Duration,
    slow_interval: Duration,
    metrics_interval: Duration,
}

impl StatusSyncer {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            fast_interval: FAST_RESYNC_INTERVAL,
            slow_interval: SLOW_RESYNC_INTERVAL,
            metrics_interval: METRICS_INTERVAL,
        }
    }

    /// Run the fast, slow, and metrics loops until the process exits.
    pub async fn run(self) {
        let fast = self.clone().resync_loop(self.fast_interval, true);
        let slow = self.clone().resync_loop(self.slow_interval, false);
        let metrics = self.clone().metrics_loop();
        tokio::join!(fast, slow, metrics);
    }

    async fn resync_loop(self, interval: Duration, fast: bool) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let clusters = match self.list_clusters().await {
                Ok(clusters) => clusters,
                Err(e) => {
                    warn!(error = %e, fast, "Failed to list clusters for resync");
                    continue;
                }
            };
            let batch: Vec<DatabaseCluster> = clusters
                .into_iter()
                .filter(|c| needs_fast_resync(c) == fast)
                .collect();
            debug!(count = batch.len(), fast, "Resyncing cluster statuses");

            // A failed cycle affects only its own cluster; errors are logged
            // per task so one bad cluster cannot abort the batch.
            let syncer = &self;
            let tasks: Vec<BoxFuture<'_, ()>> = batch
                .iter()
                .map(|cluster| {
                    let fut: BoxFuture<'_, ()> = Box::pin(async move {
                        if let Err(e) = syncer.sync_cluster(cluster).await {
                            warn!(
                                cluster = %cluster.name_any(),
                                error = %e,
                                "Status sync failed"
                            );
                            if let Some(state) = syncer.ctx.health_state.as_ref() {
                                state.metrics.record_sync_error(
                                    cluster.metadata.namespace.as_deref().unwrap_or_default(),
                                    &cluster.name_any(),
                                );
                            }
                        }
                    });
                    fut
                })
                .collect();
            self.ctx.runner.run_with_result(tasks).await;
        }
    }

    async fn metrics_loop(self) {
        let mut ticker = tokio::time::interval(self.metrics_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let clusters = match self.list_clusters().await {
                Ok(clusters) => clusters,
                Err(e) => {
                    warn!(error = %e, "Failed to list clusters for metrics");
                    continue;
                }
            };
            if let Some(state) = self.ctx.health_state.as_ref() {
                for (bucket, count) in count_health_buckets(&clusters) {
                    state
                        .metrics
                        .set_clusters_by_health(&bucket.to_string(), count);
                }
            }
        }
    }

    async fn list_clusters(&self) -> Result<Vec<DatabaseCluster>> {
        let api: Api<DatabaseCluster> = Api::all(self.ctx.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Run one status cycle for a cluster: fan out dependency conditions,
    /// aggregate deploy status, compute the Ready and Updated conditions,
    /// mirror the ingress, fold everything into the health bucket, and
    /// persist through the status subresource only.
    pub async fn sync_cluster(&self, cluster: &DatabaseCluster) -> Result<()> {
        if cluster.metadata.deletion_timestamp.is_some() {
            // The reconciler owns the Deleting transition.
            return Ok(());
        }
        let mut status = cluster.status.clone().unwrap_or_default();

        // (a) Dependency conditions, fanned out with bounded concurrency.
        // Results come back in submission order.
        let getter = &self.ctx.conditions;
        let tasks: Vec<BoxFuture<'_, ClusterCondition>> = vec![
            Box::pin(getter.meta_store_condition(cluster)),
            Box::pin(getter.object_storage_condition(cluster)),
            Box::pin(getter.msg_stream_condition(cluster)),
        ];
        for condition in self.ctx.runner.run_with_result(tasks).await {
            status.set_condition(condition);
        }

        // (b) Deploy-status aggregation from owned workloads.
        let deployments = list_owned_deployments(&self.ctx.client, cluster).await?;
        status.components_deploy_status = aggregate_deploy_status(&deployments);

        status.set_condition(ready_condition(cluster, &status.components_deploy_status));

        // (c) Updated condition; a completed rollout advances currentImage.
        let updated = updated_condition(cluster, &status);
        let rollout_complete = updated.is_true() && updated.reason == REASON_ALL_UPDATED;
        status.set_condition(updated);
        if rollout_complete && status.current_image != cluster.spec.components.image {
            info!(
                cluster = %cluster.name_any(),
                image = %cluster.spec.components.image,
                "Image rollout complete"
            );
            status.current_image = cluster.spec.components.image.clone();
        }

        // (d) Ingress mirror; not-found is a no-op.
        if cluster.spec.components.ingress.is_some() {
            status.ingress = self.ingress_status(cluster).await?;
        }

        // (e) Fold into the health bucket and persist status-only.
        let is_healthy = [
            CONDITION_META_STORE,
            CONDITION_OBJECT_STORAGE,
            CONDITION_MSG_STREAM,
            CONDITION_READY,
        ]
        .iter()
        .all(|t| status.is_condition_true(t));
        let pods = self.list_owned_pods(cluster).await?;
        status.status = health(status.status, is_healthy, is_stopping(cluster, &pods));
        status.observed_generation = cluster.metadata.generation;

        self.patch_status(cluster, &status).await
    }

    async fn ingress_status(
        &self,
        cluster: &DatabaseCluster,
    ) -> Result<Option<k8s_openapi::api::networking::v1::IngressStatus>> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Ingress> = Api::namespaced(self.ctx.client.clone(), namespace);
        // The ingress fronts the client-facing component of the mode.
        let front = crate::resources::ingress::front_component(cluster);
        Ok(api
            .get_opt(&deploy_name(cluster, front))
            .await?
            .and_then(|ingress| ingress.status))
    }

    async fn list_owned_pods(&self, cluster: &DatabaseCluster) -> Result<Vec<Pod>> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Pod> = Api::namespaced(self.ctx.client.clone(), namespace);
        let params = ListParams::default().labels(&cluster_selector(cluster));
        Ok(api.list(&params).await?.items)
    }

    async fn patch_status(
        &self,
        cluster: &DatabaseCluster,
        status: &DatabaseClusterStatus,
    ) -> Result<()> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<DatabaseCluster> = Api::namespaced(self.ctx.client.clone(), namespace);
        api.patch_status(
            &cluster.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(json!({
                "apiVersion": "databases.example.com/v1alpha1",
                "kind": "DatabaseCluster",
                "status": status,
            })),
        )
        .await?;
        Ok(())
    }
}
