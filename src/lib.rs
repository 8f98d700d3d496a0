//! dbcluster-operator library crate
//!
//! This module exports the controller, CRD definitions, and resource
//! helpers.

pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::conditions::{ConditionGetter, TcpProbe};
use controller::context::Context;
use controller::endpoint_cache::EndpointCheckCache;
use controller::installer::NullInstaller;
use controller::reconciler::reconcile;
use crd::DatabaseCluster;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Build the default service wiring: TCP dependency probes through a shared
/// single-flight cache, and no managed dependency installer. Tests and
/// alternative binaries substitute their own installer or probe.
pub fn build_context(client: Client, health_state: Option<Arc<HealthState>>) -> Context {
    let cache = Arc::new(EndpointCheckCache::new());
    let conditions = ConditionGetter::new(cache, Arc::new(TcpProbe));
    Context::new(client, Arc::new(NullInstaller), conditions, health_state)
}

/// Create the default watcher configuration for all controllers.
///
/// `any_semantic()` gives more reliable resource discovery in test
/// environments.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via generation predicate
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Run the operator controller (cluster-wide).
///
/// This is the main controller loop that watches DatabaseCluster resources
/// and reconciles them. It can be called from main.rs or spawned as a
/// background task during integration tests.
pub async fn run_controller(ctx: Context) {
    run_controller_scoped(ctx, None).await
}

/// Run the operator controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
///
/// Use the scoped version for integration tests to enable parallel test
/// execution.
pub async fn run_controller_scoped(ctx: Context, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!(
        "Starting controller for DatabaseCluster resources (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = ctx.health_state {
        state.set_ready(true).await;
    }

    let client = ctx.client.clone();
    let ctx = Arc::new(ctx);

    // Set up APIs for the controller (namespaced or cluster-wide)
    let clusters: Api<DatabaseCluster> = scoped_api(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped_api(client.clone(), namespace);
    let ingresses: Api<Ingress> = scoped_api(client.clone(), namespace);

    // Use consistent watcher configuration across all controllers
    let watcher_config = default_watcher_config();

    // Create filtered stream with standard optimizations (reflector, backoff,
    // generation predicate)
    let (reader, cluster_stream) = create_filtered_stream(clusters, watcher_config.clone());

    // Deployments need a full watcher since the deploy-status aggregation
    // reads their status; the ingress mirror only needs to know the object
    // changed, so a metadata watcher is enough.
    Controller::for_stream(cluster_stream, reader)
        .owns(deployments, watcher_config.clone())
        .owns_stream(metadata_watcher(ingresses, watcher_config).touched_objects())
        .run(reconcile, controller::reconciler::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // ObjectNotFound/NotFound errors are expected after
                    // deletion when related watch events trigger
                    // reconciliation for a deleted object.
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    error!("Controller stream ended unexpectedly");
}
