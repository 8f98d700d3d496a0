//! Shared context for the controller.
//!
//! The Context struct holds the services the reconciler and status syncer
//! share: the Kubernetes client, the dependency installer seam, the probe
//! cache, the bounded fan-out runner, and the event recorder.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::controller::conditions::ConditionGetter;
use crate::controller::installer::DependencyInstaller;
use crate::controller::runner::GroupRunner;
use crate::crd::DatabaseCluster;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "dbcluster-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Install/query seam for managed third-party dependencies
    pub installer: Arc<dyn DependencyInstaller>,
    /// Cached, single-flighted dependency condition computation
    pub conditions: ConditionGetter,
    /// Bounded fan-out runner shared by the status syncer loops
    pub runner: GroupRunner,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        installer: Arc<dyn DependencyInstaller>,
        conditions: ConditionGetter,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            installer,
            conditions,
            runner: GroupRunner::default(),
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for a cluster
    pub async fn publish_normal_event(
        &self,
        cluster: &DatabaseCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = cluster.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a warning event for a cluster
    pub async fn publish_warning_event(
        &self,
        cluster: &DatabaseCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = cluster.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish warning event");
        }
    }
}
