//! DatabaseCluster Custom Resource Definition.
//!
//! Defines the DatabaseCluster CRD for deploying and managing multi-component
//! distributed database clusters on Kubernetes. A cluster runs either as a
//! single standalone component or as a set of cooperating components (proxy,
//! coordinator, data/query/index/streaming nodes) sharing external
//! dependencies: a metadata store, object storage, and a message stream.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::networking::v1::IngressStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DatabaseCluster is a custom resource for deploying database clusters.
///
/// Example:
/// ```yaml
/// apiVersion: databases.example.com/v1alpha1
/// kind: DatabaseCluster
/// metadata:
///   name: my-cluster
/// spec:
///   mode: Cluster
///   components:
///     image: example/db:v2.5.0
///     imageUpdateMode: RollingUpgrade
///   dependencies:
///     metaStore:
///       endpoints: ["meta-0:2379"]
///     objectStorage:
///       endpoint: "storage:9000"
///     msgStream:
///       kind: Kafka
///       brokerList: ["kafka-0:9092"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "databases.example.com",
    version = "v1alpha1",
    kind = "DatabaseCluster",
    plural = "databaseclusters",
    shortname = "dbc",
    status = "DatabaseClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".status.currentImage"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    /// Deployment mode: a single standalone component or a full cluster.
    #[serde(default)]
    pub mode: ClusterMode,

    /// Component-level configuration shared by all components.
    #[serde(default)]
    pub components: ComponentsSpec,

    /// External dependency declarations.
    #[serde(default)]
    pub dependencies: DependenciesSpec,
}

/// Deployment mode of the cluster.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ClusterMode {
    /// All roles run inside one standalone component.
    #[default]
    Standalone,
    /// Each role runs as its own component workload.
    Cluster,
}

/// How image changes propagate across components.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ImageUpdateMode {
    /// Update every component at once, ignoring the dependency graph.
    All,
    /// Walk the upgrade edges of the dependency graph.
    #[default]
    RollingUpgrade,
    /// Walk the downgrade edges of the dependency graph.
    RollingDowngrade,
    /// The image is set once at creation and never changed by the operator.
    Disabled,
}

/// Shared and per-component workload configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsSpec {
    /// Desired container image for every component.
    #[serde(default)]
    pub image: String,

    /// How image changes roll across components.
    #[serde(default)]
    pub image_update_mode: ImageUpdateMode,

    /// Force-refresh the config init container image even when the pod
    /// template is otherwise unchanged.
    #[serde(default)]
    pub update_tool_image: bool,

    /// Use host networking for component pods.
    #[serde(default)]
    pub host_network: bool,

    /// DNS policy copied verbatim onto component pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,

    /// Mirror the load-balancer address of this ingress into status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mix_coord: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_node: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_node: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_node: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_node: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standalone: Option<ComponentSpec>,
}

/// Per-component workload configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Desired replica count. `-1` means externally managed (for example by
    /// an autoscaler): the operator preserves whatever is running, except a
    /// stopped workload (0) is resumed to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// User-overridden command, appended after the launcher entrypoint.
    #[serde(default)]
    pub commands: Vec<String>,

    /// Extra init containers appended after the config init container.
    #[serde(default)]
    pub init_containers: Vec<Container>,
}

/// Ingress whose load-balancer address is mirrored into status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    /// Hostname routed to the cluster's proxy or standalone service.
    #[serde(default)]
    pub host: String,

    /// Additional annotations for the ingress object.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// External dependency declarations.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependenciesSpec {
    /// Primary metadata store (endpoint list protocol).
    #[serde(default)]
    pub meta_store: MetaStoreSpec,

    /// Object storage (single endpoint protocol).
    #[serde(default)]
    pub object_storage: ObjectStorageSpec,

    /// Message stream used for log replication between components.
    #[serde(default)]
    pub msg_stream: MsgStreamSpec,
}

/// Metadata store dependency.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetaStoreSpec {
    /// True when the store is provided by the user rather than managed and
    /// probed by the operator.
    #[serde(default)]
    pub external: bool,

    /// Client endpoints, host:port.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Object storage dependency.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageSpec {
    #[serde(default)]
    pub external: bool,

    /// Storage service endpoint, host:port.
    #[serde(default)]
    pub endpoint: String,
}

/// Message stream kind, selecting the probe protocol.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum MsgStreamKind {
    /// Broker-list protocol (kafka-compatible).
    Kafka,
    /// Single-endpoint protocol (pulsar-compatible).
    Pulsar,
    /// Self-contained queue embedded in the component, no external check.
    #[default]
    Embedded,
    /// User-provided stream the operator neither manages nor probes.
    Custom,
}

/// Message stream dependency.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MsgStreamSpec {
    #[serde(default)]
    pub kind: MsgStreamKind,

    #[serde(default)]
    pub external: bool,

    /// Broker endpoints for the broker-list protocol.
    #[serde(default)]
    pub broker_list: Vec<String>,

    /// Service endpoint for the single-endpoint protocol.
    #[serde(default)]
    pub endpoint: String,

    /// Persistence for the embedded queue.
    #[serde(default)]
    pub persistence: PersistenceSpec,
}

/// Embedded queue persistence settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    #[serde(default)]
    pub enabled: bool,

    /// Reuse this PersistentVolumeClaim instead of provisioning one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_claim: Option<String>,

    /// Size of the provisioned claim (default 10Gi).
    #[serde(default = "default_storage_size")]
    pub size: String,
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

/// Status of a DatabaseCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterStatus {
    /// Aggregate health bucket.
    #[serde(default)]
    pub status: ClusterHealth,

    /// Conditions describing dependency and component state. At most one
    /// entry per type; transition time changes only when the value changes.
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// The generation most recently observed by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per-component deploy status, keyed by component name.
    #[serde(default)]
    pub components_deploy_status: BTreeMap<String, ComponentDeployStatus>,

    /// Mirror of the owned ingress load-balancer status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressStatus>,

    /// Last image fully rolled out across all components.
    #[serde(default)]
    pub current_image: String,
}

/// Aggregate health of a DatabaseCluster.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ClusterHealth {
    /// Never been ready since creation or resume.
    #[default]
    Pending,
    /// All required conditions are true.
    Healthy,
    /// Was ready before, some required condition is now false.
    Unhealthy,
    /// All components scaled to zero and no pods remain.
    Stopped,
    /// Deletion timestamp is set.
    Deleting,
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Pending => write!(f, "Pending"),
            ClusterHealth::Healthy => write!(f, "Healthy"),
            ClusterHealth::Unhealthy => write!(f, "Unhealthy"),
            ClusterHealth::Stopped => write!(f, "Stopped"),
            ClusterHealth::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Condition type for the metadata store dependency.
pub const CONDITION_META_STORE: &str = "MetaStoreReady";
/// Condition type for the object storage dependency.
pub const CONDITION_OBJECT_STORAGE: &str = "ObjectStorageReady";
/// Condition type for the message stream dependency.
pub const CONDITION_MSG_STREAM: &str = "MsgStreamReady";
/// Condition type for component readiness.
pub const CONDITION_READY: &str = "Ready";
/// Condition type for the rolling-update progress.
pub const CONDITION_UPDATED: &str = "Updated";

/// Tri-state condition status values.
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// Condition describes one observed fact about the cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition, unique within the conditions list.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    #[serde(default)]
    pub last_transition_time: String,
}

impl ClusterCondition {
    /// Create a new condition with the current timestamp.
    pub fn new(condition_type: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status { CONDITION_TRUE } else { CONDITION_FALSE }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
        }
    }

    /// Create an Unknown condition, used before the first probe completes.
    pub fn unknown(condition_type: &str, reason: &str, message: &str) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: CONDITION_UNKNOWN.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

/// Deploy status recorded for one component workload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDeployStatus {
    /// Image currently set on the workload's main container.
    #[serde(default)]
    pub image: String,

    /// Workload object generation.
    #[serde(default)]
    pub generation: i64,

    /// Generation observed by the workload controller.
    #[serde(default)]
    pub observed_generation: i64,

    /// Raw progress facts from the workload controller.
    #[serde(default)]
    pub status: DeploymentStatus,
}

/// Reason set by the workload controller once a rollout completed.
pub const NEW_REPLICA_SET_AVAILABLE: &str = "NewReplicaSetAvailable";

impl ComponentDeployStatus {
    /// Whether the recorded rollout is complete: the workload controller has
    /// observed the current generation and reports the rollout as available.
    pub fn is_ready(&self) -> bool {
        if self.observed_generation != self.generation {
            return false;
        }
        self.status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| {
                c.type_ == "Progressing"
                    && c.status == CONDITION_TRUE
                    && c.reason.as_deref() == Some(NEW_REPLICA_SET_AVAILABLE)
            })
    }
}

impl DatabaseClusterStatus {
    /// Add or update a condition. The transition time is preserved when the
    /// incoming condition carries the same value as the existing one.
    pub fn set_condition(&mut self, condition: ClusterCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            let unchanged = existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message;
            if !unchanged {
                *existing = condition;
            }
        } else {
            self.conditions.push(condition);
        }
    }

    /// Look up a condition by type.
    pub fn condition(&self, condition_type: &str) -> Option<&ClusterCondition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    /// Whether a condition of the given type exists and is true.
    pub fn is_condition_true(&self, condition_type: &str) -> bool {
        self.condition(condition_type).is_some_and(|c| c.is_true())
    }
}

/// Annotation prefix marking a component mid two-deployment rollover.
pub const COMPONENT_ROLLING_ANNOTATION: &str = "databases.example.com/component-rolling";

impl DatabaseCluster {
    /// Whether the named component is in the middle of a two-deployment
    /// rollover, which keeps the Updated condition false.
    pub fn is_component_rolling(&self, component: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&format!("{}.{}", COMPONENT_ROLLING_ANNOTATION, component)))
            .is_some_and(|v| v == "true")
    }
}

impl DatabaseClusterSpec {
    /// Stop intent: every enabled component is explicitly scaled to zero.
    pub fn is_stop_intended(&self, enabled: &[crate::controller::component::Component]) -> bool {
        !enabled.is_empty()
            && enabled.iter().all(|c| {
                self.components
                    .component(*c)
                    .and_then(|s| s.replicas)
                    .is_some_and(|r| r == 0)
            })
    }
}

impl ComponentsSpec {
    /// Per-component overrides, if declared.
    pub fn component(
        &self,
        component: crate::controller::component::Component,
    ) -> Option<&ComponentSpec> {
        use crate::controller::component::Component::*;
        match component {
            Proxy => self.proxy.as_ref(),
            MixCoord => self.mix_coord.as_ref(),
            DataNode => self.data_node.as_ref(),
            QueryNode => self.query_node.as_ref(),
            IndexNode => self.index_node.as_ref(),
            StreamingNode => self.streaming_node.as_ref(),
            Standalone => self.standalone.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentCondition;

    #[test]
    fn test_health_display() {
        assert_eq!(ClusterHealth::Pending.to_string(), "Pending");
        assert_eq!(ClusterHealth::Healthy.to_string(), "Healthy");
        assert_eq!(ClusterHealth::Unhealthy.to_string(), "Unhealthy");
        assert_eq!(ClusterHealth::Stopped.to_string(), "Stopped");
        assert_eq!(ClusterHealth::Deleting.to_string(), "Deleting");
    }

    #[test]
    fn test_health_default() {
        assert_eq!(ClusterHealth::default(), ClusterHealth::Pending);
    }

    #[test]
    fn test_set_condition_unique_per_type() {
        let mut status = DatabaseClusterStatus::default();
        status.set_condition(ClusterCondition::new(CONDITION_READY, false, "Creating", ""));
        status.set_condition(ClusterCondition::new(CONDITION_READY, true, "AllReady", ""));
        status.set_condition(ClusterCondition::new(CONDITION_META_STORE, true, "Probed", ""));

        assert_eq!(status.conditions.len(), 2);
        assert!(status.is_condition_true(CONDITION_READY));
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_unchanged() {
        let mut status = DatabaseClusterStatus::default();
        let mut first = ClusterCondition::new(CONDITION_READY, true, "AllReady", "ok");
        first.last_transition_time = "2024-01-01T00:00:00Z".to_string();
        status.set_condition(first);

        status.set_condition(ClusterCondition::new(CONDITION_READY, true, "AllReady", "ok"));
        assert_eq!(
            status.conditions[0].last_transition_time,
            "2024-01-01T00:00:00Z"
        );

        status.set_condition(ClusterCondition::new(CONDITION_READY, false, "Degraded", "x"));
        assert_ne!(
            status.conditions[0].last_transition_time,
            "2024-01-01T00:00:00Z"
        );
    }

    #[test]
    fn test_deploy_status_ready() {
        let ready = ComponentDeployStatus {
            generation: 1,
            observed_generation: 1,
            status: DeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: "Progressing".to_string(),
                    status: CONDITION_TRUE.to_string(),
                    reason: Some(NEW_REPLICA_SET_AVAILABLE.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ready.is_ready());

        let stale = ComponentDeployStatus {
            generation: 2,
            observed_generation: 1,
            status: ready.status.clone(),
            ..Default::default()
        };
        assert!(!stale.is_ready());

        let progressing = ComponentDeployStatus::default();
        assert!(!progressing.is_ready());
    }

    #[test]
    fn test_spec_serialization_round_trip() {
        let spec = DatabaseClusterSpec {
            mode: ClusterMode::Cluster,
            components: ComponentsSpec {
                image: "example/db:v2.5.0".to_string(),
                ..Default::default()
            },
            dependencies: DependenciesSpec {
                meta_store: MetaStoreSpec {
                    endpoints: vec!["meta:2379".to_string()],
                    ..Default::default()
                },
                msg_stream: MsgStreamSpec {
                    kind: MsgStreamKind::Kafka,
                    broker_list: vec!["kafka:9092".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&spec).expect("serialize");
        let parsed: DatabaseClusterSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.mode, ClusterMode::Cluster);
        assert_eq!(parsed.components.image, "example/db:v2.5.0");
        assert_eq!(parsed.dependencies.msg_stream.kind, MsgStreamKind::Kafka);
    }
}
