//! Common resource generation utilities.
//!
//! Provides labels, owner references, and workload skeletons used by the
//! deployment updater. Ownership is always expressed via owner references,
//! never name patterns.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::controller::component::Component;
use crate::controller::error::{Error, Result};
use crate::crd::DatabaseCluster;

/// Label carrying the component identity on owned workloads.
pub const APP_LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Label carrying the owning cluster's name.
pub const APP_LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Label identifying resources managed by this operator.
pub const APP_LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const MANAGED_BY: &str = "dbcluster-operator";

/// Standard labels applied to all managed resources of one component.
pub fn component_labels(
    cluster: &DatabaseCluster,
    component: Component,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL_INSTANCE.to_string(), cluster.name_any());
    labels.insert(APP_LABEL_COMPONENT.to_string(), component.name().to_string());
    labels.insert(APP_LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

/// Label selector string matching every workload owned by the cluster.
pub fn cluster_selector(cluster: &DatabaseCluster) -> String {
    format!(
        "{}={},{}={}",
        APP_LABEL_INSTANCE,
        cluster.name_any(),
        APP_LABEL_MANAGED_BY,
        MANAGED_BY
    )
}

/// Workload name for a component of the cluster.
pub fn deploy_name(cluster: &DatabaseCluster, component: Component) -> String {
    format!("{}-{}", cluster.name_any(), component.name())
}

/// Controller owner reference back to the cluster CR. The cluster must have
/// been persisted (uid set); anything else is a topology error.
pub fn owner_reference(cluster: &DatabaseCluster) -> Result<OwnerReference> {
    let uid = cluster
        .uid()
        .ok_or_else(|| Error::MissingField("metadata.uid".to_string()))?;
    Ok(OwnerReference {
        api_version: "databases.example.com/v1alpha1".to_string(),
        kind: "DatabaseCluster".to_string(),
        name: cluster.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Whether the object carries a controller owner reference to the cluster.
pub fn is_owned_by(meta: &ObjectMeta, cluster: &DatabaseCluster) -> bool {
    let Some(uid) = cluster.uid() else {
        return false;
    };
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.uid == uid)
}

/// Empty workload skeleton for a component: metadata, selector, and labeled
/// pod template. Everything else is filled by the deployment updater.
pub fn new_component_deployment(cluster: &DatabaseCluster, component: Component) -> Deployment {
    let labels = component_labels(cluster, component);
    Deployment {
        metadata: ObjectMeta {
            name: Some(deploy_name(cluster, component)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DatabaseClusterSpec;

    fn test_cluster(uid: Option<&str>) -> DatabaseCluster {
        let mut cluster = DatabaseCluster::new("my-cluster", DatabaseClusterSpec::default());
        cluster.metadata.namespace = Some("default".to_string());
        cluster.metadata.uid = uid.map(|u| u.to_string());
        cluster
    }

    #[test]
    fn test_component_labels() {
        let cluster = test_cluster(Some("uid-1"));
        let labels = component_labels(&cluster, Component::Proxy);
        assert_eq!(labels.get(APP_LABEL_INSTANCE), Some(&"my-cluster".to_string()));
        assert_eq!(labels.get(APP_LABEL_COMPONENT), Some(&"proxy".to_string()));
        assert_eq!(labels.get(APP_LABEL_MANAGED_BY), Some(&MANAGED_BY.to_string()));
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        assert!(owner_reference(&test_cluster(None)).is_err());
        let r = owner_reference(&test_cluster(Some("uid-1"))).expect("owner ref");
        assert_eq!(r.uid, "uid-1");
        assert_eq!(r.controller, Some(true));
    }

    #[test]
    fn test_is_owned_by() {
        let cluster = test_cluster(Some("uid-1"));
        let mut meta = ObjectMeta::default();
        assert!(!is_owned_by(&meta, &cluster));

        meta.owner_references = Some(vec![owner_reference(&cluster).expect("owner ref")]);
        assert!(is_owned_by(&meta, &cluster));

        let other = test_cluster(Some("uid-2"));
        assert!(!is_owned_by(&meta, &other));
    }

    #[test]
    fn test_deployment_skeleton() {
        let cluster = test_cluster(Some("uid-1"));
        let deploy = new_component_deployment(&cluster, Component::DataNode);
        assert_eq!(deploy.metadata.name, Some("my-cluster-datanode".to_string()));
        let spec = deploy.spec.expect("spec");
        assert_eq!(
            spec.selector.match_labels.expect("selector")[APP_LABEL_COMPONENT],
            "datanode"
        );
    }
}
