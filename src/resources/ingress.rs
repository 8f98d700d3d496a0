//! Ingress for the client-facing component.
//!
//! Built only when the cluster spec asks for one; the status syncer mirrors
//! its load-balancer address back into the CR status.

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::controller::component::Component;
use crate::controller::error::Result;
use crate::crd::{ClusterMode, DatabaseCluster};
use crate::resources::common::{component_labels, deploy_name, owner_reference};

/// Port the client-facing service listens on.
pub const SERVER_PORT: i32 = 19090;

/// Component serving client traffic for the cluster's mode.
pub fn front_component(cluster: &DatabaseCluster) -> Component {
    match cluster.spec.mode {
        ClusterMode::Cluster => Component::Proxy,
        ClusterMode::Standalone => Component::Standalone,
    }
}

/// Desired ingress for the cluster. `None` when no ingress is configured.
pub fn desired_ingress(cluster: &DatabaseCluster) -> Result<Option<Ingress>> {
    let Some(config) = cluster.spec.components.ingress.as_ref() else {
        return Ok(None);
    };
    let front = front_component(cluster);
    let name = deploy_name(cluster, front);

    let rule = IngressRule {
        host: (!config.host.is_empty()).then(|| config.host.clone()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: name.clone(),
                        port: Some(ServiceBackendPort {
                            number: Some(SERVER_PORT),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    };

    Ok(Some(Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(component_labels(cluster, front)),
            annotations: (!config.annotations.is_empty()).then(|| config.annotations.clone()),
            owner_references: Some(vec![owner_reference(cluster)?]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![rule]),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DatabaseClusterSpec, IngressConfig};

    fn test_cluster() -> DatabaseCluster {
        let mut cluster = DatabaseCluster::new("my-cluster", DatabaseClusterSpec::default());
        cluster.metadata.namespace = Some("ns".to_string());
        cluster.metadata.uid = Some("uid-1".to_string());
        cluster
    }

    #[test]
    fn test_no_ingress_configured() {
        let cluster = test_cluster();
        assert!(desired_ingress(&cluster).expect("build").is_none());
    }

    #[test]
    fn test_ingress_routes_to_front_component() {
        let mut cluster = test_cluster();
        cluster.spec.components.ingress = Some(IngressConfig {
            host: "db.example.com".to_string(),
            annotations: [("nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
                "true".to_string())]
            .into_iter()
            .collect(),
        });

        // Standalone mode fronts the standalone workload.
        let ingress = desired_ingress(&cluster).expect("build").expect("ingress");
        assert_eq!(ingress.metadata.name, Some("my-cluster-standalone".to_string()));
        let rules = ingress.spec.expect("spec").rules.expect("rules");
        assert_eq!(rules[0].host.as_deref(), Some("db.example.com"));
        let backend = rules[0].http.as_ref().expect("http").paths[0]
            .backend
            .service
            .as_ref()
            .expect("service backend");
        assert_eq!(backend.name, "my-cluster-standalone");

        // Cluster mode fronts the proxy.
        cluster.spec.mode = ClusterMode::Cluster;
        let ingress = desired_ingress(&cluster).expect("build").expect("ingress");
        assert_eq!(ingress.metadata.name, Some("my-cluster-proxy".to_string()));
        assert!(
            ingress
                .metadata
                .annotations
                .expect("annotations")
                .contains_key("nginx.ingress.kubernetes.io/ssl-redirect")
        );
        assert!(ingress.metadata.owner_references.is_some());
    }
}
