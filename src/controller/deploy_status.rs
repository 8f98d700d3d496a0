//! Deploy-status aggregation: reads back the workloads a cluster owns and
//! records per-component rollout facts on the CR status.
//!
//! Ownership is discovered via the owner back-reference, never by name
//! pattern, so renamed or adopted workloads are handled correctly.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams};
use kube::Client;

use crate::controller::error::Result;
use crate::crd::{ComponentDeployStatus, DatabaseCluster};
use crate::resources::common::{APP_LABEL_COMPONENT, cluster_selector, is_owned_by};

/// List every workload owned by the cluster in its namespace.
pub async fn list_owned_deployments(
    client: &Client,
    cluster: &DatabaseCluster,
) -> Result<Vec<Deployment>> {
    let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(&cluster_selector(cluster));
    let list = api.list(&params).await?;
    Ok(list
        .items
        .into_iter()
        .filter(|d| is_owned_by(&d.metadata, cluster))
        .collect())
}

/// Index owned workloads by their component label and extract rollout facts.
/// Zero owned workloads yields an empty map, not an error. Workloads without
/// a component label are skipped.
pub fn aggregate_deploy_status(
    deployments: &[Deployment],
) -> BTreeMap<String, ComponentDeployStatus> {
    let mut result = BTreeMap::new();
    for deployment in deployments {
        let Some(component) = deployment
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(APP_LABEL_COMPONENT))
        else {
            continue;
        };
        result.insert(component.clone(), deploy_status_of(deployment, component));
    }
    result
}

fn deploy_status_of(deployment: &Deployment, component: &str) -> ComponentDeployStatus {
    let image = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or_default()
        .iter()
        .find(|c| c.name == component)
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    let status = deployment.status.clone().unwrap_or_default();
    ComponentDeployStatus {
        image,
        generation: deployment.metadata.generation.unwrap_or_default(),
        observed_generation: status.observed_generation.unwrap_or_default(),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn labeled_deployment(component: &str, image: &str, generation: i64) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(format!("my-cluster-{}", component)),
                labels: Some(
                    [(APP_LABEL_COMPONENT.to_string(), component.to_string())]
                        .into_iter()
                        .collect(),
                ),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: component.to_string(),
                            image: Some(image.to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(generation),
                replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_workloads_is_empty_map() {
        assert!(aggregate_deploy_status(&[]).is_empty());
    }

    #[test]
    fn test_one_entry_per_component_label() {
        let deployments = vec![
            labeled_deployment("proxy", "example/db:v1", 3),
            labeled_deployment("datanode", "example/db:v1", 7),
        ];
        let status = aggregate_deploy_status(&deployments);
        assert_eq!(status.len(), 2);
        assert_eq!(status["proxy"].image, "example/db:v1");
        assert_eq!(status["proxy"].generation, 3);
        assert_eq!(status["proxy"].observed_generation, 3);
        assert_eq!(status["datanode"].generation, 7);
    }

    #[test]
    fn test_unlabeled_workload_skipped() {
        let mut unlabeled = labeled_deployment("proxy", "example/db:v1", 1);
        unlabeled.metadata.labels = None;
        let status = aggregate_deploy_status(&[unlabeled]);
        assert!(status.is_empty());
    }

    #[test]
    fn test_missing_main_container_records_empty_image() {
        let mut deployment = labeled_deployment("proxy", "example/db:v1", 1);
        deployment
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers = vec![Container {
            name: "sidecar".to_string(),
            ..Default::default()
        }];
        let status = aggregate_deploy_status(&[deployment]);
        assert_eq!(status["proxy"].image, "");
    }
}
