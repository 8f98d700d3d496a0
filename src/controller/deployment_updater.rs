//! Deployment updater: mutates a component workload toward its desired shape.
//!
//! Each rule is field-local and idempotent, so partial application across
//! fields is safe and repeated reconciles converge without churn. The only
//! fatal failure is a missing owner back-reference (topology error); image
//! selection is gated by the rolling-update dependency graph.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Volume, VolumeMount,
};

use crate::controller::component::{Component, enabled_components};
use crate::controller::error::Result;
use crate::crd::{DatabaseCluster, ImageUpdateMode, MsgStreamKind};
use crate::resources::common::{component_labels, owner_reference};

/// Launcher script prepended to every component entrypoint.
pub const TOOL_RUN_SCRIPT: &str = "/opt/dbcluster/tools/run.sh";
/// Server binary launched by the run script.
pub const SERVER_BINARY: &str = "dbserver";
/// Name of the injected config init container.
pub const CONFIG_CONTAINER_NAME: &str = "config";
/// Default image for the config init container; refreshed only when the pod
/// template changed for another reason or the force flag is set, so a tool
/// release alone does not restart every component.
pub const DEFAULT_TOOL_IMAGE: &str = "dbcluster-operator/config-tool:v1";

/// Name of the embedded-queue data volume, matched by name, not index.
pub const DATA_VOLUME_NAME: &str = "data";
/// Mount path of the embedded-queue data volume.
pub const DATA_MOUNT_PATH: &str = "/var/lib/dbcluster/data";

/// Computes the desired shape for one component of one cluster.
pub struct DeploymentUpdater<'a> {
    cluster: &'a DatabaseCluster,
    component: Component,
    tool_image: String,
}

impl<'a> DeploymentUpdater<'a> {
    pub fn new(cluster: &'a DatabaseCluster, component: Component) -> Self {
        Self {
            cluster,
            component,
            tool_image: DEFAULT_TOOL_IMAGE.to_string(),
        }
    }

    pub fn with_tool_image(mut self, image: &str) -> Self {
        self.tool_image = image.to_string();
        self
    }

    fn spec_image(&self) -> &str {
        &self.cluster.spec.components.image
    }

    fn current_image(&self) -> &str {
        self.cluster
            .status
            .as_ref()
            .map(|s| s.current_image.as_str())
            .unwrap_or_default()
    }

    /// Desired replica count after applying the sentinel rules:
    /// `-1` preserves the running count but resumes a stopped workload to 1,
    /// `0` forces a stop, anything else overwrites unconditionally.
    fn desired_replicas(&self, current: Option<i32>) -> i32 {
        let desired = self
            .cluster
            .spec
            .components
            .component(self.component)
            .and_then(|c| c.replicas)
            .unwrap_or(1);
        if desired == -1 {
            return match current {
                Some(0) | None => 1,
                Some(c) => c,
            };
        }
        desired
    }

    /// Entrypoint: launcher script, then the component-specific command or
    /// the user override.
    fn desired_args(&self) -> Vec<String> {
        let user = self
            .cluster
            .spec
            .components
            .component(self.component)
            .map(|c| c.commands.clone())
            .unwrap_or_default();
        let mut args = vec![TOOL_RUN_SCRIPT.to_string()];
        if user.is_empty() {
            args.push(SERVER_BINARY.to_string());
            args.push("run".to_string());
            args.push(self.component.name().to_string());
        } else {
            args.extend(user);
        }
        args
    }

    /// Whether every component required by the dependency graph, in the
    /// direction of the desired change, already records the desired image
    /// with a ready rollout at the current generation. A missing record
    /// fails closed.
    pub fn rolling_update_image_dependency_ready(&self) -> bool {
        let required: Vec<Component> = match self.cluster.spec.components.image_update_mode {
            ImageUpdateMode::RollingUpgrade => self.component.upgrade_dependencies().to_vec(),
            ImageUpdateMode::RollingDowngrade => self.component.downgrade_dependents(),
            ImageUpdateMode::All | ImageUpdateMode::Disabled => return true,
        };
        let enabled = enabled_components(self.cluster);
        let deploy_status = self
            .cluster
            .status
            .as_ref()
            .map(|s| &s.components_deploy_status);

        for dep in required.into_iter().filter(|d| enabled.contains(d)) {
            let Some(recorded) = deploy_status.and_then(|m| m.get(dep.name())) else {
                return false;
            };
            if recorded.image != self.spec_image() || !recorded.is_ready() {
                return false;
            }
        }
        true
    }

    /// Image to set on the main container, gated by the dependency graph.
    /// While the graph is not satisfied the component stays pinned to the
    /// last fully rolled-out image.
    fn desired_image(&self, current: Option<&str>) -> String {
        match self.cluster.spec.components.image_update_mode {
            ImageUpdateMode::Disabled => match current {
                Some(image) if !image.is_empty() => image.to_string(),
                _ => self.spec_image().to_string(),
            },
            ImageUpdateMode::All => self.spec_image().to_string(),
            ImageUpdateMode::RollingUpgrade | ImageUpdateMode::RollingDowngrade => {
                let rolled_out = self.current_image();
                // No version change in flight: first rollout or steady state.
                if rolled_out.is_empty() || rolled_out == self.spec_image() {
                    return self.spec_image().to_string();
                }
                if self.rolling_update_image_dependency_ready() {
                    self.spec_image().to_string()
                } else {
                    rolled_out.to_string()
                }
            }
        }
    }

    fn force_tool_refresh(&self) -> bool {
        self.cluster.spec.components.update_tool_image
    }

    fn user_init_containers(&self) -> Vec<Container> {
        self.cluster
            .spec
            .components
            .component(self.component)
            .map(|c| c.init_containers.clone())
            .unwrap_or_default()
    }

    fn embedded_queue_persistence(&self) -> Option<&crate::crd::PersistenceSpec> {
        let stream = &self.cluster.spec.dependencies.msg_stream;
        if stream.kind == MsgStreamKind::Embedded
            && stream.persistence.enabled
            && self.component.hosts_embedded_queue()
        {
            Some(&stream.persistence)
        } else {
            None
        }
    }

    fn persistence_claim_name(&self) -> String {
        let stream = &self.cluster.spec.dependencies.msg_stream;
        stream
            .persistence
            .existing_claim
            .clone()
            .unwrap_or_else(|| {
                format!("{}-{}", kube::ResourceExt::name_any(self.cluster), DATA_VOLUME_NAME)
            })
    }
}

/// Mutate the workload toward the desired shape. Returns whether anything
/// changed. The only error is the fatal owner back-reference failure.
pub fn update_deployment(deployment: &mut Deployment, updater: &DeploymentUpdater) -> Result<bool> {
    let before = deployment.clone();

    // Owner back-reference: fatal for this component's pass when it cannot
    // be established.
    let owner = owner_reference(updater.cluster)?;
    let owners = deployment.metadata.owner_references.get_or_insert_default();
    if !owners.iter().any(|r| r.uid == owner.uid) {
        owners.push(owner);
    }

    // Labels on the workload and pod template, merged idempotently.
    let labels = component_labels(updater.cluster, updater.component);
    deployment
        .metadata
        .labels
        .get_or_insert_default()
        .extend(labels.clone());

    let spec = deployment.spec.get_or_insert_default();
    if spec.selector.match_labels.is_none() {
        spec.selector.match_labels = Some(labels.clone());
    }
    spec.template
        .metadata
        .get_or_insert_default()
        .labels
        .get_or_insert_default()
        .extend(labels);

    // Replicas.
    spec.replicas = Some(updater.desired_replicas(spec.replicas));

    let pod = spec.template.spec.get_or_insert_default();

    // Main container: entrypoint and graph-gated image.
    let container_name = updater.component.name();
    if !pod.containers.iter().any(|c| c.name == container_name) {
        pod.containers.insert(
            0,
            Container {
                name: container_name.to_string(),
                ..Default::default()
            },
        );
    }
    // Main container is always present after the insert above.
    if let Some(main) = pod.containers.iter_mut().find(|c| c.name == container_name) {
        main.args = Some(updater.desired_args());
        let image = updater.desired_image(main.image.as_deref());
        main.image = Some(image);
    }

    // Embedded-queue persistence: data volume and mount, matched by name so
    // reordering is tolerated.
    apply_persistence(pod, updater);

    // Network fields copied verbatim.
    pod.host_network = Some(updater.cluster.spec.components.host_network);
    pod.dns_policy = updater.cluster.spec.components.dns_policy.clone();

    // Config init container: injected by name, never duplicated. Its image
    // refreshes only when the template changed for another reason this pass
    // or the force flag is set.
    let template_changed = before
        .spec
        .as_ref()
        .map(|s| s.template != spec.template)
        .unwrap_or(true);
    let init = spec
        .template
        .spec
        .get_or_insert_default()
        .init_containers
        .get_or_insert_default();
    match init.iter_mut().find(|c| c.name == CONFIG_CONTAINER_NAME) {
        Some(config) => {
            if template_changed || updater.force_tool_refresh() {
                config.image = Some(updater.tool_image.clone());
            }
        }
        None => {
            init.insert(
                0,
                Container {
                    name: CONFIG_CONTAINER_NAME.to_string(),
                    image: Some(updater.tool_image.clone()),
                    ..Default::default()
                },
            );
        }
    }
    // User-declared extra init containers appended after it.
    for user in updater.user_init_containers() {
        match init.iter_mut().find(|c| c.name == user.name) {
            Some(existing) => *existing = user,
            None => init.push(user),
        }
    }

    Ok(*deployment != before)
}

fn apply_persistence(
    pod: &mut k8s_openapi::api::core::v1::PodSpec,
    updater: &DeploymentUpdater,
) {
    let container_name = updater.component.name();
    match updater.embedded_queue_persistence() {
        Some(_) => {
            let claim_name = updater.persistence_claim_name();
            let volumes = pod.volumes.get_or_insert_default();
            match volumes.iter_mut().find(|v| v.name == DATA_VOLUME_NAME) {
                Some(volume) => {
                    volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                        claim_name,
                        ..Default::default()
                    });
                }
                None => volumes.push(Volume {
                    name: DATA_VOLUME_NAME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            }
            if let Some(main) = pod.containers.iter_mut().find(|c| c.name == container_name) {
                let mounts = main.volume_mounts.get_or_insert_default();
                if !mounts.iter().any(|m| m.name == DATA_VOLUME_NAME) {
                    mounts.push(VolumeMount {
                        name: DATA_VOLUME_NAME.to_string(),
                        mount_path: DATA_MOUNT_PATH.to_string(),
                        ..Default::default()
                    });
                }
            }
        }
        None => {
            if let Some(volumes) = pod.volumes.as_mut() {
                volumes.retain(|v| v.name != DATA_VOLUME_NAME);
            }
            if let Some(main) = pod.containers.iter_mut().find(|c| c.name == container_name) {
                if let Some(mounts) = main.volume_mounts.as_mut() {
                    mounts.retain(|m| m.name != DATA_VOLUME_NAME);
                }
            }
        }
    }
}
