//! Narrow seam to the subsystem that installs third-party dependency
//! software (metadata store, object storage, message queue).
//!
//! The controller only decides *whether* each dependency needs an install
//! pass and with which values; performing the install is the collaborator's
//! job. Values are typed here and serialized to the installer's untyped form
//! at the boundary, so drift detection is structural equality over typed
//! data rather than deep-comparing raw maps.

use futures::future::BoxFuture;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{DatabaseCluster, MsgStreamKind};

/// Dependency kinds the installer understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyKind {
    MetaStore,
    ObjectStorage,
    Kafka,
    Pulsar,
}

impl DependencyKind {
    /// Release name suffix for the managed install.
    pub fn release_suffix(&self) -> &'static str {
        match self {
            DependencyKind::MetaStore => "meta",
            DependencyKind::ObjectStorage => "storage",
            DependencyKind::Kafka => "kafka",
            DependencyKind::Pulsar => "pulsar",
        }
    }
}

/// Typed values for one managed dependency install. Structural equality is
/// the drift check: when the deployed values match, the install pass is a
/// no-op.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallValues {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_claim: Option<String>,
}

/// One install request: which dependency, where, and with which values.
#[derive(Clone, Debug, PartialEq)]
pub struct InstallRequest {
    pub kind: DependencyKind,
    pub namespace: String,
    pub release: String,
    pub values: InstallValues,
}

impl InstallRequest {
    pub fn new(cluster: &DatabaseCluster, kind: DependencyKind, values: InstallValues) -> Self {
        Self {
            kind,
            namespace: cluster.namespace().unwrap_or_else(|| "default".to_string()),
            release: format!("{}-{}", cluster.name_any(), kind.release_suffix()),
            values,
        }
    }
}

/// Install/query interface to the dependency subsystem. Implementations must
/// be idempotent: installing with unchanged values is a no-op. Failures come
/// back as opaque text and are wrapped into the controller's retryable
/// install error at the call site.
pub trait DependencyInstaller: Send + Sync {
    fn install(&self, request: InstallRequest) -> BoxFuture<'_, std::result::Result<(), String>>;

    fn get_values(
        &self,
        namespace: &str,
        release: &str,
    ) -> BoxFuture<'_, std::result::Result<Option<InstallValues>, String>>;
}

/// Installer used when every dependency is external: nothing to manage.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullInstaller;

impl DependencyInstaller for NullInstaller {
    fn install(&self, request: InstallRequest) -> BoxFuture<'_, std::result::Result<(), String>> {
        Box::pin(async move {
            debug!(release = %request.release, "no managed install configured, skipping");
            Ok(())
        })
    }

    fn get_values(
        &self,
        _namespace: &str,
        _release: &str,
    ) -> BoxFuture<'_, std::result::Result<Option<InstallValues>, String>> {
        Box::pin(async { Ok(None) })
    }
}

/// Install requests for every dependency the cluster asks us to manage.
/// External dependencies and the embedded queue produce no request.
pub fn managed_install_requests(cluster: &DatabaseCluster) -> Vec<InstallRequest> {
    let deps = &cluster.spec.dependencies;
    let mut requests = Vec::new();

    if !deps.meta_store.external {
        requests.push(InstallRequest::new(
            cluster,
            DependencyKind::MetaStore,
            InstallValues {
                replicas: 3,
                ..Default::default()
            },
        ));
    }
    if !deps.object_storage.external {
        requests.push(InstallRequest::new(
            cluster,
            DependencyKind::ObjectStorage,
            InstallValues {
                replicas: 1,
                ..Default::default()
            },
        ));
    }
    if !deps.msg_stream.external {
        match deps.msg_stream.kind {
            MsgStreamKind::Kafka => requests.push(InstallRequest::new(
                cluster,
                DependencyKind::Kafka,
                InstallValues {
                    replicas: 3,
                    ..Default::default()
                },
            )),
            MsgStreamKind::Pulsar => requests.push(InstallRequest::new(
                cluster,
                DependencyKind::Pulsar,
                InstallValues {
                    replicas: 3,
                    ..Default::default()
                },
            )),
            // Embedded runs inside the component workload; custom streams
            // are the user's to operate.
            MsgStreamKind::Embedded | MsgStreamKind::Custom => {}
        }
    }
    requests
}

/// Run one install pass for the cluster: skip anything already converged,
/// dispatch the rest. Install failures propagate to the outer reconcile for
/// standard retry.
pub async fn reconcile_dependencies(
    installer: &dyn DependencyInstaller,
    cluster: &DatabaseCluster,
) -> Result<()> {
    for request in managed_install_requests(cluster) {
        let deployed = installer
            .get_values(&request.namespace, &request.release)
            .await
            .map_err(Error::Install)?;
        if deployed.as_ref() == Some(&request.values) {
            debug!(release = %request.release, "dependency values unchanged, skipping install");
            continue;
        }
        installer.install(request).await.map_err(Error::Install)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DatabaseClusterSpec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingInstaller {
        deployed: Mutex<Vec<(String, InstallValues)>>,
        installs: Mutex<Vec<String>>,
    }

    impl DependencyInstaller for RecordingInstaller {
        fn install(
            &self,
            request: InstallRequest,
        ) -> BoxFuture<'_, std::result::Result<(), String>> {
            Box::pin(async move {
                self.installs.lock().unwrap().push(request.release.clone());
                self.deployed
                    .lock()
                    .unwrap()
                    .push((request.release, request.values));
                Ok(())
            })
        }

        fn get_values(
            &self,
            _namespace: &str,
            release: &str,
        ) -> BoxFuture<'_, std::result::Result<Option<InstallValues>, String>> {
            let found = self
                .deployed
                .lock()
                .unwrap()
                .iter()
                .find(|(r, _)| r == release)
                .map(|(_, v)| v.clone());
            Box::pin(async move { Ok(found) })
        }
    }

    struct FailingInstaller;

    impl DependencyInstaller for FailingInstaller {
        fn install(
            &self,
            _request: InstallRequest,
        ) -> BoxFuture<'_, std::result::Result<(), String>> {
            Box::pin(async { Err("chart render failed".to_string()) })
        }

        fn get_values(
            &self,
            _namespace: &str,
            _release: &str,
        ) -> BoxFuture<'_, std::result::Result<Option<InstallValues>, String>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn test_cluster() -> DatabaseCluster {
        let mut cluster = DatabaseCluster::new("my-cluster", DatabaseClusterSpec::default());
        cluster.metadata.namespace = Some("ns".to_string());
        cluster
    }

    #[test]
    fn test_external_dependencies_produce_no_requests() {
        let mut cluster = test_cluster();
        cluster.spec.dependencies.meta_store.external = true;
        cluster.spec.dependencies.object_storage.external = true;
        cluster.spec.dependencies.msg_stream.external = true;
        assert!(managed_install_requests(&cluster).is_empty());
    }

    #[test]
    fn test_embedded_queue_needs_no_install() {
        let mut cluster = test_cluster();
        cluster.spec.dependencies.meta_store.external = true;
        cluster.spec.dependencies.object_storage.external = true;
        cluster.spec.dependencies.msg_stream.kind = MsgStreamKind::Embedded;
        assert!(managed_install_requests(&cluster).is_empty());
    }

    #[test]
    fn test_msg_stream_dispatches_on_kind() {
        let mut cluster = test_cluster();
        cluster.spec.dependencies.msg_stream.kind = MsgStreamKind::Kafka;
        let requests = managed_install_requests(&cluster);
        assert!(requests.iter().any(|r| r.kind == DependencyKind::Kafka));

        cluster.spec.dependencies.msg_stream.kind = MsgStreamKind::Pulsar;
        let requests = managed_install_requests(&cluster);
        assert!(requests.iter().any(|r| r.kind == DependencyKind::Pulsar));
    }

    #[tokio::test]
    async fn test_install_skipped_when_values_unchanged() {
        let installer = RecordingInstaller::default();
        let cluster = test_cluster();

        reconcile_dependencies(&installer, &cluster).await.unwrap();
        let first = installer.installs.lock().unwrap().len();
        assert!(first > 0);

        reconcile_dependencies(&installer, &cluster).await.unwrap();
        assert_eq!(installer.installs.lock().unwrap().len(), first);
    }

    #[tokio::test]
    async fn test_install_failure_is_retryable() {
        let err = reconcile_dependencies(&FailingInstaller, &test_cluster())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Install(_)));
        assert!(err.is_retryable());
    }
}
