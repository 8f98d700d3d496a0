//! Dependency condition computation.
//!
//! Turns probe results into named conditions per dependency kind. External
//! or self-contained dependencies are unconditionally true ("not managed");
//! managed dependencies go through the single-flight probe cache so shared
//! endpoints are probed once and a slow probe never stalls a status cycle.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tracing::debug;

use crate::controller::endpoint_cache::{EndpointCheckCache, ProbeGuard};
use crate::crd::{
    CONDITION_META_STORE, CONDITION_MSG_STREAM, CONDITION_OBJECT_STORAGE, ClusterCondition,
    DatabaseCluster, MsgStreamKind,
};

/// Deadline for a single dependency probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reasons attached to dependency conditions.
pub const REASON_NOT_MANAGED: &str = "NotManaged";
pub const REASON_PROBE_SUCCEEDED: &str = "ProbeSucceeded";
pub const REASON_PROBE_FAILED: &str = "ProbeFailed";
pub const REASON_PROBE_PENDING: &str = "ProbePending";

/// Per-protocol dependency probe. The default implementation checks TCP
/// reachability; tests substitute fakes implementing the same contract.
pub trait EndpointProbe: Send + Sync {
    /// Probe the endpoint set, Ok when the dependency answers.
    fn probe(&self, endpoints: Vec<String>) -> BoxFuture<'static, Result<(), String>>;
}

/// TCP connect probe: the dependency is healthy when any endpoint accepts a
/// connection within the deadline.
pub struct TcpProbe;

impl EndpointProbe for TcpProbe {
    fn probe(&self, endpoints: Vec<String>) -> BoxFuture<'static, Result<(), String>> {
        Box::pin(async move {
            if endpoints.is_empty() {
                return Err("no endpoints declared".to_string());
            }
            let mut last_err = String::new();
            for endpoint in &endpoints {
                match TcpStream::connect(endpoint.as_str()).await {
                    Ok(_) => return Ok(()),
                    Err(e) => last_err = format!("{}: {}", endpoint, e),
                }
            }
            Err(last_err)
        })
    }
}

/// Computes dependency conditions through the shared probe cache.
#[derive(Clone)]
pub struct ConditionGetter {
    cache: Arc<EndpointCheckCache>,
    probe: Arc<dyn EndpointProbe>,
    timeout: Duration,
}

impl ConditionGetter {
    pub fn new(cache: Arc<EndpointCheckCache>, probe: Arc<dyn EndpointProbe>) -> Self {
        Self {
            cache,
            probe,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Metadata store condition: unconditionally true when external,
    /// otherwise probed through the cache.
    pub async fn meta_store_condition(&self, cluster: &DatabaseCluster) -> ClusterCondition {
        let dep = &cluster.spec.dependencies.meta_store;
        if dep.external {
            return not_managed(CONDITION_META_STORE);
        }
        self.cached_condition(CONDITION_META_STORE, dep.endpoints.clone())
            .await
    }

    /// Object storage condition.
    pub async fn object_storage_condition(&self, cluster: &DatabaseCluster) -> ClusterCondition {
        let dep = &cluster.spec.dependencies.object_storage;
        if dep.external {
            return not_managed(CONDITION_OBJECT_STORAGE);
        }
        self.cached_condition(CONDITION_OBJECT_STORAGE, vec![dep.endpoint.clone()])
            .await
    }

    /// Message stream condition, dispatching on the declared kind: the
    /// broker-list protocol probes the broker set, the single-endpoint
    /// protocol probes one endpoint, embedded and custom streams need no
    /// external check.
    pub async fn msg_stream_condition(&self, cluster: &DatabaseCluster) -> ClusterCondition {
        let dep = &cluster.spec.dependencies.msg_stream;
        let endpoints = match dep.kind {
            MsgStreamKind::Embedded | MsgStreamKind::Custom => {
                return not_managed(CONDITION_MSG_STREAM);
            }
            MsgStreamKind::Kafka => dep.broker_list.clone(),
            MsgStreamKind::Pulsar => vec![dep.endpoint.clone()],
        };
        if dep.external {
            return not_managed(CONDITION_MSG_STREAM);
        }
        self.cached_condition(CONDITION_MSG_STREAM, endpoints).await
    }

    /// Stale-while-revalidate lookup: return the cached condition (Unknown
    /// when the cache is cold) and, unless a probe is already in flight for
    /// this endpoint set, refresh it in the background under the deadline.
    async fn cached_condition(
        &self,
        condition_type: &str,
        endpoints: Vec<String>,
    ) -> ClusterCondition {
        let (cached, initialized) = self.cache.get(&endpoints);

        if let Some(guard) = ProbeGuard::acquire(self.cache.clone(), &endpoints) {
            let cache = self.cache.clone();
            let fut = self.probe.probe(endpoints.clone());
            let timeout = self.timeout;
            let cond_type = condition_type.to_string();
            tokio::spawn(async move {
                // guard moves into the task; drop releases the marker on
                // every exit path, including timeout and panic unwind.
                let _guard = guard;
                let result = match tokio::time::timeout(timeout, fut).await {
                    Ok(inner) => inner,
                    Err(_) => Err(format!("probe timed out after {:?}", timeout)),
                };
                let condition = match result {
                    Ok(()) => {
                        ClusterCondition::new(&cond_type, true, REASON_PROBE_SUCCEEDED, "")
                    }
                    Err(reason) => {
                        debug!(condition = %cond_type, error = %reason, "Dependency probe failed");
                        ClusterCondition::new(&cond_type, false, REASON_PROBE_FAILED, &reason)
                    }
                };
                cache.set(&endpoints, condition);
            });
        }

        if initialized {
            if let Some(condition) = cached {
                return condition;
            }
        }
        ClusterCondition::unknown(
            condition_type,
            REASON_PROBE_PENDING,
            "first probe has not completed yet",
        )
    }
}

fn not_managed(condition_type: &str) -> ClusterCondition {
    ClusterCondition::new(
        condition_type,
        true,
        REASON_NOT_MANAGED,
        "dependency is not managed by the operator",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CONDITION_UNKNOWN, DatabaseClusterSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe fake that counts invocations and answers after a delay.
    struct CountingProbe {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        result: Result<(), String>,
    }

    impl EndpointProbe for CountingProbe {
        fn probe(&self, _endpoints: Vec<String>) -> BoxFuture<'static, Result<(), String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            let result = self.result.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                result
            })
        }
    }

    fn test_cluster() -> DatabaseCluster {
        let mut cluster = DatabaseCluster::new("c", DatabaseClusterSpec::default());
        cluster.spec.dependencies.meta_store.endpoints = vec!["meta:2379".to_string()];
        cluster.spec.dependencies.object_storage.endpoint = "storage:9000".to_string();
        cluster
    }

    fn getter(probe: Arc<dyn EndpointProbe>) -> ConditionGetter {
        ConditionGetter::new(Arc::new(EndpointCheckCache::new()), probe)
    }

    #[tokio::test]
    async fn test_external_dependency_unconditionally_true() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(CountingProbe {
            calls: calls.clone(),
            delay: Duration::ZERO,
            result: Ok(()),
        });
        let g = getter(probe);

        let mut cluster = test_cluster();
        cluster.spec.dependencies.meta_store.external = true;
        let cond = g.meta_store_condition(&cluster).await;
        assert!(cond.is_true());
        assert_eq!(cond.reason, REASON_NOT_MANAGED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_embedded_and_custom_stream_true_without_probe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(CountingProbe {
            calls: calls.clone(),
            delay: Duration::ZERO,
            result: Ok(()),
        });
        let g = getter(probe);

        let mut cluster = test_cluster();
        cluster.spec.dependencies.msg_stream.kind = MsgStreamKind::Embedded;
        assert!(g.msg_stream_condition(&cluster).await.is_true());
        cluster.spec.dependencies.msg_stream.kind = MsgStreamKind::Custom;
        assert!(g.msg_stream_condition(&cluster).await.is_true());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cold_cache_returns_unknown_then_probe_fills_it() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(CountingProbe {
            calls: calls.clone(),
            delay: Duration::ZERO,
            result: Ok(()),
        });
        let g = getter(probe);
        let cluster = test_cluster();

        let cond = g.meta_store_condition(&cluster).await;
        assert_eq!(cond.status, CONDITION_UNKNOWN);

        // Let the background probe complete, then the next cycle sees it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cond = g.meta_store_condition(&cluster).await;
        assert!(cond.is_true());
        assert_eq!(cond.reason, REASON_PROBE_SUCCEEDED);
    }

    #[tokio::test]
    async fn test_probe_failure_is_condition_not_error() {
        let probe = Arc::new(CountingProbe {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            result: Err("connection refused".to_string()),
        });
        let g = getter(probe);
        let cluster = test_cluster();

        let _ = g.object_storage_condition(&cluster).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cond = g.object_storage_condition(&cluster).await;
        assert!(!cond.is_true());
        assert_eq!(cond.reason, REASON_PROBE_FAILED);
        assert!(cond.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_probe_timeout_yields_false_condition() {
        let probe = Arc::new(CountingProbe {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::from_secs(60),
            result: Ok(()),
        });
        let g = getter(probe).with_timeout(Duration::from_millis(20));
        let cluster = test_cluster();

        let _ = g.meta_store_condition(&cluster).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cond = g.meta_store_condition(&cluster).await;
        assert!(!cond.is_true());
        assert!(cond.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_single_probe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(CountingProbe {
            calls: calls.clone(),
            delay: Duration::from_millis(50),
            result: Ok(()),
        });
        let g = Arc::new(getter(probe));
        let cluster = test_cluster();

        // Two concurrent callers for the same endpoint set: the second sees
        // the in-flight marker and returns from the cache lookup at once.
        let c1 = g.meta_store_condition(&cluster);
        let c2 = g.meta_store_condition(&cluster);
        let (r1, r2) = tokio::join!(c1, c2);
        assert_eq!(r1.status, CONDITION_UNKNOWN);
        assert_eq!(r2.status, CONDITION_UNKNOWN);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_msg_stream_dispatch_by_kind() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(CountingProbe {
            calls: calls.clone(),
            delay: Duration::ZERO,
            result: Ok(()),
        });
        let g = getter(probe);

        let mut cluster = test_cluster();
        cluster.spec.dependencies.msg_stream.kind = MsgStreamKind::Kafka;
        cluster.spec.dependencies.msg_stream.broker_list = vec!["kafka:9092".to_string()];
        let _ = g.msg_stream_condition(&cluster).await;

        cluster.spec.dependencies.msg_stream.kind = MsgStreamKind::Pulsar;
        cluster.spec.dependencies.msg_stream.endpoint = "pulsar:6650".to_string();
        let _ = g.msg_stream_condition(&cluster).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Distinct endpoint sets, so two probes.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
