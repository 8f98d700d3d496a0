//! Endpoint condition cache with single-flight probing.
//!
//! Many clusters may declare the same external dependency endpoints. The
//! cache keys probe results by canonical endpoint set so a dependency is
//! probed once per refresh regardless of how many clusters share it, and a
//! slow dependency never blocks a status cycle: a cold cache returns Unknown
//! immediately while a background probe fills it for later cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::crd::ClusterCondition;

/// Entry state for one canonical endpoint set.
#[derive(Default)]
struct CacheEntry {
    /// Last completed probe result. None until the first probe finishes.
    condition: Option<ClusterCondition>,
    /// Exclusive in-flight marker: at most one probe per key.
    probing: bool,
}

/// Cache of dependency probe results, keyed by canonical endpoint set.
///
/// Entries are created lazily, live for the process lifetime, and are
/// overwritten on every completed probe.
#[derive(Default)]
pub struct EndpointCheckCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// Canonical key: sorted, de-duplicated endpoint list.
fn cache_key(endpoints: &[String]) -> String {
    let mut sorted: Vec<&str> = endpoints.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

impl EndpointCheckCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last cached condition and whether the cache has ever been filled for
    /// this endpoint set.
    pub fn get(&self, endpoints: &[String]) -> (Option<ClusterCondition>, bool) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&cache_key(endpoints)) {
            Some(entry) => (entry.condition.clone(), entry.condition.is_some()),
            None => (None, false),
        }
    }

    /// Record a completed probe result.
    pub fn set(&self, endpoints: &[String], condition: ClusterCondition) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(cache_key(endpoints)).or_default().condition = Some(condition);
    }

    /// Acquire the exclusive in-flight marker for this endpoint set.
    /// Returns false when another probe already holds it.
    pub fn try_start_probe_for(&self, endpoints: &[String]) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(cache_key(endpoints)).or_default();
        if entry.probing {
            return false;
        }
        entry.probing = true;
        true
    }

    /// Release the in-flight marker.
    pub fn end_probe_for(&self, endpoints: &[String]) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(&cache_key(endpoints)) {
            entry.probing = false;
        }
    }
}

/// Scoped in-flight marker. Releasing on drop guarantees the marker is freed
/// on every exit path of a probe, including timeout and panic unwind.
pub struct ProbeGuard {
    cache: Arc<EndpointCheckCache>,
    endpoints: Vec<String>,
}

impl ProbeGuard {
    /// Try to acquire the marker for the endpoint set. None when a probe is
    /// already in flight.
    pub fn acquire(cache: Arc<EndpointCheckCache>, endpoints: &[String]) -> Option<Self> {
        if !cache.try_start_probe_for(endpoints) {
            return None;
        }
        Some(Self {
            cache,
            endpoints: endpoints.to_vec(),
        })
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.cache.end_probe_for(&self.endpoints);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cold_cache_uninitialized() {
        let cache = EndpointCheckCache::new();
        let (condition, initialized) = cache.get(&endpoints(&["a:1"]));
        assert!(condition.is_none());
        assert!(!initialized);
    }

    #[test]
    fn test_set_then_get() {
        let cache = EndpointCheckCache::new();
        let eps = endpoints(&["a:1", "b:2"]);
        cache.set(&eps, ClusterCondition::new("MetaStoreReady", true, "Probed", ""));

        let (condition, initialized) = cache.get(&eps);
        assert!(initialized);
        assert!(condition.is_some_and(|c| c.is_true()));
    }

    #[test]
    fn test_key_canonicalization() {
        let cache = EndpointCheckCache::new();
        cache.set(
            &endpoints(&["b:2", "a:1"]),
            ClusterCondition::new("MetaStoreReady", true, "Probed", ""),
        );
        let (_, initialized) = cache.get(&endpoints(&["a:1", "b:2"]));
        assert!(initialized);
    }

    #[test]
    fn test_single_flight_marker() {
        let cache = EndpointCheckCache::new();
        let eps = endpoints(&["a:1"]);
        assert!(cache.try_start_probe_for(&eps));
        assert!(!cache.try_start_probe_for(&eps));
        cache.end_probe_for(&eps);
        assert!(cache.try_start_probe_for(&eps));
    }

    #[test]
    fn test_probe_guard_releases_on_drop() {
        let cache = Arc::new(EndpointCheckCache::new());
        let eps = endpoints(&["a:1"]);
        {
            let guard = ProbeGuard::acquire(cache.clone(), &eps);
            assert!(guard.is_some());
            assert!(ProbeGuard::acquire(cache.clone(), &eps).is_none());
        }
        assert!(ProbeGuard::acquire(cache, &eps).is_some());
    }

    #[test]
    fn test_probe_guard_releases_on_panic() {
        let cache = Arc::new(EndpointCheckCache::new());
        let eps = endpoints(&["a:1"]);

        let cache2 = cache.clone();
        let eps2 = eps.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = ProbeGuard::acquire(cache2, &eps2).unwrap();
            panic!("probe blew up");
        }));
        assert!(result.is_err());
        assert!(ProbeGuard::acquire(cache, &eps).is_some());
    }
}
