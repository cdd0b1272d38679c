//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Arena of tracked resources released by periodic cleanup."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// Opaque handle returned by [`ResourceTracker::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cache,
    SearchIndex,
    Buffer,
    FileHandle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub label: String,
    pub bytes: u64,
    /// Cleared by the owner once the resource may be reclaimed.
    pub referenced: bool,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    next_id: u64,
    resources: IndexMap<ResourceId, TrackedResource>,
}

/// Records resources owned elsewhere so cleanup can reclaim the ones their
/// owners no longer reference.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    inner: Mutex<TrackerInner>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ResourceKind, label: impl Into<String>, bytes: u64) -> ResourceId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ResourceId(inner.next_id);
        let label = label.into();
        debug!(target: "ward::resources", %id, ?kind, %label, bytes, "resource registered");
        inner.resources.insert(
            id,
            TrackedResource {
                id,
                kind,
                label,
                bytes,
                referenced: true,
                registered_at: Utc::now(),
            },
        );
        id
    }

    /// Mark a resource as unreferenced. Returns false for unknown ids.
    pub fn release(&self, id: ResourceId) -> bool {
        match self.inner.lock().resources.get_mut(&id) {
            Some(resource) => {
                resource.referenced = false;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ResourceId) -> Option<TrackedResource> {
        self.inner.lock().resources.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tracked_bytes(&self) -> u64 {
        self.inner.lock().resources.values().map(|r| r.bytes).sum()
    }

    /// Drop every unreferenced resource and return the bytes freed.
    pub fn cleanup(&self) -> u64 {
        let (freed, removed, remaining) = {
            let mut inner = self.inner.lock();
            let mut freed = 0;
            let before = inner.resources.len();
            inner.resources.retain(|_, resource| {
                if !resource.referenced {
                    freed += resource.bytes;
                }
                resource.referenced
            });
            (freed, before - inner.resources.len(), inner.resources.len())
        };
        if removed > 0 {
            info!(target: "ward::resources", removed, freed_bytes = freed, remaining, "resources cleaned up");
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_frees_only_released_resources() {
        let tracker = ResourceTracker::new();
        let cache = tracker.register(ResourceKind::Cache, "report cache", 4096);
        let index = tracker.register(ResourceKind::SearchIndex, "search index", 1024);
        assert_eq!(tracker.cleanup(), 0);

        assert!(tracker.release(cache));
        assert_eq!(tracker.cleanup(), 4096);
        assert!(tracker.get(cache).is_none());
        assert!(tracker.get(index).unwrap().referenced);
        assert_eq!(tracker.tracked_bytes(), 1024);
    }

    #[test]
    fn ids_are_not_reused() {
        let tracker = ResourceTracker::new();
        let first = tracker.register(ResourceKind::Buffer, "a", 1);
        tracker.release(first);
        tracker.cleanup();
        let second = tracker.register(ResourceKind::Buffer, "b", 1);
        assert_ne!(first, second);
        assert!(!tracker.release(first));
    }
}
