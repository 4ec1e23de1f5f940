//! Diagnostic bookkeeping of live worker threads
//!
//! Nothing in the pipeline depends on the registry for correctness. It exists
//! so a UI or log can show which workers are alive and what they are doing.
//! Create one, wrap it in an `Arc`, and hand it to whatever spawns workers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

pub type WorkerId = u64;

/// Free-form metadata attached to a worker.
pub type WorkerMeta = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerKind {
    Decode,
    PresentationSurface,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub label: Option<String>,
    pub created_at: SystemTime,
    pub meta: WorkerMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounts {
    pub decode: usize,
    pub presentation_surface: usize,
    pub other: usize,
    pub total: usize,
}

type Listener = Arc<dyn Fn(&[WorkerInfo]) + Send + Sync>;

#[derive(Default)]
pub struct WorkerRegistry {
    next_id: AtomicU64,
    next_listener: AtomicU64,
    workers: Mutex<BTreeMap<WorkerId, WorkerInfo>>,
    snapshot: ArcSwap<Vec<WorkerInfo>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl WorkerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        &self,
        kind: WorkerKind,
        label: Option<String>,
        meta: Option<WorkerMeta>,
    ) -> WorkerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = WorkerInfo {
            id,
            kind,
            label,
            created_at: SystemTime::now(),
            meta: meta.unwrap_or_default(),
        };
        trace!(id, ?kind, "Worker registered");
        self.mutate(|workers| {
            workers.insert(id, info);
        });
        id
    }

    /// Merge `patch` into the worker's metadata. `null` values remove keys.
    ///
    /// Returns false for unknown ids.
    pub fn update(&self, id: WorkerId, patch: WorkerMeta) -> bool {
        self.mutate(|workers| match workers.get_mut(&id) {
            Some(info) => {
                for (key, value) in patch {
                    if value.is_null() {
                        info.meta.remove(&key);
                    } else {
                        info.meta.insert(key, value);
                    }
                }
                true
            }
            None => false,
        })
    }

    pub fn unregister(&self, id: WorkerId) -> Option<WorkerInfo> {
        let removed = self.mutate(|workers| workers.remove(&id));
        if removed.is_some() {
            trace!(id, "Worker unregistered");
        }
        removed
    }

    /// Current workers ordered by id.
    pub fn list(&self) -> Arc<Vec<WorkerInfo>> {
        self.snapshot.load_full()
    }

    pub fn counts(&self) -> WorkerCounts {
        let snapshot = self.snapshot.load();
        let mut counts = WorkerCounts::default();
        for info in snapshot.iter() {
            match info.kind {
                WorkerKind::Decode => counts.decode += 1,
                WorkerKind::PresentationSurface => counts.presentation_surface += 1,
                WorkerKind::Other => counts.other += 1,
            }
            counts.total += 1;
        }
        counts
    }

    /// Call `listener` with a full snapshot after every mutation.
    ///
    /// The listener stays subscribed until the returned guard is dropped or
    /// [`Subscription::unsubscribe`] is called.
    pub fn on_change(
        self: &Arc<Self>,
        listener: impl Fn(&[WorkerInfo]) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::downgrade(self),
            id,
        }
    }

    fn remove_listener(&self, id: u64) {
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut BTreeMap<WorkerId, WorkerInfo>) -> R) -> R {
        let (result, snapshot) = {
            let mut workers = lock(&self.workers);
            let result = f(&mut workers);
            let snapshot = Arc::new(workers.values().cloned().collect::<Vec<_>>());
            self.snapshot.store(snapshot.clone());
            (result, snapshot)
        };

        // Listeners run outside the locks so they may call back in.
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a registry listener alive.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<WorkerRegistry>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_listener(self.id);
        }
    }
}

/// Build a metadata patch from key/value pairs.
pub fn meta<I, K>(pairs: I) -> WorkerMeta
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    #[test]
    fn register_update_unregister() {
        let registry = WorkerRegistry::new();
        let id = registry.register(WorkerKind::Decode, Some("video".into()), None);

        assert!(registry.update(id, meta([("queue", json!(3))])));
        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].label.as_deref(), Some("video"));
        assert_eq!(list[0].meta["queue"], json!(3));

        assert!(registry.update(id, meta([("queue", Value::Null)])));
        assert!(registry.list()[0].meta.get("queue").is_none());

        assert!(registry.unregister(id).is_some());
        assert!(registry.list().is_empty());
        assert!(!registry.update(id, WorkerMeta::new()));
        assert!(registry.unregister(id).is_none());
    }

    #[test]
    fn counts_by_kind() {
        let registry = WorkerRegistry::new();
        registry.register(WorkerKind::Decode, None, None);
        registry.register(WorkerKind::Decode, None, None);
        registry.register(WorkerKind::PresentationSurface, None, None);
        registry.register(WorkerKind::Other, None, None);

        assert_eq!(
            registry.counts(),
            WorkerCounts {
                decode: 2,
                presentation_surface: 1,
                other: 1,
                total: 4,
            }
        );
    }

    #[test]
    fn ids_are_unique() {
        let registry = WorkerRegistry::new();
        let a = registry.register(WorkerKind::Other, None, None);
        let b = registry.register(WorkerKind::Other, None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn listeners_see_snapshots_until_unsubscribed() {
        let registry = WorkerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let last_len = Arc::new(AtomicUsize::new(usize::MAX));

        let sub = {
            let calls = calls.clone();
            let last_len = last_len.clone();
            registry.on_change(move |snapshot| {
                calls.fetch_add(1, Ordering::SeqCst);
                last_len.store(snapshot.len(), Ordering::SeqCst);
            })
        };

        let id = registry.register(WorkerKind::Decode, None, None);
        assert_eq!(last_len.load(Ordering::SeqCst), 1);
        registry.update(id, meta([("pending", json!(1))]));
        registry.unregister(id);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(last_len.load(Ordering::SeqCst), 0);

        sub.unsubscribe();
        registry.register(WorkerKind::Decode, None, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn listener_may_read_registry() {
        let registry = WorkerRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let weak = Arc::downgrade(&registry);
            let seen = seen.clone();
            registry.on_change(move |_| {
                if let Some(registry) = weak.upgrade() {
                    seen.store(registry.counts().total, Ordering::SeqCst);
                }
            })
        };
        registry.register(WorkerKind::Other, None, None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&WorkerKind::PresentationSurface).unwrap(),
            "\"presentation-surface\""
        );
    }
}
