//! Live, runtime-bound worker instances and the cache that owns them.

use hashbrown::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;
use url::Url;

use crate::error::Result;
use crate::runtime::WorkerHandle;
use crate::types::{scope_contains, InstallState, WorkerId, WorkerMatch, WorkerRecord};

/// A worker bound to a live execution handle.
///
/// `install_state` mirrors the store and may briefly lag it.
pub struct WorkerInstance {
    id: WorkerId,
    url: Url,
    scope: Url,
    state: AtomicU8,
    handle: Box<dyn WorkerHandle>,
}

impl WorkerInstance {
    pub fn new(record: &WorkerRecord, handle: Box<dyn WorkerHandle>) -> Self {
        Self {
            id: record.id,
            url: record.url.clone(),
            scope: record.scope.clone(),
            state: AtomicU8::new(record.install_state as u8),
            handle,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn install_state(&self) -> InstallState {
        InstallState::from_i64(self.state.load(Ordering::Acquire) as i64)
            .unwrap_or(InstallState::Redundant)
    }

    pub(crate) fn set_install_state(&self, state: InstallState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn scope_contains(&self, url: &Url) -> bool {
        scope_contains(self.scope.as_str(), url.as_str())
    }

    pub fn handle(&self) -> &dyn WorkerHandle {
        self.handle.as_ref()
    }

    pub fn to_match(&self) -> WorkerMatch {
        WorkerMatch {
            instance_id: self.id,
            url: self.url.clone(),
            scope: self.scope.clone(),
            install_state: self.install_state(),
        }
    }
}

impl fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("scope", &self.scope.as_str())
            .field("install_state", &self.install_state())
            .finish()
    }
}

/// At most one live instance per worker id.
///
/// Each id gets its own cell; builds run outside the map lock so a slow
/// script only holds up callers waiting on that same id.
#[derive(Default)]
pub struct InstanceCache {
    instances: Mutex<HashMap<WorkerId, Arc<OnceCell<Arc<WorkerInstance>>>>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: WorkerId) -> Option<Arc<WorkerInstance>> {
        self.instances.lock().await.get(&id)?.get().cloned()
    }

    /// Return the cached instance for `id`, building it with `build` if absent.
    ///
    /// Concurrent callers for the same id wait on one build and get the same
    /// instance. A failed build leaves nothing behind.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        id: WorkerId,
        build: F,
    ) -> Result<Arc<WorkerInstance>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<WorkerInstance>>,
    {
        let cell = {
            let mut instances = self.instances.lock().await;
            Arc::clone(instances.entry(id).or_default())
        };

        let built = cell
            .get_or_try_init(|| async move { build().await.map(Arc::new) })
            .await
            .cloned();

        match built {
            Ok(instance) => {
                debug!(%id, "Cached worker instance");
                Ok(instance)
            }
            Err(e) => {
                let mut instances = self.instances.lock().await;
                if instances
                    .get(&id)
                    .is_some_and(|current| Arc::ptr_eq(current, &cell) && !current.initialized())
                {
                    instances.remove(&id);
                }
                Err(e)
            }
        }
    }

    /// The activated live instance with the most specific scope covering
    /// `url`, newest id on ties.
    pub async fn best_active_for(&self, url: &Url) -> Option<Arc<WorkerInstance>> {
        let instances = self.instances.lock().await;
        instances
            .values()
            .filter_map(|cell| cell.get())
            .filter(|i| i.install_state() == InstallState::Activated && i.scope_contains(url))
            .max_by_key(|i| (i.scope().as_str().len(), i.id()))
            .cloned()
    }

    /// Apply a persisted state change to the cached instance, evicting it
    /// once it is redundant.
    pub async fn mirror(&self, change: &WorkerMatch) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get(&change.instance_id).and_then(|cell| cell.get()) {
            instance.set_install_state(change.install_state);
        }
        if change.install_state.is_redundant()
            && instances.remove(&change.instance_id).is_some()
        {
            debug!(id = %change.instance_id, "Evicted redundant worker instance");
        }
    }

    /// Drop every live instance. Intended for test isolation.
    pub async fn clear(&self) {
        self.instances.lock().await.clear();
    }

    /// Number of fully built instances.
    pub async fn live_count(&self) -> usize {
        self.instances
            .lock()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExtendableEvent, FetchRequest, FetchResponse, RuntimeError};
    use crate::error::ServiceWorkerError;
    use crate::types::content_fingerprint;
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use std::sync::atomic::AtomicUsize;

    struct NullHandle;

    #[async_trait]
    impl WorkerHandle for NullHandle {
        async fn dispatch_extendable_event(&self, _event: ExtendableEvent) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn dispatch_fetch_event(&self, _request: FetchRequest) -> std::result::Result<FetchResponse, RuntimeError> {
            Err(RuntimeError::Terminated)
        }

        async fn execute_js(&self, _expression: &str) -> std::result::Result<JsonValue, RuntimeError> {
            Ok(JsonValue::Null)
        }

        async fn skip_waiting_requested(&self) -> std::result::Result<bool, RuntimeError> {
            Ok(false)
        }
    }

    fn record(id: i64, scope: &str, state: InstallState) -> WorkerRecord {
        WorkerRecord {
            id: WorkerId::new(id),
            url: Url::parse("https://example.com/sw.js").unwrap(),
            scope: Url::parse(scope).unwrap(),
            install_state: state,
            last_checked: 0,
            content_hash: content_fingerprint(b""),
            content: Vec::new(),
        }
    }

    fn instance(id: i64, scope: &str, state: InstallState) -> WorkerInstance {
        WorkerInstance::new(&record(id, scope, state), Box::new(NullHandle))
    }

    #[tokio::test]
    async fn test_builds_once_per_id() {
        let cache = InstanceCache::new();
        let builds = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .get_or_try_insert_with(WorkerId::new(1), || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(instance(1, "https://example.com/", InstallState::Installed))
                })
                .await
                .unwrap();
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.live_count().await, 1);
    }

    #[tokio::test]
    async fn test_best_active_prefers_longest_scope() {
        let cache = InstanceCache::new();
        for (id, scope, state) in [
            (1, "https://example.com/", InstallState::Activated),
            (2, "https://example.com/app/", InstallState::Activated),
            (3, "https://example.com/app/deeper/", InstallState::Installed),
        ] {
            cache
                .get_or_try_insert_with(WorkerId::new(id), || async move {
                    Ok(instance(id, scope, state))
                })
                .await
                .unwrap();
        }

        let url = Url::parse("https://example.com/app/deeper/page").unwrap();
        let best = cache.best_active_for(&url).await.unwrap();
        assert_eq!(best.id(), WorkerId::new(2));

        let elsewhere = Url::parse("https://other.org/").unwrap();
        assert!(cache.best_active_for(&elsewhere).await.is_none());
    }

    #[tokio::test]
    async fn test_mirror_updates_and_evicts() {
        let cache = InstanceCache::new();
        let live = cache
            .get_or_try_insert_with(WorkerId::new(4), || async {
                Ok(instance(4, "https://example.com/", InstallState::Installed))
            })
            .await
            .unwrap();

        let mut change = live.to_match();
        change.install_state = InstallState::Activated;
        cache.mirror(&change).await;
        assert_eq!(live.install_state(), InstallState::Activated);

        change.install_state = InstallState::Redundant;
        cache.mirror(&change).await;
        assert_eq!(live.install_state(), InstallState::Redundant);
        assert_eq!(cache.live_count().await, 0);
        assert!(cache.get(WorkerId::new(4)).await.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = InstanceCache::new();
        for id in [9, 10] {
            cache
                .get_or_try_insert_with(WorkerId::new(id), || async move {
                    Ok(instance(id, "https://example.com/", InstallState::Activated))
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.live_count().await, 2);

        cache.clear().await;
        assert_eq!(cache.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_build_is_retried() {
        let cache = InstanceCache::new();
        let failed = cache
            .get_or_try_insert_with(WorkerId::new(5), || async {
                Err(ServiceWorkerError::internal("no runtime"))
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.live_count().await, 0);

        let built = cache
            .get_or_try_insert_with(WorkerId::new(5), || async {
                Ok(instance(5, "https://example.com/", InstallState::Installed))
            })
            .await
            .unwrap();
        assert_eq!(built.id(), WorkerId::new(5));
    }

    #[tokio::test]
    async fn test_slow_build_does_not_block_other_ids() {
        let cache = Arc::new(InstanceCache::new());
        cache
            .get_or_try_insert_with(WorkerId::new(1), || async {
                Ok(instance(1, "https://example.com/a/", InstallState::Activated))
            })
            .await
            .unwrap();

        let slow = Arc::clone(&cache);
        let pending = tokio::spawn(async move {
            slow.get_or_try_insert_with(WorkerId::new(2), || async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(instance(2, "https://example.com/b/", InstallState::Activated))
            })
            .await
        });
        tokio::task::yield_now().await;

        let url = Url::parse("https://example.com/a/page").unwrap();
        let found = tokio::time::timeout(std::time::Duration::from_secs(2), cache.best_active_for(&url))
            .await
            .expect("lookup waited on an unrelated build");
        assert_eq!(found.unwrap().id(), WorkerId::new(1));
        assert!(cache.get(WorkerId::new(2)).await.is_none());

        pending.abort();
    }
}
