//! The service worker manager: an explicitly owned registry object tying the
//! store, instance cache, event bus and external collaborators together.
//!
//! Lifecycle operations live in `lifecycle.rs`, lookups in `resolver.rs`.

use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use swkit_common::with_timeout;
use swkit_net::{HttpFetcher, RemoteFetch};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};
use url::Url;

use crate::config::ServiceWorkerConfig;
use crate::error::{Result, ServiceWorkerError};
use crate::events::{EventBus, Subscription};
use crate::instance::{InstanceCache, WorkerInstance};
use crate::runtime::{ExtendableEvent, WorkerRuntime};
use crate::store::WorkerStore;
use crate::types::{InstallState, WorkerId, WorkerMatch, WorkerRecord};

/// Owns every piece of worker state for one host process.
///
/// Cheap to clone; clones share state. Background installs hold a clone.
#[derive(Clone)]
pub struct ServiceWorkerManager {
    pub(crate) inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    pub(crate) store: WorkerStore,
    pub(crate) instances: InstanceCache,
    pub(crate) events: EventBus,
    pub(crate) runtime: Arc<dyn WorkerRuntime>,
    pub(crate) fetcher: Arc<dyn RemoteFetch>,
    pub(crate) config: ServiceWorkerConfig,
    url_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ServiceWorkerManager {
    /// Open the store named in `config` and wire up the collaborators.
    pub fn new(
        config: ServiceWorkerConfig,
        runtime: Arc<dyn WorkerRuntime>,
        fetcher: Arc<dyn RemoteFetch>,
    ) -> Result<Self> {
        config.validate()?;
        let store = WorkerStore::open(&config.database_path, config.security_policy())?;
        Ok(Self::with_store(store, config, runtime, fetcher))
    }

    /// Like [`ServiceWorkerManager::new`], fetching scripts over HTTP.
    pub fn with_http(config: ServiceWorkerConfig, runtime: Arc<dyn WorkerRuntime>) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.loader.clone())?;
        Self::new(config, runtime, Arc::new(fetcher))
    }

    /// Use an already-open store.
    pub fn with_store(
        store: WorkerStore,
        config: ServiceWorkerConfig,
        runtime: Arc<dyn WorkerRuntime>,
        fetcher: Arc<dyn RemoteFetch>,
    ) -> Self {
        info!(
            update_interval_secs = config.update_check_interval_secs,
            dispatch_timeout_ms = config.dispatch_timeout_ms,
            "Service worker manager ready"
        );
        Self {
            inner: Arc::new(ManagerInner {
                store,
                instances: InstanceCache::new(),
                events: EventBus::new(),
                runtime,
                fetcher,
                config,
                url_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &WorkerStore {
        &self.inner.store
    }

    pub fn config(&self) -> &ServiceWorkerConfig {
        &self.inner.config
    }

    /// Receive every state change published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    /// Drop all live instances.
    pub async fn clear_instances(&self) {
        self.inner.instances.clear().await;
    }

    pub async fn live_instance_count(&self) -> usize {
        self.inner.instances.live_count().await
    }

    /// The live instance for `id`, building a runtime handle on first use.
    pub async fn get_instance(&self, id: WorkerId) -> Result<Arc<WorkerInstance>> {
        if let Some(instance) = self.inner.instances.get(id).await {
            return Ok(instance);
        }
        let record = self.inner.store.get(id).await?;
        self.instance_for(record).await
    }

    pub(crate) async fn instance_for(&self, record: WorkerRecord) -> Result<Arc<WorkerInstance>> {
        if record.install_state.is_redundant() {
            return Err(ServiceWorkerError::Redundant(record.id));
        }

        let runtime = Arc::clone(&self.inner.runtime);
        let timeout = self.inner.config.dispatch_timeout();
        self.inner
            .instances
            .get_or_try_insert_with(record.id, || async move {
                let handle = with_timeout(timeout, || runtime.build(&record))
                    .await
                    .map_err(|e| ServiceWorkerError::dispatch(record.id, "evaluate", e.to_string()))?
                    .map_err(|e| ServiceWorkerError::dispatch(record.id, "evaluate", e.to_string()))?;
                Ok(WorkerInstance::new(&record, handle))
            })
            .await
    }

    /// Persist a state change, then mirror and publish it.
    pub(crate) async fn commit_state(&self, id: WorkerId, state: InstallState) -> Result<WorkerMatch> {
        let change = self.inner.store.set_state(id, state).await?;
        self.announce(change.clone()).await;
        Ok(change)
    }

    /// Mark `id` redundant, tolerating records that already are.
    pub(crate) async fn mark_redundant(&self, id: WorkerId) -> Result<()> {
        match self.commit_state(id, InstallState::Redundant).await {
            Ok(_) => Ok(()),
            Err(ServiceWorkerError::InvalidTransition {
                from: InstallState::Redundant,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reflect an already-committed change in the cache and on the bus.
    pub(crate) async fn announce(&self, change: WorkerMatch) {
        self.inner.instances.mirror(&change).await;
        debug!(
            id = %change.instance_id,
            url = %change.url,
            state = %change.install_state,
            subscribers = self.inner.events.subscriber_count(),
            "Worker state changed"
        );
        self.inner.events.publish(change);
    }

    /// Run an extendable event on `instance`, bounded by the dispatch timeout.
    pub(crate) async fn dispatch(
        &self,
        instance: &WorkerInstance,
        event: ExtendableEvent,
    ) -> Result<()> {
        let event_type = event.event_type();
        let timeout = self.inner.config.dispatch_timeout();
        match with_timeout(timeout, || instance.handle().dispatch_extendable_event(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ServiceWorkerError::dispatch(instance.id(), event_type, e.to_string())),
            Err(e) => Err(ServiceWorkerError::dispatch(instance.id(), event_type, e.to_string())),
        }
    }

    /// Serialize lifecycle work for one script URL.
    pub(crate) async fn lock_url(&self, url: &Url) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .inner
                .url_locks
                .lock()
                .map_err(|_| ServiceWorkerError::internal("url lock table poisoned"))?;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(url.as_str().to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        Ok(lock.lock_owned().await)
    }
}
