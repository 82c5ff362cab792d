//! Which worker serves a URL.

use std::sync::Arc;
use swkit_common::with_timeout;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{Result, ServiceWorkerError};
use crate::instance::WorkerInstance;
use crate::manager::ServiceWorkerManager;
use crate::runtime::{
    ExtendableEvent, FetchRequest, FetchResponse, NotificationAction, NotificationData,
};
use crate::types::{InstallState, WorkerId, WorkerMatch};

const RESOLVABLE: [InstallState; 2] = [InstallState::Activated, InstallState::Installed];

impl ServiceWorkerManager {
    /// The worker that should handle `url`, if any.
    ///
    /// Prefers the most specific scope, then the newest worker. A live
    /// activated instance is used as long as nothing in the store has a
    /// longer matching scope. Installed candidates are activated on the way;
    /// one that fails to activate is skipped in favour of the next.
    #[instrument(skip(self, url), fields(url = %url))]
    pub async fn resolve(&self, url: &Url) -> Result<Option<Arc<WorkerInstance>>> {
        let cached = self.inner.instances.best_active_for(url).await;
        let candidates = self.inner.store.find_by_scope_prefix(url, &RESOLVABLE).await?;

        if let Some(instance) = cached {
            let outscoped = candidates
                .first()
                .is_some_and(|c| c.scope.as_str().len() > instance.scope().as_str().len());
            if !outscoped {
                debug!(id = %instance.id(), "Resolved from live instance");
                return Ok(Some(instance));
            }
        }

        for candidate in candidates {
            if let Some(instance) = self.try_candidate(&candidate).await {
                return Ok(Some(instance));
            }
        }

        debug!("No service worker covers URL");
        Ok(None)
    }

    async fn try_candidate(&self, candidate: &WorkerMatch) -> Option<Arc<WorkerInstance>> {
        let id = candidate.instance_id;
        let instance = match self.get_instance(id).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(%id, error = %e, "Skipping candidate that failed to load");
                return None;
            }
        };

        match candidate.install_state {
            InstallState::Activated => Some(instance),
            InstallState::Installed => match self.activate(&instance).await {
                Ok(()) => {
                    info!(%id, scope = %candidate.scope, "Activated waiting worker on demand");
                    Some(instance)
                }
                Err(e) => {
                    warn!(%id, error = %e, "Falling back past worker that failed to activate");
                    None
                }
            },
            _ => None,
        }
    }

    /// Every worker registered at the most specific scope covering `url`,
    /// in any state, newest first.
    pub async fn list_workers_for_url(&self, url: &Url) -> Result<Vec<WorkerMatch>> {
        self.inner.store.list_for_url(url).await
    }

    /// Give the controlling worker a chance to answer `request`.
    ///
    /// `Ok(None)` means no worker covers the URL and the host should go to the
    /// network itself.
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    pub async fn handle_fetch(&self, request: FetchRequest) -> Result<Option<FetchResponse>> {
        let Some(instance) = self.resolve(&request.url).await? else {
            return Ok(None);
        };

        let id = instance.id();
        let timeout = self.inner.config.dispatch_timeout();
        let response = with_timeout(timeout, || instance.handle().dispatch_fetch_event(request))
            .await
            .map_err(|e| ServiceWorkerError::dispatch(id, "fetch", e.to_string()))?
            .map_err(|e| ServiceWorkerError::dispatch(id, "fetch", e.to_string()))?;

        debug!(%id, status = response.status, "Worker answered fetch");
        Ok(Some(response))
    }

    /// Deliver a notification click or close to the worker controlling
    /// `scope`. Returns the id of the worker that handled it.
    #[instrument(skip(self, scope, notification), fields(scope = %scope, title = %notification.title))]
    pub async fn dispatch_notification(
        &self,
        scope: &Url,
        notification: NotificationData,
        action: NotificationAction,
    ) -> Result<WorkerId> {
        let instance = self
            .resolve(scope)
            .await?
            .ok_or_else(|| ServiceWorkerError::NoController(scope.clone()))?;

        let event = ExtendableEvent::notification(notification, action);
        debug!(id = %instance.id(), event = event.event_type(), "Dispatching notification event");
        self.dispatch(&instance, event).await?;
        Ok(instance.id())
    }
}
