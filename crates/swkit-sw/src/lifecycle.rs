//! Update, install and activate.
//!
//! ```text
//! Installing ──► Installed ──► Activating ──► Activated
//!     │              │              │              │
//!     └──────────────┴──────┬───────┴──────────────┘
//!                           ▼
//!                       Redundant
//! ```
//!
//! Install failures are terminal: the record goes redundant and only a fresh
//! `update()` tries again. A failed activate dispatch leaves the record in
//! `Activating` until [`ServiceWorkerManager::recover_interrupted`] runs.

use swkit_common::with_timeout;
use swkit_net::NetError;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::error::{Result, ServiceWorkerError};
use crate::instance::WorkerInstance;
use crate::manager::ServiceWorkerManager;
use crate::runtime::ExtendableEvent;
use crate::store::now_secs;
use crate::types::{content_fingerprint, default_scope, InstallState, NewWorker, WorkerId, WorkerMatch};

/// Outcome of [`ServiceWorkerManager::recover_interrupted`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stuck `Activating` records whose retried activation succeeded.
    pub activated: Vec<WorkerId>,
    /// Stuck records that were given up on.
    pub abandoned: Vec<WorkerId>,
}

impl ServiceWorkerManager {
    /// Register or refresh the worker at `url`.
    ///
    /// Returns the id of the worker that now represents `url`: the existing
    /// one when a cycle is already running, the last check is recent, or the
    /// script is unchanged; otherwise a freshly inserted record whose install
    /// runs in the background.
    #[instrument(skip(self, url, scope), fields(url = %url))]
    pub async fn update(&self, url: &Url, scope: Option<&Url>, force_check: bool) -> Result<WorkerId> {
        let _guard = self.lock_url(url).await?;

        let newest = self.inner.store.newest_record(url).await?;

        if let Some(ref record) = newest {
            if record.install_state.is_in_flight() {
                info!(id = %record.id, state = %record.install_state, "Cycle already in flight, returning existing worker");
                return Ok(record.id);
            }

            let max_age =
                i64::try_from(self.inner.config.update_check_interval().as_secs()).unwrap_or(i64::MAX);
            if !force_check && !record.is_stale(now_secs(), max_age) {
                debug!(id = %record.id, "Checked recently, returning existing worker");
                return Ok(record.id);
            }
        }

        let response = self.inner.fetcher.get(url).await?;
        if !response.ok() {
            return Err(NetError::BadStatus {
                url: url.clone(),
                status: response.status,
            }
            .into());
        }

        let checked_at = now_secs();
        let content = response.body.to_vec();

        if let Some(ref record) = newest {
            if record.content_hash == content_fingerprint(&content) {
                info!(id = %record.id, "Script unchanged");
                self.inner.store.touch_last_checked(record.id, checked_at).await?;
                return Ok(record.id);
            }
        }

        let scope = match (scope, newest.as_ref()) {
            (Some(scope), _) => scope.clone(),
            (None, Some(previous)) => previous.scope.clone(),
            (None, None) => default_scope(url),
        };

        let id = self
            .inner
            .store
            .insert(NewWorker::new(url.clone(), scope.clone(), checked_at, content))
            .await?;
        info!(%id, scope = %scope, "Installing new service worker");

        self.announce(WorkerMatch {
            instance_id: id,
            url: url.clone(),
            scope,
            install_state: InstallState::Installing,
        })
        .await;

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.install(id).await {
                warn!(%id, error = %e, category = e.category(), "Background install failed");
            }
        });

        Ok(id)
    }

    /// Run the install event for `id`, and activate straight away if the
    /// script asked to skip waiting.
    ///
    /// Any failure marks the worker redundant and is returned to the caller.
    #[instrument(skip(self))]
    pub async fn install(&self, id: WorkerId) -> Result<InstallState> {
        let record = self.inner.store.get(id).await?;
        if record.install_state != InstallState::Installing {
            return Err(ServiceWorkerError::InvalidTransition {
                id,
                from: record.install_state,
                to: InstallState::Installed,
            });
        }

        let outcome = match self.instance_for(record).await {
            Ok(instance) => self.run_install(&instance).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(state) => Ok(state),
            Err(e) => {
                error!(%id, error = %e, "Error during installation");
                self.mark_redundant(id).await?;
                Err(e)
            }
        }
    }

    async fn run_install(&self, instance: &WorkerInstance) -> Result<InstallState> {
        let id = instance.id();
        self.dispatch(instance, ExtendableEvent::Install).await?;
        self.commit_state(id, InstallState::Installed).await?;

        let timeout = self.inner.config.dispatch_timeout();
        let skip_waiting = with_timeout(timeout, || instance.handle().skip_waiting_requested())
            .await
            .map_err(|e| ServiceWorkerError::dispatch(id, "skipWaiting", e.to_string()))?
            .map_err(|e| ServiceWorkerError::dispatch(id, "skipWaiting", e.to_string()))?;

        if !skip_waiting {
            debug!(%id, "Installed, waiting for activation");
            return Ok(InstallState::Installed);
        }

        info!(%id, url = %instance.url(), "Worker called skipWaiting()");
        self.activate(instance).await?;
        Ok(InstallState::Activated)
    }

    /// Activate an installed worker.
    ///
    /// On success the worker is `Activated` and every other live record for
    /// the same script URL is `Redundant`, committed together; one event is
    /// published per changed record afterwards. If the activate event fails
    /// the error is returned and the worker stays `Activating`.
    #[instrument(skip(self, instance), fields(id = %instance.id()))]
    pub async fn activate(&self, instance: &WorkerInstance) -> Result<()> {
        let id = instance.id();
        let _guard = self.lock_url(instance.url()).await?;

        let current = self.inner.store.get(id).await?.install_state;
        match current {
            InstallState::Activated => {
                instance.set_install_state(InstallState::Activated);
                return Ok(());
            }
            InstallState::Installed => {
                self.commit_state(id, InstallState::Activating).await?;
            }
            InstallState::Activating => {
                debug!("Retrying activate dispatch");
            }
            from => {
                return Err(ServiceWorkerError::InvalidTransition {
                    id,
                    from,
                    to: InstallState::Activating,
                });
            }
        }

        if let Err(e) = self.dispatch(instance, ExtendableEvent::Activate).await {
            warn!(error = %e, "Activation failed, worker left activating");
            return Err(e);
        }

        let changes = self.inner.store.activate_cascade(id).await?;
        info!(superseded = changes.len().saturating_sub(1), "Worker activated");
        for change in changes {
            self.announce(change).await;
        }
        Ok(())
    }

    /// Activate by id; the external trigger for a waiting worker.
    pub async fn activate_by_id(&self, id: WorkerId) -> Result<()> {
        let instance = self.get_instance(id).await?;
        self.activate(&instance).await
    }

    /// Resolve records left mid-cycle by a previous process.
    ///
    /// `Installing` records are abandoned (install is not retried).
    /// `Activating` records get one more activate dispatch and are abandoned
    /// if it fails. Call before serving requests; it will abandon installs
    /// started by this process.
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for record in self.inner.store.records_in_state(InstallState::Installing).await? {
            warn!(id = %record.id, url = %record.url, "Abandoning interrupted install");
            self.mark_redundant(record.id).await?;
            report.abandoned.push(record.id);
        }

        for record in self.inner.store.records_in_state(InstallState::Activating).await? {
            let id = record.id;
            let retried = match self.instance_for(record).await {
                Ok(instance) => self.activate(&instance).await,
                Err(e) => Err(e),
            };
            match retried {
                Ok(()) => {
                    info!(%id, "Recovered interrupted activation");
                    report.activated.push(id);
                }
                Err(e) => {
                    warn!(%id, error = %e, "Abandoning interrupted activation");
                    self.mark_redundant(id).await?;
                    report.abandoned.push(id);
                }
            }
        }

        Ok(report)
    }

    /// `Last-Modified` of the remote script, if the server reports one.
    pub async fn remote_last_modified(&self, url: &Url) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let response = self.inner.fetcher.head(url).await?;
        if !response.ok() {
            return Err(NetError::BadStatus {
                url: url.clone(),
                status: response.status,
            }
            .into());
        }
        Ok(response.last_modified())
    }
}
