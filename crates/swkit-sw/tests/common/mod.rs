//! Shared fixtures for the integration suites.
//!
//! The mock runtime decides behaviour from markers in the script text:
//! `fail-evaluate`, `hang-evaluate`, `fail-install`, `fail-activate`,
//! `hang-install` and `skip-waiting`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::Value as JsonValue;
use swkit_net::{FetchedResource, NetError, RemoteFetch};
use swkit_sw::{
    ExtendableEvent, FetchRequest, FetchResponse, InstallState, NewWorker, RuntimeError,
    SecurityPolicy, ServiceWorkerConfig, ServiceWorkerManager, WorkerHandle, WorkerId,
    WorkerRecord, WorkerRuntime, WorkerStore,
};
use url::Url;

pub fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

/// Every event dispatched to any handle, in order.
pub type DispatchLog = Arc<Mutex<Vec<(WorkerId, String)>>>;

#[derive(Default)]
pub struct MockRuntime {
    pub log: DispatchLog,
    pub builds: AtomicUsize,
}

impl MockRuntime {
    pub fn events_for(&self, id: WorkerId) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(worker, _)| *worker == id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn dispatch_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkerRuntime for MockRuntime {
    async fn build(&self, record: &WorkerRecord) -> Result<Box<dyn WorkerHandle>, RuntimeError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let script = String::from_utf8_lossy(&record.content).into_owned();
        if script.contains("fail-evaluate") {
            return Err(RuntimeError::ScriptError("SyntaxError".to_string()));
        }
        if script.contains("hang-evaluate") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(Box::new(MockHandle {
            id: record.id,
            script,
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockHandle {
    id: WorkerId,
    script: String,
    log: DispatchLog,
}

#[async_trait]
impl WorkerHandle for MockHandle {
    async fn dispatch_extendable_event(&self, event: ExtendableEvent) -> Result<(), RuntimeError> {
        let event_type = event.event_type();
        self.log
            .lock()
            .unwrap()
            .push((self.id, event_type.to_string()));

        match event {
            ExtendableEvent::Install if self.script.contains("hang-install") => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
            ExtendableEvent::Install if self.script.contains("fail-install") => {
                Err(RuntimeError::EventRejected {
                    event: event_type.to_string(),
                    reason: "waitUntil rejected".to_string(),
                })
            }
            ExtendableEvent::Activate if self.script.contains("fail-activate") => {
                Err(RuntimeError::EventRejected {
                    event: event_type.to_string(),
                    reason: "waitUntil rejected".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn dispatch_fetch_event(&self, request: FetchRequest) -> Result<FetchResponse, RuntimeError> {
        self.log.lock().unwrap().push((self.id, "fetch".to_string()));
        Ok(FetchResponse {
            status: 200,
            headers: Default::default(),
            body: format!("{} from {}", request.url, self.id).into_bytes(),
        })
    }

    async fn execute_js(&self, _expression: &str) -> Result<JsonValue, RuntimeError> {
        Ok(JsonValue::Null)
    }

    async fn skip_waiting_requested(&self) -> Result<bool, RuntimeError> {
        Ok(self.script.contains("skip-waiting"))
    }
}

enum Served {
    Body(Vec<u8>),
    Status(u16),
    Unreachable,
}

/// Serves scripts from an in-memory table.
#[derive(Default)]
pub struct MockFetcher {
    scripts: Mutex<HashMap<String, Served>>,
    pub gets: AtomicUsize,
    last_modified: Mutex<Option<String>>,
}

impl MockFetcher {
    pub fn serve(&self, url: &Url, body: &str) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), Served::Body(body.as_bytes().to_vec()));
    }

    pub fn serve_status(&self, url: &Url, status: u16) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), Served::Status(status));
    }

    pub fn go_offline(&self, url: &Url) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), Served::Unreachable);
    }

    pub fn set_last_modified(&self, value: &str) {
        *self.last_modified.lock().unwrap() = Some(value.to_string());
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn respond(&self, url: &Url, with_body: bool) -> Result<FetchedResource, NetError> {
        let scripts = self.scripts.lock().unwrap();
        let (status, body) = match scripts.get(url.as_str()) {
            Some(Served::Body(body)) => (StatusCode::OK, body.clone()),
            Some(Served::Status(code)) => (StatusCode::from_u16(*code).unwrap(), Vec::new()),
            Some(Served::Unreachable) | None => {
                return Err(NetError::RequestFailed(format!("connection refused: {}", url)))
            }
        };

        let mut headers = HeaderMap::new();
        if let Some(ref stamp) = *self.last_modified.lock().unwrap() {
            headers.insert(http::header::LAST_MODIFIED, HeaderValue::from_str(stamp).unwrap());
        }

        Ok(FetchedResource {
            url: url.clone(),
            status,
            headers,
            body: if with_body { Bytes::from(body) } else { Bytes::new() },
        })
    }
}

#[async_trait]
impl RemoteFetch for MockFetcher {
    async fn get(&self, url: &Url) -> Result<FetchedResource, NetError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.respond(url, true)
    }

    async fn head(&self, url: &Url) -> Result<FetchedResource, NetError> {
        self.respond(url, false)
    }
}

pub struct Harness {
    pub manager: ServiceWorkerManager,
    pub runtime: Arc<MockRuntime>,
    pub fetcher: Arc<MockFetcher>,
}

impl Harness {
    pub fn new() -> Self {
        let config = ServiceWorkerConfig {
            dispatch_timeout_ms: 200,
            ..Default::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: ServiceWorkerConfig) -> Self {
        swkit_common::init_test_logging();

        let runtime = Arc::new(MockRuntime::default());
        let fetcher = Arc::new(MockFetcher::default());
        let store = WorkerStore::open_in_memory(SecurityPolicy::default()).unwrap();
        let manager = ServiceWorkerManager::with_store(
            store,
            config,
            Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
            Arc::clone(&fetcher) as Arc<dyn RemoteFetch>,
        );
        Self {
            manager,
            runtime,
            fetcher,
        }
    }

    /// Write a record straight into the store, bypassing the lifecycle.
    pub async fn seed(&self, script: &str, scope: &str, state: InstallState, body: &str) -> WorkerId {
        let worker = NewWorker::new(url(script), url(scope), swkit_sw::store::now_secs(), body.as_bytes().to_vec())
            .with_state(state);
        self.manager.store().insert(worker).await.unwrap()
    }

    pub async fn state_of(&self, id: WorkerId) -> InstallState {
        self.manager.store().get(id).await.unwrap().install_state
    }

    /// Poll until the background lifecycle moves `id` into `state`.
    pub async fn wait_for_state(&self, id: WorkerId, state: InstallState) -> WorkerRecord {
        for _ in 0..300 {
            let record = self.manager.store().get(id).await.unwrap();
            if record.install_state == state {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "worker {} never reached {}, still {}",
            id,
            state,
            self.state_of(id).await
        );
    }
}
