//! # swkit service workers
//!
//! A registry of versioned service workers keyed by script URL and scope.
//!
//! ## Features
//!
//! - **Registry**: workers persisted in SQLite with their script bytes
//! - **Lifecycle**: update checks, install, activate, redundancy
//! - **Scope resolution**: longest-prefix match with on-demand activation
//! - **Events**: every state change is published to subscribers
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerManager
//!     ├── WorkerStore      (rusqlite, one row per worker version)
//!     ├── InstanceCache    (live runtime handles, one per id)
//!     ├── EventBus         (WorkerMatch snapshots)
//!     ├── dyn WorkerRuntime (executes scripts)
//!     └── dyn RemoteFetch   (downloads scripts)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let manager = ServiceWorkerManager::with_http(config, runtime)?;
//! manager.recover_interrupted().await?;
//!
//! let id = manager.update(&script_url, None, false).await?;
//! if let Some(worker) = manager.resolve(&page_url).await? {
//!     println!("{} is controlled by {}", page_url, worker.id());
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod instance;
pub mod lifecycle;
pub mod manager;
pub mod policy;
pub mod resolver;
pub mod runtime;
pub mod store;
pub mod types;

pub use config::ServiceWorkerConfig;
pub use error::{Result, ServiceWorkerError};
pub use events::{EventBus, Subscription};
pub use instance::{InstanceCache, WorkerInstance};
pub use lifecycle::RecoveryReport;
pub use manager::ServiceWorkerManager;
pub use policy::SecurityPolicy;
pub use runtime::{
    ExtendableEvent, FetchRequest, FetchResponse, NotificationAction, NotificationData,
    RuntimeError, WorkerHandle, WorkerRuntime,
};
pub use store::WorkerStore;
pub use types::{InstallState, NewWorker, WorkerId, WorkerMatch, WorkerRecord};
