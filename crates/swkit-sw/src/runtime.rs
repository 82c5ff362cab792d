//! The narrow surface the core needs from whatever actually executes worker
//! scripts. The core never sees runtime internals.

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

use crate::types::WorkerRecord;

/// Failure reported by the runtime.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Event '{event}' was rejected: {reason}")]
    EventRejected { event: String, reason: String },

    #[error("Worker terminated")]
    Terminated,
}

/// Notification data carried by notification events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    pub title: String,
    pub body: Option<String>,
    pub tag: Option<String>,
    pub icon: Option<String>,
    pub data: Option<JsonValue>,
}

/// What the user did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    /// Clicked; `action` is the button id, or `None` for the body.
    Click { action: Option<String> },
    /// Dismissed.
    Close,
}

/// A lifecycle event the runtime must run to an explicit completion signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendableEvent {
    Install,
    Activate,
    NotificationClick {
        notification: NotificationData,
        /// Empty when the notification body itself was clicked.
        action: String,
    },
    NotificationClose {
        notification: NotificationData,
    },
}

impl ExtendableEvent {
    pub fn notification(notification: NotificationData, action: NotificationAction) -> Self {
        match action {
            NotificationAction::Click { action } => ExtendableEvent::NotificationClick {
                notification,
                action: action.unwrap_or_default(),
            },
            NotificationAction::Close => ExtendableEvent::NotificationClose { notification },
        }
    }

    /// The DOM event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            ExtendableEvent::Install => "install",
            ExtendableEvent::Activate => "activate",
            ExtendableEvent::NotificationClick { .. } => "notificationclick",
            ExtendableEvent::NotificationClose { .. } => "notificationclose",
        }
    }
}

/// A request handed to a worker's fetch handler.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

/// A worker's answer to a fetch event.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A live execution environment for one worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Run an extendable event to completion.
    async fn dispatch_extendable_event(&self, event: ExtendableEvent) -> Result<(), RuntimeError>;

    async fn dispatch_fetch_event(&self, request: FetchRequest)
        -> Result<FetchResponse, RuntimeError>;

    /// Evaluate an expression in the worker's global scope.
    async fn execute_js(&self, expression: &str) -> Result<JsonValue, RuntimeError>;

    /// Did the script call `skipWaiting()` during install?
    async fn skip_waiting_requested(&self) -> Result<bool, RuntimeError>;
}

/// Builds execution environments from stored script bytes.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    async fn build(&self, record: &WorkerRecord) -> Result<Box<dyn WorkerHandle>, RuntimeError>;
}
