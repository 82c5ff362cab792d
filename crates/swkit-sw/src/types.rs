//! The three shapes of a worker: the persisted [`WorkerRecord`], the
//! wire-safe [`WorkerMatch`], and (in `instance.rs`) the live instance.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Row id of a worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(i64);

impl WorkerId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Install state. The discriminants are what the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallState {
    /// Install event in flight.
    Installing = 0,
    /// Installed, waiting for activation.
    Installed = 1,
    /// Activate event in flight.
    Activating = 2,
    /// Active and eligible to serve its scope.
    Activated = 3,
    /// Failed or superseded. Terminal.
    Redundant = 4,
}

impl InstallState {
    pub const ALL: [InstallState; 5] = [
        InstallState::Installing,
        InstallState::Installed,
        InstallState::Activating,
        InstallState::Activated,
        InstallState::Redundant,
    ];

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(raw: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_i64() == raw)
    }

    pub fn is_redundant(self) -> bool {
        self == InstallState::Redundant
    }

    /// An install or activate cycle is running for this record.
    pub fn is_in_flight(self) -> bool {
        matches!(self, InstallState::Installing | InstallState::Activating)
    }

    pub fn can_transition_to(self, next: InstallState) -> bool {
        use InstallState::*;
        matches!(
            (self, next),
            (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Installing | Installed | Activating | Activated, Redundant)
        )
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallState::Installing => "installing",
            InstallState::Installed => "installed",
            InstallState::Activating => "activating",
            InstallState::Activated => "activated",
            InstallState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// SHA-256 of the script bytes, hex encoded.
pub fn content_fingerprint(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Does `scope` cover `url`? Plain string-prefix semantics.
pub fn scope_contains(scope: &str, url: &str) -> bool {
    url.starts_with(scope)
}

/// Default scope for a script: its directory.
pub fn default_scope(script_url: &Url) -> Url {
    let mut scope = script_url.clone();
    let dir = match script_url.path().rfind('/') {
        Some(idx) => script_url.path()[..=idx].to_string(),
        None => "/".to_string(),
    };
    scope.set_path(&dir);
    scope.set_query(None);
    scope.set_fragment(None);
    scope
}

/// A persisted worker row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub url: Url,
    pub scope: Url,
    pub install_state: InstallState,
    /// Epoch seconds of the last freshness check.
    pub last_checked: i64,
    pub content_hash: String,
    pub content: Vec<u8>,
}

impl WorkerRecord {
    /// Older than `max_age_secs` relative to `now` (epoch seconds).
    pub fn is_stale(&self, now: i64, max_age_secs: i64) -> bool {
        now.saturating_sub(self.last_checked) > max_age_secs
    }

    pub fn to_match(&self) -> WorkerMatch {
        WorkerMatch {
            instance_id: self.id,
            url: self.url.clone(),
            scope: self.scope.clone(),
            install_state: self.install_state,
        }
    }
}

/// Values for a new worker row.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub url: Url,
    pub scope: Url,
    pub last_checked: i64,
    pub content: Vec<u8>,
    pub install_state: InstallState,
}

impl NewWorker {
    pub fn new(url: Url, scope: Url, last_checked: i64, content: Vec<u8>) -> Self {
        Self {
            url,
            scope,
            last_checked,
            content,
            install_state: InstallState::Installing,
        }
    }

    pub fn with_state(mut self, state: InstallState) -> Self {
        self.install_state = state;
        self
    }
}

/// Immutable snapshot of a worker, safe to send across threads and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMatch {
    pub instance_id: WorkerId,
    pub url: Url,
    pub scope: Url,
    pub install_state: InstallState,
}
