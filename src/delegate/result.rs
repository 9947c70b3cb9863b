//! Delegate result buffering
//!
//! Payloads POSTed by callback sidecars are held here, keyed by the parent's
//! identity and tagged with the config fingerprint they were produced under.
//! A result is consumed exactly once: `pop` removes the entry whether or not
//! the fingerprint matched, so stale generations never leak to a consumer.

use std::collections::HashMap;
use std::sync::Mutex;

use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ParentObject;
use crate::operator::GROUP;

/// Identifies the result slot for one parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub kind: String,
    pub uid: String,
}

impl StorageKey {
    /// Derive the storage key for a parent: `(lower(kind), uid)`.
    ///
    /// Panics if the parent is not a `kudzu.sh` resource; only the operator's
    /// own types may be keyed here, and anything else is a programming error.
    pub fn for_object<P: ParentObject>(parent: &P) -> StorageKey {
        let group = P::group(&());
        if group != GROUP {
            panic!("{}/{} is not a {} resource", group, P::kind(&()), GROUP);
        }

        StorageKey {
            kind: P::kind(&()).to_lowercase(),
            uid: parent.uid().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResultError {
    /// No payload for the parent, or the stored payload belonged to another
    /// fingerprint generation.
    #[error("result not found; callback not received from delegate")]
    NotFound,

    /// The delegate reported a failure instead of a result.
    #[error("delegate error: {0}")]
    Delegate(String),

    #[error("failed to decode delegate result: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Buffer shared between the callback server (producer) and the reconcilers
/// (consumers). At most one entry per key.
pub trait ResultStorage: Send + Sync {
    /// Store a payload, replacing any prior entry for the key.
    fn put(&self, key: StorageKey, fingerprint: &str, data: Vec<u8>) -> Result<(), ResultError>;

    /// Atomically remove and return the payload for `key`. Returns `NotFound`
    /// when no entry exists or the stored fingerprint differs from
    /// `fingerprint`; the entry is removed in either case.
    fn pop(&self, key: &StorageKey, fingerprint: &str) -> Result<Vec<u8>, ResultError>;
}

struct StoredResult {
    fingerprint: String,
    data: Vec<u8>,
}

/// Process-local, non-durable result storage. Results in flight across an
/// operator restart are lost and regenerated by a fresh delegate run.
#[derive(Default)]
pub struct MemoryResultStorage {
    data: Mutex<HashMap<StorageKey, StoredResult>>,
}

impl ResultStorage for MemoryResultStorage {
    fn put(&self, key: StorageKey, fingerprint: &str, data: Vec<u8>) -> Result<(), ResultError> {
        let mut entries = self.data.lock().expect("result storage mutex poisoned");
        entries.insert(
            key,
            StoredResult {
                fingerprint: fingerprint.to_string(),
                data,
            },
        );
        Ok(())
    }

    fn pop(&self, key: &StorageKey, fingerprint: &str) -> Result<Vec<u8>, ResultError> {
        let mut entries = self.data.lock().expect("result storage mutex poisoned");
        let stored = entries.remove(key).ok_or(ResultError::NotFound)?;

        if stored.fingerprint != fingerprint {
            return Err(ResultError::NotFound);
        }

        Ok(stored.data)
    }
}

/// Group/version identifying the error payload shape.
pub const ERROR_API_VERSION: &str = "delegate.kudzu.sh/v1alpha1";
pub const ERROR_KIND: &str = "Error";

/// A delegate-produced failure report, distinguished from domain payloads by
/// its fixed apiVersion/kind pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorResult {
    fn matches_sentinel(&self) -> bool {
        self.api_version == ERROR_API_VERSION && self.kind == ERROR_KIND
    }
}

/// Decode a delegate payload. A payload carrying the error sentinel GVK is
/// surfaced as `ResultError::Delegate`; anything else is decoded into the
/// caller's type.
pub fn decode_result<T: DeserializeOwned>(data: &[u8]) -> Result<T, ResultError> {
    if let Ok(report) = serde_json::from_slice::<ErrorResult>(data) {
        if report.matches_sentinel() {
            return Err(ResultError::Delegate(report.message));
        }
    }

    Ok(serde_json::from_slice(data)?)
}
