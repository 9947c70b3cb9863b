//! Operator types
//!
//! Shared context, error type, and the label/finalizer vocabulary of the API
//! controller.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use thiserror::Error;

use crate::delegate::{DelegateError, Manager, ResultError, ResultStorage};

/// The operator's API group.
pub const GROUP: &str = "kudzu.sh";
pub const VERSION: &str = "v1alpha1";

/// Label tying an owned CRD back to its API: `kudzu.sh/api=<name>`.
pub const LABEL_API: &str = "kudzu.sh/api";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "kudzu";

/// Finalizer blocking API deletion until owned CRDs are gone.
pub const FINALIZER: &str = "kudzu.sh/api";

/// Operator errors
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Delegate(#[from] DelegateError),

    #[error(transparent)]
    Result(#[from] ResultError),
}

/// Result type for operator operations
pub type Result<T, E = OperatorError> = std::result::Result<T, E>;

/// Context data for the controller
pub struct Context {
    pub client: Client,
    pub delegates: Manager,
    pub results: Arc<dyn ResultStorage>,
}

impl Context {
    pub fn new(client: Client, delegates: Manager, results: Arc<dyn ResultStorage>) -> Self {
        Self {
            client,
            delegates,
            results,
        }
    }
}

pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == FINALIZER))
}

/// Add the finalizer if missing; returns whether the list changed.
pub fn ensure_finalizer(meta: &mut ObjectMeta) -> bool {
    if has_finalizer(meta) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    true
}

/// Remove the finalizer if present; returns whether the list changed.
pub fn remove_finalizer(meta: &mut ObjectMeta) -> bool {
    if !has_finalizer(meta) {
        return false;
    }
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|f| f != FINALIZER);
    }
    true
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists")
}
