//! Delegate workloads
//!
//! A delegate is a short-lived Pod (plus an optional input ConfigMap) spawned
//! on behalf of a parent resource to compute an answer the operator cannot
//! produce itself. The Pod runs one task image as an init container and a
//! callback sidecar that POSTs the task's output back to the operator.

mod callback;
mod fingerprint;
mod manager;
mod resources;
mod result;

pub use callback::{callback_router, serve, CONFIG_HASH_HEADER};
pub use fingerprint::{config_fingerprint, EMPTY_FINGERPRINT};
pub use manager::{Config, Manager, DEFAULT_BASE_URL, DEFAULT_CALLBACK_IMAGE, DEFAULT_NAMESPACE};
pub use resources::{build_config_map, build_delegate_pod};
pub use result::{
    decode_result, ErrorResult, MemoryResultStorage, ResultError, ResultStorage, StorageKey,
    ERROR_API_VERSION, ERROR_KIND,
};

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::operator::crd::{SourceSpec, SourceStatus};

/// Label carried by every delegate Pod and ConfigMap.
pub const ROLE_LABEL: &str = "kudzu.sh/role";
pub const ROLE_VALUE: &str = "delegate";

/// Annotation holding the config fingerprint a Pod or ConfigMap was built
/// for. Once committed, the same annotation on the parent records the last
/// fingerprint whose result was applied.
pub const CONFIG_ANNOTATION: &str = "delegate.kudzu.sh/config";

/// Errors from the delegate lifecycle.
#[derive(Debug, Error)]
pub enum DelegateError {
    /// The parent spec names no source image to run.
    #[error("spec for {0} doesn't specify an image")]
    MissingImage(String),

    /// `commit` was invoked on a delegate without a Pod.
    #[error("delegate for {0} has no pod to commit")]
    MissingPod(String),

    /// The parent annotation update kept conflicting after retries.
    #[error("conflict updating {0} was not resolved")]
    Conflict(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Capabilities a resource must expose for delegates to be spawned on its
/// behalf. Implemented by each concrete parent type; the Manager is generic
/// over it rather than inspecting objects at runtime.
pub trait ParentObject:
    Resource<DynamicType = (), Scope = k8s_openapi::ClusterResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
{
    fn source_spec(&self) -> &SourceSpec;
    fn source_status(&self) -> Option<&SourceStatus>;
    fn set_source_status(&mut self, status: SourceStatus);
}

/// The in-cluster view of one parent's delegate: at most one Pod and at most
/// one ConfigMap.
#[derive(Debug, Default, Clone)]
pub struct Delegate {
    pub pod: Option<Pod>,
    pub config_map: Option<ConfigMap>,
}

impl Delegate {
    /// Whether the delegate Pod ran its task to completion.
    pub fn succeeded(&self) -> bool {
        self.pod
            .as_ref()
            .and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.phase.as_deref())
            == Some("Succeeded")
    }
}

/// Deterministic name for a parent's delegate Pod and ConfigMap:
/// `delegate-<lower(kind)>-<name>`, dots replaced by dashes, truncated to the
/// 63-character object-name limit with trailing dashes trimmed.
pub fn delegate_name<P: ParentObject>(parent: &P) -> String {
    let kind = P::kind(&()).to_lowercase();
    let mut name = format!("delegate-{}-{}", kind, parent.name_any()).replace('.', "-");

    if name.len() > 63 {
        name.truncate(63);
        name.truncate(name.trim_end_matches('-').len());
    }

    name
}

/// Labels identifying a parent's delegate objects.
pub fn delegate_labels<P: ParentObject>(parent: &P) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(ROLE_LABEL.to_string(), ROLE_VALUE.to_string());
    labels.insert(
        format!("{}/{}", P::group(&()), P::kind(&()).to_lowercase()),
        parent.name_any(),
    );
    labels
}

/// The URL a delegate's callback sidecar POSTs its result to.
pub fn callback_url<P: ParentObject>(base_url: &str, parent: &P) -> String {
    format!(
        "{}/callbacks/{}/{}/result",
        base_url,
        P::kind(&()).to_lowercase(),
        parent.uid().unwrap_or_default(),
    )
}

pub(crate) fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
