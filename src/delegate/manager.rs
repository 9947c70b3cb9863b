//! Delegate lifecycle management
//!
//! The Manager decides, per reconcile pass, whether a parent's delegate Pod
//! and input ConfigMap match the configuration the operator would hand out
//! now, and repairs them one mutation at a time. Each mutating step returns
//! immediately so the watch-triggered re-queue re-enters the decision with a
//! fresh cluster view.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::fingerprint::config_fingerprint;
use super::resources::{build_config_map, build_delegate_pod};
use super::result::{ResultError, ResultStorage, StorageKey};
use super::{
    decode_result, delegate_labels, label_selector, Delegate, DelegateError, ParentObject,
    CONFIG_ANNOTATION,
};
use crate::operator::crd::{ImageStatus, SourceStatus};

pub const DEFAULT_BASE_URL: &str = "http://kudzu.kudzu.svc.cluster.local";
pub const DEFAULT_CALLBACK_IMAGE: &str = "kudzutools/callback:latest";
pub const DEFAULT_NAMESPACE: &str = "kudzu";

const COMMIT_RETRY_LIMIT: usize = 5;

/// Manager settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Image for the callback sidecar that ships results back to the
    /// operator.
    pub callback_image: String,

    /// Base URL of the operator's callback server as reachable from
    /// delegate pods.
    pub base_url: String,

    /// Namespace delegate Pods and ConfigMaps are created in.
    pub namespace: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            callback_image: DEFAULT_CALLBACK_IMAGE.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// Creates, updates, and deletes delegate Pods and ConfigMaps.
pub struct Manager {
    config: Config,
    client: Client,
}

impl Manager {
    pub fn new(client: Client, config: Config) -> Manager {
        Manager { config, client }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Load the parent's current delegate view: the oldest Pod and ConfigMap
    /// carrying its delegate labels, or `None` when neither exists.
    pub async fn get<P: ParentObject>(&self, parent: &P) -> Result<Option<Delegate>, DelegateError> {
        let selector = label_selector(&delegate_labels(parent));
        let params = ListParams::default().labels(&selector);

        let mut pods = self.pods().list(&params).await?.items;
        if pods.len() > 1 {
            warn!(
                parent = %parent.name_any(),
                count = pods.len(),
                "multiple delegate pods match; taking the oldest"
            );
        }
        pods.sort_by(|a, b| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp));
        let pod = pods.into_iter().next();

        let mut config_maps = self.config_maps().list(&params).await?.items;
        if config_maps.len() > 1 {
            warn!(
                parent = %parent.name_any(),
                count = config_maps.len(),
                "multiple delegate configmaps match; taking the oldest"
            );
        }
        config_maps
            .sort_by(|a, b| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp));
        let config_map = config_maps.into_iter().next();

        if pod.is_some() || config_map.is_some() {
            return Ok(Some(Delegate { pod, config_map }));
        }

        Ok(None)
    }

    /// Drive the parent's delegate toward the given task and configuration.
    ///
    /// At most one mutating delete or update is issued per call; after any
    /// such mutation the current view is returned immediately and the next
    /// reconcile pass re-enters the decision. A new Pod is only created when
    /// the parent is invalidated: either the caller says so, or the committed
    /// fingerprint or source image no longer match.
    pub async fn ensure<P: ParentObject>(
        &self,
        parent: &P,
        task: &str,
        config: &BTreeMap<String, String>,
        invalidated: bool,
    ) -> Result<Delegate, DelegateError> {
        let source = parent.source_spec();
        if source.image.as_ref().map_or(true, |image| image.repository.is_empty()) {
            return Err(DelegateError::MissingImage(parent.name_any()));
        }

        let fingerprint = config_fingerprint(config)?;
        let mut delegate = self.get(parent).await?.unwrap_or_default();

        if let Some(config_map) = delegate.config_map.take() {
            if config.is_empty() {
                self.config_maps()
                    .delete(&config_map.name_any(), &DeleteParams::default())
                    .await?;
                return Ok(delegate);
            }

            if config_map.annotations().get(CONFIG_ANNOTATION) != Some(&fingerprint) {
                let mut rebuilt = build_config_map(parent, config, &fingerprint, &self.config);
                rebuilt.metadata.resource_version = config_map.metadata.resource_version.clone();
                let updated = self
                    .config_maps()
                    .replace(&config_map.name_any(), &PostParams::default(), &rebuilt)
                    .await?;
                delegate.config_map = Some(updated);
                return Ok(delegate);
            }

            delegate.config_map = Some(config_map);
        }

        if let Some(pod) = &delegate.pod {
            let stale = pod.annotations().get(CONFIG_ANNOTATION) != Some(&fingerprint)
                || !source.matches(parent.source_status());
            if stale {
                self.pods()
                    .delete(&pod.name_any(), &DeleteParams::default())
                    .await?;
                delegate.pod = None;
                return Ok(delegate);
            }
        }

        if delegate.config_map.is_none() && !config.is_empty() {
            let config_map = build_config_map(parent, config, &fingerprint, &self.config);
            let created = self
                .config_maps()
                .create(&PostParams::default(), &config_map)
                .await?;
            delegate.config_map = Some(created);
        }

        let invalidated = invalidated
            || parent.annotations().get(CONFIG_ANNOTATION) != Some(&fingerprint)
            || !source.matches(parent.source_status());

        if delegate.pod.is_none() && invalidated {
            let pod = build_delegate_pod(parent, task, &fingerprint, &self.config)?;
            let created = self.pods().create(&PostParams::default(), &pod).await?;
            info!(
                parent = %parent.name_any(),
                pod = %created.name_any(),
                config_hash = %fingerprint,
                "created delegate pod"
            );
            delegate.pod = Some(created);
        }

        Ok(delegate)
    }

    /// Consume the delegate's buffered result, decoding it into `T`.
    ///
    /// Returns `NotFound` when the delegate has no Pod or no payload has
    /// arrived for the Pod's fingerprint generation.
    pub fn result<P: ParentObject, T: DeserializeOwned>(
        &self,
        parent: &P,
        delegate: &Delegate,
        storage: &dyn ResultStorage,
    ) -> Result<T, ResultError> {
        let pod = delegate.pod.as_ref().ok_or(ResultError::NotFound)?;
        let fingerprint = pod
            .annotations()
            .get(CONFIG_ANNOTATION)
            .cloned()
            .unwrap_or_default();

        let key = StorageKey::for_object(parent);
        let data = storage.pop(&key, &fingerprint)?;
        decode_result(&data)
    }

    /// Record the delegate's work on the parent and tear the delegate down.
    ///
    /// The source status is taken from the task container's resolved image;
    /// the Pod's fingerprint becomes the parent's committed fingerprint. The
    /// annotation write retries on conflict; the Pod (and ConfigMap) deletes
    /// follow it, so a crash in between costs at most one redundant delegate
    /// run.
    pub async fn commit<P: ParentObject>(
        &self,
        parent: &mut P,
        delegate: &mut Delegate,
    ) -> Result<(), DelegateError> {
        let pod = delegate
            .pod
            .clone()
            .ok_or_else(|| DelegateError::MissingPod(parent.name_any()))?;

        let image_id = pod
            .status
            .as_ref()
            .and_then(|status| status.init_container_statuses.as_ref())
            .and_then(|statuses| statuses.first())
            .map(|status| status.image_id.clone())
            .unwrap_or_default();
        let content_hash = image_id.rsplit('@').next().unwrap_or_default().to_string();

        if let Some(image) = parent.source_spec().image.clone() {
            parent.set_source_status(SourceStatus {
                image: Some(ImageStatus {
                    repository: image.repository,
                    tag: image.tag,
                    hash: content_hash,
                }),
            });
        }

        let fingerprint = pod
            .annotations()
            .get(CONFIG_ANNOTATION)
            .cloned()
            .unwrap_or_default();

        let api: Api<P> = Api::all(self.client.clone());
        let name = parent.name_any();
        let mut attempts = 0;
        loop {
            parent
                .annotations_mut()
                .insert(CONFIG_ANNOTATION.to_string(), fingerprint.clone());

            match api.replace(&name, &PostParams::default(), parent).await {
                Ok(updated) => {
                    parent.meta_mut().resource_version = updated.resource_version();
                    break;
                }
                Err(err) if is_conflict(&err) && attempts < COMMIT_RETRY_LIMIT => {
                    attempts += 1;
                    debug!(parent = %name, attempts, "conflict committing fingerprint; retrying");
                    let fresh = api.get(&name).await?;
                    parent.meta_mut().resource_version = fresh.resource_version();
                }
                Err(err) if is_conflict(&err) => {
                    return Err(DelegateError::Conflict(name));
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.pods()
            .delete(&pod.name_any(), &DeleteParams::default())
            .await?;
        delegate.pod = None;

        if let Some(config_map) = delegate.config_map.take() {
            self.config_maps()
                .delete(&config_map.name_any(), &DeleteParams::default())
                .await?;
        }

        Ok(())
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}
