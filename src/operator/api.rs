//! API controller
//!
//! Drives an API toward convergence: ensures a delegate runs whenever the
//! declared resources drift from the cluster or the source image changes,
//! applies the delegate's CRD payload, and tears everything down again when
//! the API is deleted.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::crd::{APIStatus, ResourceStatus, API, CONDITION_APPLIED, CONDITION_UPDATED};
use super::types::{
    ensure_finalizer, is_already_exists, remove_finalizer, Context, OperatorError, Result,
    LABEL_API, LABEL_MANAGED_BY, MANAGED_BY,
};
use crate::delegate::{label_selector, ResultError};

/// How long to wait between finalization passes while owned CRDs terminate.
const FINALIZE_REQUEUE: Duration = Duration::from_secs(20);

/// Main reconciliation entry point for API resources
pub async fn reconcile_api(api: Arc<API>, ctx: Arc<Context>) -> Result<Action> {
    let name = api.name_any();
    debug!(api = %name, "reconciliation requested");

    let mut api = (*api).clone();
    if api.meta().deletion_timestamp.is_some() {
        finalize(&mut api, &ctx).await
    } else {
        sync(&mut api, &ctx).await
    }
}

async fn sync(api: &mut API, ctx: &Context) -> Result<Action> {
    let name = api.name_any();
    let apis: Api<API> = Api::all(ctx.client.clone());

    if ensure_finalizer(api.meta_mut()) {
        let updated = apis.replace(&name, &PostParams::default(), api).await?;
        api.meta_mut().resource_version = updated.resource_version();
    }

    let crds = owned_crds(ctx, &name).await?;

    let mut needs_update = false;
    let status = api.status.get_or_insert_with(APIStatus::default);
    if status.conditions.is_empty() {
        status.initialize_conditions();
        needs_update = true;
    }

    let evaluation = evaluate(status, &crds);
    if evaluation.needs_delegate {
        info!(api = %name, "declared resources incomplete; delegate required");
        needs_update = true;
    }
    delete_stale_crds(ctx, &name, &evaluation.stale).await?;

    let delegate = ctx
        .delegates
        .ensure(api, "reify-api", &BTreeMap::new(), evaluation.needs_delegate)
        .await?;

    if let Some(pod) = &delegate.pod {
        let message = format!(
            "Created delegate Pod: {}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any(),
        );
        let status = api.status.get_or_insert_with(APIStatus::default);
        status.mark_false(CONDITION_UPDATED, "Updating", message);
        needs_update = true;
    }

    let payload: std::result::Result<k8s_openapi::List<CustomResourceDefinition>, ResultError> =
        ctx.delegates.result(api, &delegate, ctx.results.as_ref());
    match payload {
        Err(ResultError::NotFound) => {}
        Err(err) => {
            error!(api = %name, error = %err, "error getting delegate result");
            return Err(err.into());
        }
        Ok(list) => {
            process(api, ctx, list.items).await?;
            needs_update = true;

            let mut delegate = delegate;
            ctx.delegates.commit(api, &mut delegate).await?;
        }
    }

    let status = api.status.get_or_insert_with(APIStatus::default);
    if status.resource_count != status.resources.len() as i32 {
        status.resource_count = status.resources.len() as i32;
        needs_update = true;
    }

    if needs_update {
        apis.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": &api.status })),
        )
        .await?;
    }

    Ok(Action::await_change())
}

/// A stale CRD: labeled for the API but no longer declared by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleCrd {
    pub name: String,
    pub uid: Option<String>,
}

#[derive(Debug, Default)]
pub struct Evaluation {
    pub needs_delegate: bool,
    pub stale: Vec<StaleCrd>,
}

/// Compare the declared resources against the CRDs actually in the cluster.
///
/// An empty declaration means the API is new; a declared resource missing
/// from the cluster marks the API incomplete. Both require a delegate run.
/// Extant CRDs the API no longer declares are returned for deletion, except
/// those already terminating.
pub fn evaluate(status: &mut APIStatus, crds: &[CustomResourceDefinition]) -> Evaluation {
    if status.resources.is_empty() {
        status.mark_false(CONDITION_APPLIED, "New", "API is newly added");
        return Evaluation {
            needs_delegate: true,
            stale: Vec::new(),
        };
    }

    let extant: HashSet<&str> = crds.iter().filter_map(|crd| crd.metadata.name.as_deref()).collect();
    let declared: HashSet<String> = status.resources.iter().map(|r| r.name.clone()).collect();

    let mut needs_delegate = false;
    for resource in &status.resources {
        if !extant.contains(resource.name.as_str()) {
            debug!(crd = %resource.name, "declared CRD missing from cluster");
            needs_delegate = true;
        }
    }
    if needs_delegate {
        status.mark_false(
            CONDITION_APPLIED,
            "Incomplete",
            "Some requested CRDs are missing",
        );
    }

    let stale = crds
        .iter()
        .filter(|crd| {
            crd.metadata.deletion_timestamp.is_none()
                && crd
                    .metadata
                    .name
                    .as_deref()
                    .is_some_and(|name| !declared.contains(name))
        })
        .map(|crd| StaleCrd {
            name: crd.name_any(),
            uid: crd.uid(),
        })
        .collect();

    Evaluation {
        needs_delegate,
        stale,
    }
}

async fn delete_stale_crds(ctx: &Context, api_name: &str, stale: &[StaleCrd]) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    for crd in stale {
        info!(api = %api_name, crd = %crd.name, "CRD no longer declared; deleting");
        crds.delete(&crd.name, &delete_params_for(crd)).await?;
    }
    Ok(())
}

fn delete_params_for(crd: &StaleCrd) -> DeleteParams {
    DeleteParams {
        preconditions: Some(Preconditions {
            uid: crd.uid.clone(),
            resource_version: None,
        }),
        ..Default::default()
    }
}

/// Apply the delegate's CRDs to the cluster and record them in the status.
async fn process(api: &mut API, ctx: &Context, crds: Vec<CustomResourceDefinition>) -> Result<()> {
    let name = api.name_any();
    let names: Vec<&str> = crds.iter().filter_map(|crd| crd.metadata.name.as_deref()).collect();
    info!(api = %name, crds = ?names, "received CRDs from delegate");

    let labels = crd_labels(&name);
    let owner = api.controller_owner_ref(&());
    let crd_api: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());

    let mut applied = Vec::with_capacity(crds.len());
    for mut crd in crds {
        let crd_name = crd.name_any();
        crd.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        crd.metadata.owner_references = owner.clone().map(|reference| vec![reference]);

        match crd_api.create(&PostParams::default(), &crd).await {
            Ok(_) => info!(crd = %crd_name, "created CRD"),
            Err(err) if is_already_exists(&err) => {
                crd_api
                    .patch(&crd_name, &PatchParams::default(), &Patch::Merge(&crd))
                    .await?;
                info!(crd = %crd_name, "updated CRD");
            }
            Err(err) => {
                error!(crd = %crd_name, error = %err, "error creating CRD");
                return Err(err.into());
            }
        }

        applied.push(status_for_crd(&crd));
    }

    let status = api.status.get_or_insert_with(APIStatus::default);
    status.resources = applied;
    status.mark_true(CONDITION_APPLIED);
    status.mark_true(CONDITION_UPDATED);

    Ok(())
}

async fn finalize(api: &mut API, ctx: &Context) -> Result<Action> {
    let name = api.name_any();
    let crds = owned_crds(ctx, &name).await?;

    if !crds.is_empty() {
        info!(api = %name, count = crds.len(), "finalizing; deleting CRDs");
    }

    let crd_api: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    for crd in &crds {
        if crd.metadata.deletion_timestamp.is_some() {
            continue;
        }

        let stale = StaleCrd {
            name: crd.name_any(),
            uid: crd.uid(),
        };
        crd_api.delete(&stale.name, &delete_params_for(&stale)).await?;
    }

    let remaining = owned_crds(ctx, &name).await?;
    if remaining.is_empty() {
        if remove_finalizer(api.meta_mut()) {
            let apis: Api<API> = Api::all(ctx.client.clone());
            apis.replace(&name, &PostParams::default(), api).await?;
        }

        info!(api = %name, "API finalized");
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(FINALIZE_REQUEUE))
}

async fn owned_crds(ctx: &Context, api_name: &str) -> Result<Vec<CustomResourceDefinition>> {
    let selector = label_selector(&crd_labels(api_name));
    let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    let list = crds.list(&ListParams::default().labels(&selector)).await?;
    Ok(list.items)
}

/// Labels stamped onto every CRD the operator applies for an API.
pub fn crd_labels(api_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_API.to_string(), api_name.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

/// Status entry for an applied CRD, using its storage version.
pub fn status_for_crd(crd: &CustomResourceDefinition) -> ResourceStatus {
    let version = crd
        .spec
        .versions
        .iter()
        .find(|version| version.storage)
        .or_else(|| crd.spec.versions.first())
        .map(|version| version.name.clone())
        .unwrap_or_default();

    ResourceStatus {
        name: crd.name_any(),
        group: crd.spec.group.clone(),
        version,
        kind: crd.spec.names.kind.clone(),
    }
}

/// Error handler for the controller
fn error_policy(_api: Arc<API>, error: &OperatorError, _ctx: Arc<Context>) -> Action {
    error!(error = %error, "reconciliation error");
    Action::requeue(Duration::from_secs(60))
}

/// Start the API controller and run it to completion.
pub async fn run_api_controller(ctx: Arc<Context>) -> Result<()> {
    let client = ctx.client.clone();
    let apis: Api<API> = Api::all(client.clone());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &ctx.delegates.config().namespace);
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    info!("starting API controller");

    Controller::new(apis, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .owns(crds, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_api, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _action)) => debug!(object = ?object, "reconciled"),
                Err(err) => warn!(error = ?err, "reconciliation failed"),
            }
        })
        .await;

    Ok(())
}
