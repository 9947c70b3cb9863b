//! API custom resource
//!
//! The parent resource this operator reconciles: an `API` names a source
//! image whose delegate run produces the CRDs the API declares.

use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::delegate::ParentObject;

// ==================== API CRD ====================

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kudzu.sh",
    version = "v1alpha1",
    kind = "API",
    plural = "apis",
    shortname = "api",
    status = "APIStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct APISpec {
    /// Where the delegate image that reifies this API comes from
    #[serde(default)]
    pub source: SourceSpec,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSpec>,
}

impl SourceSpec {
    /// Whether the recorded source status still reflects this spec. A parent
    /// whose image reference changed no longer matches and must re-run its
    /// delegate. A parent with no recorded image matches: nothing has been
    /// committed yet, so there is no "image changed" event, and deleting an
    /// in-flight delegate over it would livelock the first run.
    pub fn matches(&self, status: Option<&SourceStatus>) -> bool {
        let Some(image) = self.image.as_ref() else {
            return false;
        };
        let Some(recorded) = status.and_then(|status| status.image.as_ref()) else {
            return true;
        };
        image.repository == recorded.repository && image.tag == recorded.tag
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image repository, e.g. `quay.io/lady`
    pub repository: String,

    /// Image tag; `latest` when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,

    /// Pull policy for the task container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

impl ImageSpec {
    /// Full image reference with the tag defaulted.
    pub fn reference(&self) -> String {
        if self.tag.is_empty() {
            format!("{}:latest", self.repository)
        } else {
            format!("{}:{}", self.repository, self.tag)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageStatus>,
}

/// The last successfully processed image.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    pub repository: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,

    /// Content hash resolved from the task container's image ID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct APIStatus {
    /// CRDs this API currently declares, in delegate order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,

    #[serde(default)]
    pub resource_count: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub name: String,
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ==================== Conditions ====================

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_APPLIED: &str = "Applied";
pub const CONDITION_UPDATED: &str = "Updated";

impl APIStatus {
    /// Seed the condition set for a newly seen API.
    pub fn initialize_conditions(&mut self) {
        self.set_condition(CONDITION_READY, "False", None, None);
        self.set_condition(CONDITION_APPLIED, "False", Some("New"), None);
        self.set_condition(CONDITION_UPDATED, "False", Some("Updating"), None);
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.set_condition(type_, "True", None, None);
        self.recompute_ready();
    }

    pub fn mark_false(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        self.set_condition(type_, "False", Some(reason), Some(message.into()));
        self.recompute_ready();
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    fn set_condition(
        &mut self,
        type_: &str,
        status: &str,
        reason: Option<&str>,
        message: Option<String>,
    ) {
        let reason = reason.map(str::to_string);
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = Some(Utc::now().to_rfc3339());
                }
                existing.status = status.to_string();
                existing.reason = reason;
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                last_transition_time: Some(Utc::now().to_rfc3339()),
                reason,
                message,
            }),
        }
    }

    /// Ready is dependent on the other conditions: true exactly when both
    /// Applied and Updated are true.
    fn recompute_ready(&mut self) {
        let dependent_true = [CONDITION_APPLIED, CONDITION_UPDATED].iter().all(|type_| {
            self.condition(type_)
                .is_some_and(|condition| condition.status == "True")
        });

        if dependent_true {
            self.set_condition(CONDITION_READY, "True", None, None);
        } else {
            self.set_condition(CONDITION_READY, "False", None, None);
        }
    }
}

impl ParentObject for API {
    fn source_spec(&self) -> &SourceSpec {
        &self.spec.source
    }

    fn source_status(&self) -> Option<&SourceStatus> {
        self.status.as_ref().and_then(|status| status.source.as_ref())
    }

    fn set_source_status(&mut self, source: SourceStatus) {
        self.status.get_or_insert_with(APIStatus::default).source = Some(source);
    }
}
