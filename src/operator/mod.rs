mod api;
mod types;

pub mod crd;

pub use api::{
    crd_labels, evaluate, reconcile_api, run_api_controller, status_for_crd, Evaluation, StaleCrd,
};
pub use crd::{
    APISpec, APIStatus, Condition, ImageSpec, ImageStatus, ResourceStatus, SourceSpec,
    SourceStatus, API, CONDITION_APPLIED, CONDITION_READY, CONDITION_UPDATED,
};
pub use types::{
    ensure_finalizer, has_finalizer, is_already_exists, is_not_found, remove_finalizer, Context,
    OperatorError, Result, FINALIZER, GROUP, LABEL_API, LABEL_MANAGED_BY, MANAGED_BY, VERSION,
};
