use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kudzu_rs::operator::{
    crd_labels, ensure_finalizer, evaluate, has_finalizer, remove_finalizer, status_for_crd,
    APIStatus, ResourceStatus, CONDITION_APPLIED, CONDITION_READY, CONDITION_UPDATED, FINALIZER,
};

fn crd(name: &str, versions: Vec<CustomResourceDefinitionVersion>) -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: "pets.example.com".to_string(),
            names: CustomResourceDefinitionNames {
                kind: "Pet".to_string(),
                plural: "pets".to_string(),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions,
            ..Default::default()
        },
        status: None,
    }
}

fn version(name: &str, storage: bool) -> CustomResourceDefinitionVersion {
    CustomResourceDefinitionVersion {
        name: name.to_string(),
        served: true,
        storage,
        ..Default::default()
    }
}

fn declared(names: &[&str]) -> APIStatus {
    APIStatus {
        resources: names
            .iter()
            .map(|name| ResourceStatus {
                name: name.to_string(),
                group: "pets.example.com".to_string(),
                version: "v1".to_string(),
                kind: "Pet".to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

#[test]
fn new_api_needs_a_delegate() {
    let mut status = APIStatus::default();
    let evaluation = evaluate(&mut status, &[]);

    assert!(evaluation.needs_delegate);
    assert!(evaluation.stale.is_empty());

    let applied = status.condition(CONDITION_APPLIED).unwrap();
    assert_eq!(applied.status, "False");
    assert_eq!(applied.reason.as_deref(), Some("New"));
}

#[test]
fn undeclared_crd_is_marked_stale() {
    let mut status = declared(&["foo"]);
    let extant = vec![crd("foo", vec![version("v1", true)]), crd("bar", vec![version("v1", true)])];

    let evaluation = evaluate(&mut status, &extant);

    assert!(!evaluation.needs_delegate);
    assert_eq!(evaluation.stale.len(), 1);
    assert_eq!(evaluation.stale[0].name, "bar");
    assert_eq!(evaluation.stale[0].uid.as_deref(), Some("uid-bar"));
}

#[test]
fn missing_declared_crd_requires_delegate() {
    let mut status = declared(&["foo", "baz"]);
    let extant = vec![crd("foo", vec![version("v1", true)])];

    let evaluation = evaluate(&mut status, &extant);

    assert!(evaluation.needs_delegate);
    assert!(evaluation.stale.is_empty());

    let applied = status.condition(CONDITION_APPLIED).unwrap();
    assert_eq!(applied.status, "False");
    assert_eq!(applied.reason.as_deref(), Some("Incomplete"));
}

#[test]
fn terminating_crds_are_left_alone() {
    let mut status = declared(&["foo"]);
    let mut terminating = crd("bar", vec![version("v1", true)]);
    terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    let extant = vec![crd("foo", vec![version("v1", true)]), terminating];

    let evaluation = evaluate(&mut status, &extant);
    assert!(evaluation.stale.is_empty());
}

#[test]
fn status_uses_the_storage_version() {
    let crd = crd(
        "pets.pets.example.com",
        vec![version("v1alpha1", false), version("v1", true)],
    );

    let status = status_for_crd(&crd);
    assert_eq!(status.name, "pets.pets.example.com");
    assert_eq!(status.group, "pets.example.com");
    assert_eq!(status.version, "v1");
    assert_eq!(status.kind, "Pet");
}

#[test]
fn status_falls_back_to_the_first_version() {
    let crd = crd(
        "pets.pets.example.com",
        vec![version("v1alpha1", false), version("v1beta1", false)],
    );

    assert_eq!(status_for_crd(&crd).version, "v1alpha1");
}

#[test]
fn conditions_initialize_for_a_new_api() {
    let mut status = APIStatus::default();
    status.initialize_conditions();

    let ready = status.condition(CONDITION_READY).unwrap();
    assert_eq!(ready.status, "False");

    let applied = status.condition(CONDITION_APPLIED).unwrap();
    assert_eq!(applied.status, "False");
    assert_eq!(applied.reason.as_deref(), Some("New"));

    let updated = status.condition(CONDITION_UPDATED).unwrap();
    assert_eq!(updated.status, "False");
    assert_eq!(updated.reason.as_deref(), Some("Updating"));
}

#[test]
fn ready_follows_applied_and_updated() {
    let mut status = APIStatus::default();
    status.initialize_conditions();

    status.mark_true(CONDITION_APPLIED);
    assert_eq!(status.condition(CONDITION_READY).unwrap().status, "False");

    status.mark_true(CONDITION_UPDATED);
    assert_eq!(status.condition(CONDITION_READY).unwrap().status, "True");

    status.mark_false(CONDITION_UPDATED, "Updating", "delegate re-running");
    assert_eq!(status.condition(CONDITION_READY).unwrap().status, "False");
}

#[test]
fn finalizer_bookkeeping_is_idempotent() {
    let mut meta = ObjectMeta::default();
    assert!(!has_finalizer(&meta));

    assert!(ensure_finalizer(&mut meta));
    assert!(has_finalizer(&meta));
    assert_eq!(meta.finalizers.as_ref().unwrap(), &vec![FINALIZER.to_string()]);

    // second add is a no-op
    assert!(!ensure_finalizer(&mut meta));
    assert_eq!(meta.finalizers.as_ref().unwrap().len(), 1);

    assert!(remove_finalizer(&mut meta));
    assert!(!has_finalizer(&meta));
    assert!(!remove_finalizer(&mut meta));
}

#[test]
fn owned_crds_are_labeled_for_the_api() {
    let labels = crd_labels("rainicorn");
    assert_eq!(labels.get("kudzu.sh/api").map(String::as_str), Some("rainicorn"));
    assert_eq!(
        labels.get("app.kubernetes.io/managed-by").map(String::as_str),
        Some("kudzu")
    );
}
