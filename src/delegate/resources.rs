//! Delegate object construction
//!
//! Builders for the Pod and ConfigMap that make up one delegate. The Pod
//! runs the task image as an init container writing to a scratch volume, and
//! a callback sidecar that POSTs the output back to the operator.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::fingerprint::EMPTY_FINGERPRINT;
use super::manager::Config;
use super::{callback_url, delegate_labels, delegate_name, DelegateError, ParentObject};
use super::CONFIG_ANNOTATION;

const OUTPUT_VOLUME: &str = "output";
const OUTPUT_PATH: &str = "/run/kudzu/output";
const INPUT_VOLUME: &str = "input";
const INPUT_PATH: &str = "/run/kudzu/input";

/// Build the delegate Pod for `task` under fingerprint `fingerprint`.
pub fn build_delegate_pod<P: ParentObject>(
    parent: &P,
    task: &str,
    fingerprint: &str,
    config: &Config,
) -> Result<Pod, DelegateError> {
    let source = parent.source_spec();
    let image = source
        .image
        .as_ref()
        .filter(|image| !image.repository.is_empty())
        .ok_or_else(|| DelegateError::MissingImage(parent.name_any()))?;

    let mut volumes = vec![Volume {
        name: OUTPUT_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: OUTPUT_VOLUME.to_string(),
        mount_path: OUTPUT_PATH.to_string(),
        ..Default::default()
    }];

    if fingerprint != EMPTY_FINGERPRINT {
        volumes.push(Volume {
            name: INPUT_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: delegate_name(parent),
                default_mode: Some(0o444),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: INPUT_VOLUME.to_string(),
            mount_path: INPUT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let task_container = Container {
        name: task.to_string(),
        image: Some(image.reference()),
        image_pull_policy: image.pull_policy.clone(),
        command: Some(vec![format!("/opt/kudzu/bin/{task}")]),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let sidecar = Container {
        name: "callback".to_string(),
        image: Some(config.callback_image.clone()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["/opt/kudzu/bin/callback".to_string()]),
        env: Some(vec![
            EnvVar {
                name: "KUDZU_CALLBACK_URL".to_string(),
                value: Some(callback_url(&config.base_url, parent)),
                ..Default::default()
            },
            EnvVar {
                name: "KUDZU_CONFIG_HASH".to_string(),
                value: Some(fingerprint.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "KUDZU_DELEGATE_IMAGE".to_string(),
                value: Some(image.reference()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: OUTPUT_VOLUME.to_string(),
            mount_path: OUTPUT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Pod {
        metadata: delegate_metadata(parent, fingerprint, config),
        spec: Some(PodSpec {
            init_containers: Some(vec![task_container]),
            containers: vec![sidecar],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the ConfigMap holding a delegate's input configuration.
pub fn build_config_map<P: ParentObject>(
    parent: &P,
    entries: &BTreeMap<String, String>,
    fingerprint: &str,
    config: &Config,
) -> ConfigMap {
    ConfigMap {
        metadata: delegate_metadata(parent, fingerprint, config),
        data: Some(entries.clone()),
        ..Default::default()
    }
}

fn delegate_metadata<P: ParentObject>(parent: &P, fingerprint: &str, config: &Config) -> ObjectMeta {
    let mut annotations = BTreeMap::new();
    annotations.insert(CONFIG_ANNOTATION.to_string(), fingerprint.to_string());

    ObjectMeta {
        name: Some(delegate_name(parent)),
        namespace: Some(config.namespace.clone()),
        labels: Some(delegate_labels(parent)),
        annotations: Some(annotations),
        owner_references: parent.controller_owner_ref(&()).map(|reference| vec![reference]),
        ..Default::default()
    }
}
