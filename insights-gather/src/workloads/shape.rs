// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./shape_test.rs"]
mod shape_test;

use super::types::{ContainerKey, ContainerShape, PodShape, WorkloadImage};
use insights_common::anonymize::hash_argument;
use insights_common::k8s::{object_name, object_namespace, pod_phase};
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod};
use serde_json::Value;

const DOCKER_PULLABLE_PREFIX: &str = "docker-pullable://";

/// Returns the content addressable digest of an image reference such as
/// `quay.io/org/app@sha256:<hex>`, or nothing if the reference is not pinned by digest.
#[must_use]
pub fn image_reference_id(reference: &str) -> Option<&str> {
  let (name, digest) = reference.rsplit_once('@')?;
  let (algorithm, hex) = digest.split_once(':')?;
  let valid = !name.is_empty()
    && !algorithm.is_empty()
    && algorithm
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
    && hex.len() >= 32
    && hex.chars().all(|c| c.is_ascii_hexdigit());
  valid.then_some(digest)
}

/// Finds the spec entry of a container status, trying the status position first since kubelets
/// keep statuses in spec order.
#[must_use]
pub fn matching_spec_index(name: &str, spec: &[Container], hint: usize) -> Option<usize> {
  if spec.get(hint).is_some_and(|container| container.name == name) {
    return Some(hint);
  }
  spec.iter().position(|container| container.name == name)
}

fn first_hashed(values: Option<&Vec<String>>) -> String {
  values
    .and_then(|values| values.first())
    .map(|value| hash_argument(value))
    .unwrap_or_default()
}

/// Computes the shapes of a container list. Returns nothing if any status cannot be matched to
/// its spec or has no resolvable image ID.
fn container_shapes(
  pod: &Pod,
  spec: &[Container],
  statuses: &[ContainerStatus],
) -> Option<Vec<ContainerShape>> {
  let mut shapes = Vec::with_capacity(statuses.len());
  for (i, status) in statuses.iter().enumerate() {
    let Some(index) = matching_spec_index(&status.name, spec, i) else {
      log::debug!(
        "unable to match container {} of pod {}/{} to its spec",
        status.name,
        object_namespace(&pod.metadata),
        object_name(&pod.metadata)
      );
      return None;
    };
    let container = &spec[index];

    let status_image = status
      .image_id
      .strip_prefix(DOCKER_PULLABLE_PREFIX)
      .unwrap_or(&status.image_id);
    let image_id = image_reference_id(status_image)
      .or_else(|| container.image.as_deref().and_then(image_reference_id))?;

    shapes.push(ContainerShape {
      image_id: image_id.to_string(),
      first_command: first_hashed(container.command.as_ref()),
      first_arg: first_hashed(container.args.as_ref()),
      runtime_info: None,
      runtime_key: status.container_id.as_ref().map(|container_id| ContainerKey {
        namespace: object_namespace(&pod.metadata).to_string(),
        pod: object_name(&pod.metadata).to_string(),
        container_id: container_id.clone(),
      }),
    });
  }
  Some(shapes)
}

//
// PodClass
//

/// How a scanned pod is accounted for in its namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum PodClass {
  /// Succeeded or failed.
  Terminal,
  /// In an unknown phase or without status.
  Ignored,
  /// Statuses that do not line up with the spec, or containers without an image ID.
  Invalid,
  Shape(PodShape),
}

/// Classifies a pod and computes its shape if it has one.
#[must_use]
pub fn classify_pod(pod: &Pod) -> PodClass {
  let (Some(spec), Some(status)) = (&pod.spec, &pod.status) else {
    return PodClass::Ignored;
  };
  match pod_phase(pod) {
    "Succeeded" | "Failed" => return PodClass::Terminal,
    "Running" | "Pending" => {},
    _ => return PodClass::Ignored,
  }

  let init_spec = spec.init_containers.as_deref().unwrap_or_default();
  let init_statuses = status.init_container_statuses.as_deref().unwrap_or_default();
  let statuses = status.container_statuses.as_deref().unwrap_or_default();
  if init_statuses.len() != init_spec.len() || statuses.len() != spec.containers.len() {
    return PodClass::Invalid;
  }

  let Some(init_containers) = container_shapes(pod, init_spec, init_statuses) else {
    return PodClass::Invalid;
  };
  let Some(containers) = container_shapes(pod, &spec.containers, statuses) else {
    return PodClass::Invalid;
  };
  PodClass::Shape(PodShape {
    duplicates: 0,
    restarts_always: spec.restart_policy.as_deref() == Some("Always"),
    init_containers,
    containers,
  })
}

fn first_hashed_json(value: Option<&Value>) -> String {
  value
    .and_then(Value::as_array)
    .and_then(|values| values.first())
    .and_then(Value::as_str)
    .map(hash_argument)
    .unwrap_or_default()
}

/// Extracts the layers and the hashed entrypoint and command of an `image.openshift.io/v1` image.
/// Images without parseable metadata only carry their layers.
#[must_use]
pub fn image_info(image: &Value) -> WorkloadImage {
  let layer_ids = image
    .get("dockerImageLayers")
    .and_then(Value::as_array)
    .map(|layers| {
      layers
        .iter()
        .filter_map(|layer| layer.get("name").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect()
    })
    .unwrap_or_default();

  let config = image.get("dockerImageMetadata").and_then(|metadata| {
    metadata
      .get("ContainerConfig")
      .filter(|config| config.is_object())
      .or_else(|| metadata.get("Config"))
  });
  WorkloadImage {
    layer_ids,
    first_command: first_hashed_json(config.and_then(|config| config.get("Entrypoint"))),
    first_arg: first_hashed_json(config.and_then(|config| config.get("Cmd"))),
  }
}
