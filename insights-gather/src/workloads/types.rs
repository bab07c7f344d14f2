// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const fn is_zero(n: &usize) -> bool {
  *n == 0
}

//
// WorkloadPods
//

/// The summarized workloads of a cluster. Every identifying value is hashed: namespaces are keyed
/// by their hashed name and container commands are reduced to hashes of their normalized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadPods {
  /// Every pod scanned, across all namespaces.
  #[serde(rename = "pods")]
  pub pod_count: usize,
  /// Distinct image IDs referenced by pod shapes, including those without image metadata.
  #[serde(rename = "imageCount")]
  pub image_count: usize,
  #[serde(default)]
  pub images: BTreeMap<String, WorkloadImage>,
  #[serde(default)]
  pub namespaces: BTreeMap<String, NamespacePods>,
}

//
// WorkloadImage
//

/// The image metadata needed to relate images through their layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadImage {
  /// Layers from lowest to highest.
  #[serde(rename = "layerIDs", default)]
  pub layer_ids: Vec<String>,
  #[serde(rename = "firstCommand", default, skip_serializing_if = "String::is_empty")]
  pub first_command: String,
  #[serde(rename = "firstArg", default, skip_serializing_if = "String::is_empty")]
  pub first_arg: String,
}

impl WorkloadImage {
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.layer_ids.is_empty()
  }
}

//
// NamespacePods
//

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespacePods {
  pub count: usize,
  #[serde(rename = "terminalCount", default, skip_serializing_if = "is_zero")]
  pub terminal_count: usize,
  #[serde(rename = "ignoredCount", default, skip_serializing_if = "is_zero")]
  pub ignored_count: usize,
  #[serde(rename = "invalidCount", default, skip_serializing_if = "is_zero")]
  pub invalid_count: usize,
  #[serde(default)]
  pub shapes: Vec<PodShape>,
}

impl NamespacePods {
  /// Pods accounted for by shapes and counters. Always equal to `count` once the bucket is sealed.
  #[must_use]
  pub fn accounted(&self) -> usize {
    self
      .shapes
      .iter()
      .map(|shape| shape.duplicates + 1)
      .sum::<usize>()
      + self.terminal_count
      + self.ignored_count
      + self.invalid_count
  }
}

//
// PodShape
//

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodShape {
  /// Pods sharing this shape beyond the first one.
  #[serde(default, skip_serializing_if = "is_zero")]
  pub duplicates: usize,
  #[serde(rename = "restartAlways")]
  pub restarts_always: bool,
  #[serde(rename = "initContainers", default, skip_serializing_if = "Vec::is_empty")]
  pub init_containers: Vec<ContainerShape>,
  #[serde(default)]
  pub containers: Vec<ContainerShape>,
}

impl PodShape {
  /// Structural equality of the restart policy and the container shapes, in order. Duplicates and
  /// runtime data are not part of the shape.
  #[must_use]
  pub fn same_shape(&self, other: &Self) -> bool {
    fn same(a: &[ContainerShape], b: &[ContainerShape]) -> bool {
      a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_shape(b))
    }
    self.restarts_always == other.restarts_always
      && same(&self.init_containers, &other.init_containers)
      && same(&self.containers, &other.containers)
  }

  pub fn all_containers(&self) -> impl Iterator<Item = &ContainerShape> {
    self.init_containers.iter().chain(&self.containers)
  }

  pub fn all_containers_mut(&mut self) -> impl Iterator<Item = &mut ContainerShape> {
    self.init_containers.iter_mut().chain(&mut self.containers)
  }
}

//
// ContainerShape
//

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerShape {
  #[serde(rename = "imageID")]
  pub image_id: String,
  #[serde(rename = "firstCommand", default, skip_serializing_if = "String::is_empty")]
  pub first_command: String,
  #[serde(rename = "firstArg", default, skip_serializing_if = "String::is_empty")]
  pub first_arg: String,
  #[serde(rename = "runtimeInfo", default, skip_serializing_if = "Option::is_none")]
  pub runtime_info: Option<RuntimeInfo>,
  /// Where the container ran, used only to join runtime data. Never serialized.
  #[serde(skip)]
  pub runtime_key: Option<ContainerKey>,
}

impl ContainerShape {
  #[must_use]
  pub fn same_shape(&self, other: &Self) -> bool {
    self.image_id == other.image_id
      && self.first_command == other.first_command
      && self.first_arg == other.first_arg
  }
}

//
// ContainerKey
//

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerKey {
  pub namespace: String,
  pub pod: String,
  pub container_id: String,
}

//
// RuntimeInfo
//

/// Facts about a running container reported by the runtime extractor on its node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub os: String,
  #[serde(rename = "osVersion", default, skip_serializing_if = "String::is_empty")]
  pub os_version: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub kind: String,
  #[serde(rename = "kindVersion", default, skip_serializing_if = "String::is_empty")]
  pub kind_version: String,
  #[serde(rename = "kindImplementer", default, skip_serializing_if = "String::is_empty")]
  pub kind_implementer: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub runtimes: Vec<RuntimeComponent>,
}

impl RuntimeInfo {
  #[must_use]
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeComponent {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub version: String,
}
