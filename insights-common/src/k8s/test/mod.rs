// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod, PodSpec, PodStatus};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

#[must_use]
pub fn make_object_meta(
  namespace: &str,
  name: &str,
  labels: BTreeMap<String, String>,
) -> ObjectMeta {
  ObjectMeta {
    name: Some(name.to_string()),
    namespace: Some(namespace.to_string()),
    labels: Some(labels),
    ..Default::default()
  }
}

#[must_use]
pub fn make_container(name: &str, image: &str, command: &[&str], args: &[&str]) -> Container {
  let to_vec = |values: &[&str]| {
    (!values.is_empty()).then(|| values.iter().map(ToString::to_string).collect())
  };
  Container {
    name: name.to_string(),
    image: Some(image.to_string()),
    command: to_vec(command),
    args: to_vec(args),
    ..Default::default()
  }
}

#[must_use]
pub fn make_container_status(name: &str, image_id: &str, container_id: &str) -> ContainerStatus {
  ContainerStatus {
    name: name.to_string(),
    image_id: image_id.to_string(),
    container_id: Some(container_id.to_string()),
    ..Default::default()
  }
}

//
// PodBuilder
//

/// Builds pods for tests. Statuses are derived from the containers unless set explicitly.
pub struct PodBuilder {
  pod: Pod,
}

impl PodBuilder {
  #[must_use]
  pub fn new(namespace: &str, name: &str) -> Self {
    Self {
      pod: Pod {
        metadata: make_object_meta(namespace, name, BTreeMap::new()),
        spec: Some(PodSpec {
          restart_policy: Some("Always".to_string()),
          ..Default::default()
        }),
        status: Some(PodStatus {
          phase: Some("Running".to_string()),
          ..Default::default()
        }),
      },
    }
  }

  #[must_use]
  pub fn labels(mut self, labels: &[(&str, &str)]) -> Self {
    self.pod.metadata.labels = Some(
      labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect(),
    );
    self
  }

  #[must_use]
  pub fn phase(mut self, phase: Option<&str>) -> Self {
    if let Some(status) = &mut self.pod.status {
      status.phase = phase.map(ToString::to_string);
    }
    self
  }

  #[must_use]
  pub fn no_status(mut self) -> Self {
    self.pod.status = None;
    self
  }

  #[must_use]
  pub fn restart_policy(mut self, policy: &str) -> Self {
    if let Some(spec) = &mut self.pod.spec {
      spec.restart_policy = Some(policy.to_string());
    }
    self
  }

  #[must_use]
  pub fn node_name(mut self, node_name: &str) -> Self {
    if let Some(spec) = &mut self.pod.spec {
      spec.node_name = Some(node_name.to_string());
    }
    self
  }

  #[must_use]
  pub fn pod_ip(mut self, ip: &str) -> Self {
    if let Some(status) = &mut self.pod.status {
      status.pod_ip = Some(ip.to_string());
    }
    self
  }

  /// Adds a container whose status reports the provided image ID.
  #[must_use]
  pub fn container(mut self, container: Container, image_id: &str) -> Self {
    let status = make_container_status(
      &container.name,
      image_id,
      &format!("cri-o://{}", container.name),
    );
    if let Some(spec) = &mut self.pod.spec {
      spec.containers.push(container);
    }
    if let Some(pod_status) = &mut self.pod.status {
      pod_status
        .container_statuses
        .get_or_insert_with(Vec::new)
        .push(status);
    }
    self
  }

  /// Adds an init container whose status reports the provided image ID.
  #[must_use]
  pub fn init_container(mut self, container: Container, image_id: &str) -> Self {
    let status = make_container_status(
      &container.name,
      image_id,
      &format!("cri-o://{}", container.name),
    );
    if let Some(spec) = &mut self.pod.spec {
      spec
        .init_containers
        .get_or_insert_with(Vec::new)
        .push(container);
    }
    if let Some(pod_status) = &mut self.pod.status {
      pod_status
        .init_container_statuses
        .get_or_insert_with(Vec::new)
        .push(status);
    }
    self
  }

  #[must_use]
  pub fn container_statuses(mut self, statuses: Vec<ContainerStatus>) -> Self {
    if let Some(pod_status) = &mut self.pod.status {
      pod_status.container_statuses = Some(statuses);
    }
    self
  }

  #[must_use]
  pub fn build(self) -> Pod {
    self.pod
  }
}
