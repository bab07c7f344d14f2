// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod openshift;
pub mod pods;
pub mod remote;
pub mod test;

use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;

/// Returns the namespace for the provided object.
#[must_use]
pub fn object_namespace(meta: &ObjectMeta) -> &str {
  meta.namespace.as_deref().unwrap_or("default")
}

/// Returns the name for the provided object, or the empty string.
#[must_use]
pub fn object_name(meta: &ObjectMeta) -> &str {
  meta.name.as_deref().unwrap_or_default()
}

/// Returns the pod phase, or the empty string if the pod has no status.
#[must_use]
pub fn pod_phase(pod: &Pod) -> &str {
  pod
    .status
    .as_ref()
    .and_then(|status| status.phase.as_deref())
    .unwrap_or_default()
}

/// Returns true if the error is a Kubernetes API not found response.
#[must_use]
pub fn is_not_found(error: &kube::Error) -> bool {
  matches!(error, kube::Error::Api(response) if response.code == 404)
}
