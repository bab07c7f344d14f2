// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::is_not_found;
use anyhow::Context;
use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams};
use mockall::automock;
use serde_json::Value;

fn api_resource(group: &str, version: &str, kind: &str) -> ApiResource {
  ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

fn to_value(object: &DynamicObject) -> anyhow::Result<Value> {
  Ok(serde_json::to_value(object)?)
}

//
// ImageClient
//

/// Access to `image.openshift.io/v1` resources. Objects are returned in their JSON form since only
/// a handful of fields are ever read.
#[automock]
#[async_trait]
pub trait ImageClient: Send + Sync {
  /// Fetches an image by ID. Returns `None` if the image is unknown to the cluster.
  async fn get_image(&self, id: &str) -> anyhow::Result<Option<Value>>;

  async fn list_image_streams(&self, namespace: &str) -> anyhow::Result<Vec<Value>>;
}

//
// ApiRequestCountClient
//

#[automock]
#[async_trait]
pub trait ApiRequestCountClient: Send + Sync {
  /// Lists `apiserver.openshift.io/v1` request counts. Returns `None` if the resource type is not
  /// served by the cluster.
  async fn list_api_request_counts(&self) -> anyhow::Result<Option<Vec<Value>>>;
}

//
// ClusterVersionClient
//

#[automock]
#[async_trait]
pub trait ClusterVersionClient: Send + Sync {
  /// Returns the desired version from the status of the `version` cluster version object.
  async fn cluster_version(&self) -> anyhow::Result<String>;
}

//
// KubeOpenShiftClient
//

#[derive(Clone)]
pub struct KubeOpenShiftClient {
  client: kube::Client,
}

impl KubeOpenShiftClient {
  #[must_use]
  pub const fn new(client: kube::Client) -> Self {
    Self { client }
  }

  fn cluster_api(&self, resource: &ApiResource) -> kube::Api<DynamicObject> {
    kube::Api::all_with(self.client.clone(), resource)
  }
}

#[async_trait]
impl ImageClient for KubeOpenShiftClient {
  async fn get_image(&self, id: &str) -> anyhow::Result<Option<Value>> {
    let resource = api_resource("image.openshift.io", "v1", "Image");
    self
      .cluster_api(&resource)
      .get_opt(id)
      .await?
      .as_ref()
      .map(to_value)
      .transpose()
  }

  async fn list_image_streams(&self, namespace: &str) -> anyhow::Result<Vec<Value>> {
    let resource = api_resource("image.openshift.io", "v1", "ImageStream");
    let api: kube::Api<DynamicObject> =
      kube::Api::namespaced_with(self.client.clone(), namespace, &resource);
    api
      .list(&ListParams::default())
      .await
      .with_context(|| format!("unable to list image streams in {namespace}"))?
      .items
      .iter()
      .map(to_value)
      .collect()
  }
}

#[async_trait]
impl ApiRequestCountClient for KubeOpenShiftClient {
  async fn list_api_request_counts(&self) -> anyhow::Result<Option<Vec<Value>>> {
    let resource = api_resource("apiserver.openshift.io", "v1", "APIRequestCount");
    match self.cluster_api(&resource).list(&ListParams::default()).await {
      Ok(list) => Ok(Some(
        list.items.iter().map(to_value).collect::<anyhow::Result<_>>()?,
      )),
      Err(e) if is_not_found(&e) => Ok(None),
      Err(e) => Err(e.into()),
    }
  }
}

#[async_trait]
impl ClusterVersionClient for KubeOpenShiftClient {
  async fn cluster_version(&self) -> anyhow::Result<String> {
    let resource = api_resource("config.openshift.io", "v1", "ClusterVersion");
    let version = self.cluster_api(&resource).get("version").await?;
    Ok(
      version
        .data
        .pointer("/status/desired/version")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
    )
  }
}
