// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams};
use mockall::automock;
use std::time::Duration;

//
// ListPodsRequest
//

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPodsRequest {
  pub label_selector: Option<String>,
  pub field_selector: Option<String>,
  pub limit: Option<u32>,
  pub continue_token: Option<String>,
}

impl ListPodsRequest {
  fn to_list_params(&self) -> ListParams {
    let mut params = ListParams::default();
    if let Some(label_selector) = &self.label_selector {
      params = params.labels(label_selector);
    }
    if let Some(field_selector) = &self.field_selector {
      params = params.fields(field_selector);
    }
    if let Some(limit) = self.limit {
      params = params.limit(limit);
    }
    if let Some(continue_token) = &self.continue_token {
      params = params.continue_token(continue_token);
    }
    params
  }
}

//
// PodPage
//

/// A single page of a pod listing. An absent continue token means the listing is complete.
#[derive(Debug, Clone, Default)]
pub struct PodPage {
  pub items: Vec<Pod>,
  pub continue_token: Option<String>,
}

//
// LogRequest
//

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRequest {
  pub container: String,
  pub tail_lines: Option<i64>,
  pub since: Option<Duration>,
  pub limit_bytes: Option<i64>,
  pub previous: bool,
  pub timestamps: bool,
}

impl LogRequest {
  fn to_log_params(&self) -> LogParams {
    LogParams {
      container: Some(self.container.clone()),
      tail_lines: self.tail_lines,
      since_seconds: self
        .since
        .map(|since| i64::try_from(since.as_secs()).unwrap_or(i64::MAX)),
      limit_bytes: self.limit_bytes,
      previous: self.previous,
      timestamps: self.timestamps,
      ..Default::default()
    }
  }
}

//
// PodClient
//

pub type LogLines = BoxStream<'static, anyhow::Result<String>>;

/// Read only access to pods and their container logs.
#[automock]
#[async_trait]
pub trait PodClient: Send + Sync {
  /// Lists a page of pods. An empty namespace lists across all namespaces.
  async fn list_pods(&self, namespace: &str, request: ListPodsRequest)
  -> anyhow::Result<PodPage>;

  async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>>;

  /// Streams a container log one line at a time.
  async fn stream_logs(
    &self,
    namespace: &str,
    pod: &str,
    request: LogRequest,
  ) -> anyhow::Result<LogLines>;
}

//
// KubePodClient
//

#[derive(Clone)]
pub struct KubePodClient {
  client: kube::Client,
}

impl KubePodClient {
  #[must_use]
  pub const fn new(client: kube::Client) -> Self {
    Self { client }
  }

  fn api(&self, namespace: &str) -> kube::Api<Pod> {
    if namespace.is_empty() {
      kube::Api::all(self.client.clone())
    } else {
      kube::Api::namespaced(self.client.clone(), namespace)
    }
  }
}

#[async_trait]
impl PodClient for KubePodClient {
  async fn list_pods(
    &self,
    namespace: &str,
    request: ListPodsRequest,
  ) -> anyhow::Result<PodPage> {
    let list = self.api(namespace).list(&request.to_list_params()).await?;
    Ok(PodPage {
      items: list.items,
      continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
    })
  }

  async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>> {
    Ok(self.api(namespace).get_opt(name).await?)
  }

  async fn stream_logs(
    &self,
    namespace: &str,
    pod: &str,
    request: LogRequest,
  ) -> anyhow::Result<LogLines> {
    let reader = self
      .api(namespace)
      .log_stream(pod, &request.to_log_params())
      .await?;
    Ok(reader.lines().map_err(anyhow::Error::from).boxed())
  }
}
