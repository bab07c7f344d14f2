// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./namespace_test.rs"]
mod namespace_test;

use super::{BuildContext, GatherFunction, RECORD_PREFIX, build_closure};
use crate::conditional::logs::{LogContainersFilter, LogMessagesFilter, collect_logs_from_containers};
use crate::conditional::validation::{FieldKind, FieldSchema, NAMESPACE_PATTERN};
use crate::gatherer::{GatherOutput, GatheringClosure};
use insights_common::anonymize::mask_string;
use insights_common::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;

//
// LogsOfNamespace
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogsOfNamespaceParams {
  pub namespace: String,
  pub tail_lines: i64,
}

/// Collects the last lines of every container log in a namespace.
pub struct LogsOfNamespace;

const LOGS_OF_NAMESPACE_SCHEMA: &[FieldSchema] = &[
  FieldSchema::required("namespace", FieldKind::string(NAMESPACE_PATTERN)),
  FieldSchema::required("tail_lines", FieldKind::integer(1, 4096)),
];

async fn gather_logs_of_namespace(
  context: BuildContext,
  params: LogsOfNamespaceParams,
) -> GatherOutput {
  let tail_lines = params.tail_lines;
  let output = collect_logs_from_containers(
    context.pods.as_ref(),
    &LogContainersFilter {
      namespace: params.namespace,
      max_containers: Some(context.config.max_namespace_containers),
      ..Default::default()
    },
    &LogMessagesFilter {
      tail_lines: Some(tail_lines),
      ..Default::default()
    },
    context.config.max_concurrent_streams,
    |namespace, pod, container| {
      format!(
        "{RECORD_PREFIX}/namespaces/{namespace}/pods/{pod}/containers/{container}/logs/last-\
         {tail_lines}-lines.log"
      )
    },
  )
  .await;
  output.unwrap_or_else(GatherOutput::from_error)
}

impl GatherFunction for LogsOfNamespace {
  fn name(&self) -> &'static str {
    "logs_of_namespace"
  }

  fn params_schema(&self) -> &'static [FieldSchema] {
    LOGS_OF_NAMESPACE_SCHEMA
  }

  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure> {
    build_closure(self.name(), context, params, gather_logs_of_namespace)
  }
}

//
// ImageStreamsOfNamespace
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageStreamsOfNamespaceParams {
  pub namespace: String,
}

/// Collects the image stream definitions of a namespace with their registry references masked.
pub struct ImageStreamsOfNamespace;

const IMAGE_STREAMS_OF_NAMESPACE_SCHEMA: &[FieldSchema] = &[FieldSchema::required(
  "namespace",
  FieldKind::string(NAMESPACE_PATTERN),
)];

fn mask_at(value: &mut Value, pointer: &str) {
  if let Some(Value::String(s)) = value.pointer_mut(pointer) {
    *s = mask_string(s);
  }
}

fn array_at<'a>(value: &'a mut Value, pointer: &str) -> impl Iterator<Item = &'a mut Value> {
  value
    .pointer_mut(pointer)
    .and_then(Value::as_array_mut)
    .into_iter()
    .flatten()
}

/// Masks every field of an image stream that names a registry or repository.
pub fn anonymize_image_stream(image_stream: &mut Value) {
  mask_at(image_stream, "/spec/dockerImageRepository");
  for tag in array_at(image_stream, "/spec/tags") {
    mask_at(tag, "/from/name");
  }
  mask_at(image_stream, "/status/dockerImageRepository");
  mask_at(image_stream, "/status/publicDockerImageRepository");
  for tag in array_at(image_stream, "/status/tags") {
    for item in array_at(tag, "/items") {
      mask_at(item, "/dockerImageReference");
    }
  }
}

async fn gather_image_streams_of_namespace(
  context: BuildContext,
  params: ImageStreamsOfNamespaceParams,
) -> GatherOutput {
  let image_streams = match context.images.list_image_streams(&params.namespace).await {
    Ok(image_streams) => image_streams,
    Err(e) => return GatherOutput::from_error(e),
  };

  let mut output = GatherOutput::default();
  for mut image_stream in image_streams {
    anonymize_image_stream(&mut image_stream);
    let name = image_stream
      .pointer("/metadata/name")
      .and_then(Value::as_str)
      .unwrap_or_default();
    match Record::json(
      format!(
        "{RECORD_PREFIX}/namespaces/{}/imagestreams/{name}",
        params.namespace
      ),
      &image_stream,
    ) {
      Ok(record) => output.records.push(record),
      Err(e) => output.errors.push(e),
    }
  }
  output
}

impl GatherFunction for ImageStreamsOfNamespace {
  fn name(&self) -> &'static str {
    "image_streams_of_namespace"
  }

  fn params_schema(&self) -> &'static [FieldSchema] {
    IMAGE_STREAMS_OF_NAMESPACE_SCHEMA
  }

  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure> {
    build_closure(
      self.name(),
      context,
      params,
      gather_image_streams_of_namespace,
    )
  }
}
