// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./api_request_counts_test.rs"]
mod api_request_counts_test;

use super::{BuildContext, GatherFunction, RECORD_PREFIX, build_closure};
use crate::conditional::validation::{ALERT_NAME_PATTERN, FieldKind, FieldSchema};
use crate::gatherer::{GatherOutput, GatheringClosure};
use anyhow::anyhow;
use insights_common::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiRequestCountsParams {
  pub alert_name: String,
}

/// The request counts of an API resource that is about to be removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRequestCount {
  #[serde(rename = "resource")]
  pub resource_name: String,
  pub removed_in_release: String,
  pub total_request_count: i64,
  pub last_day_request_count: i64,
}

/// Collects the request counts of the resources named by the firing alert's `resource`, `version`
/// and `group` labels.
pub struct ApiRequestCountsOfResourceFromAlert;

const SCHEMA: &[FieldSchema] = &[FieldSchema::required(
  "alert_name",
  FieldKind::string(ALERT_NAME_PATTERN),
)];

fn nested<'a>(object: &'a Value, pointer: &str) -> anyhow::Result<&'a Value> {
  object
    .pointer(pointer)
    .ok_or_else(|| anyhow!("{pointer} accessor error: field not found"))
}

fn nested_i64(object: &Value, pointer: &str) -> anyhow::Result<i64> {
  nested(object, pointer)?
    .as_i64()
    .ok_or_else(|| anyhow!("{pointer} accessor error: value is not an integer"))
}

fn nested_str(object: &Value, pointer: &str) -> anyhow::Result<String> {
  Ok(
    nested(object, pointer)?
      .as_str()
      .ok_or_else(|| anyhow!("{pointer} accessor error: value is not a string"))?
      .to_string(),
  )
}

fn or_default<T: Default>(result: anyhow::Result<T>, errors: &mut Vec<anyhow::Error>) -> T {
  result.unwrap_or_else(|e| {
    errors.push(e);
    T::default()
  })
}

fn to_api_request_count(
  name: &str,
  object: &Value,
  errors: &mut Vec<anyhow::Error>,
) -> ApiRequestCount {
  ApiRequestCount {
    resource_name: name.to_string(),
    total_request_count: or_default(nested_i64(object, "/status/requestCount"), errors),
    last_day_request_count: or_default(
      nested_i64(object, "/status/currentHour/requestCount"),
      errors,
    ),
    removed_in_release: or_default(nested_str(object, "/status/removedInRelease"), errors),
  }
}

async fn gather_api_request_counts(
  context: BuildContext,
  params: ApiRequestCountsParams,
) -> GatherOutput {
  let instances = match context.alert_instances(&params.alert_name) {
    Ok(instances) => instances,
    Err(e) => return GatherOutput::from_error(e.into()),
  };
  let resources: HashSet<String> = instances
    .iter()
    .map(|labels| {
      let label = |name: &str| labels.get(name).map(String::as_str).unwrap_or_default();
      format!("{}.{}.{}", label("resource"), label("version"), label("group"))
    })
    .collect();

  let items = match context.api_request_counts.list_api_request_counts().await {
    Ok(Some(items)) => items,
    Ok(None) => return GatherOutput::default(),
    Err(e) => return GatherOutput::from_error(e),
  };

  let mut errors = Vec::new();
  let counts: Vec<ApiRequestCount> = items
    .iter()
    .filter_map(|item| {
      let name = item.pointer("/metadata/name").and_then(Value::as_str)?;
      resources
        .contains(name)
        .then(|| to_api_request_count(name, item, &mut errors))
    })
    .collect();

  match Record::json(
    format!(
      "{RECORD_PREFIX}/alerts/{}/api_request_counts",
      params.alert_name
    ),
    &counts,
  ) {
    Ok(record) => GatherOutput::new(vec![record], errors),
    Err(e) => {
      errors.push(e);
      GatherOutput::new(vec![], errors)
    },
  }
}

impl GatherFunction for ApiRequestCountsOfResourceFromAlert {
  fn name(&self) -> &'static str {
    "api_request_counts_of_resource_from_alert"
  }

  fn params_schema(&self) -> &'static [FieldSchema] {
    SCHEMA
  }

  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure> {
    build_closure(self.name(), context, params, gather_api_request_counts)
  }
}
