// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod api_request_counts;
pub mod namespace;
pub mod pods;

use super::alerts::{AlertLabels, FiringAlerts};
use super::validation::FieldSchema;
use crate::config::ConditionalConfig;
use crate::gatherer::{GatherError, GatherOutput, GatheringClosure, until_cancelled};
use anyhow::Context;
use insights_common::k8s::openshift::{ApiRequestCountClient, ImageClient};
use insights_common::k8s::pods::PodClient;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

pub const RECORD_PREFIX: &str = "conditional";

//
// BuildContext
//

/// Everything a builder may capture into its closure. The firing alerts are the snapshot taken by
/// the refresh that preceded rule evaluation.
#[derive(Clone)]
pub struct BuildContext {
  pub pods: Arc<dyn PodClient>,
  pub images: Arc<dyn ImageClient>,
  pub api_request_counts: Arc<dyn ApiRequestCountClient>,
  pub firing_alerts: Arc<FiringAlerts>,
  pub config: Arc<ConditionalConfig>,
}

impl BuildContext {
  /// Returns the instances of a firing alert, or the not firing error.
  pub fn alert_instances(&self, alert_name: &str) -> Result<&[AlertLabels], GatherError> {
    if self.firing_alerts.is_firing(alert_name) {
      Ok(self.firing_alerts.instances(alert_name))
    } else {
      Err(GatherError::NotFiring(alert_name.to_string()))
    }
  }
}

//
// GatherFunction
//

/// A named, parameterized way of gathering data that rules can reference.
pub trait GatherFunction: Send + Sync {
  fn name(&self) -> &'static str;

  /// The accepted params fields, checked before any rule is evaluated.
  fn params_schema(&self) -> &'static [FieldSchema];

  /// Creates the closure for the provided params. Params are parsed into the function's own type
  /// again, so a shape mismatch is an error even if validation was skipped.
  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure>;
}

/// Parses function params into their typed form.
pub fn parse_params<P: DeserializeOwned>(function: &str, params: &Value) -> anyhow::Result<P> {
  serde_json::from_value(params.clone())
    .with_context(|| format!("invalid params for gathering function {function}"))
}

/// Builds a closure that parses its params once and runs `gather` with them on every run.
pub fn build_closure<P, F, Fut>(
  function: &'static str,
  context: &BuildContext,
  params: &Value,
  gather: F,
) -> anyhow::Result<GatheringClosure>
where
  P: DeserializeOwned + Clone + Send + Sync + 'static,
  F: Fn(BuildContext, P) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = GatherOutput> + Send + 'static,
{
  let params: P = parse_params(function, params)?;
  let context = context.clone();
  Ok(GatheringClosure::new(move |shutdown| {
    until_cancelled(shutdown, gather(context.clone(), params.clone()))
  }))
}

//
// Registry
//

/// The gather functions rules may reference, keyed by name.
#[derive(Clone, Default)]
pub struct Registry {
  functions: BTreeMap<&'static str, Arc<dyn GatherFunction>>,
}

impl Registry {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry with every built in gather function.
  #[must_use]
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register(Arc::new(namespace::LogsOfNamespace));
    registry.register(Arc::new(namespace::ImageStreamsOfNamespace));
    registry.register(Arc::new(api_request_counts::ApiRequestCountsOfResourceFromAlert));
    registry.register(Arc::new(pods::ContainersLogs));
    registry.register(Arc::new(pods::PodDefinition));
    registry.register(Arc::new(pods::LogsOfUnhealthyPods));
    registry.register(Arc::new(pods::LogsOfUnhealthyPodsByAlerts));
    registry.register(Arc::new(pods::AlertmanagerLogs));
    registry
  }

  /// Registers a function, replacing any function with the same name.
  pub fn register(&mut self, function: Arc<dyn GatherFunction>) {
    self.functions.insert(function.name(), function);
  }

  #[must_use]
  pub fn get(&self, name: &str) -> Option<&Arc<dyn GatherFunction>> {
    self.functions.get(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
    self.functions.keys().copied()
  }
}

fn render_param(value: &Value) -> Option<String> {
  match value {
    Value::Null => None,
    Value::String(s) if s.is_empty() => None,
    Value::String(s) => Some(s.clone()),
    Value::Array(items) if items.is_empty() => None,
    Value::Array(items) => Some(format!(
      "[{}]",
      items.iter().filter_map(render_param).join(" ")
    )),
    Value::Bool(_) | Value::Number(_) | Value::Object(_) => Some(value.to_string()),
  }
}

/// Derives the externally visible closure name: the function name followed by the non empty params
/// sorted by key, e.g. `logs_of_namespace/namespace=openshift-foo,tail_lines=100`.
#[must_use]
pub fn closure_name(function: &str, params: &Value) -> String {
  let Some(params) = params.as_object() else {
    return function.to_string();
  };
  let rendered = params
    .iter()
    .sorted_by(|(a, _), (b, _)| a.cmp(b))
    .filter_map(|(key, value)| render_param(value).map(|value| format!("{key}={value}")))
    .join(",");
  if rendered.is_empty() {
    function.to_string()
  } else {
    format!("{function}/{rendered}")
  }
}

//
// AlertLabelError
//

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLabelError {
  #[error("alert is missing 'pod' label")]
  MissingPod,
  #[error("alert is missing 'namespace' label")]
  MissingNamespace,
  #[error("alert is missing 'container' label")]
  MissingContainer,
}

impl AlertLabelError {
  const fn label(self) -> &'static str {
    match self {
      Self::MissingPod => "pod",
      Self::MissingNamespace => "namespace",
      Self::MissingContainer => "container",
    }
  }
}

/// Returns the value of a label the alert must carry. An empty value counts as missing.
pub fn required_label(
  labels: &AlertLabels,
  missing: AlertLabelError,
) -> Result<&str, AlertLabelError> {
  labels
    .get(missing.label())
    .map(String::as_str)
    .filter(|value| !value.is_empty())
    .ok_or(missing)
}

/// Returns the record name of a container log for the alert driven log functions.
#[must_use]
pub fn container_log_name(
  namespace: &str,
  pod: &str,
  container: &str,
  previous: bool,
  tail_lines: i64,
) -> String {
  let directory = if previous { "logs-previous" } else { "logs" };
  format!(
    "{RECORD_PREFIX}/namespaces/{namespace}/pods/{pod}/containers/{container}/{directory}/last-\
     {tail_lines}-lines.log"
  )
}
