// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./pods_test.rs"]
mod pods_test;

use super::{
  AlertLabelError,
  BuildContext,
  GatherFunction,
  RECORD_PREFIX,
  build_closure,
  container_log_name,
  required_label,
};
use crate::conditional::alerts::AlertLabels;
use crate::conditional::logs::{LogContainersFilter, LogMessagesFilter, collect_logs_from_containers};
use crate::conditional::validation::{
  ALERT_NAME_PATTERN,
  CONTAINER_NAME_PATTERN,
  FieldKind,
  FieldSchema,
  NAMESPACE_PATTERN,
  POD_NAME_PATTERN,
};
use crate::gatherer::{GatherOutput, GatheringClosure};
use anyhow::anyhow;
use insights_common::record::Record;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ALERT_NAME: FieldSchema =
  FieldSchema::required("alert_name", FieldKind::string(ALERT_NAME_PATTERN));
const PREVIOUS: FieldSchema = FieldSchema::optional("previous", FieldKind::Boolean);
const ALERT_LOG_TAIL_LINES: FieldKind = FieldKind::integer(1, 4096);
const UNHEALTHY_POD_TAIL_LINES: FieldKind = FieldKind::integer(1, 1_000_000);

fn exact_match(name: &str) -> anyhow::Result<Regex> {
  Ok(Regex::new(&format!("^{}$", regex::escape(name)))?)
}

/// Collects the logs of the containers of one alert instance, wrapping any failure.
async fn collect_instance_logs(
  context: &BuildContext,
  containers_filter: LogContainersFilter,
  messages_filter: LogMessagesFilter,
  log_name: impl Fn(&str, &str, &str) -> String,
) -> GatherOutput {
  let result = collect_logs_from_containers(
    context.pods.as_ref(),
    &containers_filter,
    &messages_filter,
    context.config.max_concurrent_streams,
    log_name,
  )
  .await;
  match result {
    Ok(output) => output,
    Err(e) => {
      let error = anyhow!("unable to get container logs: {e}");
      log::warn!("{error}");
      GatherOutput::from_error(error)
    },
  }
}

fn label_error(output: &mut GatherOutput, alert_name: &str, error: AlertLabelError) {
  log::warn!("{error} at alertName: {alert_name}");
  output.errors.push(error.into());
}

//
// ContainersLogs
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainersLogsParams {
  pub alert_name: String,
  /// Only alert instances in this namespace are considered.
  #[serde(default)]
  pub namespace: String,
  /// Overrides the alert's `container` label.
  #[serde(default)]
  pub container: String,
  /// Overrides the alert's `pod` label.
  #[serde(default)]
  pub pod_name: String,
  pub tail_lines: i64,
  #[serde(default)]
  pub previous: bool,
}

/// Collects the logs of the containers a firing alert points at.
pub struct ContainersLogs;

const CONTAINERS_LOGS_SCHEMA: &[FieldSchema] = &[
  ALERT_NAME,
  FieldSchema::optional("namespace", FieldKind::string(NAMESPACE_PATTERN)),
  FieldSchema::optional("container", FieldKind::string(CONTAINER_NAME_PATTERN)),
  FieldSchema::optional("pod_name", FieldKind::string(POD_NAME_PATTERN)),
  FieldSchema::required("tail_lines", ALERT_LOG_TAIL_LINES),
  PREVIOUS,
];

fn containers_logs_filter(
  labels: &AlertLabels,
  params: &ContainersLogsParams,
  output: &mut GatherOutput,
) -> anyhow::Result<Option<LogContainersFilter>> {
  let namespace = match required_label(labels, AlertLabelError::MissingNamespace) {
    Ok(namespace) => namespace,
    Err(e) => {
      label_error(output, &params.alert_name, e);
      return Ok(None);
    },
  };
  if !params.namespace.is_empty() && params.namespace != namespace {
    return Ok(None);
  }

  let container_name_regex = if params.container.is_empty() {
    match required_label(labels, AlertLabelError::MissingContainer) {
      Ok(container) => exact_match(container)?,
      Err(e) => {
        label_error(output, &params.alert_name, e);
        return Ok(None);
      },
    }
  } else {
    exact_match(&params.container)?
  };

  let mut filter = LogContainersFilter {
    namespace: namespace.to_string(),
    container_name_regex: Some(container_name_regex),
    ..Default::default()
  };
  if params.pod_name.is_empty() {
    match required_label(labels, AlertLabelError::MissingPod) {
      Ok(pod) => filter.field_selector = Some(format!("metadata.name={pod}")),
      Err(e) => {
        label_error(output, &params.alert_name, e);
        return Ok(None);
      },
    }
  } else {
    filter.pod_name_regex = Some(exact_match(&params.pod_name)?);
  }
  Ok(Some(filter))
}

async fn gather_containers_logs(context: BuildContext, params: ContainersLogsParams) -> GatherOutput {
  let instances = match context.alert_instances(&params.alert_name) {
    Ok(instances) => instances.to_vec(),
    Err(e) => return GatherOutput::from_error(e.into()),
  };

  let mut output = GatherOutput::default();
  for labels in &instances {
    let filter = match containers_logs_filter(labels, &params, &mut output) {
      Ok(Some(filter)) => filter,
      Ok(None) => continue,
      Err(e) => {
        output.errors.push(e);
        continue;
      },
    };
    let instance_output = collect_instance_logs(
      &context,
      filter,
      LogMessagesFilter {
        tail_lines: Some(params.tail_lines),
        previous: params.previous,
        ..Default::default()
      },
      |namespace, pod, container| {
        container_log_name(namespace, pod, container, params.previous, params.tail_lines)
      },
    )
    .await;
    output.merge(instance_output);
  }
  output
}

impl GatherFunction for ContainersLogs {
  fn name(&self) -> &'static str {
    "containers_logs"
  }

  fn params_schema(&self) -> &'static [FieldSchema] {
    CONTAINERS_LOGS_SCHEMA
  }

  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure> {
    build_closure(self.name(), context, params, gather_containers_logs)
  }
}

//
// PodDefinition
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PodDefinitionParams {
  pub alert_name: String,
}

/// Collects the definition of every pod a firing alert points at.
pub struct PodDefinition;

const POD_DEFINITION_SCHEMA: &[FieldSchema] = &[ALERT_NAME];

async fn gather_pod_definition(context: BuildContext, params: PodDefinitionParams) -> GatherOutput {
  let instances = match context.alert_instances(&params.alert_name) {
    Ok(instances) => instances.to_vec(),
    Err(e) => return GatherOutput::from_error(e.into()),
  };

  let mut output = GatherOutput::default();
  for labels in &instances {
    let target = required_label(labels, AlertLabelError::MissingNamespace)
      .and_then(|namespace| Ok((namespace, required_label(labels, AlertLabelError::MissingPod)?)));
    let (namespace, pod_name) = match target {
      Ok(target) => target,
      Err(e) => {
        label_error(&mut output, &params.alert_name, e);
        continue;
      },
    };

    match context.pods.get_pod(namespace, pod_name).await {
      Ok(Some(pod)) => {
        match Record::json(
          format!("{RECORD_PREFIX}/namespaces/{namespace}/pods/{pod_name}/{pod_name}"),
          &pod,
        ) {
          Ok(record) => output.records.push(record),
          Err(e) => output.errors.push(e),
        }
      },
      Ok(None) => {
        log::warn!("pod {pod_name} not found in {namespace} namespace");
        output
          .errors
          .push(anyhow!("pod {pod_name} not found in {namespace} namespace"));
      },
      Err(e) => {
        log::warn!("unable to get pod {pod_name} in {namespace} namespace: {e}");
        output.errors.push(e);
      },
    }
  }
  output
}

impl GatherFunction for PodDefinition {
  fn name(&self) -> &'static str {
    "pod_definition"
  }

  fn params_schema(&self) -> &'static [FieldSchema] {
    POD_DEFINITION_SCHEMA
  }

  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure> {
    build_closure(self.name(), context, params, gather_pod_definition)
  }
}

//
// LogsOfUnhealthyPods
//

/// Collects the logs of the pods, and the container if labeled, that each alert instance points at.
async fn gather_unhealthy_pod_logs(
  context: &BuildContext,
  alert_name: &str,
  instances: &[AlertLabels],
  tail_lines: i64,
  previous: bool,
) -> GatherOutput {
  let mut output = GatherOutput::default();
  for labels in instances {
    let target = required_label(labels, AlertLabelError::MissingNamespace)
      .and_then(|namespace| Ok((namespace, required_label(labels, AlertLabelError::MissingPod)?)));
    let (namespace, pod) = match target {
      Ok(target) => target,
      Err(e) => {
        label_error(&mut output, alert_name, e);
        continue;
      },
    };
    // The container label is not carried by every alert, e.g. KubePodNotReady.
    let container_name_regex = match required_label(labels, AlertLabelError::MissingContainer) {
      Ok(container) => match exact_match(container) {
        Ok(regex) => Some(regex),
        Err(e) => {
          output.errors.push(e);
          continue;
        },
      },
      Err(_) => None,
    };

    let instance_output = collect_instance_logs(
      context,
      LogContainersFilter {
        namespace: namespace.to_string(),
        field_selector: Some(format!("metadata.name={pod}")),
        container_name_regex,
        ..Default::default()
      },
      LogMessagesFilter {
        tail_lines: Some(tail_lines),
        previous,
        ..Default::default()
      },
      |namespace, pod, container| container_log_name(namespace, pod, container, previous, tail_lines),
    )
    .await;
    output.merge(instance_output);
  }
  output
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogsOfUnhealthyPodsParams {
  pub alert_name: String,
  pub tail_lines: i64,
  #[serde(default)]
  pub previous: bool,
}

pub struct LogsOfUnhealthyPods;

const LOGS_OF_UNHEALTHY_PODS_SCHEMA: &[FieldSchema] = &[
  ALERT_NAME,
  FieldSchema::required("tail_lines", UNHEALTHY_POD_TAIL_LINES),
  PREVIOUS,
];

async fn gather_logs_of_unhealthy_pods(
  context: BuildContext,
  params: LogsOfUnhealthyPodsParams,
) -> GatherOutput {
  let instances = match context.alert_instances(&params.alert_name) {
    Ok(instances) => instances.to_vec(),
    Err(e) => return GatherOutput::from_error(e.into()),
  };
  gather_unhealthy_pod_logs(
    &context,
    &params.alert_name,
    &instances,
    params.tail_lines,
    params.previous,
  )
  .await
}

impl GatherFunction for LogsOfUnhealthyPods {
  fn name(&self) -> &'static str {
    "logs_of_unhealthy_pods"
  }

  fn params_schema(&self) -> &'static [FieldSchema] {
    LOGS_OF_UNHEALTHY_PODS_SCHEMA
  }

  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure> {
    build_closure(self.name(), context, params, gather_logs_of_unhealthy_pods)
  }
}

//
// LogsOfUnhealthyPodsByAlerts
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogsOfUnhealthyPodsByAlertsParams {
  /// Alerts whose pods have their current logs collected.
  #[serde(default)]
  pub alerts_current: Vec<String>,
  /// Alerts whose pods have the logs of their previous containers collected.
  #[serde(default)]
  pub alerts_previous: Vec<String>,
  pub tail_lines_current: i64,
  pub tail_lines_previous: i64,
}

/// The list form of `logs_of_unhealthy_pods`. Alerts that are not firing are skipped.
pub struct LogsOfUnhealthyPodsByAlerts;

const LOGS_OF_UNHEALTHY_PODS_BY_ALERTS_SCHEMA: &[FieldSchema] = &[
  FieldSchema::optional(
    "alerts_current",
    FieldKind::StringArray {
      pattern: Some(ALERT_NAME_PATTERN),
      min_items: 0,
      max_items: 64,
    },
  ),
  FieldSchema::optional(
    "alerts_previous",
    FieldKind::StringArray {
      pattern: Some(ALERT_NAME_PATTERN),
      min_items: 0,
      max_items: 64,
    },
  ),
  FieldSchema::required("tail_lines_current", UNHEALTHY_POD_TAIL_LINES),
  FieldSchema::required("tail_lines_previous", UNHEALTHY_POD_TAIL_LINES),
];

async fn gather_logs_of_unhealthy_pods_by_alerts(
  context: BuildContext,
  params: LogsOfUnhealthyPodsByAlertsParams,
) -> GatherOutput {
  let mut output = GatherOutput::default();
  let batches = [
    (&params.alerts_current, params.tail_lines_current, false),
    (&params.alerts_previous, params.tail_lines_previous, true),
  ];
  for (alerts, tail_lines, previous) in batches {
    for alert_name in alerts {
      let instances = context.firing_alerts.instances(alert_name).to_vec();
      if instances.is_empty() {
        log::debug!("skipping alert {alert_name}, it is not firing");
        continue;
      }
      output.merge(
        gather_unhealthy_pod_logs(&context, alert_name, &instances, tail_lines, previous).await,
      );
    }
  }
  output
}

impl GatherFunction for LogsOfUnhealthyPodsByAlerts {
  fn name(&self) -> &'static str {
    "logs_of_unhealthy_pods_by_alerts"
  }

  fn params_schema(&self) -> &'static [FieldSchema] {
    LOGS_OF_UNHEALTHY_PODS_BY_ALERTS_SCHEMA
  }

  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure> {
    build_closure(
      self.name(),
      context,
      params,
      gather_logs_of_unhealthy_pods_by_alerts,
    )
  }
}

//
// AlertmanagerLogs
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertmanagerLogsParams {
  pub alert_name: String,
  pub tail_lines: i64,
}

/// Collects the alertmanager container logs of the pods a firing alert points at.
pub struct AlertmanagerLogs;

const ALERTMANAGER_LOGS_SCHEMA: &[FieldSchema] = &[
  ALERT_NAME,
  FieldSchema::required("tail_lines", ALERT_LOG_TAIL_LINES),
];

async fn gather_alertmanager_logs(
  context: BuildContext,
  params: AlertmanagerLogsParams,
) -> GatherOutput {
  let instances = match context.alert_instances(&params.alert_name) {
    Ok(instances) => instances.to_vec(),
    Err(e) => return GatherOutput::from_error(e.into()),
  };

  let file_name = format!("alertmanager-{}.log", params.alert_name.to_lowercase());
  let mut output = GatherOutput::default();
  for labels in &instances {
    let target = required_label(labels, AlertLabelError::MissingNamespace)
      .and_then(|namespace| Ok((namespace, required_label(labels, AlertLabelError::MissingPod)?)));
    let (namespace, pod) = match target {
      Ok(target) => target,
      Err(e) => {
        label_error(&mut output, &params.alert_name, e);
        continue;
      },
    };

    let instance_output = collect_instance_logs(
      &context,
      LogContainersFilter {
        namespace: namespace.to_string(),
        field_selector: Some(format!("metadata.name={pod}")),
        container_name_regex: exact_match("alertmanager").ok(),
        ..Default::default()
      },
      LogMessagesFilter {
        tail_lines: Some(params.tail_lines),
        ..Default::default()
      },
      |namespace, pod, _| {
        format!("{RECORD_PREFIX}/namespaces/{namespace}/pods/{pod}/containers/logs/{file_name}")
      },
    )
    .await;
    output.merge(instance_output);
  }
  output
}

impl GatherFunction for AlertmanagerLogs {
  fn name(&self) -> &'static str {
    "alertmanager_logs"
  }

  fn params_schema(&self) -> &'static [FieldSchema] {
    ALERTMANAGER_LOGS_SCHEMA
  }

  fn build(&self, context: &BuildContext, params: &Value) -> anyhow::Result<GatheringClosure> {
    build_closure(self.name(), context, params, gather_alertmanager_logs)
  }
}
