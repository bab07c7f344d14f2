// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./logs_test.rs"]
mod logs_test;

use crate::gatherer::GatherOutput;
use anyhow::{Context, anyhow};
use futures::{StreamExt, TryStreamExt};
use insights_common::k8s::pods::{ListPodsRequest, LogRequest, PodClient};
use insights_common::k8s::{object_name, object_namespace};
use insights_common::record::Record;
use k8s_openapi::api::core::v1::Pod;
use regex::Regex;
use std::time::Duration;

//
// LogContainersFilter
//

/// Selects the containers whose logs are read. Unset filters match everything.
#[derive(Debug, Clone, Default)]
pub struct LogContainersFilter {
  pub namespace: String,
  pub label_selector: Option<String>,
  pub field_selector: Option<String>,
  pub pod_name_regex: Option<Regex>,
  pub container_name_regex: Option<Regex>,
  /// At most this many containers are read, the rest are reported as skipped.
  pub max_containers: Option<usize>,
}

//
// LogMessagesFilter
//

/// Selects what is read from each container log and which lines are kept.
#[derive(Debug, Clone, Default)]
pub struct LogMessagesFilter {
  /// Lines containing any of the messages are kept, every line if empty. Matching is a case
  /// insensitive substring search unless `is_regex` is set.
  pub messages: Vec<String>,
  pub is_regex: bool,
  pub since: Option<Duration>,
  pub limit_bytes: Option<i64>,
  pub tail_lines: Option<i64>,
  pub previous: bool,
}

impl LogMessagesFilter {
  fn log_request(&self, container: &str) -> LogRequest {
    LogRequest {
      container: container.to_string(),
      tail_lines: self.tail_lines,
      since: self.since,
      limit_bytes: self.limit_bytes,
      previous: self.previous,
      timestamps: true,
    }
  }

  fn line_matcher(&self) -> anyhow::Result<LineMatcher> {
    if self.messages.is_empty() {
      Ok(LineMatcher::All)
    } else if self.is_regex {
      Ok(LineMatcher::Regex(
        Regex::new(&self.messages.join("|")).context("invalid log message regex")?,
      ))
    } else {
      Ok(LineMatcher::Substrings(
        self.messages.iter().map(|m| m.to_lowercase()).collect(),
      ))
    }
  }
}

//
// LineMatcher
//

#[derive(Debug, Clone)]
pub enum LineMatcher {
  All,
  Regex(Regex),
  Substrings(Vec<String>),
}

impl LineMatcher {
  #[must_use]
  pub fn is_match(&self, line: &str) -> bool {
    match self {
      Self::All => true,
      Self::Regex(regex) => regex.is_match(line),
      Self::Substrings(messages) => {
        let line = line.to_lowercase();
        messages.iter().any(|message| line.contains(message))
      },
    }
  }
}

/// Streams a container log and joins the matching lines.
pub async fn read_filtered_log(
  client: &dyn PodClient,
  namespace: &str,
  pod: &str,
  request: LogRequest,
  matcher: &LineMatcher,
) -> anyhow::Result<String> {
  let lines: Vec<String> = client
    .stream_logs(namespace, pod, request)
    .await?
    .try_filter(|line| futures::future::ready(matcher.is_match(line)))
    .try_collect()
    .await?;
  Ok(lines.join("\n"))
}

/// Lists every pod matching the selectors, following continuation tokens.
pub async fn list_all_pods(
  client: &dyn PodClient,
  namespace: &str,
  label_selector: Option<String>,
  field_selector: Option<String>,
) -> anyhow::Result<Vec<Pod>> {
  let mut pods = Vec::new();
  let mut continue_token = None;
  loop {
    let page = client
      .list_pods(
        namespace,
        ListPodsRequest {
          label_selector: label_selector.clone(),
          field_selector: field_selector.clone(),
          limit: None,
          continue_token,
        },
      )
      .await?;
    pods.extend(page.items);
    match page.continue_token {
      Some(token) => continue_token = Some(token),
      None => return Ok(pods),
    }
  }
}

/// Returns the names of the regular and then the init containers of the pod.
pub fn container_names(pod: &Pod) -> impl Iterator<Item = &str> {
  pod.spec.iter().flat_map(|spec| {
    spec
      .containers
      .iter()
      .chain(spec.init_containers.iter().flatten())
      .map(|container| container.name.as_str())
  })
}

#[must_use]
pub fn default_log_name(namespace: &str, pod: &str, _container: &str) -> String {
  format!("config/pod/{namespace}/logs/{pod}/errors.log")
}

/// Reads the logs of every container selected by the filter. Failing to list pods is an error;
/// failing to read a single container is reported alongside the logs that were read. Containers
/// whose filtered log is empty produce no record.
pub async fn collect_logs_from_containers(
  client: &dyn PodClient,
  containers_filter: &LogContainersFilter,
  messages_filter: &LogMessagesFilter,
  max_concurrent_streams: usize,
  log_name: impl Fn(&str, &str, &str) -> String,
) -> anyhow::Result<GatherOutput> {
  let matcher = messages_filter.line_matcher()?;
  let pods = list_all_pods(
    client,
    &containers_filter.namespace,
    containers_filter.label_selector.clone(),
    containers_filter.field_selector.clone(),
  )
  .await?;
  if pods.is_empty() {
    log::info!(
      "no pods in {} namespace were found",
      containers_filter.namespace
    );
  }

  let mut targets = Vec::new();
  let mut skipped = 0;
  for pod in &pods {
    let pod_name = object_name(&pod.metadata);
    if containers_filter
      .pod_name_regex
      .as_ref()
      .is_some_and(|regex| !regex.is_match(pod_name))
    {
      continue;
    }
    for container in container_names(pod) {
      if containers_filter
        .container_name_regex
        .as_ref()
        .is_some_and(|regex| !regex.is_match(container))
      {
        continue;
      }
      if containers_filter
        .max_containers
        .is_some_and(|max| targets.len() >= max)
      {
        skipped += 1;
        continue;
      }
      targets.push((object_namespace(&pod.metadata), pod_name, container));
    }
  }

  let results: Vec<_> = futures::stream::iter(targets)
    .map(|(namespace, pod, container)| {
      let matcher = &matcher;
      async move {
        let log = read_filtered_log(
          client,
          namespace,
          pod,
          messages_filter.log_request(container),
          matcher,
        )
        .await
        .with_context(|| {
          format!("unable to read logs of container {container} in pod {namespace}/{pod}")
        });
        (namespace, pod, container, log)
      }
    })
    .buffered(max_concurrent_streams.max(1))
    .collect()
    .await;

  let mut output = GatherOutput::default();
  for (namespace, pod, container, log) in results {
    match log {
      Ok(log) if log.trim().is_empty() => {},
      Ok(log) => output.records.push(Record::raw(
        log_name(namespace, pod, container),
        log.into_bytes(),
      )),
      Err(e) => output.errors.push(e),
    }
  }

  if skipped > 0 {
    output.errors.push(anyhow!(
      "skipping {skipped} containers on namespace {} (max: {})",
      containers_filter.namespace,
      containers_filter.max_containers.unwrap_or_default()
    ));
  }
  Ok(output)
}
