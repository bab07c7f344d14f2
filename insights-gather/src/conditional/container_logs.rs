// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./container_logs_test.rs"]
mod container_logs_test;

use super::logs::{LineMatcher, list_all_pods, read_filtered_log};
use super::rules::RawLogRequest;
use crate::config::ConditionalConfig;
use crate::gatherer::{GatherError, GatherOutput};
use anyhow::{Context, anyhow, bail};
use futures::StreamExt;
use insights_common::k8s::object_name;
use insights_common::k8s::pods::{LogRequest, PodClient};
use insights_common::record::Record;
use itertools::Itertools;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

type LogResult = anyhow::Result<Record>;

/// Messages keyed by pod name regex and whether previous container logs are wanted.
type NamespaceRequests = BTreeMap<(String, bool), BTreeSet<String>>;

/// Groups requests by namespace, merging the messages of identical pod name regexes.
#[must_use]
pub fn group_by_namespace(requests: &[RawLogRequest]) -> BTreeMap<String, NamespaceRequests> {
  let mut grouped: BTreeMap<String, NamespaceRequests> = BTreeMap::new();
  for request in requests {
    grouped
      .entry(request.namespace.clone())
      .or_default()
      .entry((request.pod_name_regex.clone(), request.previous))
      .or_default()
      .extend(request.messages.iter().cloned());
  }
  grouped
}

/// Combines messages into a single alternation.
pub fn messages_to_regex<'a>(
  messages: impl IntoIterator<Item = &'a String>,
) -> anyhow::Result<Regex> {
  let alternation = messages.into_iter().join("|");
  if alternation.is_empty() {
    bail!("input messages are nil or empty");
  }
  Ok(Regex::new(&alternation)?)
}

#[must_use]
pub fn log_record_name(namespace: &str, pod: &str, container: &str, previous: bool) -> String {
  let file = if previous { "previous.log" } else { "current.log" };
  format!("namespaces/{namespace}/pods/{pod}/{container}/{file}")
}

struct ContainerLogTask {
  namespace: String,
  pod: String,
  container: String,
  previous: bool,
  matcher: Arc<LineMatcher>,
}

async fn read_container_log(
  client: &dyn PodClient,
  task: ContainerLogTask,
  since: Duration,
) -> LogResult {
  let log = read_filtered_log(
    client,
    &task.namespace,
    &task.pod,
    LogRequest {
      container: task.container.clone(),
      since: Some(since),
      previous: task.previous,
      timestamps: true,
      ..Default::default()
    },
    &task.matcher,
  )
  .await
  .with_context(|| {
    format!(
      "unable to read logs of container {} in pod {}/{}",
      task.container, task.namespace, task.pod
    )
  })?;

  if log.is_empty() {
    return Err(
      GatherError::NoLogsFound {
        namespace: task.namespace,
        pod: task.pod,
        container: task.container,
      }
      .into(),
    );
  }
  Ok(Record::raw(
    log_record_name(&task.namespace, &task.pod, &task.container, task.previous),
    log.into_bytes(),
  ))
}

/// Resolves the pods of one namespace and streams the matching lines of each of their containers
/// into the results channel.
async fn namespace_worker(
  client: Arc<dyn PodClient>,
  namespace: String,
  requests: NamespaceRequests,
  since: Duration,
  max_concurrent_streams: usize,
  results: mpsc::Sender<LogResult>,
) {
  let pods = match list_all_pods(client.as_ref(), &namespace, None, None).await {
    Ok(pods) => pods,
    Err(e) => {
      let _ignored = results
        .send(Err(anyhow!(
          "failed to get matching pod names for namespace {namespace}: {e}"
        )))
        .await;
      return;
    },
  };

  let mut pod_name_regexes = Vec::new();
  for ((pod_name_regex, previous), messages) in &requests {
    match Regex::new(pod_name_regex) {
      Ok(regex) => pod_name_regexes.push((regex, *previous, messages)),
      Err(e) => {
        let _ignored = results
          .send(Err(anyhow!(
            "invalid pod name regex {pod_name_regex} for namespace {namespace}: {e}"
          )))
          .await;
      },
    }
  }

  let mut tasks = Vec::new();
  for pod in &pods {
    let pod_name = object_name(&pod.metadata);
    for previous in [false, true] {
      let matching: Vec<_> = pod_name_regexes
        .iter()
        .filter(|(regex, wants_previous, _)| {
          *wants_previous == previous && regex.is_match(pod_name)
        })
        .collect();
      if matching.is_empty() {
        continue;
      }
      let messages: BTreeSet<&String> = matching
        .iter()
        .flat_map(|(_, _, messages)| messages.iter())
        .collect();
      let matcher = match messages_to_regex(messages) {
        Ok(regex) => Arc::new(LineMatcher::Regex(regex)),
        Err(e) => {
          let _ignored = results
            .send(Err(anyhow!(
              "failed to compile the list of messages for pod {pod_name} in namespace \
               {namespace}: {e}"
            )))
            .await;
          continue;
        },
      };
      for container in pod.spec.iter().flat_map(|spec| &spec.containers) {
        tasks.push(ContainerLogTask {
          namespace: namespace.clone(),
          pod: pod_name.to_string(),
          container: container.name.clone(),
          previous,
          matcher: matcher.clone(),
        });
      }
    }
  }

  let client = client.as_ref();
  let mut logs = futures::stream::iter(tasks)
    .map(|task| read_container_log(client, task, since))
    .buffer_unordered(max_concurrent_streams.max(1));
  while let Some(result) = logs.next().await {
    if results.send(result).await.is_err() {
      // The collector gave up.
      return;
    }
  }
}

/// Collects the log lines matching the requested messages from the containers of the pods whose
/// name matches the requested regexes. Every namespace is resolved by its own worker and all
/// results are gathered by a single collector, bounded by the configured log timeout.
pub async fn gather_container_logs(
  client: Arc<dyn PodClient>,
  requests: &[RawLogRequest],
  config: &ConditionalConfig,
) -> GatherOutput {
  let (results_tx, mut results_rx) = mpsc::channel(config.max_concurrent_streams.max(1));
  let mut workers = JoinSet::new();
  for (namespace, namespace_requests) in group_by_namespace(requests) {
    workers.spawn(namespace_worker(
      client.clone(),
      namespace,
      namespace_requests,
      config.log_since,
      config.max_concurrent_streams,
      results_tx.clone(),
    ));
  }
  drop(results_tx);

  let mut output = GatherOutput::default();
  let collected = tokio::time::timeout(config.log_timeout, async {
    while let Some(result) = results_rx.recv().await {
      match result {
        Ok(record) => output.records.push(record),
        Err(e) => {
          log::debug!("container log: {e}");
          output.errors.push(e);
        },
      }
    }
  })
  .await;

  if collected.is_err() {
    workers.abort_all();
    output.errors.push(anyhow!(
      "timed out after {:?} collecting container logs",
      config.log_timeout
    ));
  }
  while let Some(joined) = workers.join_next().await {
    if let Err(e) = joined
      && !e.is_cancelled()
    {
      output.errors.push(anyhow!("container log worker failed: {e}"));
    }
  }
  output
}
