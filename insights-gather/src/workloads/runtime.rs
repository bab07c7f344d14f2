// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./runtime_test.rs"]
mod runtime_test;

use super::WorkloadError;
use super::types::{ContainerKey, RuntimeInfo, WorkloadPods};
use crate::conditional::logs::list_all_pods;
use crate::config::RuntimeExtractorConfig;
use anyhow::{Context, bail};
use bd_shutdown::ComponentShutdownTriggerHandle;
use insights_common::k8s::pod_phase;
use insights_common::k8s::pods::PodClient;
use prometheus::IntCounter;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use tokio::task::JoinSet;

pub const EXTRACTOR_LABEL_SELECTOR: &str = "app.kubernetes.io/name=insights-runtime-extractor";
const GATHER_PATH: &str = "gather_runtime_info";

pub type RuntimeInfos = HashMap<ContainerKey, RuntimeInfo>;

/// The extractor response: namespace, then pod, then container ID.
type NodeRuntimeInfo = BTreeMap<String, BTreeMap<String, BTreeMap<String, RuntimeInfo>>>;

//
// ExtractorPod
//

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorPod {
  pub pod_ip: String,
  pub node_name: String,
}

/// Lists the running extractor pods of the namespace, one per node.
pub async fn list_extractor_pods(
  client: &dyn PodClient,
  namespace: &str,
) -> anyhow::Result<Vec<ExtractorPod>> {
  let pods = list_all_pods(
    client,
    namespace,
    Some(EXTRACTOR_LABEL_SELECTOR.to_string()),
    None,
  )
  .await?;
  let extractors: Vec<_> = pods
    .iter()
    .filter(|pod| pod_phase(pod) == "Running")
    .filter_map(|pod| {
      let pod_ip = pod.status.as_ref()?.pod_ip.clone()?;
      let node_name = pod.spec.as_ref()?.node_name.clone().unwrap_or_default();
      Some(ExtractorPod { pod_ip, node_name })
    })
    .collect();
  if extractors.is_empty() {
    return Err(WorkloadError::NoExtractorPods.into());
  }
  Ok(extractors)
}

/// Flattens an extractor response, skipping containers without any runtime data.
#[must_use]
pub fn flatten(node: NodeRuntimeInfo) -> RuntimeInfos {
  let mut infos = RuntimeInfos::new();
  for (namespace, pods) in node {
    for (pod, containers) in pods {
      for (container_id, info) in containers {
        if info.is_empty() {
          continue;
        }
        infos.insert(
          ContainerKey {
            namespace: namespace.clone(),
            pod: pod.clone(),
            container_id,
          },
          info,
        );
      }
    }
  }
  infos
}

fn extractor_url(extractor: &ExtractorPod, port: u16) -> anyhow::Result<String> {
  let ip: IpAddr = extractor
    .pod_ip
    .parse()
    .with_context(|| format!("invalid extractor pod IP {:?}", extractor.pod_ip))?;
  Ok(format!("http://{}/{GATHER_PATH}", SocketAddr::new(ip, port)))
}

async fn node_runtime_infos(
  client: reqwest::Client,
  extractor: ExtractorPod,
  port: u16,
) -> anyhow::Result<RuntimeInfos> {
  let url = extractor_url(&extractor, port)?;
  log::debug!(
    "gathering workload runtime info for node {} from {url}",
    extractor.node_name
  );
  let response = client.get(&url).send().await?;
  let status = response.status();
  if !status.is_success() {
    bail!("received unexpected status code {status} from {url}");
  }
  let node: NodeRuntimeInfo = response
    .json()
    .await
    .with_context(|| format!("unable to parse the runtime info from {url}"))?;
  Ok(flatten(node))
}

/// Queries the extractor of every node and merges the results. A node that cannot be reached only
/// loses its own data.
pub async fn gather_runtime_infos(
  pods: &dyn PodClient,
  config: &RuntimeExtractorConfig,
  node_failures: &IntCounter,
  shutdown: ComponentShutdownTriggerHandle,
) -> (RuntimeInfos, Vec<anyhow::Error>) {
  let Some(namespace) = config.namespace() else {
    return (
      RuntimeInfos::new(),
      vec![anyhow::anyhow!(
        "unable to gather runtime info: the extractor namespace is unknown"
      )],
    );
  };
  let extractors = match list_extractor_pods(pods, &namespace).await {
    Ok(extractors) => extractors,
    Err(e) => return (RuntimeInfos::new(), vec![e]),
  };
  let client = match reqwest::Client::builder().timeout(config.timeout).build() {
    Ok(client) => client,
    Err(e) => return (RuntimeInfos::new(), vec![e.into()]),
  };

  let mut workers = JoinSet::new();
  for extractor in extractors {
    let node_name = extractor.node_name.clone();
    let client = client.clone();
    let port = config.port;
    workers.spawn(async move { (node_name, node_runtime_infos(client, extractor, port).await) });
  }

  let mut infos = RuntimeInfos::new();
  let mut errors = Vec::new();
  let mut shutdown = shutdown.make_shutdown();
  loop {
    let joined = tokio::select! {
      joined = workers.join_next() => joined,
      () = shutdown.cancelled() => {
        workers.abort_all();
        errors.push(WorkloadError::Cancelled.into());
        break;
      },
    };
    let Some(joined) = joined else {
      break;
    };
    match joined {
      Ok((_, Ok(node_infos))) => infos.extend(node_infos),
      Ok((node_name, Err(e))) => {
        node_failures.inc();
        log::warn!("unable to gather runtime info from node {node_name}: {e:#}");
        errors.push(e.context(format!("runtime info of node {node_name}")));
      },
      Err(e) => errors.push(anyhow::anyhow!("runtime info worker failed: {e}")),
    }
  }
  (infos, errors)
}

/// Attaches runtime info to every container shape that remembers where it ran.
pub fn merge_into_shapes(workloads: &mut WorkloadPods, infos: &RuntimeInfos) {
  if infos.is_empty() {
    return;
  }
  for container in workloads
    .namespaces
    .values_mut()
    .flat_map(|namespace| namespace.shapes.iter_mut())
    .flat_map(|shape| shape.all_containers_mut())
  {
    if let Some(key) = &container.runtime_key
      && let Some(info) = infos.get(key)
    {
      container.runtime_info = Some(info.clone());
    }
  }
}
