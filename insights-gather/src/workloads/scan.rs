// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./scan_test.rs"]
mod scan_test;

use super::WorkloadError;
use super::shape::{PodClass, classify_pod};
use super::types::{NamespacePods, PodShape, WorkloadPods};
use bd_shutdown::{ComponentShutdown, ComponentShutdownTriggerHandle};
use insights_common::anonymize::hash_string;
use insights_common::k8s::object_namespace;
use insights_common::k8s::pods::{ListPodsRequest, PodClient};
use k8s_openapi::api::core::v1::Pod;
use prometheus::IntCounter;
use std::collections::HashSet;
use tokio::sync::mpsc;

//
// ScanStats
//

#[derive(Clone)]
pub struct ScanStats {
  pub pods_scanned: IntCounter,
  pub pod_cap_reached: IntCounter,
}

//
// PodScan
//

/// The result of a pod scan. Images are not resolved yet, `image_count` is the number of distinct
/// image IDs referenced by the shapes.
#[derive(Debug, Default)]
pub struct PodScan {
  pub workloads: WorkloadPods,
  pub errors: Vec<anyhow::Error>,
}

/// The namespace currently being scanned. Pods are listed in namespace order so a bucket is sealed
/// as soon as the namespace changes.
#[derive(Default)]
struct Bucket {
  namespace: String,
  pods: NamespacePods,
}

enum Added {
  Counted,
  CapReached,
  Cancelled,
}

struct Scanner<'a> {
  pod_cap: usize,
  images: &'a mpsc::Sender<String>,
  stats: &'a ScanStats,
  workloads: WorkloadPods,
  bucket: Bucket,
  observed_images: HashSet<String>,
}

impl Scanner<'_> {
  fn seal(&mut self) {
    let bucket = std::mem::take(&mut self.bucket);
    if bucket.pods.count == 0 {
      return;
    }
    self.workloads.pod_count += bucket.pods.count;
    let sealed = self
      .workloads
      .namespaces
      .entry(hash_string(&bucket.namespace))
      .or_default();
    sealed.count += bucket.pods.count;
    sealed.terminal_count += bucket.pods.terminal_count;
    sealed.ignored_count += bucket.pods.ignored_count;
    sealed.invalid_count += bucket.pods.invalid_count;
    sealed.shapes.extend(bucket.pods.shapes);
  }

  /// Accounts for one pod unless the pod cap is reached.
  async fn add(&mut self, pod: &Pod, shutdown: &mut ComponentShutdown) -> Added {
    let namespace = object_namespace(&pod.metadata);
    if namespace != self.bucket.namespace {
      self.seal();
      self.bucket.namespace = namespace.to_string();
    }
    if self.workloads.pod_count + self.bucket.pods.count >= self.pod_cap {
      return Added::CapReached;
    }
    self.bucket.pods.count += 1;
    self.stats.pods_scanned.inc();

    match classify_pod(pod) {
      PodClass::Terminal => self.bucket.pods.terminal_count += 1,
      PodClass::Ignored => self.bucket.pods.ignored_count += 1,
      PodClass::Invalid => self.bucket.pods.invalid_count += 1,
      PodClass::Shape(shape) => return self.add_shape(shape, shutdown).await,
    }
    Added::Counted
  }

  async fn add_shape(&mut self, shape: PodShape, shutdown: &mut ComponentShutdown) -> Added {
    // Pods of the same workload tend to be listed next to each other.
    if let Some(existing) = self
      .bucket
      .pods
      .shapes
      .iter_mut()
      .rev()
      .find(|existing| existing.same_shape(&shape))
    {
      existing.duplicates += 1;
      return Added::Counted;
    }

    let new_images: Vec<_> = shape
      .all_containers()
      .filter(|container| self.observed_images.insert(container.image_id.clone()))
      .map(|container| container.image_id.clone())
      .collect();
    self.bucket.pods.shapes.push(shape);

    for image_id in new_images {
      tokio::select! {
        biased;
        () = shutdown.cancelled() => return Added::Cancelled,
        sent = self.images.send(image_id) => {
          if sent.is_err() {
            log::debug!("image pipeline closed before the scan completed");
          }
        },
      }
    }
    Added::Counted
  }
}

/// Lists every pod of the cluster page by page and summarizes them into hashed namespace buckets of
/// deduplicated shapes. Image IDs of new shapes are sent once each on `images`.
///
/// Failing to list the first page fails the scan. Later failures, the pod cap and cancellation stop
/// the scan and keep what was summarized so far.
pub async fn scan_pods(
  client: &dyn PodClient,
  page_size: u32,
  pod_cap: usize,
  images: &mpsc::Sender<String>,
  stats: &ScanStats,
  shutdown: ComponentShutdownTriggerHandle,
) -> anyhow::Result<PodScan> {
  let mut shutdown = shutdown.make_shutdown();
  let mut scanner = Scanner {
    pod_cap,
    images,
    stats,
    workloads: WorkloadPods::default(),
    bucket: Bucket::default(),
    observed_images: HashSet::new(),
  };
  let mut errors = Vec::new();
  let mut continue_token = None;
  let mut first_page = true;

  loop {
    let request = ListPodsRequest {
      limit: Some(page_size),
      continue_token: continue_token.take(),
      ..Default::default()
    };
    let listed = tokio::select! {
      biased;
      () = shutdown.cancelled() => {
        errors.push(WorkloadError::Cancelled.into());
        break;
      },
      listed = client.list_pods("", request) => listed,
    };
    let page = match listed {
      Ok(page) => page,
      Err(e) if first_page => return Err(e.context("unable to list pods")),
      Err(e) => {
        errors.push(e.context("unable to list the next page of pods"));
        break;
      },
    };
    first_page = false;

    let mut stopped = Added::Counted;
    for pod in &page.items {
      stopped = scanner.add(pod, &mut shutdown).await;
      if !matches!(stopped, Added::Counted) {
        break;
      }
    }
    match stopped {
      Added::Counted => {},
      Added::CapReached => {
        stats.pod_cap_reached.inc();
        log::info!("stopping the pod scan at {pod_cap} pods");
        errors.push(WorkloadError::PodCap(pod_cap).into());
        break;
      },
      Added::Cancelled => {
        errors.push(WorkloadError::Cancelled.into());
        break;
      },
    }

    match page.continue_token {
      Some(token) if !token.is_empty() => continue_token = Some(token),
      _ => break,
    }
  }

  scanner.seal();
  let mut workloads = scanner.workloads;
  workloads.image_count = scanner.observed_images.len();
  log::debug!(
    "scanned {} pods in {} namespaces referencing {} images",
    workloads.pod_count,
    workloads.namespaces.len(),
    workloads.image_count
  );
  Ok(PodScan { workloads, errors })
}

