// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod images;
pub mod runtime;
pub mod scan;
pub mod shape;
pub mod types;

use crate::config::WorkloadsConfig;
use crate::gatherer::{GatherOutput, GatheringClosure};
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdownTriggerHandle;
use images::{ImageCache, ImagePipeline, ImageStats};
use insights_common::k8s::openshift::ImageClient;
use insights_common::k8s::pods::PodClient;
use insights_common::record::Record;
use prometheus::IntCounter;
use scan::{PodScan, ScanStats, scan_pods};
use std::sync::Arc;
use std::time::Duration;

pub const WORKLOAD_INFO_RECORD_NAME: &str = "config/workload_info";
pub const WORKLOAD_INFO_CLOSURE_NAME: &str = "workload_info";

//
// WorkloadError
//

#[derive(thiserror::Error, Debug)]
pub enum WorkloadError {
  #[error("the {0} limit for number of pods gathered was reached")]
  PodCap(usize),
  #[error("gathering was cancelled")]
  Cancelled,
  #[error("no running pods found for the insights-runtime-extractor")]
  NoExtractorPods,
}

//
// Stats
//

struct Stats {
  scan: ScanStats,
  images: ImageStats,
  runtime_node_failure: IntCounter,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    Self {
      scan: ScanStats {
        pods_scanned: scope.counter("pods_scanned"),
        pod_cap_reached: scope.counter("pod_cap_reached"),
      },
      images: ImageStats {
        fetch: scope.counter("image_fetch"),
        cache_hit: scope.counter("image_cache_hit"),
        fetch_failure: scope.counter("image_fetch_failure"),
      },
      runtime_node_failure: scope.counter("runtime_node_failure"),
    }
  }
}

/// How long to wait for image metadata once the scan is done: a tenth of a second per pod, but no
/// less than the configured floor.
#[must_use]
pub fn image_wait(pod_count: usize, floor: Duration) -> Duration {
  floor.max(Duration::from_secs((pod_count / 10) as u64))
}

//
// WorkloadGatherer
//

/// Summarizes every pod of the cluster into anonymized workload shapes with their image layers and
/// optional runtime data. The image cache lives as long as the gatherer and spans cycles.
pub struct WorkloadGatherer {
  pods: Arc<dyn PodClient>,
  images: Arc<dyn ImageClient>,
  cache: Arc<ImageCache>,
  config: WorkloadsConfig,
  stats: Stats,
}

impl WorkloadGatherer {
  #[must_use]
  pub fn new(
    pods: Arc<dyn PodClient>,
    images: Arc<dyn ImageClient>,
    config: WorkloadsConfig,
    scope: &Scope,
  ) -> Self {
    let cache = Arc::new(ImageCache::new(config.pod_cap));
    Self {
      pods,
      images,
      cache,
      config,
      stats: Stats::new(&scope.scope("workloads")),
    }
  }

  #[must_use]
  pub fn image_cache(&self) -> &ImageCache {
    &self.cache
  }

  /// Wraps the gatherer into the `workload_info` gather closure.
  #[must_use]
  pub fn closure(self: &Arc<Self>) -> GatheringClosure {
    let gatherer = self.clone();
    GatheringClosure::new(move |shutdown| {
      let gatherer = gatherer.clone();
      async move { gatherer.gather(shutdown).await }
    })
  }

  pub async fn gather(&self, shutdown: ComponentShutdownTriggerHandle) -> GatherOutput {
    let page_size = self.config.page_size;
    let pipeline = ImagePipeline::spawn(
      self.images.clone(),
      self.cache.clone(),
      page_size as usize,
      self.stats.images.clone(),
      shutdown.clone(),
    );
    let sender = pipeline.sender();
    let scanned = scan_pods(
      self.pods.as_ref(),
      page_size,
      self.config.pod_cap,
      &sender,
      &self.stats.scan,
      shutdown.clone(),
    )
    .await;
    drop(sender);

    let PodScan {
      mut workloads,
      mut errors,
    } = match scanned {
      Ok(scanned) => scanned,
      Err(e) => {
        let _ = pipeline.finish(Duration::ZERO, shutdown).await;
        return GatherOutput::from_error(e);
      },
    };
    let mut cancelled = errors
      .iter()
      .any(|e| matches!(e.downcast_ref(), Some(WorkloadError::Cancelled)));

    self.cache.resize(workloads.pod_count);
    let deadline = image_wait(workloads.pod_count, self.config.image_wait_floor);
    let (images, images_cancelled) = pipeline.finish(deadline, shutdown.clone()).await;
    workloads.images = images.resolved();
    log::debug!(
      "resolved {} of {} images",
      workloads.images.len(),
      workloads.image_count
    );
    if images_cancelled && !cancelled {
      errors.push(WorkloadError::Cancelled.into());
      cancelled = true;
    }

    if self.config.runtime_extractor.enabled && !cancelled {
      let (infos, runtime_errors) = runtime::gather_runtime_infos(
        self.pods.as_ref(),
        &self.config.runtime_extractor,
        &self.stats.runtime_node_failure,
        shutdown,
      )
      .await;
      runtime::merge_into_shapes(&mut workloads, &infos);
      errors.extend(runtime_errors);
    }

    match Record::json(WORKLOAD_INFO_RECORD_NAME, &workloads) {
      Ok(record) => GatherOutput::new(vec![record], errors),
      Err(e) => {
        errors.push(e);
        GatherOutput::new(vec![], errors)
      },
    }
  }
}
