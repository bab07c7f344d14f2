// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./images_test.rs"]
mod images_test;

use super::shape::image_info;
use super::types::WorkloadImage;
use crate::lru_map::LruMap;
use bd_log::warn_every;
use bd_shutdown::ComponentShutdownTriggerHandle;
use insights_common::k8s::openshift::ImageClient;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use time::ext::NumericalDuration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

//
// ImageCache
//

/// Image metadata kept across gathering cycles. The capacity follows the size of the cluster so
/// that images of deleted workloads eventually expire.
pub struct ImageCache {
  images: LruMap<String, WorkloadImage>,
}

impl ImageCache {
  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self {
      images: LruMap::new(capacity),
    }
  }

  /// Sets the capacity to 1.2 times the number of scanned pods.
  pub fn resize(&self, pod_count: usize) {
    let evicted = self.images.set_capacity(pod_count.saturating_mul(6) / 5);
    if evicted > 0 {
      log::debug!("evicted {evicted} cached images");
    }
  }

  #[must_use]
  pub fn get(&self, image_id: &str) -> Option<WorkloadImage> {
    self.images.get(&image_id.to_string())
  }

  pub fn add(&self, image_id: String, image: WorkloadImage) {
    self.images.insert(image_id, image);
  }

  #[must_use]
  pub fn capacity(&self) -> usize {
    self.images.capacity()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.images.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.images.is_empty()
  }
}

//
// ImageStats
//

#[derive(Clone)]
pub struct ImageStats {
  pub fetch: IntCounter,
  pub cache_hit: IntCounter,
  pub fetch_failure: IntCounter,
}

//
// ImageResults
//

/// Image metadata resolved so far in a cycle. Entries are inserted empty before their fetch so
/// that an ID is only ever fetched once.
#[derive(Clone, Default)]
pub struct ImageResults {
  images: Arc<Mutex<HashMap<String, WorkloadImage>>>,
}

impl ImageResults {
  /// Returns the images resolved with at least one layer.
  #[must_use]
  pub fn resolved(&self) -> BTreeMap<String, WorkloadImage> {
    self
      .images
      .lock()
      .iter()
      .filter(|(_, image)| !image.is_empty())
      .map(|(id, image)| (id.clone(), image.clone()))
      .collect()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.images.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

//
// ImagePipeline
//

/// The background worker resolving image IDs sent by the pod scan.
pub struct ImagePipeline {
  sender: mpsc::Sender<String>,
  results: ImageResults,
  worker: JoinHandle<()>,
}

impl ImagePipeline {
  #[must_use]
  pub fn spawn(
    client: Arc<dyn ImageClient>,
    cache: Arc<ImageCache>,
    capacity: usize,
    stats: ImageStats,
    shutdown: ComponentShutdownTriggerHandle,
  ) -> Self {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let results = ImageResults::default();
    let worker = tokio::spawn(image_worker(
      client,
      cache,
      receiver,
      results.clone(),
      stats,
      shutdown,
    ));
    Self {
      sender,
      results,
      worker,
    }
  }

  #[must_use]
  pub fn sender(&self) -> mpsc::Sender<String> {
    self.sender.clone()
  }

  /// Closes the pipeline and waits up to the deadline for the queued IDs to resolve. Whatever
  /// resolved by then is returned and the worker is stopped. The flag tells whether the wait was
  /// cut short by cancellation.
  pub async fn finish(
    self,
    deadline: Duration,
    shutdown: ComponentShutdownTriggerHandle,
  ) -> (ImageResults, bool) {
    let Self {
      sender,
      results,
      mut worker,
    } = self;
    drop(sender);

    let mut shutdown = shutdown.make_shutdown();
    // The worker also stops on cancellation, so cancellation is checked first.
    let cancelled = tokio::select! {
      biased;
      () = shutdown.cancelled() => {
        worker.abort();
        true
      },
      joined = &mut worker => {
        if let Err(e) = joined {
          log::warn!("image worker failed: {e}");
        }
        false
      },
      () = tokio::time::sleep(deadline) => {
        log::debug!("image metadata not complete after {deadline:?}");
        worker.abort();
        false
      },
    };
    (results, cancelled)
  }
}

async fn image_worker(
  client: Arc<dyn ImageClient>,
  cache: Arc<ImageCache>,
  mut receiver: mpsc::Receiver<String>,
  results: ImageResults,
  stats: ImageStats,
  shutdown: ComponentShutdownTriggerHandle,
) {
  let mut shutdown = shutdown.make_shutdown();
  let mut pending = Vec::new();
  loop {
    let received = tokio::select! {
      received = receiver.recv() => received,
      () = shutdown.cancelled() => return,
    };
    let Some(image_id) = received else {
      return;
    };

    // Batch whatever else is already queued.
    pending.push(image_id);
    while let Ok(image_id) = receiver.try_recv() {
      pending.push(image_id);
    }

    for image_id in pending.drain(..) {
      {
        let mut images = results.images.lock();
        if images.contains_key(&image_id) {
          continue;
        }
        if let Some(image) = cache.get(&image_id) {
          stats.cache_hit.inc();
          images.insert(image_id, image);
          continue;
        }
        images.insert(image_id.clone(), WorkloadImage::default());
      }

      stats.fetch.inc();
      let fetched = tokio::select! {
        fetched = client.get_image(&image_id) => fetched,
        () = shutdown.cancelled() => return,
      };
      match fetched {
        Ok(Some(image)) => {
          let image = image_info(&image);
          cache.add(image_id.clone(), image.clone());
          results.images.lock().insert(image_id, image);
        },
        Ok(None) => log::debug!("no image {image_id}"),
        Err(e) => {
          stats.fetch_failure.inc();
          warn_every!(
            1.minutes(),
            "unable to retrieve image {}: {}",
            image_id,
            e
          );
        },
      }
    }
  }
}
