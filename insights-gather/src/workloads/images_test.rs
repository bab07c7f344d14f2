// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use anyhow::anyhow;
use bd_server_stats::stats::Collector;
use bd_shutdown::ComponentShutdownTrigger;
use insights_common::k8s::openshift::MockImageClient;
use pretty_assertions::assert_eq;
use serde_json::json;

fn stats() -> ImageStats {
  let scope = Collector::default().scope("test");
  ImageStats {
    fetch: scope.counter("fetch"),
    cache_hit: scope.counter("cache_hit"),
    fetch_failure: scope.counter("fetch_failure"),
  }
}

fn image(layers: &[&str]) -> WorkloadImage {
  WorkloadImage {
    layer_ids: layers.iter().map(ToString::to_string).collect(),
    ..Default::default()
  }
}

#[test]
fn cache_resize() {
  let cache = ImageCache::new(500);
  for i in 0 .. 20 {
    cache.add(format!("sha256:{i}"), image(&["l"]));
  }
  assert_eq!(20, cache.len());

  cache.resize(10);
  assert_eq!(12, cache.capacity());
  assert_eq!(12, cache.len());
  assert!(cache.get("sha256:0").is_none());
  assert!(cache.get("sha256:19").is_some());

  cache.resize(3);
  assert_eq!(3, cache.capacity());
  assert_eq!(3, cache.len());
}

#[tokio::test]
async fn resolves_queued_images() {
  let mut client = MockImageClient::new();
  client
    .expect_get_image()
    .withf(|id| id == "sha256:found")
    .times(1)
    .returning(|_| {
      Ok(Some(json!({
        "dockerImageLayers": [{"name": "sha256:l1"}, {"name": "sha256:l2"}],
      })))
    });
  client
    .expect_get_image()
    .withf(|id| id == "sha256:missing")
    .times(1)
    .returning(|_| Ok(None));
  client
    .expect_get_image()
    .withf(|id| id == "sha256:broken")
    .times(1)
    .returning(|_| Err(anyhow!("internal error")));

  let cache = Arc::new(ImageCache::new(10));
  cache.add("sha256:cached".to_string(), image(&["sha256:c1"]));
  let stats = stats();
  let trigger = ComponentShutdownTrigger::default();
  let pipeline = ImagePipeline::spawn(
    Arc::new(client),
    cache.clone(),
    10,
    stats.clone(),
    trigger.make_handle(),
  );

  let sender = pipeline.sender();
  for id in [
    "sha256:found",
    "sha256:missing",
    "sha256:found",
    "sha256:cached",
    "sha256:broken",
  ] {
    sender.send(id.to_string()).await.unwrap();
  }
  drop(sender);

  let (results, cancelled) = pipeline
    .finish(Duration::from_secs(15), trigger.make_handle())
    .await;
  assert!(!cancelled);
  assert_eq!(4, results.len());
  assert_eq!(
    BTreeMap::from([
      ("sha256:cached".to_string(), image(&["sha256:c1"])),
      (
        "sha256:found".to_string(),
        image(&["sha256:l1", "sha256:l2"])
      ),
    ]),
    results.resolved()
  );
  assert_eq!(Some(image(&["sha256:l1", "sha256:l2"])), cache.get("sha256:found"));
  assert_eq!(3, stats.fetch.get());
  assert_eq!(1, stats.cache_hit.get());
  assert_eq!(1, stats.fetch_failure.get());
}

#[tokio::test(start_paused = true)]
async fn deadline_keeps_partial_results() {
  let mut client = MockImageClient::new();
  client
    .expect_get_image()
    .returning(|_| Ok(Some(json!({"dockerImageLayers": [{"name": "sha256:l1"}]}))));

  struct Stalled(MockImageClient);

  #[async_trait::async_trait]
  impl ImageClient for Stalled {
    async fn get_image(&self, id: &str) -> anyhow::Result<Option<serde_json::Value>> {
      if id == "sha256:slow" {
        futures::future::pending::<()>().await;
      }
      self.0.get_image(id).await
    }

    async fn list_image_streams(&self, namespace: &str) -> anyhow::Result<Vec<serde_json::Value>> {
      self.0.list_image_streams(namespace).await
    }
  }

  let trigger = ComponentShutdownTrigger::default();
  let pipeline = ImagePipeline::spawn(
    Arc::new(Stalled(client)),
    Arc::new(ImageCache::new(10)),
    10,
    stats(),
    trigger.make_handle(),
  );
  let sender = pipeline.sender();
  sender.send("sha256:fast".to_string()).await.unwrap();
  sender.send("sha256:slow".to_string()).await.unwrap();
  sender.send("sha256:never".to_string()).await.unwrap();
  drop(sender);

  let start = tokio::time::Instant::now();
  let (results, cancelled) = pipeline
    .finish(Duration::from_secs(15), trigger.make_handle())
    .await;
  assert!(!cancelled);
  assert!(start.elapsed() >= Duration::from_secs(15));
  assert_eq!(
    vec!["sha256:fast"],
    results.resolved().keys().collect::<Vec<_>>()
  );
}

#[tokio::test]
async fn cancellation_stops_waiting() {
  let mut client = MockImageClient::new();
  client.expect_get_image().never();

  let trigger = ComponentShutdownTrigger::default();
  let pipeline = ImagePipeline::spawn(
    Arc::new(client),
    Arc::new(ImageCache::new(10)),
    10,
    stats(),
    trigger.make_handle(),
  );
  let finish = tokio::spawn(pipeline.finish(Duration::from_secs(3600), trigger.make_handle()));
  trigger.shutdown().await;

  let (results, cancelled) = finish.await.unwrap();
  assert!(cancelled);
  assert!(results.is_empty());
}
