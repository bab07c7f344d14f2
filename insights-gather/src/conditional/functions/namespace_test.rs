// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::super::test::{TestContext, error_messages, record_names, run};
use super::*;
use futures::StreamExt;
use insights_common::k8s::pods::PodPage;
use insights_common::k8s::test::{PodBuilder, make_container};
use insights_common::record::RecordItem;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn logs_of_namespace() {
  let mut context = TestContext::default();
  context
    .pods
    .expect_list_pods()
    .withf(|namespace, _| namespace == "openshift-cluster-samples-operator")
    .returning(|_, _| {
      Ok(PodPage {
        items: vec![
          PodBuilder::new("openshift-cluster-samples-operator", "samples-0")
            .container(make_container("operator", "samples:1", &[], &[]), "")
            .container(make_container("watch", "samples:1", &[], &[]), "")
            .build(),
        ],
        continue_token: None,
      })
    });
  context
    .pods
    .expect_stream_logs()
    .withf(|_, _, request| request.tail_lines == Some(100))
    .returning(|_, _, request| {
      let lines = if request.container == "operator" {
        vec![Ok("started".to_string())]
      } else {
        vec![]
      };
      Ok(futures::stream::iter(lines).boxed())
    });

  let closure = LogsOfNamespace
    .build(
      &context.build(),
      &json!({"namespace": "openshift-cluster-samples-operator", "tail_lines": 100}),
    )
    .unwrap();
  let output = run(&closure).await;
  assert!(output.errors.is_empty());
  assert_eq!(
    vec![
      "conditional/namespaces/openshift-cluster-samples-operator/pods/samples-0/containers/\
       operator/logs/last-100-lines.log"
    ],
    record_names(&output)
  );
}

#[tokio::test]
async fn logs_of_namespace_list_failure() {
  let mut context = TestContext::default();
  context
    .pods
    .expect_list_pods()
    .returning(|_, _| Err(anyhow::anyhow!("forbidden")));

  let closure = LogsOfNamespace
    .build(
      &context.build(),
      &json!({"namespace": "openshift-a", "tail_lines": 1}),
    )
    .unwrap();
  let output = run(&closure).await;
  assert!(output.records.is_empty());
  assert_eq!(vec!["forbidden".to_string()], error_messages(&output));
}

#[test]
fn anonymize() {
  let mut image_stream = json!({
    "metadata": {"name": "ruby", "namespace": "openshift"},
    "spec": {
      "dockerImageRepository": "quay.io/ruby",
      "tags": [{"name": "2.7", "from": {"kind": "DockerImage", "name": "quay.io/ruby:2.7"}}],
    },
    "status": {
      "dockerImageRepository": "registry/ruby",
      "publicDockerImageRepository": "",
      "tags": [{"tag": "2.7", "items": [{"dockerImageReference": "quay.io/ruby@sha256:1"}]}],
    },
  });
  anonymize_image_stream(&mut image_stream);
  assert_eq!(
    json!({
      "metadata": {"name": "ruby", "namespace": "openshift"},
      "spec": {
        "dockerImageRepository": "xxxxxxxxxxxx",
        "tags": [{"name": "2.7", "from": {"kind": "DockerImage", "name": "xxxxxxxxxxxxxxxx"}}],
      },
      "status": {
        "dockerImageRepository": "xxxxxxxxxxxxx",
        "publicDockerImageRepository": "",
        "tags": [{"tag": "2.7", "items": [{"dockerImageReference": "xxxxxxxxxxxxxxxxxxxxx"}]}],
      },
    }),
    image_stream
  );
}

#[tokio::test]
async fn image_streams_of_namespace() {
  let mut context = TestContext::default();
  context
    .images
    .expect_list_image_streams()
    .withf(|namespace| namespace == "openshift-cluster-samples-operator")
    .returning(|_| {
      Ok(vec![json!({
        "metadata": {"name": "ruby"},
        "spec": {"dockerImageRepository": "quay.io/ruby"},
      })])
    });

  let closure = ImageStreamsOfNamespace
    .build(
      &context.build(),
      &json!({"namespace": "openshift-cluster-samples-operator"}),
    )
    .unwrap();
  let output = run(&closure).await;
  assert!(output.errors.is_empty());
  assert_eq!(
    vec!["conditional/namespaces/openshift-cluster-samples-operator/imagestreams/ruby"],
    record_names(&output)
  );
  assert_eq!(
    RecordItem::Json(json!({
      "metadata": {"name": "ruby"},
      "spec": {"dockerImageRepository": "xxxxxxxxxxxx"},
    })),
    output.records[0].item
  );
}
