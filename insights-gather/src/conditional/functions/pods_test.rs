// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::super::test::{TestContext, alert, error_messages, record_names, run};
use super::*;
use crate::conditional::alerts::FiringAlerts;
use futures::StreamExt;
use insights_common::k8s::pods::PodPage;
use insights_common::k8s::test::{PodBuilder, make_container};
use insights_common::record::RecordItem;
use k8s_openapi::api::core::v1::Pod;
use pretty_assertions::assert_eq;
use serde_json::json;

fn etcd_pod(name: &str) -> Pod {
  PodBuilder::new("openshift-etcd", name)
    .container(make_container("etcd", "etcd:1", &[], &[]), "")
    .container(make_container("etcdctl", "etcd:1", &[], &[]), "")
    .build()
}

/// Serves pods by their `metadata.name` field selector, or every pod without one, and returns the
/// container name as its only log line.
fn serve_pods(context: &mut TestContext, pods: Vec<Pod>) {
  context.pods.expect_list_pods().returning(move |_, request| {
    let items = pods
      .iter()
      .filter(|pod| {
        request.field_selector.as_ref().is_none_or(|selector| {
          Some(selector.as_str())
            == pod
              .metadata
              .name
              .as_ref()
              .map(|name| format!("metadata.name={name}"))
              .as_deref()
        })
      })
      .cloned()
      .collect();
    Ok(PodPage {
      items,
      continue_token: None,
    })
  });
  context.pods.expect_stream_logs().returning(|_, _, request| {
    Ok(futures::stream::iter(vec![Ok(request.container)]).boxed())
  });
}

#[tokio::test]
async fn containers_logs_from_alert_labels() {
  let mut context = TestContext {
    firing_alerts: FiringAlerts::from([(
      "KubePodCrashLooping",
      vec![
        alert(&[
          ("alertname", "KubePodCrashLooping"),
          ("namespace", "openshift-etcd"),
          ("pod", "etcd-0"),
          ("container", "etcd"),
        ]),
        alert(&[
          ("alertname", "KubePodCrashLooping"),
          ("namespace", "openshift-etcd"),
          ("pod", "etcd-1"),
          ("container", ""),
        ]),
        alert(&[("alertname", "KubePodCrashLooping"), ("pod", "etcd-2")]),
        alert(&[
          ("alertname", "KubePodCrashLooping"),
          ("namespace", "openshift-other"),
          ("pod", "other-0"),
          ("container", "other"),
        ]),
      ],
    )]),
    ..Default::default()
  };
  serve_pods(&mut context, vec![etcd_pod("etcd-0"), etcd_pod("etcd-1")]);

  let closure = ContainersLogs
    .build(
      &context.build(),
      &json!({
        "alert_name": "KubePodCrashLooping",
        "namespace": "openshift-etcd",
        "tail_lines": 20,
        "previous": true,
      }),
    )
    .unwrap();
  let output = run(&closure).await;
  assert_eq!(
    vec![
      "conditional/namespaces/openshift-etcd/pods/etcd-0/containers/etcd/logs-previous/last-20-\
       lines.log"
    ],
    record_names(&output)
  );
  assert_eq!(
    vec![
      "alert is missing 'container' label".to_string(),
      "alert is missing 'namespace' label".to_string(),
    ],
    error_messages(&output)
  );
}

#[tokio::test]
async fn containers_logs_param_overrides() {
  let mut context = TestContext {
    firing_alerts: FiringAlerts::from([(
      "KubePodCrashLooping",
      vec![alert(&[
        ("alertname", "KubePodCrashLooping"),
        ("namespace", "openshift-etcd"),
      ])],
    )]),
    ..Default::default()
  };
  serve_pods(&mut context, vec![etcd_pod("etcd-0"), etcd_pod("etcd-1")]);

  let closure = ContainersLogs
    .build(
      &context.build(),
      &json!({
        "alert_name": "KubePodCrashLooping",
        "container": "etcdctl",
        "pod_name": "etcd-1",
        "tail_lines": 5,
      }),
    )
    .unwrap();
  let output = run(&closure).await;
  assert!(output.errors.is_empty());
  assert_eq!(
    vec!["conditional/namespaces/openshift-etcd/pods/etcd-1/containers/etcdctl/logs/last-5-lines.log"],
    record_names(&output)
  );
}

#[tokio::test]
async fn containers_logs_not_firing() {
  let closure = ContainersLogs
    .build(
      &TestContext::default().build(),
      &json!({"alert_name": "KubePodCrashLooping", "tail_lines": 5}),
    )
    .unwrap();
  assert_eq!(
    vec![
      "conditional gather triggered, but specified alert \"KubePodCrashLooping\" is not firing"
        .to_string()
    ],
    error_messages(&run(&closure).await)
  );
}

#[tokio::test]
async fn pod_definition() {
  let mut context = TestContext {
    firing_alerts: FiringAlerts::from([(
      "KubePodNotReady",
      vec![
        alert(&[("namespace", "openshift-etcd"), ("pod", "etcd-0")]),
        alert(&[("namespace", "openshift-etcd"), ("pod", "etcd-9")]),
        alert(&[("namespace", "openshift-etcd")]),
      ],
    )]),
    ..Default::default()
  };
  context.pods.expect_get_pod().returning(|_, name| {
    Ok((name == "etcd-0").then(|| PodBuilder::new("openshift-etcd", "etcd-0").build()))
  });

  let closure = PodDefinition
    .build(&context.build(), &json!({"alert_name": "KubePodNotReady"}))
    .unwrap();
  let output = run(&closure).await;
  assert_eq!(
    vec!["conditional/namespaces/openshift-etcd/pods/etcd-0/etcd-0"],
    record_names(&output)
  );
  let RecordItem::Json(pod) = &output.records[0].item else {
    panic!("expected a json record");
  };
  assert_eq!(json!("etcd-0"), pod["metadata"]["name"]);
  assert_eq!(
    vec![
      "pod etcd-9 not found in openshift-etcd namespace".to_string(),
      "alert is missing 'pod' label".to_string(),
    ],
    error_messages(&output)
  );
}

#[tokio::test]
async fn logs_of_unhealthy_pods_without_container_label() {
  let mut context = TestContext {
    firing_alerts: FiringAlerts::from([(
      "KubePodNotReady",
      vec![alert(&[
        ("namespace", "openshift-etcd"),
        ("pod", "etcd-0"),
        ("container", ""),
      ])],
    )]),
    ..Default::default()
  };
  serve_pods(&mut context, vec![etcd_pod("etcd-0"), etcd_pod("etcd-1")]);

  let closure = LogsOfUnhealthyPods
    .build(
      &context.build(),
      &json!({"alert_name": "KubePodNotReady", "tail_lines": 100}),
    )
    .unwrap();
  let output = run(&closure).await;
  assert!(output.errors.is_empty());
  assert_eq!(
    vec![
      "conditional/namespaces/openshift-etcd/pods/etcd-0/containers/etcd/logs/last-100-lines.log",
      "conditional/namespaces/openshift-etcd/pods/etcd-0/containers/etcdctl/logs/last-100-lines.\
       log",
    ],
    record_names(&output)
  );
}

#[tokio::test]
async fn logs_of_unhealthy_pods_by_alerts() {
  let mut context = TestContext {
    firing_alerts: FiringAlerts::from([
      (
        "KubePodNotReady",
        vec![alert(&[
          ("namespace", "openshift-etcd"),
          ("pod", "etcd-0"),
          ("container", "etcd"),
        ])],
      ),
      (
        "KubePodCrashLooping",
        vec![alert(&[
          ("namespace", "openshift-etcd"),
          ("pod", "etcd-1"),
          ("container", "etcd"),
        ])],
      ),
    ]),
    ..Default::default()
  };
  serve_pods(&mut context, vec![etcd_pod("etcd-0"), etcd_pod("etcd-1")]);

  let closure = LogsOfUnhealthyPodsByAlerts
    .build(
      &context.build(),
      &json!({
        "alerts_current": ["KubePodNotReady", "NotFiring"],
        "alerts_previous": ["KubePodCrashLooping"],
        "tail_lines_current": 100,
        "tail_lines_previous": 20,
      }),
    )
    .unwrap();
  let output = run(&closure).await;
  assert!(output.errors.is_empty());
  assert_eq!(
    vec![
      "conditional/namespaces/openshift-etcd/pods/etcd-0/containers/etcd/logs/last-100-lines.log",
      "conditional/namespaces/openshift-etcd/pods/etcd-1/containers/etcd/logs-previous/last-20-\
       lines.log",
    ],
    record_names(&output)
  );
}

#[tokio::test]
async fn alertmanager_logs() {
  let mut context = TestContext {
    firing_alerts: FiringAlerts::from([(
      "AlertmanagerFailedToSendAlerts",
      vec![alert(&[
        ("namespace", "openshift-monitoring"),
        ("pod", "alertmanager-main-0"),
      ])],
    )]),
    ..Default::default()
  };
  serve_pods(
    &mut context,
    vec![
      PodBuilder::new("openshift-monitoring", "alertmanager-main-0")
        .container(make_container("alertmanager", "am:1", &[], &[]), "")
        .container(make_container("config-reloader", "am:1", &[], &[]), "")
        .build(),
    ],
  );

  let closure = AlertmanagerLogs
    .build(
      &context.build(),
      &json!({"alert_name": "AlertmanagerFailedToSendAlerts", "tail_lines": 50}),
    )
    .unwrap();
  let output = run(&closure).await;
  assert!(output.errors.is_empty());
  assert_eq!(
    vec![
      "conditional/namespaces/openshift-monitoring/pods/alertmanager-main-0/containers/logs/\
       alertmanager-alertmanagerfailedtosendalerts.log"
    ],
    record_names(&output)
  );
  assert_eq!(
    RecordItem::Raw(b"alertmanager".to_vec()),
    output.records[0].item
  );
}
