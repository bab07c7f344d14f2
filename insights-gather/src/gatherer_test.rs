// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use anyhow::anyhow;
use bd_shutdown::ComponentShutdownTrigger;
use pretty_assertions::assert_eq;

#[test]
fn merge_keeps_records_and_errors() {
  let mut output = GatherOutput::new(vec![Record::raw("a", b"1".to_vec())], vec![]);
  output.merge(GatherOutput::from_error(anyhow!("failed")));
  output.merge(GatherOutput::new(vec![Record::raw("b", b"2".to_vec())], vec![]));

  assert_eq!(
    vec!["a", "b"],
    output
      .records
      .iter()
      .map(|record| record.name.as_str())
      .collect::<Vec<_>>()
  );
  assert_eq!(1, output.errors.len());
}

#[tokio::test]
async fn closure_can_run_repeatedly() {
  let closure = GatheringClosure::new(|_| async {
    GatherOutput::new(vec![Record::raw("conditional/x", vec![])], vec![])
  });
  let trigger = ComponentShutdownTrigger::default();

  for _ in 0 .. 2 {
    let output = closure.run(trigger.make_handle()).await;
    assert_eq!(1, output.records.len());
  }
}

#[tokio::test]
async fn cancellation_discards_the_gathering() {
  let trigger = ComponentShutdownTrigger::default();
  let gather = tokio::spawn(until_cancelled(trigger.make_handle(), async {
    futures::future::pending::<()>().await;
    GatherOutput::default()
  }));
  trigger.shutdown().await;

  let output = gather.await.unwrap();
  assert!(output.records.is_empty());
  assert_eq!(
    vec!["gathering was cancelled".to_string()],
    output
      .errors
      .iter()
      .map(ToString::to_string)
      .collect::<Vec<_>>()
  );
}

#[tokio::test]
async fn completed_gathering_is_returned() {
  let trigger = ComponentShutdownTrigger::default();
  let output = until_cancelled(trigger.make_handle(), async {
    GatherOutput::from_error(GatherError::NotFiring("KubePodCrashLooping".to_string()).into())
  })
  .await;
  assert_eq!(
    "conditional gather triggered, but specified alert \"KubePodCrashLooping\" is not firing",
    output.errors[0].to_string()
  );
}
