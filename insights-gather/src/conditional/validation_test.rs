// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;
use serde_json::json;

fn validate_with_logs(rules: Value, container_logs: Value) -> Vec<String> {
  validate_configuration(
    &RawConfiguration {
      version: String::new(),
      rules,
      container_logs,
    },
    &Registry::with_defaults(),
  )
  .iter()
  .map(ToString::to_string)
  .collect()
}

fn validate(rules: Value) -> Vec<String> {
  validate_with_logs(rules, json!([]))
}

fn samples_rule(function: &str, params: Value) -> Value {
  json!({
    "conditions": [
      {"type": "alert_is_firing", "params": {"name": "SamplesImagestreamImportFailing"}}
    ],
    "gathering_functions": {function: params},
  })
}

#[test]
fn embedded_rules_are_valid() {
  let errors = validate_configuration(&RawConfiguration::embedded(), &Registry::with_defaults());
  assert_eq!(Vec::<ValidationError>::new(), errors);
  assert!(
    RawConfiguration::embedded()
      .rules
      .as_array()
      .is_some_and(|rules| !rules.is_empty())
  );
}

#[test]
fn namespace_pattern() {
  assert_eq!(
    vec![
      "0.gathering_functions.logs_of_namespace.namespace: Does not match pattern \
       '^openshift-[A-Za-z0-9_.-]{1,128}$'"
    ],
    validate(json!([samples_rule(
      "logs_of_namespace",
      json!({"namespace": "not-openshift-foo", "tail_lines": 100})
    )]))
  );
}

#[test]
fn empty_rules() {
  assert_eq!(
    vec!["(root): there are no conditional rules"],
    validate(json!([]))
  );
  assert_eq!(
    vec!["(root): Invalid type. Expected: array, given: object"],
    validate(json!({}))
  );
}

#[test]
fn integer_bounds_and_types() {
  assert_eq!(
    vec!["0.gathering_functions.logs_of_namespace.tail_lines: Must be less than or equal to 4096"],
    validate(json!([samples_rule(
      "logs_of_namespace",
      json!({"namespace": "openshift-a", "tail_lines": 4097})
    )]))
  );
  assert_eq!(
    vec!["0.gathering_functions.logs_of_namespace.tail_lines: Must be greater than or equal to 1"],
    validate(json!([samples_rule(
      "logs_of_namespace",
      json!({"namespace": "openshift-a", "tail_lines": 0})
    )]))
  );
  assert_eq!(
    vec![
      "0.gathering_functions.logs_of_namespace.tail_lines: Invalid type. Expected: integer, \
       given: string"
    ],
    validate(json!([samples_rule(
      "logs_of_namespace",
      json!({"namespace": "openshift-a", "tail_lines": "100"})
    )]))
  );
}

#[test]
fn missing_and_unknown_params() {
  assert_eq!(
    vec![
      "0.gathering_functions.logs_of_namespace: tail_lines is required",
      "0.gathering_functions.logs_of_namespace: Additional property lines is not allowed",
    ],
    validate(json!([samples_rule(
      "logs_of_namespace",
      json!({"namespace": "openshift-a", "lines": 100})
    )]))
  );
}

#[test]
fn unknown_function() {
  assert_eq!(
    vec!["0.gathering_functions: Additional property logs_of_everything is not allowed"],
    validate(json!([samples_rule("logs_of_everything", json!({}))]))
  );
}

#[test]
fn gathering_functions_required() {
  assert_eq!(
    vec![
      "0: gathering_functions is required",
      "1.gathering_functions: Must have at least 1 properties",
      "2: Additional property extra is not allowed",
    ],
    validate(json!([
      {"conditions": []},
      {"gathering_functions": {}},
      {
        "gathering_functions": {"image_streams_of_namespace": {"namespace": "openshift-a"}},
        "extra": true,
      },
    ]))
  );
}

#[test]
fn conditions() {
  let rule = json!({
    "conditions": [
      {"type": "alert_is_burning", "params": {"name": "A"}},
      {"type": "alert_is_firing", "params": {"name": "not-valid"}},
      {"type": "cluster_version_matches", "params": {"version": ""}},
      {"type": "alert_is_firing"},
    ],
    "gathering_functions": {"image_streams_of_namespace": {"namespace": "openshift-a"}},
  });
  assert_eq!(
    vec![
      "0.conditions.0.type: 0.conditions.0.type must be one of the following: \
       \"alert_is_firing\", \"cluster_version_matches\"",
      "0.conditions.1.params.name: Does not match pattern '^[A-Za-z0-9]{1,128}$'",
      "0.conditions.2.params.version: String length must be greater than or equal to 1",
      "0.conditions.3: params is required",
    ],
    validate(json!([rule]))
  );
}

#[test]
fn uniqueness_and_limits() {
  let rule = samples_rule(
    "image_streams_of_namespace",
    json!({"namespace": "openshift-a"}),
  );
  assert_eq!(
    vec!["(root): array items[0,1] must be unique"],
    validate(json!([rule, rule]))
  );

  let rules: Vec<Value> = (0 .. 65)
    .map(|i| {
      samples_rule(
        "image_streams_of_namespace",
        json!({"namespace": format!("openshift-{i}")}),
      )
    })
    .collect();
  assert_eq!(
    vec!["(root): Array must have at most 64 items"],
    validate(Value::Array(rules))
  );

  let conditions: Vec<Value> = (0 .. 9)
    .map(|i| json!({"type": "alert_is_firing", "params": {"name": format!("Alert{i}")}}))
    .collect();
  assert_eq!(
    vec!["0.conditions: Array must have at most 8 items"],
    validate(json!([{
      "conditions": conditions,
      "gathering_functions": {"image_streams_of_namespace": {"namespace": "openshift-a"}},
    }]))
  );
}

#[test]
fn string_arrays() {
  assert_eq!(
    vec![
      "0.gathering_functions.logs_of_unhealthy_pods_by_alerts.alerts_current: array items[0,1] \
       must be unique",
      "0.gathering_functions.logs_of_unhealthy_pods_by_alerts.alerts_previous.0: Invalid type. \
       Expected: string, given: integer",
    ],
    validate(json!([samples_rule(
      "logs_of_unhealthy_pods_by_alerts",
      json!({
        "alerts_current": ["KubePodNotReady", "KubePodNotReady"],
        "alerts_previous": [1],
        "tail_lines_current": 100,
        "tail_lines_previous": 20,
      })
    )]))
  );
}

#[test]
fn container_logs_requests() {
  let rules = json!([samples_rule(
    "image_streams_of_namespace",
    json!({"namespace": "openshift-a"})
  )]);
  assert!(
    validate_with_logs(
      rules.clone(),
      json!([{
        "namespace": "openshift-kube-apiserver",
        "pod_name_regex": "^kube-apiserver-",
        "messages": ["timeout"],
      }])
    )
    .is_empty()
  );

  let errors = validate_with_logs(
    rules,
    json!([
      {"namespace": "kube-system", "pod_name_regex": "^a", "messages": ["x"]},
      {"namespace": "openshift-a", "pod_name_regex": "^a", "messages": []},
      {"namespace": "openshift-a", "pod_name_regex": "(", "messages": ["x"], "previous": true},
    ]),
  );
  assert_eq!(3, errors.len(), "{errors:?}");
  assert_eq!(
    "container_logs.0.namespace: Does not match pattern '^openshift-[A-Za-z0-9_.-]{1,128}$'",
    errors[0]
  );
  assert_eq!(
    "container_logs.1.messages: Array must have at least 1 items",
    errors[1]
  );
  assert!(
    errors[2].starts_with("container_logs.2.pod_name_regex: invalid regex:"),
    "{}",
    errors[2]
  );
}

#[test]
fn aggregated_display() {
  let errors = ValidationErrors(vec![
    ValidationError::new("", "there are no conditional rules"),
    ValidationError::new("container_logs", "Invalid type. Expected: array, given: null"),
  ]);
  assert_eq!(
    "conditional gathering rules are invalid: (root): there are no conditional rules; \
     container_logs: Invalid type. Expected: array, given: null",
    errors.to_string()
  );
}
