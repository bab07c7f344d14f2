// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The rules compiled into the binary, used until a remote configuration has been loaded.
pub const EMBEDDED_RULES: &str = include_str!("./default_rules.json");

//
// Condition
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertIsFiringParams {
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterVersionMatchesParams {
  pub version: String,
}

/// A rule predicate. The params shape is determined by the type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum Condition {
  AlertIsFiring(AlertIsFiringParams),
  ClusterVersionMatches(ClusterVersionMatchesParams),
}

//
// GatheringRule
//

/// A set of conditions plus the gather functions to run when all of them hold. Function params
/// stay in their JSON form until the function's builder parses them into its own params type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatheringRule {
  #[serde(default)]
  pub conditions: Vec<Condition>,
  pub gathering_functions: BTreeMap<String, Value>,
}

//
// RawLogRequest
//

/// A request to collect the lines matching any of the messages from the containers of the pods
/// whose name matches the regex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLogRequest {
  pub namespace: String,
  pub pod_name_regex: String,
  pub messages: Vec<String>,
  #[serde(default)]
  pub previous: bool,
}

//
// RawConfiguration
//

/// A configuration as received, before validation. Rules are kept as JSON so that validation can
/// report every offending field by path.
#[derive(Debug, Clone, PartialEq)]
pub struct RawConfiguration {
  pub version: String,
  pub rules: Value,
  pub container_logs: Value,
}

impl RawConfiguration {
  /// Parses either the remote configuration document or a bare array of rules.
  pub fn parse(json: &str) -> anyhow::Result<Self> {
    match serde_json::from_str::<Value>(json)? {
      rules @ Value::Array(_) => Ok(Self {
        version: String::new(),
        rules,
        container_logs: Value::Array(vec![]),
      }),
      Value::Object(mut object) => Ok(Self {
        version: object
          .get("version")
          .and_then(Value::as_str)
          .unwrap_or_default()
          .to_string(),
        rules: object
          .remove("conditional_gathering_rules")
          .unwrap_or(Value::Array(vec![])),
        container_logs: object
          .remove("container_logs")
          .unwrap_or(Value::Array(vec![])),
      }),
      other => bail!("unexpected conditional gathering configuration: {other}"),
    }
  }

  #[must_use]
  pub fn embedded() -> Self {
    // The embedded document is checked by tests, fall back to an empty configuration regardless.
    Self::parse(EMBEDDED_RULES).unwrap_or_else(|_| Self {
      version: String::new(),
      rules: Value::Array(vec![]),
      container_logs: Value::Array(vec![]),
    })
  }
}

//
// Configuration
//

/// A validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
  pub version: String,
  pub rules: Vec<GatheringRule>,
  pub container_logs: Vec<RawLogRequest>,
}

impl Configuration {
  /// Converts a raw configuration into typed rules. Callers validate first so that failures here
  /// only happen if validation and the types disagree.
  pub fn from_raw(raw: &RawConfiguration) -> anyhow::Result<Self> {
    Ok(Self {
      version: raw.version.clone(),
      rules: serde_json::from_value(raw.rules.clone())?,
      container_logs: serde_json::from_value(raw.container_logs.clone())?,
    })
  }
}
