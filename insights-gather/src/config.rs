// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

fn default_metrics_url() -> String {
  "https://prometheus-k8s.openshift-monitoring.svc:9091".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_token_path() -> Option<PathBuf> {
  Some(PathBuf::from(SERVICE_ACCOUNT_TOKEN))
}

const fn default_log_timeout() -> Duration {
  Duration::from_secs(5 * 60)
}

const fn default_log_since() -> Duration {
  Duration::from_secs(6 * 60 * 60)
}

const fn default_max_concurrent_streams() -> usize {
  30
}

const fn default_max_namespace_containers() -> usize {
  64
}

const fn default_page_size() -> u32 {
  500
}

const fn default_pod_cap() -> usize {
  3000
}

const fn default_image_wait_floor() -> Duration {
  Duration::from_secs(15)
}

const fn default_true() -> bool {
  true
}

const fn default_runtime_port() -> u16 {
  8000
}

const fn default_runtime_timeout() -> Duration {
  Duration::from_secs(2 * 60)
}

//
// Config
//

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
  #[serde(default)]
  pub conditional: ConditionalConfig,
  #[serde(default)]
  pub workloads: WorkloadsConfig,
}

impl Config {
  pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
    // An empty document is a valid config with every default applied.
    if yaml.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(yaml)?)
  }

  pub fn load(path: &Path) -> anyhow::Result<Self> {
    log::info!("loading config from: {}", path.display());
    let yaml = std::fs::read_to_string(path)
      .with_context(|| format!("unable to read config {}", path.display()))?;
    Self::from_yaml(&yaml)
  }
}

//
// ConditionalConfig
//

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConditionalConfig {
  /// Remote conditional gathering configuration. The embedded rules are used when unset.
  #[serde(default)]
  pub rules_endpoint: Option<String>,
  #[serde(default = "default_token_path")]
  pub rules_token_path: Option<PathBuf>,

  #[serde(default = "default_metrics_url")]
  pub metrics_url: String,
  #[serde(default = "default_token_path")]
  pub metrics_token_path: Option<PathBuf>,
  #[serde(default)]
  pub metrics_ca_path: Option<PathBuf>,

  #[serde(default = "default_log_timeout", with = "humantime_serde")]
  pub log_timeout: Duration,
  #[serde(default = "default_log_since", with = "humantime_serde")]
  pub log_since: Duration,
  #[serde(default = "default_max_concurrent_streams")]
  pub max_concurrent_streams: usize,
  #[serde(default = "default_max_namespace_containers")]
  pub max_namespace_containers: usize,
}

impl Default for ConditionalConfig {
  fn default() -> Self {
    Self {
      rules_endpoint: None,
      rules_token_path: default_token_path(),
      metrics_url: default_metrics_url(),
      metrics_token_path: default_token_path(),
      metrics_ca_path: None,
      log_timeout: default_log_timeout(),
      log_since: default_log_since(),
      max_concurrent_streams: default_max_concurrent_streams(),
      max_namespace_containers: default_max_namespace_containers(),
    }
  }
}

//
// WorkloadsConfig
//

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkloadsConfig {
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default = "default_pod_cap")]
  pub pod_cap: usize,
  #[serde(default = "default_image_wait_floor", with = "humantime_serde")]
  pub image_wait_floor: Duration,
  #[serde(default)]
  pub runtime_extractor: RuntimeExtractorConfig,
}

impl Default for WorkloadsConfig {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
      pod_cap: default_pod_cap(),
      image_wait_floor: default_image_wait_floor(),
      runtime_extractor: RuntimeExtractorConfig::default(),
    }
  }
}

//
// RuntimeExtractorConfig
//

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeExtractorConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Namespace the extractor pods run in. Falls back to `POD_NAMESPACE`.
  #[serde(default)]
  pub namespace: Option<String>,
  #[serde(default = "default_runtime_port")]
  pub port: u16,
  #[serde(default = "default_runtime_timeout", with = "humantime_serde")]
  pub timeout: Duration,
}

impl RuntimeExtractorConfig {
  #[must_use]
  pub fn namespace(&self) -> Option<String> {
    self
      .namespace
      .clone()
      .or_else(|| std::env::var("POD_NAMESPACE").ok())
      .filter(|namespace| !namespace.is_empty())
  }
}

impl Default for RuntimeExtractorConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      namespace: None,
      port: default_runtime_port(),
      timeout: default_runtime_timeout(),
    }
  }
}
