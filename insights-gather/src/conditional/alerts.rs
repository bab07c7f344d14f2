// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./alerts_test.rs"]
mod alerts_test;

use bd_log::warn_every;
use insights_common::k8s::openshift::ClusterVersionClient;
use insights_common::k8s::remote::AlertsClient;
use parking_lot::RwLock;
use prometheus_parser::{GroupKey, GroupKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::ext::NumericalDuration;

const ALERT_NAME_LABEL: &str = "alertname";

pub type AlertLabels = BTreeMap<String, String>;

//
// FiringAlerts
//

/// Firing alerts keyed by alert name. An alert fires once per target, each with its own labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FiringAlerts {
  alerts: BTreeMap<String, Vec<AlertLabels>>,
}

impl FiringAlerts {
  /// Builds the alerts from the Prometheus text exposition returned by the federate endpoint.
  /// Samples without an alert name are skipped.
  pub fn parse(exposition: &str) -> anyhow::Result<Self> {
    let groups = prometheus_parser::parse_text(exposition)
      .map_err(|e| anyhow::anyhow!("unable to parse firing alerts: {e:?}"))?;

    let mut alerts = Self::default();
    for group in groups {
      let keys: Vec<GroupKey> = match group.metrics {
        GroupKind::Summary(samples) => samples.into_keys().collect(),
        GroupKind::Histogram(samples) => samples.into_keys().collect(),
        GroupKind::Gauge(samples) => samples.into_keys().collect(),
        GroupKind::Counter(samples) => samples.into_keys().collect(),
        GroupKind::Untyped(samples) => samples.into_keys().collect(),
      };
      for key in keys {
        alerts.insert(key.labels.into_iter().collect());
      }
    }
    Ok(alerts)
  }

  /// Adds a firing alert instance. Returns false if the labels carry no alert name.
  pub fn insert(&mut self, labels: AlertLabels) -> bool {
    let Some(name) = labels.get(ALERT_NAME_LABEL).filter(|name| !name.is_empty()) else {
      warn_every!(
        1.minutes(),
        "skipping firing alert without an alert name: {:?}",
        labels
      );
      return false;
    };
    self.alerts.entry(name.clone()).or_default().push(labels);
    true
  }

  #[must_use]
  pub fn is_firing(&self, name: &str) -> bool {
    self.alerts.contains_key(name)
  }

  /// Returns the labels of every firing instance of the alert.
  #[must_use]
  pub fn instances(&self, name: &str) -> &[AlertLabels] {
    self.alerts.get(name).map_or(&[], Vec::as_slice)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.alerts.keys().map(String::as_str)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.alerts.is_empty()
  }
}

impl<const N: usize> From<[(&str, Vec<AlertLabels>); N]> for FiringAlerts {
  fn from(alerts: [(&str, Vec<AlertLabels>); N]) -> Self {
    Self {
      alerts: alerts
        .into_iter()
        .map(|(name, instances)| (name.to_string(), instances))
        .collect(),
    }
  }
}

//
// AlertCache
//

#[derive(Default)]
struct CacheState {
  alerts: Arc<FiringAlerts>,
  cluster_version: String,
}

/// The firing alerts and cluster version seen by the last refresh. Both are replaced in full on
/// every refresh and read only while rules are evaluated.
pub struct AlertCache {
  alerts_client: Arc<dyn AlertsClient>,
  version_client: Arc<dyn ClusterVersionClient>,
  state: RwLock<CacheState>,
}

impl AlertCache {
  #[must_use]
  pub fn new(
    alerts_client: Arc<dyn AlertsClient>,
    version_client: Arc<dyn ClusterVersionClient>,
  ) -> Self {
    Self {
      alerts_client,
      version_client,
      state: RwLock::new(CacheState::default()),
    }
  }

  /// Fetches the firing alerts and the cluster version. Failing to fetch or parse the alerts is an
  /// error and leaves the cache untouched. A failed version lookup only clears the version, which
  /// makes every version condition non-matching.
  pub async fn refresh(&self) -> anyhow::Result<()> {
    let exposition = self.alerts_client.federate_alerts().await?;
    let alerts = FiringAlerts::parse(&exposition)?;

    let cluster_version = match self.version_client.cluster_version().await {
      Ok(version) => version,
      Err(e) => {
        log::warn!("unable to get the cluster version: {e}");
        String::new()
      },
    };

    log::debug!(
      "refreshed firing alerts: [{}], cluster version: {cluster_version:?}",
      alerts.names().collect::<Vec<_>>().join(", ")
    );
    *self.state.write() = CacheState {
      alerts: Arc::new(alerts),
      cluster_version,
    };
    Ok(())
  }

  #[must_use]
  pub fn firing_alerts(&self) -> Arc<FiringAlerts> {
    self.state.read().alerts.clone()
  }

  #[must_use]
  pub fn cluster_version(&self) -> String {
    self.state.read().cluster_version.clone()
  }
}
