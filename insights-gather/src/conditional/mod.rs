// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod alerts;
pub mod container_logs;
pub mod functions;
pub mod logs;
pub mod rules;
pub mod validation;
pub mod version;

use crate::config::ConditionalConfig;
use crate::gatherer::{GatherOutput, GatheringClosure, until_cancelled};
use alerts::AlertCache;
use anyhow::anyhow;
use bd_server_stats::stats::Scope;
use functions::{BuildContext, Registry, closure_name};
use insights_common::k8s::openshift::{
  ApiRequestCountClient,
  ClusterVersionClient,
  ImageClient,
  KubeOpenShiftClient,
};
use insights_common::k8s::pods::{KubePodClient, PodClient};
use insights_common::k8s::remote::{AlertsClient, HttpAlertsClient, HttpRulesClient, RulesClient};
use insights_common::record::Record;
use parking_lot::Mutex;
use prometheus::IntCounter;
use rules::{Condition, Configuration, GatheringRule, RawConfiguration};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use validation::{ValidationErrors, validate_configuration};

pub const RULES_CLOSURE_NAME: &str = "conditional_gatherer_rules";
pub const RULES_RECORD_NAME: &str = "insights-operator/conditional-gatherer-rules";
pub const CONTAINER_LOGS_CLOSURE_NAME: &str = "container_logs";

//
// Stats
//

struct Stats {
  plan: IntCounter,
  rules_triggered: IntCounter,
  builder_failure: IntCounter,
  alert_refresh_failure: IntCounter,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    Self {
      plan: scope.counter("plan"),
      rules_triggered: scope.counter("rules_triggered"),
      builder_failure: scope.counter("builder_failure"),
      alert_refresh_failure: scope.counter("alert_refresh_failure"),
    }
  }
}

//
// ConditionalClients
//

/// The cluster and remote endpoints the conditional gatherer reads from.
pub struct ConditionalClients {
  pub pods: Arc<dyn PodClient>,
  pub images: Arc<dyn ImageClient>,
  pub api_request_counts: Arc<dyn ApiRequestCountClient>,
  pub cluster_version: Arc<dyn ClusterVersionClient>,
  pub alerts: Arc<dyn AlertsClient>,
  pub rules: Option<Arc<dyn RulesClient>>,
}

impl ConditionalClients {
  pub fn from_kube(client: kube::Client, config: &ConditionalConfig) -> anyhow::Result<Self> {
    let openshift = Arc::new(KubeOpenShiftClient::new(client.clone()));
    let rules: Option<Arc<dyn RulesClient>> = match &config.rules_endpoint {
      Some(endpoint) => Some(Arc::new(HttpRulesClient::new(
        endpoint,
        config.rules_token_path.clone(),
      )?)),
      None => None,
    };
    Ok(Self {
      pods: Arc::new(KubePodClient::new(client)),
      images: openshift.clone(),
      api_request_counts: openshift.clone(),
      cluster_version: openshift,
      alerts: Arc::new(HttpAlertsClient::new(
        &config.metrics_url,
        config.metrics_token_path.clone(),
        config.metrics_ca_path.as_ref(),
      )?),
      rules,
    })
  }
}

//
// Plan
//

/// The closures to run this cycle, keyed by their derived names, plus the builder failures.
#[derive(Debug, Default)]
pub struct Plan {
  pub closures: BTreeMap<String, GatheringClosure>,
  pub errors: Vec<anyhow::Error>,
}

#[derive(Serialize)]
struct RuleMetadata {
  rule: GatheringRule,
  errors: Vec<String>,
  was_triggered: bool,
}

#[derive(Serialize)]
struct RulesMetadata {
  version: String,
  endpoint: String,
  conditional_gathering_rules: Vec<RuleMetadata>,
}

//
// ConditionalGatherer
//

/// Decides which gather closures to run from the active rules, the firing alerts and the cluster
/// version.
pub struct ConditionalGatherer {
  registry: Registry,
  clients: ConditionalClients,
  alert_cache: AlertCache,
  config: Arc<ConditionalConfig>,
  last_good: Mutex<RawConfiguration>,
  stats: Stats,
}

impl ConditionalGatherer {
  #[must_use]
  pub fn new(
    registry: Registry,
    clients: ConditionalClients,
    config: ConditionalConfig,
    scope: &Scope,
  ) -> Self {
    let alert_cache = AlertCache::new(clients.alerts.clone(), clients.cluster_version.clone());
    Self {
      registry,
      clients,
      alert_cache,
      config: Arc::new(config),
      last_good: Mutex::new(RawConfiguration::embedded()),
      stats: Stats::new(&scope.scope("conditional")),
    }
  }

  /// Returns the remote configuration, or the last one that loaded if the fetch fails.
  async fn load_configuration(&self) -> (RawConfiguration, bool) {
    let Some(rules_client) = &self.clients.rules else {
      return (self.last_good.lock().clone(), false);
    };
    let fetched = match rules_client.fetch_rules().await {
      Ok(body) => RawConfiguration::parse(&body),
      Err(e) => Err(e),
    };
    match fetched {
      Ok(configuration) => (configuration, true),
      Err(e) => {
        log::warn!("unable to load the remote conditional gathering configuration: {e}");
        (self.last_good.lock().clone(), false)
      },
    }
  }

  fn rule_matches(&self, rule: &GatheringRule, cluster_version: &str) -> bool {
    let firing_alerts = self.alert_cache.firing_alerts();
    rule.conditions.iter().all(|condition| match condition {
      Condition::AlertIsFiring(params) => firing_alerts.is_firing(&params.name),
      Condition::ClusterVersionMatches(params) => {
        version::cluster_version_matches(cluster_version, &params.version)
      },
    })
  }

  /// Validates the active rules, refreshes the alert cache and builds the closures of every
  /// matching rule. Invalid rules and alert fetch failures fail the whole plan. Builder failures
  /// are returned next to the closures that did build.
  pub async fn plan(&self) -> anyhow::Result<Plan> {
    self.stats.plan.inc();

    let (raw, fetched) = self.load_configuration().await;
    let validation_errors = validate_configuration(&raw, &self.registry);
    if !validation_errors.is_empty() {
      return Err(ValidationErrors(validation_errors).into());
    }
    if fetched {
      *self.last_good.lock() = raw.clone();
    }

    if let Err(e) = self.alert_cache.refresh().await {
      self.stats.alert_refresh_failure.inc();
      return Err(e.context("unable to refresh the firing alerts"));
    }
    let configuration = Configuration::from_raw(&raw)?;
    let cluster_version = self.alert_cache.cluster_version();
    let context = BuildContext {
      pods: self.clients.pods.clone(),
      images: self.clients.images.clone(),
      api_request_counts: self.clients.api_request_counts.clone(),
      firing_alerts: self.alert_cache.firing_alerts(),
      config: self.config.clone(),
    };

    let mut plan = Plan::default();
    let mut metadata = Vec::with_capacity(configuration.rules.len());
    for rule in &configuration.rules {
      let was_triggered = self.rule_matches(rule, &cluster_version);
      let mut rule_errors = Vec::new();
      if was_triggered {
        self.stats.rules_triggered.inc();
        for (name, params) in &rule.gathering_functions {
          let built = self
            .registry
            .get(name)
            .ok_or_else(|| anyhow!("unknown gathering function {name}"))
            .and_then(|function| function.build(&context, params));
          match built {
            Ok(closure) => {
              plan.closures.insert(closure_name(name, params), closure);
            },
            Err(e) => {
              self.stats.builder_failure.inc();
              log::warn!("unable to build gathering function {name}: {e:#}");
              rule_errors.push(format!("{e:#}"));
              plan.errors.push(e);
            },
          }
        }
      }
      metadata.push(RuleMetadata {
        rule: rule.clone(),
        errors: rule_errors,
        was_triggered,
      });
    }

    let rules_record = Record::json(
      RULES_RECORD_NAME,
      &RulesMetadata {
        version: configuration.version.clone(),
        endpoint: self.config.rules_endpoint.clone().unwrap_or_default(),
        conditional_gathering_rules: metadata,
      },
    )?;
    plan.closures.insert(
      RULES_CLOSURE_NAME.to_string(),
      GatheringClosure::new(move |_| {
        let record = rules_record.clone();
        async move { GatherOutput::new(vec![record], vec![]) }
      }),
    );

    if !configuration.container_logs.is_empty() {
      let pods = self.clients.pods.clone();
      let requests = Arc::new(configuration.container_logs);
      let config = self.config.clone();
      plan.closures.insert(
        CONTAINER_LOGS_CLOSURE_NAME.to_string(),
        GatheringClosure::new(move |shutdown| {
          let pods = pods.clone();
          let requests = requests.clone();
          let config = config.clone();
          async move {
            until_cancelled(
              shutdown,
              container_logs::gather_container_logs(pods, &requests, &config),
            )
            .await
          }
        }),
      );
    }

    log::debug!(
      "planned conditional gathering: [{}]",
      plan.closures.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
    );
    Ok(plan)
  }
}
