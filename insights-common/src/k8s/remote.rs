// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::{Context, bail};
use async_trait::async_trait;
use http::header::{ACCEPT, AUTHORIZATION};
use mockall::automock;
use std::path::PathBuf;

pub const FIRING_ALERTS_MATCHER: &str = "ALERTS{alertstate=\"firing\"}";

//
// AlertsClient
//

/// Fetches firing alerts in Prometheus text exposition format.
#[automock]
#[async_trait]
pub trait AlertsClient: Send + Sync {
  async fn federate_alerts(&self) -> anyhow::Result<String>;
}

//
// RulesClient
//

/// Fetches the remote conditional gathering configuration as a JSON document.
#[automock]
#[async_trait]
pub trait RulesClient: Send + Sync {
  async fn fetch_rules(&self) -> anyhow::Result<String>;
}

fn make_http_client(ca_path: Option<&PathBuf>) -> anyhow::Result<reqwest::Client> {
  let mut builder = reqwest::Client::builder();
  if let Some(ca_path) = ca_path {
    let pem = std::fs::read(ca_path)
      .with_context(|| format!("unable to read CA bundle {}", ca_path.display()))?;
    builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
  }
  Ok(builder.build()?)
}

fn read_bearer_token(token_path: Option<&PathBuf>) -> anyhow::Result<Option<String>> {
  token_path
    .map(|path| {
      std::fs::read_to_string(path)
        .map(|token| token.trim().to_string())
        .with_context(|| format!("unable to read token {}", path.display()))
    })
    .transpose()
}

async fn get_text(request: reqwest::RequestBuilder) -> anyhow::Result<String> {
  let response = request.send().await?;
  let status = response.status();
  if !status.is_success() {
    bail!("unexpected status {status} from {}", response.url());
  }
  Ok(response.text().await?)
}

//
// HttpAlertsClient
//

pub struct HttpAlertsClient {
  client: reqwest::Client,
  base_url: String,
  token_path: Option<PathBuf>,
}

impl HttpAlertsClient {
  pub fn new(
    base_url: &str,
    token_path: Option<PathBuf>,
    ca_path: Option<&PathBuf>,
  ) -> anyhow::Result<Self> {
    Ok(Self {
      client: make_http_client(ca_path)?,
      base_url: base_url.trim_end_matches('/').to_string(),
      token_path,
    })
  }
}

#[async_trait]
impl AlertsClient for HttpAlertsClient {
  async fn federate_alerts(&self) -> anyhow::Result<String> {
    let mut request = self
      .client
      .get(format!("{}/federate", self.base_url))
      .query(&[("match[]", FIRING_ALERTS_MATCHER)])
      .header(ACCEPT, "text/plain");
    // The token is re-read on every refresh since it is rotated on disk.
    if let Some(token) = read_bearer_token(self.token_path.as_ref())? {
      request = request.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    get_text(request).await
  }
}

//
// HttpRulesClient
//

pub struct HttpRulesClient {
  client: reqwest::Client,
  endpoint: String,
  token_path: Option<PathBuf>,
}

impl HttpRulesClient {
  pub fn new(endpoint: &str, token_path: Option<PathBuf>) -> anyhow::Result<Self> {
    Ok(Self {
      client: make_http_client(None)?,
      endpoint: endpoint.to_string(),
      token_path,
    })
  }
}

#[async_trait]
impl RulesClient for HttpRulesClient {
  async fn fetch_rules(&self) -> anyhow::Result<String> {
    let mut request = self.client.get(&self.endpoint);
    if let Some(token) = read_bearer_token(self.token_path.as_ref())? {
      request = request.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    get_text(request).await
  }
}
