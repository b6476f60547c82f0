use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tokio::net::UdpSocket;

use crate::config::RouterConfig;

const CMD_LIST: &str = "/rest/ip/dns/static/print";
const CMD_SET: &str = "/rest/ip/dns/static/set";

/// Only static entries tagged with this comment are rewritten.
const LOCAL_DNS_COMMENT: &str = "local-dns";

/// Whole-helper budget; this runs once at boot and must not stall
/// startup on an unreachable router.
const REQUEST_BUDGET: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct StaticDnsEntry {
    #[serde(rename = ".id")]
    id: String,
    #[serde(default)]
    comment: Option<String>,
}

fn local_dns_ids(entries: Vec<StaticDnsEntry>) -> Vec<String> {
    entries
        .into_iter()
        .filter(|entry| entry.comment.as_deref() == Some(LOCAL_DNS_COMMENT))
        .map(|entry| entry.id)
        .collect()
}

struct RouterClient {
    base: String,
    http: reqwest::Client,
    username: String,
    password: String,
}

impl RouterClient {
    fn new(cfg: &RouterConfig) -> Self {
        let base = if cfg.address.starts_with("http://") || cfg.address.starts_with("https://") {
            cfg.address.clone()
        } else {
            format!("http://{}", cfg.address)
        };

        Self {
            base,
            http: reqwest::Client::new(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        }
    }

    async fn call(&self, cmd: &str, body: Option<serde_json::Value>) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base, cmd))
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("RouterOS request {cmd} failed"))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("RouterOS HTTP error {status}: {text}");
        }

        Ok(response)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let response = self.call(CMD_LIST, None).await?;
        let entries: Vec<StaticDnsEntry> = response
            .json()
            .await
            .context("failed decoding RouterOS static DNS list")?;

        Ok(local_dns_ids(entries))
    }

    async fn set_forward_to(&self, ids: &[String], address: &str) -> Result<()> {
        let body = json!({
            ".id": ids.join(","),
            "forward-to": address,
        });
        self.call(CMD_SET, Some(body)).await?;
        Ok(())
    }
}

/// The address this host reaches the world from; the router will
/// forward its static entries here.
async fn local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed binding discovery socket")?;
    socket
        .connect("8.8.8.8:80")
        .await
        .context("could not fetch local address")?;

    Ok(socket.local_addr()?.ip())
}

/// Boot-time helper: points every `local-dns`-tagged static entry on
/// the router at this host.
pub async fn update_static_dns(cfg: &RouterConfig) -> Result<()> {
    if !cfg.enabled {
        tracing::info!("RouterOS API disabled");
        return Ok(());
    }

    let client = RouterClient::new(cfg);
    let forward_to = local_ip().await?.to_string();

    tokio::time::timeout(REQUEST_BUDGET, async {
        let ids = client
            .list()
            .await
            .context("could not fetch RouterOS static DNS")?;
        tracing::info!(records = ids.len(), "RouterOS API fetched static DNS records");

        client
            .set_forward_to(&ids, &forward_to)
            .await
            .context("could not update RouterOS static DNS")?;
        tracing::info!(
            records = ids.len(),
            forward_to = %forward_to,
            "RouterOS API updated static DNS records"
        );

        Ok(())
    })
    .await
    .map_err(|_| anyhow::anyhow!("RouterOS request timed out"))?
}
