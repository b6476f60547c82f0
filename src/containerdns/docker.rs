use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::models::EventMessageTypeEnum;
use bollard::query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions};
use bollard::Docker;
use futures::StreamExt;
use hickory_proto::op::Query;
use hickory_proto::rr::rdata::PTR;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::sync::{broadcast, mpsc};

use crate::containerdns::store::{reverse_ip, MemoryStore, RecordStore, StoreError, RECORD_TTL};

/// The slice of a container inspection this system cares about.
#[derive(Debug, Clone)]
pub struct ContainerView {
    pub id: String,
    pub hostname: String,
    /// Top-level address; present on the default bridge network.
    pub ip_address: Option<String>,
    /// Per-network addresses, in engine order.
    pub network_addresses: Vec<String>,
}

impl ContainerView {
    #[cfg(test)]
    pub(crate) fn with_top_ip(id: &str, hostname: &str, ip: &str) -> Self {
        Self {
            id: id.to_string(),
            hostname: hostname.to_string(),
            ip_address: (!ip.is_empty()).then(|| ip.to_string()),
            network_addresses: Vec::new(),
        }
    }
}

/// Picks the container's address: the top-level one when set,
/// otherwise the first non-empty per-network address.
pub fn container_ip(view: &ContainerView) -> Result<Ipv4Addr, StoreError> {
    let raw = view
        .ip_address
        .as_deref()
        .filter(|addr| !addr.is_empty())
        .or_else(|| {
            view.network_addresses
                .iter()
                .map(String::as_str)
                .find(|addr| !addr.is_empty())
        });

    let Some(raw) = raw else {
        return Err(StoreError::IpNotFound(view.id.clone()));
    };

    raw.parse()
        .map_err(|_| StoreError::IpNotFound(view.id.clone()))
}

/// Seam over the container engine so stores and the event worker can
/// be exercised without a daemon.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list(&self) -> Result<Vec<String>>;
    async fn inspect(&self, id: &str) -> Result<ContainerView>;
}

/// Container lifecycle events the cache worker reacts to; everything
/// else in the engine's stream is dropped at the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Start { id: String },
    Die { id: String },
}

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects via the environment's defaults and pings the daemon;
    /// an unreachable engine is a startup failure.
    pub async fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed constructing docker client")?;
        docker.ping().await.context("docker engine unreachable")?;

        Ok(Self { docker })
    }

    /// Forwards container start/die events into `tx` until the
    /// engine stream ends or the receiver goes away.
    pub async fn stream_events(self, tx: mpsc::Sender<EngineEvent>) -> Result<()> {
        let mut stream = self.docker.events(None::<EventsOptions>);

        while let Some(event) = stream.next().await {
            let event = event.context("docker event stream failed")?;

            if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
                continue;
            }
            let Some(id) = event.actor.and_then(|actor| actor.id) else {
                continue;
            };

            let event = match event.action.as_deref() {
                Some("start") => EngineEvent::Start { id },
                Some("die") => EngineEvent::Die { id },
                _ => continue,
            };

            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list(&self) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers(None::<ListContainersOptions>)
            .await
            .context("failed listing containers")?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerView> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("failed inspecting container {id}"))?;

        let hostname = details
            .config
            .as_ref()
            .and_then(|config| config.hostname.clone())
            .unwrap_or_default();

        let settings = details.network_settings;
        let ip_address = settings.as_ref().and_then(|s| s.ip_address.clone());
        let network_addresses = settings
            .as_ref()
            .and_then(|s| s.networks.as_ref())
            .map(|networks| {
                networks
                    .values()
                    .filter_map(|endpoint| endpoint.ip_address.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(ContainerView {
            id: details.id.unwrap_or_else(|| id.to_string()),
            hostname,
            ip_address,
            network_addresses,
        })
    }
}

/// Turns container lifecycle events into memory-store mutations:
/// `start` inserts the container's A and PTR records, `die` drops
/// exactly the records that container produced.
pub struct CacheWorker {
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<MemoryStore>,
}

impl CacheWorker {
    pub fn new(engine: Arc<dyn ContainerEngine>, cache: Arc<MemoryStore>) -> Self {
        Self { engine, cache }
    }

    pub async fn run(
        self,
        mut events: mpsc::Receiver<EngineEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("docker cache worker stopped");
                    return Ok(());
                }
                event = events.recv() => match event {
                    None => {
                        tracing::info!("docker event stream closed");
                        return Ok(());
                    }
                    Some(EngineEvent::Start { id }) => self.handle_start(&id).await,
                    Some(EngineEvent::Die { id }) => self.cache.remove_container(&id).await,
                }
            }
        }
    }

    async fn handle_start(&self, id: &str) {
        let view = match self.engine.inspect(id).await {
            Ok(view) => view,
            Err(err) => {
                tracing::warn!(container = %id, error = %err, "could not inspect container");
                return;
            }
        };

        if !view.hostname.contains('.') {
            tracing::warn!(
                container = %view.id,
                hostname = %view.hostname,
                "ignoring container with invalid hostname"
            );
            return;
        }

        let ip = match container_ip(&view) {
            Ok(ip) => ip,
            Err(err) => {
                tracing::warn!(container = %view.id, error = %err, "could not fetch ip address");
                return;
            }
        };

        let fqdn = match Name::from_ascii(format!("{}.", view.hostname)) {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(container = %view.id, error = %err, "invalid hostname");
                return;
            }
        };

        let a_query = Query::query(fqdn.clone(), RecordType::A);
        let a_record = Record::from_rdata(fqdn.clone(), RECORD_TTL, RData::A(ip.into()));
        self.cache.set(&a_query, &view.id, vec![a_record]).await;

        tracing::info!(
            container = %view.id,
            hostname = %view.hostname,
            "added A record to cache"
        );

        let reversed = reverse_ip(&ip.to_string());
        let ptr_name = match Name::from_ascii(format!("{reversed}.in-addr.arpa.")) {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(container = %view.id, error = %err, "invalid reverse name");
                return;
            }
        };

        let ptr_query = Query::query(ptr_name, RecordType::PTR);
        // The record keeps the hostname as its owner name; the rdata
        // points at the hostname so reverse lookups resolve it.
        let ptr_record = Record::from_rdata(fqdn.clone(), RECORD_TTL, RData::PTR(PTR(fqdn)));
        self.cache.set(&ptr_query, &view.id, vec![ptr_record]).await;

        tracing::info!(
            container = %view.id,
            hostname = %view.hostname,
            "added PTR record to cache"
        );
    }
}
