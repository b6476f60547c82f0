pub mod upstream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;

use crate::admin::Storage;
use crate::broadcast::Broadcaster;
use crate::cache::{CacheItem, Store};
use crate::config::ResolverConfig;
use crate::resolver::upstream::{UdpUpstream, Upstream};
use crate::types::UpdateMessage;

/// Absolute budget for one tick, regardless of how slow upstreams
/// are or how many domains are configured.
const TICK_DEADLINE: Duration = Duration::from_secs(15);

struct FetchResult {
    ttl: Duration,
    msg: UpdateMessage,
}

/// Periodically resolves the configured domains and feeds the
/// resulting address deltas to the broadcaster. The next wake-up is
/// the minimum positive TTL observed across the tick's answers.
pub struct Resolver {
    cfg: ResolverConfig,
    domains: RwLock<Vec<String>>,
    store: Store,
    broadcaster: Broadcaster,
    upstream: Arc<dyn Upstream>,
}

impl Resolver {
    pub fn new(cfg: ResolverConfig, store: Store, broadcaster: Broadcaster) -> Arc<Self> {
        Self::with_upstream(cfg, store, broadcaster, Arc::new(UdpUpstream))
    }

    pub fn with_upstream(
        cfg: ResolverConfig,
        store: Store,
        broadcaster: Broadcaster,
        upstream: Arc<dyn Upstream>,
    ) -> Arc<Self> {
        let domains = cfg.domains.clone();
        Arc::new(Self {
            cfg,
            domains: RwLock::new(domains),
            store,
            broadcaster,
            upstream,
        })
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Tick loop. A single re-armable timer drives all domains; each
    /// tick re-arms it from the TTLs the tick observed.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut next_wake = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("dns resolver stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(next_wake) => {
                    let started = Instant::now();
                    let (wake, msg) = Arc::clone(&self).fetch_domains().await;

                    tracing::info!(
                        next_secs = wake.as_secs(),
                        spent_ms = started.elapsed().as_millis() as u64,
                        "resolved all domains"
                    );

                    next_wake = Instant::now() + wake;
                    self.broadcaster.broadcast(msg).await;
                }
            }
        }
    }

    /// One tick: fan out a task per configured domain, fan results
    /// back in under the tick deadline, and aggregate their deltas.
    async fn fetch_domains(self: Arc<Self>) -> (Duration, UpdateMessage) {
        let deadline = Instant::now() + TICK_DEADLINE;
        let domains = self.domains.read().await.clone();

        let (tx, mut rx) = mpsc::channel(domains.len().max(1));
        for domain in &domains {
            tokio::spawn(Arc::clone(&self).resolve_domain(domain.clone(), deadline, tx.clone()));
        }
        drop(tx);

        let mut received = domains.len();
        let mut wake: Option<Duration> = None;
        let mut msg = UpdateMessage::default();

        while received > 0 {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!("stop waiting for resolver responses");
                    break;
                }
                res = rx.recv() => {
                    let Some(res) = res else {
                        // Every domain task finished; skipped and
                        // failed domains produce no result.
                        break;
                    };

                    msg.merge(res.msg);
                    if res.ttl > Duration::ZERO && wake.map_or(true, |cur| res.ttl < cur) {
                        wake = Some(res.ttl);
                    }

                    received -= 1;
                    if received == 0 {
                        tracing::info!("received all answers");
                    }
                }
            }
        }

        (wake.unwrap_or(Duration::from_secs(self.cfg.timeout)), msg)
    }

    /// Resolves one domain against every configured server and emits
    /// the merged delta. Fresh cache hits are skipped; the first
    /// transport error terminates this domain's tick.
    async fn resolve_domain(
        self: Arc<Self>,
        domain: String,
        deadline: Instant,
        out: mpsc::Sender<FetchResult>,
    ) {
        let item = match self.store.get(&domain).await {
            None => Arc::new(CacheItem::new(domain.clone())),
            Some(item) if item.is_expired() => {
                tracing::debug!(domain = %domain, ttl = item.expire(), "cache expired");
                item.reset();
                item
            }
            Some(item) => {
                tracing::debug!(domain = %domain, records = item.records().len(), "cache hit");
                return;
            }
        };

        let fqdn = format!("{domain}.");
        let mut msg = UpdateMessage::default();

        for server in &self.cfg.servers {
            match self.upstream.query_a(server, &fqdn, deadline).await {
                Ok(answer) => {
                    msg.merge(item.add_records(&answer.addresses, answer.min_ttl));
                }
                Err(err) => {
                    tracing::warn!(
                        domain = %domain,
                        server = %server,
                        error = %err,
                        "could not resolve"
                    );
                    return;
                }
            }
        }

        self.store.set(domain.clone(), Arc::clone(&item)).await;

        tracing::debug!(domain = %domain, ttl = item.expire(), "resolved");
        let _ = out
            .send(FetchResult {
                ttl: Duration::from_secs(u64::from(item.expire())),
                msg,
            })
            .await;
    }

    async fn has_domain(&self, domain: &str) -> bool {
        self.domains.read().await.iter().any(|d| d == domain)
    }
}

#[async_trait]
impl Storage for Resolver {
    async fn get(&self, domain: &str) -> Option<Arc<CacheItem>> {
        if !self.has_domain(domain).await {
            return None;
        }

        self.store.get(domain).await
    }

    async fn set(&self, domain: &str, item: Arc<CacheItem>) -> bool {
        self.store.set(domain, Arc::clone(&item)).await;

        let mut domains = self.domains.write().await;
        if let Some(at) = domains.iter().position(|d| d == domain) {
            domains[at] = item.domain().to_string();
        } else {
            domains.push(item.domain().to_string());
        }

        true
    }

    async fn delete(&self, domain: &str) {
        self.store.delete(domain).await;

        let mut domains = self.domains.write().await;
        domains.retain(|d| d != domain);
    }

    async fn list(&self) -> HashMap<String, Arc<CacheItem>> {
        let domains = self.domains.read().await.clone();

        let mut out = HashMap::with_capacity(domains.len());
        for domain in domains {
            let item = match self.store.get(&domain).await {
                Some(item) => item,
                None => Arc::new(CacheItem::new(domain.clone())),
            };
            out.insert(domain, item);
        }

        out
    }
}
