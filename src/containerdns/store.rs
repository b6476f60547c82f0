use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Query;
use hickory_proto::rr::rdata::PTR;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::containerdns::docker::{container_ip, ContainerEngine, ContainerView};

pub const RECORD_TTL: u32 = 3600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("container {0}: ip not found")]
    IpNotFound(String),
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

/// Store contract: the memory cache and the live Docker lookup both
/// answer `get`; only the memory cache retains `set`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, query: &Query) -> Result<Vec<Record>, StoreError>;
    async fn set(&self, query: &Query, container_id: &str, records: Vec<Record>);
}

/// Reader-writer-locked record cache with a reverse index from
/// container id to the questions it produced, so a container's death
/// invalidates exactly its records.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<Query, Vec<Record>>,
    containers: HashMap<String, Vec<Query>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every record the given container produced.
    pub async fn remove_container(&self, container_id: &str) {
        let mut state = self.inner.write().await;

        let Some(queries) = state.containers.remove(container_id) else {
            return;
        };

        for query in queries {
            state.records.remove(&query);
            tracing::debug!(
                container = %container_id,
                hostname = %query.name(),
                "removed record from cache"
            );
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let state = self.inner.read().await;
        state
            .records
            .get(query)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn set(&self, query: &Query, container_id: &str, records: Vec<Record>) {
        let mut state = self.inner.write().await;
        state.records.insert(query.clone(), records);
        state
            .containers
            .entry(container_id.to_string())
            .or_default()
            .push(query.clone());
    }
}

/// Live lookups against the container engine. Hits are copied into
/// the memory cache so the next query short-circuits there.
pub struct DockerStore {
    engine: Arc<dyn ContainerEngine>,
    cache: Option<Arc<MemoryStore>>,
}

impl DockerStore {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            cache: None,
        }
    }

    pub fn set_cache(&mut self, cache: Arc<MemoryStore>) {
        self.cache = Some(cache);
    }

    async fn cache_result(&self, query: &Query, container_id: &str, records: Vec<Record>) {
        if let Some(cache) = &self.cache {
            cache.set(query, container_id, records).await;
        }
    }

    /// Inspects every running container, keeping the ones with an
    /// FQDN-style hostname. Containers that fail inspection are
    /// skipped with a warning.
    async fn usable_containers(&self) -> Result<Vec<ContainerView>, StoreError> {
        let ids = self.engine.list().await?;

        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            match self.engine.inspect(&id).await {
                Ok(view) => views.push(view),
                Err(err) => {
                    tracing::warn!(container = %id, error = %err, "could not inspect container");
                }
            }
        }

        Ok(views)
    }

    /// `A .`: one record per container with a usable hostname and a
    /// parseable address.
    async fn fetch_all_records(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let mut records = Vec::new();
        for view in self.usable_containers().await? {
            if !view.hostname.contains('.') {
                tracing::warn!(
                    container = %view.id,
                    hostname = %view.hostname,
                    "ignoring container with invalid hostname"
                );
                continue;
            }

            let ip = match container_ip(&view) {
                Ok(ip) => ip,
                Err(err) => {
                    tracing::warn!(container = %view.id, error = %err, "could not fetch ip address");
                    continue;
                }
            };

            let name = match Name::from_ascii(format!("{}.", view.hostname)) {
                Ok(name) => name,
                Err(err) => {
                    tracing::warn!(container = %view.id, error = %err, "invalid hostname");
                    continue;
                }
            };

            let record = Record::from_rdata(name, RECORD_TTL, RData::A(ip.into()));
            records.push(record.clone());

            let cached = Query::query(record.name().clone(), query.query_type());
            self.cache_result(&cached, &view.id, vec![record]).await;
        }

        Ok(records)
    }

    async fn fetch_by_hostname(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let wanted = query.name().to_string();

        for view in self.usable_containers().await? {
            if !format!("{}.", view.hostname).eq_ignore_ascii_case(&wanted) {
                continue;
            }

            let ip = container_ip(&view)?;
            let record =
                Record::from_rdata(query.name().clone(), RECORD_TTL, RData::A(ip.into()));
            self.cache_result(query, &view.id, vec![record.clone()]).await;

            return Ok(vec![record]);
        }

        Err(StoreError::NotFound)
    }

    async fn fetch_by_ip(&self, ip: &str, query: &Query) -> Result<Vec<Record>, StoreError> {
        for view in self.usable_containers().await? {
            let top = view.ip_address.as_deref().unwrap_or_default();
            let matches =
                top == ip || view.network_addresses.iter().any(|addr| addr == ip);
            if !matches {
                continue;
            }

            let target = Name::from_ascii(format!("{}.", view.hostname))
                .map_err(|err| StoreError::Engine(err.into()))?;
            let record = Record::from_rdata(
                query.name().clone(),
                RECORD_TTL,
                RData::PTR(PTR(target)),
            );
            self.cache_result(query, &view.id, vec![record.clone()]).await;

            return Ok(vec![record]);
        }

        Err(StoreError::NotFound)
    }
}

#[async_trait]
impl RecordStore for DockerStore {
    async fn get(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        match query.query_type() {
            RecordType::A => {
                if query.name().is_root() {
                    return self.fetch_all_records(query).await;
                }

                self.fetch_by_hostname(query).await
            }
            RecordType::PTR => {
                let name = query.name().to_string().to_ascii_lowercase();
                let Some(reversed) = name.strip_suffix(".in-addr.arpa.") else {
                    return Err(StoreError::NotFound);
                };

                let ip = reverse_ip(reversed);
                tracing::debug!(ip = %ip, "reverse ip");

                self.fetch_by_ip(&ip, query).await
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn set(&self, _query: &Query, _container_id: &str, _records: Vec<Record>) {}
}

/// First-hit chain over the composed stores; only `NotFound` moves
/// on to the next store.
pub struct ChainStore {
    stores: Vec<Arc<dyn RecordStore>>,
}

impl ChainStore {
    pub fn new(stores: Vec<Arc<dyn RecordStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl RecordStore for ChainStore {
    async fn get(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        for store in &self.stores {
            match store.get(query).await {
                Ok(records) => return Ok(records),
                Err(StoreError::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::NotFound)
    }

    async fn set(&self, query: &Query, container_id: &str, records: Vec<Record>) {
        for store in &self.stores {
            store.set(query, container_id, records.clone()).await;
        }
    }
}

/// Reverses the octet order of a dotted-quad string; the reverse of
/// a `.in-addr.arpa.` owner is the forward address and vice versa.
pub fn reverse_ip(ip: &str) -> String {
    let mut octets: Vec<&str> = ip.split('.').collect();
    octets.reverse();
    octets.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containerdns::docker::tests::MockEngine;
    use std::net::Ipv4Addr;

    fn a_query(name: &str) -> Query {
        Query::query(Name::from_ascii(name).unwrap(), RecordType::A)
    }

    fn ptr_query(name: &str) -> Query {
        Query::query(Name::from_ascii(name).unwrap(), RecordType::PTR)
    }

    fn a_record(name: &str, ip: Ipv4Addr) -> Record {
        Record::from_rdata(Name::from_ascii(name).unwrap(), RECORD_TTL, RData::A(ip.into()))
    }

    #[test]
    fn reverse_ip_flips_octets() {
        assert_eq!(reverse_ip("10.0.0.5"), "5.0.0.10");
        assert_eq!(reverse_ip("5.0.0.10"), "10.0.0.5");
    }

    #[tokio::test]
    async fn memory_store_round_trips_and_invalidates_by_container() {
        let store = MemoryStore::new();
        let query = a_query("x.lab.");
        let record = a_record("x.lab.", Ipv4Addr::new(10, 0, 0, 5));

        store.set(&query, "cid-1", vec![record.clone()]).await;
        assert_eq!(store.get(&query).await.unwrap(), vec![record]);

        store.remove_container("cid-1").await;
        assert!(matches!(
            store.get(&query).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn docker_store_enumerates_fqdn_containers_for_root_query() {
        let engine = MockEngine::new(vec![
            ContainerView::with_top_ip("cid-a", "a.lab", "10.0.0.2"),
            ContainerView::with_top_ip("cid-b", "b.lab", "10.0.0.3"),
            // Hostname without a dot is not served.
            ContainerView::with_top_ip("cid-c", "nodot", "10.0.0.4"),
        ]);
        let store = DockerStore::new(Arc::new(engine));

        let records = store.get(&a_query(".")).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn docker_store_finds_container_by_hostname() {
        let engine = MockEngine::new(vec![
            ContainerView::with_top_ip("cid-a", "a.lab", "10.0.0.2"),
            ContainerView::with_top_ip("cid-b", "b.lab", "10.0.0.3"),
        ]);
        let store = DockerStore::new(Arc::new(engine));

        let records = store.get(&a_query("b.lab.")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].data(),
            Some(&RData::A(Ipv4Addr::new(10, 0, 0, 3).into()))
        );

        assert!(matches!(
            store.get(&a_query("missing.lab.")).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn docker_store_prefers_top_ip_then_first_network() {
        let mut view = ContainerView::with_top_ip("cid-a", "a.lab", "");
        view.network_addresses = vec![String::new(), "172.17.0.9".to_string()];
        let store = DockerStore::new(Arc::new(MockEngine::new(vec![view])));

        let records = store.get(&a_query("a.lab.")).await.unwrap();
        assert_eq!(
            records[0].data(),
            Some(&RData::A(Ipv4Addr::new(172, 17, 0, 9).into()))
        );
    }

    #[tokio::test]
    async fn docker_store_reports_missing_ip() {
        let view = ContainerView::with_top_ip("cid-a", "a.lab", "");
        let store = DockerStore::new(Arc::new(MockEngine::new(vec![view])));

        assert!(matches!(
            store.get(&a_query("a.lab.")).await,
            Err(StoreError::IpNotFound(_))
        ));
    }

    #[tokio::test]
    async fn docker_store_answers_reverse_queries() {
        let engine = MockEngine::new(vec![ContainerView::with_top_ip(
            "cid-a", "x.lab", "10.0.0.5",
        )]);
        let store = DockerStore::new(Arc::new(engine));

        let records = store.get(&ptr_query("5.0.0.10.in-addr.arpa.")).await.unwrap();
        assert_eq!(records.len(), 1);
        let Some(RData::PTR(ptr)) = records[0].data() else {
            panic!("expected PTR rdata");
        };
        assert_eq!(ptr.0.to_string(), "x.lab.");

        assert!(matches!(
            store.get(&ptr_query("9.9.9.9.in-addr.arpa.")).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn docker_store_ignores_unsupported_types() {
        let store = DockerStore::new(Arc::new(MockEngine::new(vec![])));
        let query = Query::query(Name::from_ascii("x.lab.").unwrap(), RecordType::MX);

        let records = store.get(&query).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn docker_store_populates_the_memory_cache() {
        let cache = Arc::new(MemoryStore::new());
        let engine = MockEngine::new(vec![ContainerView::with_top_ip(
            "cid-a", "a.lab", "10.0.0.2",
        )]);
        let mut store = DockerStore::new(Arc::new(engine));
        store.set_cache(Arc::clone(&cache));

        let query = a_query("a.lab.");
        store.get(&query).await.unwrap();

        assert_eq!(cache.get(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chain_short_circuits_on_first_hit() {
        let memory = Arc::new(MemoryStore::new());
        let query = a_query("x.lab.");
        let cached = a_record("x.lab.", Ipv4Addr::new(10, 9, 9, 9));
        memory.set(&query, "cid-1", vec![cached.clone()]).await;

        // The docker store would answer differently; the memory hit
        // must win.
        let engine = MockEngine::new(vec![ContainerView::with_top_ip(
            "cid-1", "x.lab", "10.0.0.5",
        )]);
        let chain = ChainStore::new(vec![
            memory,
            Arc::new(DockerStore::new(Arc::new(engine))),
        ]);

        let records = chain.get(&query).await.unwrap();
        assert_eq!(records, vec![cached]);
    }

    #[tokio::test]
    async fn chain_falls_through_not_found() {
        let memory = Arc::new(MemoryStore::new());
        let engine = MockEngine::new(vec![ContainerView::with_top_ip(
            "cid-1", "x.lab", "10.0.0.5",
        )]);
        let chain = ChainStore::new(vec![
            memory,
            Arc::new(DockerStore::new(Arc::new(engine))),
        ]);

        let records = chain.get(&a_query("x.lab.")).await.unwrap();
        assert_eq!(records.len(), 1);

        assert!(matches!(
            chain.get(&a_query("missing.lab.")).await,
            Err(StoreError::NotFound)
        ));
    }
}
