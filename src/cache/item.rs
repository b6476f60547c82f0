use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::UpdateMessage;

/// How long an address stays advertised after it was last seen in an
/// upstream answer. A transient upstream miss must not withdraw a
/// route; only a full day of silence does.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-domain cache entry: the set of known addresses, the minimum
/// positive TTL observed since the last reset, and a per-address
/// freshness deadline driving age-out.
#[derive(Debug)]
pub struct CacheItem {
    domain: String,
    state: Mutex<ItemState>,
}

#[derive(Debug)]
struct ItemState {
    /// Minimum strictly-positive TTL seen since the last reset;
    /// zero means no TTL observed yet.
    expire: u32,
    /// Start of the current TTL window.
    now: Instant,
    /// Address -> freshness deadline (last seen + 24 h).
    ext: HashMap<Ipv4Addr, Instant>,
    /// Live addresses; always equals the key set of `ext`.
    record: Vec<Ipv4Addr>,
    /// Withdrawals produced by `reset`, handed out by the next
    /// `add_records` call.
    pending_remove: Vec<Ipv4Addr>,
}

impl CacheItem {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            state: Mutex::new(ItemState {
                expire: 0,
                now: Instant::now(),
                ext: HashMap::new(),
                record: Vec::new(),
                pending_remove: Vec::new(),
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Minimum positive TTL observed since the last reset, seconds.
    pub fn expire(&self) -> u32 {
        self.state.lock().expect("cache item lock poisoned").expire
    }

    /// Snapshot of the live address list.
    pub fn records(&self) -> Vec<Ipv4Addr> {
        self.state
            .lock()
            .expect("cache item lock poisoned")
            .record
            .clone()
    }

    /// Merges one upstream answer into the item and returns the
    /// resulting delta: aged-out addresses in `to_remove` (plus any
    /// withdrawals a preceding `reset` produced), newly-seen ones in
    /// `to_update`. A known address is left untouched; its freshness
    /// deadline is not renewed.
    pub fn add_records(&self, records: &[Ipv4Addr], ttl: u32) -> UpdateMessage {
        let mut state = self.state.lock().expect("cache item lock poisoned");

        if ttl > 0 && (ttl < state.expire || state.expire == 0) {
            state.expire = ttl;
        }

        let mut msg = UpdateMessage {
            to_update: Vec::new(),
            to_remove: std::mem::take(&mut state.pending_remove),
        };

        let now = Instant::now();
        state.prune(now, &mut msg.to_remove);

        let deadline = now + FRESHNESS_WINDOW;
        for &addr in records {
            if state.ext.contains_key(&addr) {
                continue;
            }

            state.ext.insert(addr, deadline);
            state.record.push(addr);
            msg.to_update.push(addr);
        }

        msg
    }

    /// Whether the current TTL window has elapsed.
    pub fn is_expired(&self) -> bool {
        let state = self.state.lock().expect("cache item lock poisoned");
        Instant::now() > state.now + Duration::from_secs(u64::from(state.expire))
    }

    /// Rebases the TTL window and drops addresses whose freshness
    /// deadline has passed; their withdrawals surface on the next
    /// `add_records` call.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("cache item lock poisoned");

        let now = Instant::now();
        state.now = now;
        state.expire = 0;

        let mut removed = std::mem::take(&mut state.pending_remove);
        state.prune(now, &mut removed);
        state.pending_remove = removed;
    }
}

impl ItemState {
    /// Drops every address whose freshness deadline is before `now`,
    /// collecting the casualties and re-deriving `record` from the
    /// survivors.
    fn prune(&mut self, now: Instant, removed: &mut Vec<Ipv4Addr>) {
        let stale: Vec<Ipv4Addr> = self
            .ext
            .iter()
            .filter(|(_, deadline)| now > **deadline)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in stale {
            self.ext.remove(&addr);
            removed.push(addr);
        }

        self.record = self.ext.keys().copied().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn record_set(item: &CacheItem) -> HashSet<Ipv4Addr> {
        item.records().into_iter().collect()
    }

    fn ext_keys(item: &CacheItem) -> HashSet<Ipv4Addr> {
        item.state
            .lock()
            .unwrap()
            .ext
            .keys()
            .copied()
            .collect()
    }

    #[test]
    fn add_records_returns_new_addresses_once() {
        let item = CacheItem::new("example.com");

        let msg = item.add_records(&[addr(1), addr(2)], 300);
        assert_eq!(msg.to_update.len(), 2);
        assert!(msg.to_remove.is_empty());

        let msg = item.add_records(&[addr(1), addr(2)], 300);
        assert!(msg.is_empty());
    }

    #[test]
    fn record_always_matches_ext_keys() {
        let item = CacheItem::new("example.com");

        item.add_records(&[addr(1)], 60);
        assert_eq!(record_set(&item), ext_keys(&item));

        item.add_records(&[addr(2), addr(3)], 30);
        assert_eq!(record_set(&item), ext_keys(&item));

        item.reset();
        item.add_records(&[addr(4)], 10);
        assert_eq!(record_set(&item), ext_keys(&item));
    }

    #[test]
    fn expire_tracks_minimum_positive_ttl() {
        let item = CacheItem::new("example.com");

        item.add_records(&[addr(1)], 300);
        assert_eq!(item.expire(), 300);

        item.add_records(&[addr(2)], 60);
        assert_eq!(item.expire(), 60);

        // Larger and zero TTLs are not adopted.
        item.add_records(&[addr(3)], 600);
        assert_eq!(item.expire(), 60);
        item.add_records(&[addr(4)], 0);
        assert_eq!(item.expire(), 60);
    }

    #[test]
    fn zero_ttl_leaves_expire_unset() {
        let item = CacheItem::new("example.com");
        item.add_records(&[addr(1)], 0);
        assert_eq!(item.expire(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn is_expired_after_ttl_window() {
        let item = CacheItem::new("example.com");
        item.add_records(&[addr(1)], 30);

        assert!(!item.is_expired());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(item.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_address_survives_reset() {
        let item = CacheItem::new("example.com");
        item.add_records(&[addr(1)], 30);

        tokio::time::advance(Duration::from_secs(60)).await;
        item.reset();
        assert_eq!(item.expire(), 0);

        // Still inside the 24-h window: re-adding is not an update.
        let msg = item.add_records(&[addr(1)], 30);
        assert!(msg.is_empty());
        assert_eq!(record_set(&item), ext_keys(&item));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_address_is_withdrawn_and_readded() {
        let item = CacheItem::new("example.com");
        item.add_records(&[addr(1)], 30);

        tokio::time::advance(Duration::from_secs(25 * 60 * 60)).await;
        item.reset();
        assert!(item.records().is_empty());

        // The 24-h window elapsed: the address comes back as both a
        // withdrawal (from the reset prune) and a fresh update.
        let msg = item.add_records(&[addr(1)], 30);
        assert_eq!(msg.to_remove, vec![addr(1)]);
        assert_eq!(msg.to_update, vec![addr(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn add_records_prunes_aged_out_addresses() {
        let item = CacheItem::new("example.com");
        item.add_records(&[addr(1)], 30);

        tokio::time::advance(Duration::from_secs(25 * 60 * 60)).await;

        // No reset in between: the prune inside add_records catches
        // the aged-out address.
        let msg = item.add_records(&[addr(2)], 30);
        assert_eq!(msg.to_remove, vec![addr(1)]);
        assert_eq!(msg.to_update, vec![addr(2)]);
        assert_eq!(record_set(&item), ext_keys(&item));
    }
}
