//! TTL-bounded cache of resolved records.
//!
//! Entries are keyed by (canonical name, query type). Each record carries its
//! own absolute expiry; expired records are dropped lazily on lookup and an
//! entry whose records have all expired is unlinked by the probe that finds
//! it empty.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use super::types::{DnsRecord, MAX_RECORDS, RecordType, canonical_name};
use crate::types::now;

#[derive(Debug, Clone)]
struct CachedRecord {
    record: DnsRecord,
    expires_at: u64,
}

/// Shared record cache. Lookup and insert serialize on one mutex; the
/// no-expired-records invariant depends on the read-evict sequence staying
/// atomic.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: Mutex<HashMap<(String, RecordType), Vec<CachedRecord>>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the still-live records for (name, qtype), or `None` on miss.
    /// A hit never contains a record whose expiry has passed.
    pub async fn get(&self, name: &str, qtype: RecordType) -> Option<Vec<DnsRecord>> {
        let key = (canonical_name(name), qtype);
        let current = now();

        let mut entries = self.entries.lock().await;
        let cached = entries.get(&key)?;

        let live: Vec<DnsRecord> = cached
            .iter()
            .filter(|c| c.expires_at > current)
            .map(|c| c.record.clone())
            .collect();

        if live.is_empty() {
            debug!("cache entry {} {} fully expired, unlinking", key.0, qtype);
            entries.remove(&key);
            return None;
        }
        Some(live)
    }

    /// Stores up to [`MAX_RECORDS`] records under (name, qtype), replacing
    /// whatever the entry held before. Each record expires at now + ttl.
    pub async fn put(&self, name: &str, qtype: RecordType, records: &[DnsRecord]) {
        if records.is_empty() {
            return;
        }
        let key = (canonical_name(name), qtype);
        let current = now();

        let cached: Vec<CachedRecord> = records
            .iter()
            .take(MAX_RECORDS)
            .map(|r| CachedRecord {
                record: r.clone(),
                expires_at: current + u64::from(r.ttl),
            })
            .collect();

        debug!("cache store {} {} ({} records)", key.0, qtype, cached.len());
        self.entries.lock().await.insert(key, cached);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
