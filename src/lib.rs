//! Waypost: a caching HTTP/1.0 forward proxy and an iterative DNS resolver.
//!
//! Both subsystems share one skeleton: a listener hands work to a worker
//! that drives a protocol state machine, with a cache memoizing results
//! under per-entry expiry and a transport doing the wire exchange.

pub mod dns;
pub mod proxy;
pub mod types;

pub use dns::{DnsCache, DnsRecord, RecordType, ResolveError, Resolver};
pub use proxy::{CacheMeta, CacheStore, ProxyServer, cache_key};
pub use types::now;
