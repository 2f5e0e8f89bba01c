//! Iterative DNS resolver: wire codec, transport, TTL cache, and the
//! resolution loop.

pub mod cache;
pub mod resolver;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports
pub use cache::DnsCache;
pub use resolver::{DNS_PORT, ROOT_SERVERS, ResolveError, Resolver};
pub use transport::{QueryError, tcp_query, udp_query};
pub use types::{DnsRecord, RecordType, canonical_name};
pub use wire::{DnsHeader, DnsMessage, DnsQuestion, WireError, build_query, parse_message};
