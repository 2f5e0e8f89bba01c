//! Caching HTTP/1.0 forward proxy.

pub mod cache;
pub mod http;
pub mod server;
pub mod session;

// Re-exports
pub use cache::{BodyWriter, CacheError, CacheMeta, CacheStore, cache_key, fnv1a};
pub use http::{
    Conditionals, Header, HttpError, MAX_BODY_SIZE, MAX_HEADER_SIZE, Request, ResponseInfo,
    build_forward_request, parse_response_head, read_request, simple_response,
};
pub use server::ProxyServer;
pub use session::{OriginError, handle_client};
