//! Iterative resolution: walk the hierarchy from the roots, following
//! referrals and CNAME chains until an answer, a terminal error, or a cap.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::cache::DnsCache;
use super::transport::{tcp_query, udp_query};
use super::types::{DnsRecord, RecordType, canonical_name, rcode};
use super::wire::{DnsMessage, WireError, build_query, parse_message};

/// The 13 IPv4 root server addresses.
pub const ROOT_SERVERS: [&str; 13] = [
    "198.41.0.4",
    "199.9.14.201",
    "192.33.4.12",
    "199.7.91.13",
    "192.203.230.10",
    "192.5.5.241",
    "192.112.36.4",
    "198.97.190.53",
    "192.36.148.17",
    "192.58.128.30",
    "193.0.14.129",
    "199.7.83.42",
    "202.12.27.33",
];

pub const DNS_PORT: u16 = 53;

/// Cap on the working server list; excess referral entries are discarded in
/// insertion order.
const MAX_SERVERS: usize = 32;

/// Recursion cap for out-of-band NS address resolution.
const MAX_DEPTH: u32 = 10;

/// Outer loop cap; referral chains longer than this fail.
const MAX_ITERATIONS: u32 = 25;

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("NXDOMAIN: domain does not exist")]
    NxDomain,
    #[error("no usable referral")]
    NoReferral,
    #[error("iteration limit exceeded")]
    IterationLimit,
    #[error("resolution depth exceeded")]
    DepthExceeded,
    #[error("no root servers configured")]
    NoRoots,
    #[error("failed to build query: {0}")]
    Wire(#[from] WireError),
}

type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<DnsRecord>, ResolveError>> + Send + 'a>>;

/// Iterative resolver with a shared TTL cache.
///
/// One `resolve` call is sequential; concurrent calls share the cache, which
/// serializes internally.
pub struct Resolver {
    cache: DnsCache,
    roots: Vec<SocketAddr>,
    /// Port for servers learned from referral records.
    server_port: u16,
}

impl Resolver {
    pub fn new() -> Self {
        let roots = ROOT_SERVERS
            .iter()
            .filter_map(|ip| ip.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, DNS_PORT))
            .collect();
        Self {
            cache: DnsCache::new(),
            roots,
            server_port: DNS_PORT,
        }
    }

    /// Resolver rooted at custom servers, with `port` used for servers
    /// learned from referrals.
    pub fn with_roots(roots: Vec<SocketAddr>, port: u16) -> Self {
        Self {
            cache: DnsCache::new(),
            roots,
            server_port: port,
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Resolves (name, qtype) to materialized records.
    ///
    /// Per-server timeouts and parse failures move on to the next server;
    /// NXDOMAIN is terminal. Halts within [`MAX_ITERATIONS`] outer steps.
    pub async fn resolve(
        &self,
        name: &str,
        qtype: RecordType,
    ) -> Result<Vec<DnsRecord>, ResolveError> {
        self.resolve_at_depth(name, qtype, 0).await
    }

    fn resolve_at_depth<'a>(
        &'a self,
        name: &'a str,
        qtype: RecordType,
        depth: u32,
    ) -> ResolveFuture<'a> {
        Box::pin(async move {
            if depth > MAX_DEPTH {
                return Err(ResolveError::DepthExceeded);
            }

            let name = canonical_name(name);
            if let Some(hit) = self.cache.get(&name, qtype).await {
                debug!("answered {} {} from cache", name, qtype);
                return Ok(hit);
            }

            if self.roots.is_empty() {
                return Err(ResolveError::NoRoots);
            }
            let mut servers = self.roots.clone();
            let mut current = name;

            for iteration in 0..MAX_ITERATIONS {
                let mut progressed = false;

                for server in servers.clone() {
                    let id = rand::random::<u16>();
                    let query = build_query(&current, qtype, id)?;

                    let Some(msg) = self.exchange(server, &query, id).await else {
                        continue;
                    };

                    match msg.header.rcode() {
                        rcode::NOERROR => {}
                        rcode::NXDOMAIN => return Err(ResolveError::NxDomain),
                        other => {
                            debug!("server {} returned rcode {}, trying next", server, other);
                            continue;
                        }
                    }

                    // Answer branch: direct matches for the current name.
                    let matches: Vec<DnsRecord> = msg
                        .answers
                        .iter()
                        .filter(|r| {
                            r.name == current
                                && (qtype == RecordType::Any || r.rtype == qtype.code())
                        })
                        .cloned()
                        .collect();
                    if !matches.is_empty() {
                        self.cache.put(&current, qtype, &matches).await;
                        return Ok(matches);
                    }

                    // CNAME branch: rewrite the name and restart at the roots.
                    if qtype != RecordType::Cname {
                        let cname = msg.answers.iter().find(|r| {
                            r.rtype == RecordType::Cname.code() && r.name == current
                        });
                        if let Some(cname) = cname {
                            debug!("following CNAME {} -> {}", current, cname.data);
                            self.cache
                                .put(&current, RecordType::Cname, std::slice::from_ref(cname))
                                .await;
                            current = canonical_name(&cname.data);
                            servers = self.roots.clone();
                            progressed = true;
                            break;
                        }
                    }

                    // Referral branch: NS names from authority, addresses
                    // from glue or, failing that, from recursive resolution.
                    let ns_names: Vec<String> = msg
                        .authorities
                        .iter()
                        .filter(|r| r.rtype == RecordType::Ns.code())
                        .map(|r| canonical_name(&r.data))
                        .collect();
                    if ns_names.is_empty() {
                        continue;
                    }

                    let glue = self.collect_glue(&msg, &ns_names);
                    if !glue.is_empty() {
                        debug!("following glued referral to {} server(s)", glue.len());
                        servers = glue;
                        progressed = true;
                        break;
                    }

                    let mut next = Vec::new();
                    for ns in &ns_names {
                        self.resolve_ns_addresses(ns, depth, &mut next).await;
                        if next.len() >= MAX_SERVERS {
                            break;
                        }
                    }
                    if !next.is_empty() {
                        debug!("referral resolved out of band to {} server(s)", next.len());
                        servers = next;
                        progressed = true;
                        break;
                    }
                }

                if !progressed {
                    return Err(ResolveError::NoReferral);
                }
            }

            Err(ResolveError::IterationLimit)
        })
    }

    /// One query against one server: UDP first, TCP when truncated. Any
    /// failure, including a mismatched transaction id, yields `None` so the
    /// caller can try the next server.
    async fn exchange(&self, server: SocketAddr, query: &[u8], id: u16) -> Option<DnsMessage> {
        debug!("udp query to {}", server);
        let reply = match udp_query(server, query, QUERY_TIMEOUT).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("udp query to {} failed: {}", server, e);
                return None;
            }
        };
        let mut msg = match parse_message(&reply) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("failed to parse udp reply from {}: {}", server, e);
                return None;
            }
        };
        if msg.header.id != id {
            warn!("reply id mismatch from {} (got {}, want {}), discarding", server, msg.header.id, id);
            return None;
        }

        if msg.header.is_truncated() {
            debug!("reply from {} truncated, retrying over tcp", server);
            let reply = match tcp_query(server, query, QUERY_TIMEOUT).await {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("tcp query to {} failed: {}", server, e);
                    return None;
                }
            };
            msg = match parse_message(&reply) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("failed to parse tcp reply from {}: {}", server, e);
                    return None;
                }
            };
            if msg.header.id != id {
                warn!("reply id mismatch from {} (got {}, want {}), discarding", server, msg.header.id, id);
                return None;
            }
        }

        debug!(
            "reply from {}: rcode={}, answers={}, authorities={}, additionals={}",
            server,
            msg.header.rcode(),
            msg.answers.len(),
            msg.authorities.len(),
            msg.additionals.len()
        );
        Some(msg)
    }

    /// Glue: A/AAAA records in the additional section whose owner is one of
    /// the referral's NS names.
    fn collect_glue(&self, msg: &DnsMessage, ns_names: &[String]) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        for rec in &msg.additionals {
            if out.len() >= MAX_SERVERS {
                break;
            }
            if rec.rtype != RecordType::A.code() && rec.rtype != RecordType::Aaaa.code() {
                continue;
            }
            if !ns_names.iter().any(|ns| *ns == rec.name) {
                continue;
            }
            if let Ok(ip) = rec.data.parse::<IpAddr>() {
                out.push(SocketAddr::new(ip, self.server_port));
            }
        }
        out
    }

    /// Resolves a glue-less NS name to addresses, depth-bounded. Failures
    /// leave `out` untouched; the caller falls through to the next NS name.
    async fn resolve_ns_addresses(&self, ns: &str, depth: u32, out: &mut Vec<SocketAddr>) {
        for qtype in [RecordType::A, RecordType::Aaaa] {
            match self.resolve_at_depth(ns, qtype, depth + 1).await {
                Ok(records) => {
                    for rec in records.iter().filter(|r| r.rtype == qtype.code()) {
                        if out.len() >= MAX_SERVERS {
                            return;
                        }
                        if let Ok(ip) = rec.data.parse::<IpAddr>() {
                            out.push(SocketAddr::new(ip, self.server_port));
                        }
                    }
                }
                Err(e) => {
                    debug!("ns {} {} resolution failed: {}", ns, qtype, e);
                }
            }
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
