//! HTTP/1.x framing for the proxy: request reading and parsing, forwarding
//! request construction, and response-head extraction.
//!
//! The proxy speaks HTTP/1.0 upstream regardless of what the client sent.
//! Only the cache-relevant response headers are interpreted; everything else
//! passes through as opaque bytes.

use std::io;

use chrono::DateTime;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap on a request or response header block, end-of-headers marker included.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Cap on a request body declared via Content-Length.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Product token added when the client sends no User-Agent.
pub const USER_AGENT: &str = concat!("waypost/", env!("CARGO_PKG_VERSION"));

/// Hop-by-hop headers stripped when forwarding (RFC 2616 §13.5.1 plus
/// Proxy-Connection).
const HOP_BY_HOP: [&str; 7] = [
    "Connection",
    "Proxy-Connection",
    "Keep-Alive",
    "Transfer-Encoding",
    "TE",
    "Trailer",
    "Upgrade",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("connection closed before end of headers")]
    ConnectionClosed,
    #[error("header block exceeds {MAX_HEADER_SIZE} bytes")]
    HeadersTooLarge,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("missing Host header")]
    MissingHost,
    #[error("bad host or port")]
    BadHost,
    #[error("https is not supported")]
    HttpsUnsupported,
    #[error("unrecognized url scheme")]
    BadScheme,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("connection closed before end of body")]
    ShortBody,
    #[error("malformed response head")]
    BadResponse,
    #[error("read failed: {0}")]
    Io(String),
}

impl From<io::Error> for HttpError {
    fn from(e: io::Error) -> Self {
        HttpError::Io(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A parsed client request with its origin already resolved.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl Request {
    /// First header value with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// The absolute URL the cache is keyed by.
    pub fn absolute_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    pub fn is_post(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST")
    }
}

/// Offset just past the `\r\n\r\n` marker, if present.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Reads from `stream` until the end-of-headers marker.
///
/// Returns the accumulated buffer (which may already contain body bytes) and
/// the header-block length. A block that reaches [`MAX_HEADER_SIZE`] bytes,
/// marker included, is rejected.
pub async fn read_head<R>(stream: &mut R) -> Result<(Vec<u8>, usize), HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let mut scanned = 0usize;

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);

        let from = scanned.saturating_sub(3);
        if let Some(at) = find_header_end(&buf[from..]) {
            let header_len = from + at;
            if header_len >= MAX_HEADER_SIZE {
                return Err(HttpError::HeadersTooLarge);
            }
            return Ok((buf, header_len));
        }
        scanned = buf.len();

        if buf.len() >= MAX_HEADER_SIZE {
            return Err(HttpError::HeadersTooLarge);
        }
    }
}

/// Reads and parses a complete client request: head, origin resolution, and
/// the POST body when Content-Length declares one.
pub async fn read_request<R>(stream: &mut R) -> Result<Request, HttpError>
where
    R: AsyncRead + Unpin,
{
    let (buf, header_len) = read_head(stream).await?;
    let mut req = parse_request_head(&buf[..header_len])?;

    let content_length = match req.header("Content-Length") {
        Some(v) => {
            let n = v.trim().parse::<i64>().unwrap_or(0);
            if n < 0 || n as usize > MAX_BODY_SIZE {
                return Err(HttpError::BodyTooLarge);
            }
            n as usize
        }
        None => 0,
    };

    if req.is_post() && content_length > 0 {
        let mut body = Vec::with_capacity(content_length);
        let buffered = &buf[header_len..];
        let take = buffered.len().min(content_length);
        body.extend_from_slice(&buffered[..take]);

        while body.len() < content_length {
            let mut chunk = vec![0u8; (content_length - body.len()).min(8192)];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(HttpError::ShortBody);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        req.body = body;
    }

    resolve_origin(&mut req)?;
    Ok(req)
}

/// Parses the request line and header list out of one header block.
pub fn parse_request_head(head: &[u8]) -> Result<Request, HttpError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HttpError::BadRequestLine)?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().unwrap_or("").to_string();
    let url = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("").to_string();
    if method.is_empty() || url.is_empty() || version.is_empty() {
        return Err(HttpError::BadRequestLine);
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        // Lines without a colon are skipped rather than failing the request.
        if let Some((name, value)) = line.split_once(':') {
            headers.push(Header {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }

    Ok(Request {
        method,
        url,
        version,
        host: String::new(),
        port: 80,
        path: String::new(),
        headers,
        body: Vec::new(),
    })
}

/// Splits `host[:port]`, leaving bracketed IPv6 literals whole.
fn parse_host_port(hostport: &str) -> Result<(String, u16), HttpError> {
    if let Some(colon) = hostport.rfind(':') {
        if !hostport[colon + 1..].contains(']') {
            let host = &hostport[..colon];
            let port: u32 = hostport[colon + 1..].parse().map_err(|_| HttpError::BadHost)?;
            if host.is_empty() || port == 0 || port > 65535 {
                return Err(HttpError::BadHost);
            }
            return Ok((host.to_string(), port as u16));
        }
    }
    if hostport.is_empty() {
        return Err(HttpError::BadHost);
    }
    Ok((hostport.to_string(), 80))
}

/// Fills in (host, port, path) from the request URL, falling back to the
/// Host header for origin-form requests. HTTPS and unknown schemes are
/// refused.
fn resolve_origin(req: &mut Request) -> Result<(), HttpError> {
    // Some clients prefix the absolute URL with a stray slash.
    let url: &str = if req.url.starts_with("/http://") {
        &req.url[1..]
    } else {
        &req.url
    };

    if url.len() >= 7 && url[..7].eq_ignore_ascii_case("http://") {
        let rest = &url[7..];
        let (hostport, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };
        let (host, port) = parse_host_port(hostport)?;
        req.host = host;
        req.port = port;
        req.path = path.to_string();
        return Ok(());
    }

    if url.len() >= 8 && url[..8].eq_ignore_ascii_case("https://") {
        return Err(HttpError::HttpsUnsupported);
    }

    if url.starts_with('/') {
        let host_header = req
            .header("Host")
            .map(str::to_string)
            .ok_or(HttpError::MissingHost)?;
        let (host, port) = parse_host_port(&host_header)?;
        req.host = host;
        req.port = port;
        req.path = url.to_string();
        return Ok(());
    }

    Err(HttpError::BadScheme)
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Conditional headers injected from cache metadata.
#[derive(Debug, Clone, Default)]
pub struct Conditionals {
    pub if_modified_since: Option<String>,
    pub if_none_match: Option<String>,
}

/// Builds the upstream request head.
///
/// The request line carries the origin path and HTTP/1.0. `Host` appears
/// exactly once; hop-by-hop headers and client-supplied conditionals are
/// dropped; a User-Agent is added when the client had none; POST keeps its
/// Content-Length; the head always ends with `Connection: close`.
pub fn build_forward_request(req: &Request, conditionals: &Conditionals) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("{} {} HTTP/1.0\r\n", req.method, req.path));
    out.push_str(&format!("Host: {}\r\n", req.host));

    let mut has_user_agent = false;
    let mut has_content_length = false;

    for header in &req.headers {
        let name = header.name.as_str();
        if name.eq_ignore_ascii_case("Host") {
            continue;
        }
        if name.eq_ignore_ascii_case("If-Modified-Since")
            || name.eq_ignore_ascii_case("If-None-Match")
        {
            continue;
        }
        if is_hop_by_hop(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("User-Agent") {
            has_user_agent = true;
        }
        if name.eq_ignore_ascii_case("Content-Length") {
            has_content_length = true;
        }
        out.push_str(&format!("{}: {}\r\n", header.name, header.value));
    }

    if !has_user_agent {
        out.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
    }
    if req.is_post() && !has_content_length {
        out.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
    }

    if let Some(since) = &conditionals.if_modified_since {
        out.push_str(&format!("If-Modified-Since: {since}\r\n"));
    }
    if let Some(etag) = &conditionals.if_none_match {
        out.push_str(&format!("If-None-Match: {etag}\r\n"));
    }

    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

/// Cache-relevant fields extracted from an upstream response head.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub status: u16,
    pub max_age: Option<u64>,
    pub expires: Option<u64>,
    pub no_store: bool,
    pub no_cache: bool,
    pub must_revalidate: bool,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// Parses the status line and the cache-relevant headers of a response head.
pub fn parse_response_head(head: &[u8]) -> Result<ResponseInfo, HttpError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(HttpError::BadResponse)?;
    let mut parts = status_line.split_ascii_whitespace();
    let proto = parts.next().ok_or(HttpError::BadResponse)?;
    if !proto.starts_with("HTTP/") {
        return Err(HttpError::BadResponse);
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(HttpError::BadResponse)?;

    let mut info = ResponseInfo {
        status,
        ..Default::default()
    };

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("Cache-Control") {
            parse_cache_control(value, &mut info);
        } else if name.eq_ignore_ascii_case("Expires") {
            info.expires = parse_http_date(value);
        } else if name.eq_ignore_ascii_case("Last-Modified") {
            info.last_modified = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("ETag") {
            info.etag = Some(value.to_string());
        }
    }

    Ok(info)
}

/// Case-insensitive directive scan. `no-cache` implies must-revalidate;
/// directive arguments are not honored.
fn parse_cache_control(value: &str, info: &mut ResponseInfo) {
    let lower = value.to_ascii_lowercase();

    if lower.contains("no-store") {
        info.no_store = true;
    }
    if lower.contains("no-cache") {
        info.no_cache = true;
        info.must_revalidate = true;
    }
    if lower.contains("must-revalidate") {
        info.must_revalidate = true;
    }

    if let Some(at) = lower.find("max-age=") {
        let rest = &lower[at + 8..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(secs) = digits.parse::<u64>() {
            info.max_age = Some(secs);
        }
    }
}

/// RFC 1123 date (`Tue, 15 Nov 1994 08:12:31 GMT`) to epoch seconds.
pub fn parse_http_date(value: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc2822(value).ok()?;
    u64::try_from(parsed.timestamp()).ok()
}

/// A fixed, minimal error response simple clients can render.
pub fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}
