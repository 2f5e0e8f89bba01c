//! Proxy integration tests against a scripted local origin server.
//!
//! The origin serves a fixed sequence of canned responses and records every
//! request it sees, so the tests can assert both what reached the client and
//! whether the proxy touched the upstream at all.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use waypost::proxy::{CacheStore, ProxyServer, cache_key};

struct Origin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

/// Serves each canned response to one connection, in order, recording the
/// request head (and body, when Content-Length declares one).
async fn spawn_origin(responses: Vec<Vec<u8>>) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let hit_count = Arc::clone(&hits);
    let request_log = Arc::clone(&requests);
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            hit_count.fetch_add(1, Ordering::SeqCst);

            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_len = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break buf.len();
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(at) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break at + 4;
                }
            };

            // Read a declared body so POST requests are captured whole.
            let head = String::from_utf8_lossy(&buf[..header_len]).to_string();
            let content_length = head
                .lines()
                .find_map(|l| {
                    let lower = l.to_ascii_lowercase();
                    lower
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().to_string())
                })
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < header_len + content_length {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            request_log.lock().await.push(String::from_utf8_lossy(&buf).to_string());
            stream.write_all(&response).await.unwrap();
            // Closing the stream marks end of response (HTTP/1.0 style).
        }
    });

    Origin {
        addr,
        hits,
        requests,
    }
}

fn test_cache_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("waypost_proxy_{}_{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

async fn spawn_proxy(tag: &str) -> (SocketAddr, Arc<CacheStore>, PathBuf) {
    let dir = test_cache_dir(tag);
    let store = Arc::new(CacheStore::open(&dir).unwrap());
    let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&store))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, store, dir)
}

/// Sends one raw request through the proxy and reads until the proxy closes.
async fn roundtrip(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

async fn get(proxy: SocketAddr, url: &str) -> Vec<u8> {
    roundtrip(proxy, format!("GET {url} HTTP/1.0\r\n\r\n").as_bytes()).await
}

fn read_meta_field(dir: &std::path::Path, key: &str, field: &str) -> Option<u64> {
    let text = std::fs::read_to_string(dir.join(format!("{key}.meta"))).ok()?;
    text.lines()
        .find_map(|l| l.strip_prefix(&format!("{field}=")))
        .and_then(|v| v.parse().ok())
}

#[tokio::test]
async fn cache_miss_then_fresh_hit() {
    let response = b"HTTP/1.0 200 OK\r\n\
                     Cache-Control: max-age=600\r\n\
                     Last-Modified: Tue, 15 Nov 1994 08:12:31 GMT\r\n\
                     Content-Length: 5\r\n\
                     \r\n\
                     HELLO"
        .to_vec();
    let origin = spawn_origin(vec![response.clone()]).await;
    let (proxy, _store, dir) = spawn_proxy("hit").await;
    let url = format!("http://127.0.0.1:{}/foo", origin.addr.port());

    let first = get(proxy, &url).await;
    assert!(first.ends_with(b"HELLO"));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    // The committed blob is the full upstream response, byte for byte.
    let key = cache_key(&url);
    let blob = std::fs::read(dir.join(format!("{key}.cache"))).unwrap();
    assert_eq!(blob, response);

    // Replayed verbatim from the cache: byte-identical, no origin contact.
    let second = get(proxy, &url).await;
    assert_eq!(second, first);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_entry_revalidates_with_304() {
    let last_modified = "Tue, 15 Nov 1994 08:12:31 GMT";
    let first_response = format!(
        "HTTP/1.0 200 OK\r\n\
         Cache-Control: max-age=0\r\n\
         Last-Modified: {last_modified}\r\n\
         Content-Length: 5\r\n\
         \r\n\
         HELLO"
    )
    .into_bytes();
    let not_modified = b"HTTP/1.0 304 Not Modified\r\n\r\n".to_vec();

    let origin = spawn_origin(vec![first_response, not_modified]).await;
    let (proxy, _store, dir) = spawn_proxy("revalidate").await;
    let url = format!("http://127.0.0.1:{}/foo", origin.addr.port());
    let key = cache_key(&url);

    let first = get(proxy, &url).await;
    assert!(first.ends_with(b"HELLO"));
    let stored_at_before = read_meta_field(&dir, &key, "stored_at").unwrap();

    // stored_at has one-second granularity.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let second = get(proxy, &url).await;
    assert!(second.ends_with(b"HELLO"));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);

    let revalidation = origin.requests.lock().await[1].clone();
    assert!(revalidation.contains(&format!("If-Modified-Since: {last_modified}\r\n")));

    let stored_at_after = read_meta_field(&dir, &key, "stored_at").unwrap();
    assert!(stored_at_after > stored_at_before);
}

#[tokio::test]
async fn no_store_bypasses_the_cache() {
    let response = b"HTTP/1.0 200 OK\r\n\
                     Cache-Control: no-store\r\n\
                     Content-Length: 6\r\n\
                     \r\n\
                     SECRET"
        .to_vec();
    let origin = spawn_origin(vec![response.clone(), response]).await;
    let (proxy, _store, dir) = spawn_proxy("nostore").await;
    let url = format!("http://127.0.0.1:{}/private", origin.addr.port());

    let first = get(proxy, &url).await;
    assert!(first.ends_with(b"SECRET"));

    // Nothing landed on disk.
    let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
    assert!(entries.is_empty());

    // And the second request hits the origin again.
    let second = get(proxy, &url).await;
    assert!(second.ends_with(b"SECRET"));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn post_streams_through_uncached() {
    let response = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
    let origin = spawn_origin(vec![response]).await;
    let (proxy, _store, dir) = spawn_proxy("post").await;
    let url = format!("http://127.0.0.1:{}/submit", origin.addr.port());

    let request = format!("POST {url} HTTP/1.0\r\nContent-Length: 5\r\n\r\nhello");
    let reply = roundtrip(proxy, request.as_bytes()).await;
    assert!(reply.ends_with(b"ok"));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    let seen = origin.requests.lock().await[0].clone();
    assert!(seen.starts_with("POST /submit HTTP/1.0\r\n"));
    assert!(seen.contains("Content-Length: 5\r\n"));
    assert!(seen.ends_with("hello"));
    assert!(seen.contains("Connection: close\r\n"));

    let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn forwarded_request_is_downgraded_and_stripped() {
    let response = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
    let origin = spawn_origin(vec![response]).await;
    let (proxy, _store, _dir) = spawn_proxy("strip").await;
    let url = format!("http://127.0.0.1:{}/page", origin.addr.port());

    let request = format!(
        "GET {url} HTTP/1.1\r\n\
         Connection: keep-alive\r\n\
         Proxy-Connection: keep-alive\r\n\
         Accept: */*\r\n\
         \r\n"
    );
    roundtrip(proxy, request.as_bytes()).await;

    let seen = origin.requests.lock().await[0].clone();
    assert!(seen.starts_with("GET /page HTTP/1.0\r\n"));
    assert_eq!(seen.matches("Host:").count(), 1);
    assert!(!seen.contains("keep-alive"));
    assert!(!seen.contains("Proxy-Connection"));
    assert!(seen.contains("Accept: */*\r\n"));
    assert!(seen.contains("User-Agent: waypost/"));
    assert!(seen.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn unsupported_method_gets_501() {
    let (proxy, _store, _dir) = spawn_proxy("method").await;
    let reply = roundtrip(proxy, b"DELETE http://example.com/ HTTP/1.0\r\n\r\n").await;
    assert!(reply.starts_with(b"HTTP/1.0 501 Not Implemented\r\n"));
}

#[tokio::test]
async fn https_and_bad_schemes_get_400() {
    let (proxy, _store, _dir) = spawn_proxy("scheme").await;

    let reply = roundtrip(proxy, b"GET https://example.com/ HTTP/1.0\r\n\r\n").await;
    assert!(reply.starts_with(b"HTTP/1.0 400 Bad Request\r\n"));

    let reply = roundtrip(proxy, b"GET ftp://example.com/ HTTP/1.0\r\n\r\n").await;
    assert!(reply.starts_with(b"HTTP/1.0 400 Bad Request\r\n"));
}

#[tokio::test]
async fn unreachable_origin_gets_502() {
    let (proxy, _store, _dir) = spawn_proxy("gateway").await;

    // Bind then drop to find a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let reply = get(proxy, &format!("http://127.0.0.1:{dead_port}/")).await;
    assert!(reply.starts_with(b"HTTP/1.0 502 Bad Gateway\r\n"));
}

#[tokio::test]
async fn uncacheable_status_streams_through() {
    let response = b"HTTP/1.0 404 Not Found\r\nContent-Length: 4\r\n\r\ngone".to_vec();
    let origin = spawn_origin(vec![response.clone(), response]).await;
    let (proxy, _store, dir) = spawn_proxy("status").await;
    let url = format!("http://127.0.0.1:{}/missing", origin.addr.port());

    let reply = get(proxy, &url).await;
    assert!(reply.starts_with(b"HTTP/1.0 404 Not Found\r\n"));
    assert!(reply.ends_with(b"gone"));

    let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
    assert!(entries.is_empty());

    get(proxy, &url).await;
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
}
