//! Per-connection proxy session.
//!
//! Each accepted client runs ReadRequest → Dispatch → Get/Post flow inside
//! its own task. Every error is handled here: the client gets a fixed error
//! response where possible and the connection closes; nothing propagates to
//! the listener.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::cache::{CacheMeta, CacheStore, cache_key};
use super::http::{
    Conditionals, Request, ResponseInfo, build_forward_request, parse_response_head, read_head,
    read_request, simple_response,
};
use crate::types::now;

/// Upstream connects must finish within this.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const IO_BUF_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("resolving {0} failed: {1}")]
    Resolve(String, io::Error),
    #[error("connect to {0} failed: {1}")]
    Connect(String, io::Error),
    #[error("connect to {0} timed out")]
    Timeout(String),
}

/// Runs one client connection to completion.
pub async fn handle_client(mut stream: TcpStream, store: Arc<CacheStore>) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            warn!("bad request: {}", e);
            let body = simple_response(400, "Bad Request", "malformed request\n");
            let _ = stream.write_all(&body).await;
            return;
        }
    };

    if request.is_get() {
        get_flow(stream, request, store).await;
    } else if request.is_post() {
        info!("POST request: {}", request.absolute_url());
        post_flow(stream, request).await;
    } else {
        debug!("unsupported method: {}", request.method);
        let body = simple_response(501, "Not Implemented", "only GET and POST are supported\n");
        let _ = stream.write_all(&body).await;
    }
}

/// GET: fresh hit replays from disk; otherwise fetch from the origin with
/// conditionals, refresh on 304, and tee cacheable 200s to disk.
async fn get_flow(mut client: TcpStream, request: Request, store: Arc<CacheStore>) {
    let url = request.absolute_url();
    let key = cache_key(&url);

    let meta = store.read_meta(&key).await;
    if let Some(meta) = &meta {
        if meta.is_fresh(now()) {
            info!("cache hit: {} ({})", url, key);
            match store.open_body(&key).await {
                Ok(mut body) => {
                    let _ = tokio::io::copy(&mut body, &mut client).await;
                    return;
                }
                Err(e) => warn!("cached body for {} unreadable ({}), refetching", url, e),
            }
        }
    }
    info!("cache miss: {} ({})", url, key);

    let conditionals = meta
        .as_ref()
        .map(|m| Conditionals {
            if_modified_since: m.last_modified.clone(),
            if_none_match: m.etag.clone(),
        })
        .unwrap_or_default();
    let forward = build_forward_request(&request, &conditionals);

    let mut origin = match connect_to_origin(&request.host, request.port).await {
        Ok(origin) => origin,
        Err(e) => {
            error!("origin unreachable for {}: {}", url, e);
            let body = simple_response(502, "Bad Gateway", "could not connect to upstream\n");
            let _ = client.write_all(&body).await;
            return;
        }
    };

    if let Err(e) = origin.write_all(&forward).await {
        error!("failed to send upstream request for {}: {}", url, e);
        let body = simple_response(502, "Bad Gateway", "failed to send upstream request\n");
        let _ = client.write_all(&body).await;
        return;
    }

    let (resp_buf, header_len) = match read_head(&mut origin).await {
        Ok(head) => head,
        Err(e) => {
            error!("failed to read upstream response for {}: {}", url, e);
            let body = simple_response(502, "Bad Gateway", "failed to read upstream response\n");
            let _ = client.write_all(&body).await;
            return;
        }
    };
    let info = match parse_response_head(&resp_buf[..header_len]) {
        Ok(info) => info,
        Err(e) => {
            error!("bad upstream response for {}: {}", url, e);
            let body = simple_response(502, "Bad Gateway", "bad upstream response\n");
            let _ = client.write_all(&body).await;
            return;
        }
    };

    if info.status == 304 {
        if let Some(mut meta) = meta {
            info!("revalidated, serving cached body (304): {}", url);
            meta.apply_response(&info, now());
            meta.stored_at = now();
            if let Err(e) = store.write_meta(&key, &meta).await {
                warn!("metadata refresh for {} failed: {}", url, e);
            }
            match store.open_body(&key).await {
                Ok(mut body) => {
                    let _ = tokio::io::copy(&mut body, &mut client).await;
                }
                Err(e) => {
                    error!("cached body for {} unreadable after revalidation: {}", url, e);
                    let body =
                        simple_response(502, "Bad Gateway", "failed to read upstream response\n");
                    let _ = client.write_all(&body).await;
                }
            }
            return;
        }
    }

    let cacheable = info.status == 200 && !info.no_store;
    if !cacheable {
        debug!("response for {} not cacheable (status={}, no_store={})", url, info.status, info.no_store);
    }
    stream_response(origin, client, &store, &key, &info, &resp_buf, cacheable).await;
}

/// POST: forward request and body, stream the response back, never cache.
async fn post_flow(mut client: TcpStream, request: Request) {
    let forward = build_forward_request(&request, &Conditionals::default());

    let mut origin = match connect_to_origin(&request.host, request.port).await {
        Ok(origin) => origin,
        Err(e) => {
            error!("origin unreachable: {}", e);
            let body = simple_response(502, "Bad Gateway", "could not connect to upstream\n");
            let _ = client.write_all(&body).await;
            return;
        }
    };

    let sent = async {
        origin.write_all(&forward).await?;
        if !request.body.is_empty() {
            origin.write_all(&request.body).await?;
        }
        Ok::<_, io::Error>(())
    }
    .await;
    if let Err(e) = sent {
        error!("failed to send POST upstream: {}", e);
        let body = simple_response(502, "Bad Gateway", "failed to send upstream request\n");
        let _ = client.write_all(&body).await;
        return;
    }

    let (resp_buf, _header_len) = match read_head(&mut origin).await {
        Ok(head) => head,
        Err(e) => {
            error!("failed to read upstream response: {}", e);
            let body = simple_response(502, "Bad Gateway", "failed to read upstream response\n");
            let _ = client.write_all(&body).await;
            return;
        }
    };

    if client.write_all(&resp_buf).await.is_err() {
        return;
    }
    let mut chunk = [0u8; IO_BUF_SIZE];
    loop {
        match origin.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if client.write_all(&chunk[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Streams the rest of the origin response to the client, teeing into a temp
/// cache file when `cacheable`. The body commits only on clean upstream EOF;
/// the metadata record follows the body. Cache failures never interrupt the
/// client stream.
async fn stream_response(
    mut origin: TcpStream,
    mut client: TcpStream,
    store: &Arc<CacheStore>,
    key: &str,
    info: &ResponseInfo,
    buffered: &[u8],
    cacheable: bool,
) {
    let mut writer = if cacheable {
        match store.begin_body(key).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!("could not open cache temp file for {}: {}", key, e);
                None
            }
        }
    } else {
        None
    };

    if client.write_all(buffered).await.is_err() {
        return; // writer drop unlinks the temp file
    }
    if let Some(mut w) = writer.take() {
        if w.write(buffered).await.is_ok() {
            writer = Some(w);
        }
    }

    let mut chunk = [0u8; IO_BUF_SIZE];
    loop {
        let n = match origin.read(&mut chunk).await {
            Ok(0) => break, // clean end of stream
            Ok(n) => n,
            Err(e) => {
                debug!("upstream read for {} failed mid-stream: {}", key, e);
                return;
            }
        };
        if client.write_all(&chunk[..n]).await.is_err() {
            return;
        }
        if let Some(mut w) = writer.take() {
            if w.write(&chunk[..n]).await.is_ok() {
                writer = Some(w);
            }
        }
    }

    if let Some(writer) = writer {
        if let Err(e) = writer.commit().await {
            warn!("cache commit for {} failed: {}", key, e);
            return;
        }
        let mut meta = CacheMeta {
            stored_at: now(),
            ..Default::default()
        };
        meta.apply_response(info, now());
        if let Err(e) = store.write_meta(key, &meta).await {
            warn!("metadata write for {} failed: {}", key, e);
        }
    }
}

/// Opens a TCP connection to the origin, trying each resolved address under
/// a finite timeout.
async fn connect_to_origin(host: &str, port: u16) -> Result<TcpStream, OriginError> {
    let target = format!("{host}:{port}");
    let addrs: Vec<_> = lookup_host(target.as_str())
        .await
        .map_err(|e| OriginError::Resolve(target.clone(), e))?
        .collect();

    let mut last: Option<OriginError> = None;
    for addr in addrs {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last = Some(OriginError::Connect(target.clone(), e)),
            Err(_) => last = Some(OriginError::Timeout(target.clone())),
        }
    }
    Err(last.unwrap_or_else(|| {
        OriginError::Resolve(
            target.clone(),
            io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        )
    }))
}
