//! UDP and TCP exchanges with a single nameserver.
//!
//! Each call opens a fresh socket, performs one request/response exchange
//! under a wall-clock timeout, and closes the socket on drop. Timeouts do not
//! carry over between operations.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use super::types::MAX_REPLY_SIZE;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to send query: {0}")]
    SendFailed(io::Error),
    #[error("timed out waiting for reply")]
    ReceiveTimeout,
    #[error("reply larger than {MAX_REPLY_SIZE} bytes")]
    OversizedReply,
    #[error("peer closed the connection mid-message")]
    ShortRead,
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed { addr: SocketAddr, source: io::Error },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Sends one datagram to `addr` and waits for a single reply on the same
/// socket. A reply that fills the whole buffer is rejected as oversized.
pub async fn udp_query(
    addr: SocketAddr,
    payload: &[u8],
    wait: Duration,
) -> Result<Vec<u8>, QueryError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await.map_err(|e| QueryError::ConnectFailed {
        addr,
        source: e,
    })?;

    socket.send(payload).await.map_err(QueryError::SendFailed)?;

    let mut buf = vec![0u8; MAX_REPLY_SIZE];
    let n = match timeout(wait, socket.recv(&mut buf)).await {
        Ok(result) => result?,
        Err(_) => return Err(QueryError::ReceiveTimeout),
    };
    if n >= buf.len() {
        return Err(QueryError::OversizedReply);
    }
    buf.truncate(n);
    debug!("udp reply from {}: {} bytes", addr, n);
    Ok(buf)
}

/// The same exchange over TCP with RFC 1035 length framing: a 16-bit
/// big-endian length before both the query and the reply.
pub async fn tcp_query(
    addr: SocketAddr,
    payload: &[u8],
    wait: Duration,
) -> Result<Vec<u8>, QueryError> {
    let mut stream = match timeout(wait, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(QueryError::ConnectFailed { addr, source: e }),
        Err(_) => return Err(QueryError::ConnectTimeout(addr)),
    };

    let mut framed = Vec::with_capacity(payload.len() + 2);
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    timeout(wait, stream.write_all(&framed))
        .await
        .map_err(|_| QueryError::ReceiveTimeout)?
        .map_err(QueryError::SendFailed)?;

    let mut len_buf = [0u8; 2];
    read_exact_timed(&mut stream, &mut len_buf, wait).await?;
    let reply_len = u16::from_be_bytes(len_buf) as usize;
    if reply_len == 0 || reply_len > MAX_REPLY_SIZE {
        return Err(QueryError::OversizedReply);
    }

    let mut reply = vec![0u8; reply_len];
    read_exact_timed(&mut stream, &mut reply, wait).await?;
    debug!("tcp reply from {}: {} bytes", addr, reply_len);
    Ok(reply)
}

async fn read_exact_timed(
    stream: &mut TcpStream,
    buf: &mut [u8],
    wait: Duration,
) -> Result<(), QueryError> {
    match timeout(wait, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(QueryError::ShortRead),
        Ok(Err(e)) => Err(QueryError::Io(e)),
        Err(_) => Err(QueryError::ReceiveTimeout),
    }
}
