//! Socket transport: one-shot TCP connections carrying a single envelope, and the listening socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lanmsg_core::wire::{decode_envelope, encode_envelope, DecodeError, EncodeError};
use lanmsg_core::TransferEnvelope;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const READ_CHUNK: usize = 8 * 1024;

/// Connect parameters: per-attempt timeout and bounded retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Total attempts, including the first.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub probe_on_failure: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConnectOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout(),
            retry_count: cfg.connect_retries,
            retry_delay: cfg.retry_delay(),
            probe_on_failure: cfg.probe_on_failure,
        }
    }
}

/// Every connect attempt failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connect to {addr} failed after {attempts} attempt(s): {reason}")]
pub struct ConnectError {
    pub addr: SocketAddr,
    pub attempts: u32,
    pub reason: String,
}

/// The listening socket could not be set up.
#[derive(Debug, thiserror::Error)]
#[error("bind {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: std::io::Error,
}

/// Failure on an open connection. Terminates that connection only.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("connection closed")]
    Closed,
}

/// Opens connections and listening sockets. [`TcpTransport`] is the real one; tests inject fakes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        addr: SocketAddr,
        opts: &ConnectOptions,
    ) -> Result<Connection, ConnectError>;

    async fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<ServerHandle, BindError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        addr: SocketAddr,
        opts: &ConnectOptions,
    ) -> Result<Connection, ConnectError> {
        let attempts = opts.retry_count.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(opts.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(%addr, attempt, "connected");
                    return Ok(Connection::new(stream, addr));
                }
                Ok(Err(e)) => reason = e.to_string(),
                Err(_) => reason = format!("timed out after {:?}", opts.connect_timeout),
            }
            warn!(%addr, attempt, attempts, %reason, "connect attempt failed");
            if attempt < attempts {
                tokio::time::sleep(jittered(opts.retry_delay)).await;
            }
        }
        if opts.probe_on_failure {
            probe(addr.ip()).await;
        }
        Err(ConnectError {
            addr,
            attempts,
            reason,
        })
    }

    async fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<ServerHandle, BindError> {
        let bind_err = |source| BindError { addr, source };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!(%local_addr, backlog, "listening");
        Ok(ServerHandle {
            inner: Arc::new(ServerInner {
                listener,
                local_addr,
                closed: CancellationToken::new(),
            }),
        })
    }
}

fn jittered(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// One ICMP echo to the unreachable host, logged only.
async fn probe(ip: IpAddr) {
    let mut ping = tokio::process::Command::new("ping");
    ping.args(["-c", "1", &ip.to_string()]).kill_on_drop(true);
    match tokio::time::timeout(PROBE_TIMEOUT, ping.output()).await {
        Ok(Ok(out)) if out.status.success() => info!(%ip, "probe: host answers ping"),
        Ok(Ok(out)) => warn!(%ip, status = %out.status, "probe: no ping reply"),
        Ok(Err(e)) => warn!(%ip, error = %e, "probe: could not run ping"),
        Err(_) => warn!(%ip, "probe: ping timed out"),
    }
}

/// A live TCP stream for exactly one envelope exchange. Closed on `close` or drop.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Write the encoded envelope, flush and shut down the write half.
    pub async fn write_envelope(
        &mut self,
        envelope: &TransferEnvelope,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let bytes = encode_envelope(envelope)?;
        self.write_encoded(&bytes, timeout).await
    }

    /// Write an already-encoded envelope; see [`write_envelope`](Self::write_envelope).
    pub async fn write_encoded(
        &mut self,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await?;
            stream.shutdown().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(res) => res.map_err(ConnectionError::Write),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    /// Read until one envelope decodes. The peer need not shut down its write half;
    /// bytes past the envelope in the same read are a decode error.
    pub async fn read_envelope(
        &mut self,
        timeout: Duration,
    ) -> Result<TransferEnvelope, ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
        match tokio::time::timeout(timeout, read_one(stream)).await {
            Ok(res) => res,
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    /// Idempotent; never fails.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

async fn read_one(stream: &mut TcpStream) -> Result<TransferEnvelope, ConnectionError> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await.map_err(ConnectionError::Read)?;
        if n == 0 {
            return Ok(decode_envelope(&buf)?);
        }
        buf.extend_from_slice(&chunk[..n]);
        // Decoding rejects anything over MAX_ENVELOPE_LEN, which bounds `buf`.
        match decode_envelope(&buf) {
            Err(DecodeError::Truncated) => continue,
            res => return Ok(res?),
        }
    }
}

struct ServerInner {
    listener: TcpListener,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

/// Listening socket. Clones share the socket; it is released when the last clone drops.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Wait for the next peer. `None` once the handle is closed.
    pub async fn accept(&self) -> Option<std::io::Result<(Connection, SocketAddr)>> {
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => None,
            res = self.inner.listener.accept() => {
                Some(res.map(|(stream, addr)| (Connection::new(stream, addr), addr)))
            }
        }
    }

    /// Idempotent; wakes every pending `accept`.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanmsg_core::wire::MAX_ENVELOPE_LEN;

    fn fast_opts(retries: u32) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_millis(500),
            retry_count: retries,
            retry_delay: Duration::from_millis(1),
            probe_on_failure: false,
        }
    }

    async fn unused_port() -> SocketAddr {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    }

    #[tokio::test]
    async fn envelope_crosses_loopback() {
        let server = TcpTransport
            .listen("127.0.0.1:0".parse().unwrap(), 55)
            .await
            .unwrap();
        let addr = server.local_addr();
        let accept = tokio::spawn({
            let server = server.clone();
            async move {
                let (mut conn, _) = server.accept().await.unwrap().unwrap();
                let env = conn.read_envelope(Duration::from_secs(5)).await;
                conn.close().await;
                env
            }
        });
        let mut conn = TcpTransport.connect(addr, &fast_opts(1)).await.unwrap();
        let env = TransferEnvelope::new(200, Some("hi".into()));
        conn.write_envelope(&env, Duration::from_secs(5))
            .await
            .unwrap();
        conn.close().await;
        assert_eq!(accept.await.unwrap().unwrap(), env);
    }

    #[tokio::test]
    async fn connect_gives_up_after_retry_count() {
        let addr = unused_port().await;
        let err = TcpTransport.connect(addr, &fast_opts(3)).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.addr, addr);
    }

    #[tokio::test]
    async fn bind_conflict_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let err = TcpTransport.listen(addr, 55).await.unwrap_err();
        assert_eq!(err.addr, addr);
    }

    #[tokio::test]
    async fn close_ends_accept_and_is_idempotent() {
        let server = TcpTransport
            .listen("127.0.0.1:0".parse().unwrap(), 55)
            .await
            .unwrap();
        let waiting = tokio::spawn({
            let server = server.clone();
            async move { server.accept().await.is_none() }
        });
        tokio::task::yield_now().await;
        server.close();
        server.close();
        assert!(waiting.await.unwrap());
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_decode_error() {
        let server = TcpTransport
            .listen("127.0.0.1:0".parse().unwrap(), 55)
            .await
            .unwrap();
        let addr = server.local_addr();
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (mut conn, _) = server.accept().await.unwrap().unwrap();
        let bytes = encode_envelope(&TransferEnvelope::new(1, Some("abc".into()))).unwrap();
        raw.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
        raw.shutdown().await.unwrap();
        let err = conn.read_envelope(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(DecodeError::Truncated)));
    }

    #[tokio::test]
    async fn envelope_decodes_while_peer_keeps_connection_open() {
        let server = TcpTransport
            .listen("127.0.0.1:0".parse().unwrap(), 55)
            .await
            .unwrap();
        let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
        let (mut conn, _) = server.accept().await.unwrap().unwrap();
        let env = TransferEnvelope::new(200, Some("hi".into()));
        raw.write_all(&encode_envelope(&env).unwrap()).await.unwrap();
        raw.flush().await.unwrap();
        let got = conn.read_envelope(Duration::from_millis(300)).await.unwrap();
        assert_eq!(got, env);
        drop(raw);
    }

    #[tokio::test]
    async fn envelope_split_across_writes_is_reassembled() {
        let server = TcpTransport
            .listen("127.0.0.1:0".parse().unwrap(), 55)
            .await
            .unwrap();
        let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
        let (mut conn, _) = server.accept().await.unwrap().unwrap();
        let env = TransferEnvelope::new(7, Some("y".repeat(3 * READ_CHUNK)));
        let bytes = encode_envelope(&env).unwrap();
        let reader = tokio::spawn(async move { conn.read_envelope(Duration::from_secs(5)).await });
        let (head, tail) = bytes.split_at(5);
        raw.write_all(head).await.unwrap();
        raw.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        raw.write_all(tail).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), env);
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_without_waiting_for_it() {
        let server = TcpTransport
            .listen("127.0.0.1:0".parse().unwrap(), 55)
            .await
            .unwrap();
        let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
        let (mut conn, _) = server.accept().await.unwrap().unwrap();
        // code 1, Some(payload) with a varint u64 length just over the limit.
        let mut header = vec![0x02, 0x01, 253];
        header.extend_from_slice(&(MAX_ENVELOPE_LEN + 1).to_le_bytes());
        header.extend_from_slice(b"xxxx");
        raw.write_all(&header).await.unwrap();
        let err = conn
            .read_envelope(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(DecodeError::TooLarge)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let server = TcpTransport
            .listen("127.0.0.1:0".parse().unwrap(), 55)
            .await
            .unwrap();
        let _raw = TcpStream::connect(server.local_addr()).await.unwrap();
        let (mut conn, _) = server.accept().await.unwrap().unwrap();
        let err = conn
            .read_envelope(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
    }

    #[tokio::test]
    async fn closed_connection_rejects_io() {
        let server = TcpTransport
            .listen("127.0.0.1:0".parse().unwrap(), 55)
            .await
            .unwrap();
        let mut conn = TcpTransport
            .connect(server.local_addr(), &fast_opts(1))
            .await
            .unwrap();
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        let err = conn
            .write_envelope(&TransferEnvelope::new(1, None), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }
}
