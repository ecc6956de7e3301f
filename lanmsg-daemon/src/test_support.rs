//! Fakes shared by the daemon's unit tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lanmsg_core::{PlatformNotification, ServiceInfo, TransferEnvelope};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::discovery::{ConnectionInfo, DiscoveryBackend, DiscoveryError, NotificationSink};
use crate::transport::{
    BindError, ConnectError, ConnectOptions, Connection, ServerHandle, TcpTransport, Transport,
};

/// Scripted discovery backend: tests push notifications and preset resolutions.
#[derive(Default)]
pub struct FakeBackend {
    registered: Mutex<Option<(String, u16)>>,
    sink: Mutex<Option<NotificationSink>>,
    resolutions: Mutex<HashMap<String, SocketAddr>>,
    info: Mutex<ConnectionInfo>,
    requests: AtomicUsize,
    resolves: AtomicUsize,
}

impl FakeBackend {
    pub fn set_resolution(&self, name: &str, addr: SocketAddr) {
        self.resolutions.lock().insert(name.to_string(), addr);
    }

    pub fn set_connection_info(&self, info: ConnectionInfo) {
        *self.info.lock() = info;
    }

    pub fn push(&self, n: PlatformNotification) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(n);
        }
    }

    pub fn registered(&self) -> Option<(String, u16)> {
        self.registered.lock().clone()
    }

    pub fn is_discovering(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn request_calls(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryBackend for FakeBackend {
    async fn register_local_service(&self, name: &str, port: u16) -> Result<String, DiscoveryError> {
        *self.registered.lock() = Some((name.to_string(), port));
        Ok(name.to_string())
    }

    async fn unregister_local_service(&self) {
        *self.registered.lock() = None;
    }

    async fn start_discovery(&self, sink: NotificationSink) -> Result<(), DiscoveryError> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn stop_discovery(&self) {
        *self.sink.lock() = None;
    }

    async fn request_peers(&self) -> Result<(), DiscoveryError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resolve(&self, service: &ServiceInfo) -> Result<SocketAddr, DiscoveryError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.resolutions
            .lock()
            .get(&service.name)
            .copied()
            .ok_or_else(|| DiscoveryError::Resolution {
                service: service.name.clone(),
                reason: "unknown".to_string(),
            })
    }

    async fn connection_info(&self) -> ConnectionInfo {
        self.info.lock().clone()
    }
}

/// Real TCP underneath; records every connect and can refuse, delay or hang up on chosen addresses.
#[derive(Default)]
pub struct RecordingTransport {
    attempts: Mutex<Vec<SocketAddr>>,
    refused: Mutex<HashSet<SocketAddr>>,
    delays: Mutex<HashMap<SocketAddr, Duration>>,
    hung_up: Mutex<HashSet<SocketAddr>>,
}

impl RecordingTransport {
    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().clone()
    }

    pub fn refuse(&self, addr: SocketAddr) {
        self.refused.lock().insert(addr);
    }

    pub fn delay(&self, addr: SocketAddr, by: Duration) {
        self.delays.lock().insert(addr, by);
    }

    /// Connect succeeds, but the connection is already closed when handed out.
    pub fn hang_up(&self, addr: SocketAddr) {
        self.hung_up.lock().insert(addr);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(
        &self,
        addr: SocketAddr,
        opts: &ConnectOptions,
    ) -> Result<Connection, ConnectError> {
        self.attempts.lock().push(addr);
        if self.refused.lock().contains(&addr) {
            return Err(ConnectError {
                addr,
                attempts: 1,
                reason: "refused by test".to_string(),
            });
        }
        let delay = self.delays.lock().get(&addr).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let once = ConnectOptions {
            retry_count: 1,
            ..opts.clone()
        };
        let mut conn = TcpTransport.connect(addr, &once).await?;
        if self.hung_up.lock().contains(&addr) {
            conn.close().await;
        }
        Ok(conn)
    }

    async fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<ServerHandle, BindError> {
        TcpTransport.listen(addr, backlog).await
    }
}

/// Loopback listener that forwards every decoded envelope.
pub async fn envelope_sink() -> (SocketAddr, mpsc::UnboundedReceiver<TransferEnvelope>) {
    let server = TcpTransport
        .listen("127.0.0.1:0".parse().unwrap(), 55)
        .await
        .unwrap();
    let addr = server.local_addr();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(Ok((mut conn, _))) = server.accept().await {
            if let Ok(env) = conn.read_envelope(Duration::from_secs(5)).await {
                let _ = tx.send(env);
            }
            conn.close().await;
        }
    });
    (addr, rx)
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    l.local_addr().unwrap()
}
