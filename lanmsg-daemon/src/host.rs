//! Host listener: always-on accept loop, one task per inbound connection, one envelope each.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lanmsg_core::TransferEnvelope;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::transport::{BindError, Connection, ServerHandle, Transport};

/// Pause after a failed accept (e.g. EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Listening,
    Stopped,
}

type ActiveSet = Arc<Mutex<HashMap<u64, CancellationToken>>>;

struct Running {
    handle: ServerHandle,
    task: JoinHandle<()>,
}

pub struct HostListener {
    transport: Arc<dyn Transport>,
    backlog: u32,
    io_timeout: Duration,
    /// Serializes `start` and `stop` across their awaits.
    lifecycle: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
    state: Mutex<HostState>,
    active: ActiveSet,
}

impl HostListener {
    pub fn new(transport: Arc<dyn Transport>, backlog: u32, io_timeout: Duration) -> Self {
        Self {
            transport,
            backlog,
            io_timeout,
            lifecycle: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
            state: Mutex::new(HostState::Idle),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, cfg: &Config) -> Self {
        Self::new(transport, cfg.listen_backlog, cfg.io_timeout())
    }

    pub fn state(&self) -> HostState {
        *self.state.lock()
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.handle.local_addr())
    }

    /// Connections currently being read.
    pub fn active_connections(&self) -> usize {
        self.active.lock().len()
    }

    /// Bind and start accepting. Every received envelope (or synthetic read failure) goes to `sink`.
    /// No-op returning the bound address when already listening.
    pub async fn start(
        &self,
        addr: SocketAddr,
        sink: mpsc::UnboundedSender<TransferEnvelope>,
    ) -> Result<SocketAddr, BindError> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(local) = self.local_addr() {
            debug!(%local, "host listener already running");
            return Ok(local);
        }
        let handle = self.transport.listen(addr, self.backlog).await?;
        let local = handle.local_addr();
        let task = tokio::spawn(accept_loop(
            handle.clone(),
            self.active.clone(),
            self.io_timeout,
            sink,
        ));
        *self.running.lock() = Some(Running { handle, task });
        *self.state.lock() = HostState::Listening;
        info!(%local, "host listener started");
        Ok(local)
    }

    /// Close the listening socket and every in-flight connection, then wait for all of them.
    /// Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(Running { handle, task }) = self.running.lock().take() else {
            return;
        };
        handle.close();
        {
            let mut active = self.active.lock();
            for token in active.values() {
                token.cancel();
            }
            active.clear();
        }
        drop(handle);
        if let Err(e) = task.await {
            error!(error = %e, "accept loop ended abnormally");
        }
        *self.state.lock() = HostState::Stopped;
        info!("host listener stopped");
    }
}

/// Removes the connection from the active set on every exit path, panics included.
struct ActiveGuard {
    id: u64,
    active: ActiveSet,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
    }
}

async fn accept_loop(
    handle: ServerHandle,
    active: ActiveSet,
    io_timeout: Duration,
    sink: mpsc::UnboundedSender<TransferEnvelope>,
) {
    let mut handlers = JoinSet::new();
    let mut next_id = 0u64;
    loop {
        tokio::select! {
            accepted = handle.accept() => match accepted {
                None => break,
                Some(Ok((mut conn, addr))) => {
                    next_id += 1;
                    let token = CancellationToken::new();
                    // Checked under the lock so `stop` either sees this entry or we see the close.
                    let closed = {
                        let mut set = active.lock();
                        let closed = handle.is_closed();
                        if !closed {
                            set.insert(next_id, token.clone());
                        }
                        closed
                    };
                    if closed {
                        conn.close().await;
                        break;
                    }
                    debug!(%addr, id = next_id, "accepted connection");
                    let guard = ActiveGuard { id: next_id, active: active.clone() };
                    handlers.spawn(handle_connection(conn, guard, token, io_timeout, sink.clone()));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(res) = handlers.join_next(), if !handlers.is_empty() => log_handler_exit(res),
        }
    }
    drop(handle);
    while let Some(res) = handlers.join_next().await {
        log_handler_exit(res);
    }
}

fn log_handler_exit(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!("connection handler panicked");
        }
    }
}

async fn handle_connection(
    mut conn: Connection,
    _guard: ActiveGuard,
    token: CancellationToken,
    io_timeout: Duration,
    sink: mpsc::UnboundedSender<TransferEnvelope>,
) {
    let addr = conn.peer_addr();
    let outcome = tokio::select! {
        _ = token.cancelled() => None,
        res = conn.read_envelope(io_timeout) => Some(res),
    };
    conn.close().await;
    let envelope = match outcome {
        None => {
            debug!(%addr, "connection closed by shutdown");
            return;
        }
        Some(Ok(env)) => {
            debug!(%addr, code = env.code, "envelope received");
            env
        }
        Some(Err(e)) => {
            warn!(%addr, error = %e, "read from client failed");
            TransferEnvelope::read_failure(e.to_string())
        }
    };
    if sink.send(envelope).is_err() {
        debug!(%addr, "no consumer for incoming envelope");
    }
}
