use crate::core::backoff::{BackoffPolicy, RetryError};
use crate::core::shutdown::Shutdown;
use crate::domain::error::{BridgeError, BridgeResult, ListenFaultKind};
use crate::infrastructure::tcp::client::{ClientConnection, ClientSink};
use crate::infrastructure::tcp::registry::{ClientRegistry, Visit};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients a write was attempted on
    pub attempted: usize,
    /// Writes that completed
    pub delivered: usize,
    /// Writes that failed; those clients were removed
    pub failed: usize,
    /// Clients found disconnected and removed without a write
    pub pruned: usize,
}

/// TCP listener plus fan-out of serial payloads to every connected client.
pub struct BroadcastServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    accept_poll: Duration,
    write_timeout: Duration,
}

impl BroadcastServer {
    pub const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(100);
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Bind and listen, retrying while the address is in use or the socket
    /// layer reports an error.
    pub async fn start(
        bind_address: &str,
        port: u16,
        registry: Arc<ClientRegistry>,
        policy: &BackoffPolicy,
        shutdown: &Shutdown,
    ) -> BridgeResult<Self> {
        let ip: IpAddr = bind_address.parse().map_err(|e| BridgeError::Config {
            message: format!("invalid bind address '{}': {}", bind_address, e),
        })?;
        let addr = SocketAddr::new(ip, port);

        let listener = policy
            .retry_forever(
                shutdown,
                || TcpListener::bind(addr),
                |e: &io::Error| ListenFaultKind::from_io(e) != ListenFaultKind::Invalid,
                |e, retry| {
                    error!(
                        %addr,
                        code = e.raw_os_error().unwrap_or_default(),
                        attempt = retry.attempt,
                        delay_ms = retry.delay.as_millis() as u64,
                        "[{}]{}",
                        e.raw_os_error().unwrap_or_default(),
                        e
                    );
                },
            )
            .await
            .map_err(|e| match e {
                RetryError::Cancelled => BridgeError::Cancelled,
                RetryError::Permanent(source) => BridgeError::Listen {
                    addr: addr.to_string(),
                    kind: ListenFaultKind::from_io(&source),
                    source,
                },
            })?;

        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Started TCP listener");

        Ok(Self {
            listener,
            local_addr,
            registry,
            accept_poll: Self::DEFAULT_ACCEPT_POLL,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
        })
    }

    pub fn with_accept_poll(mut self, accept_poll: Duration) -> Self {
        self.accept_poll = accept_poll;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn client_count(&self) -> usize {
        self.registry.count().await
    }

    /// Accept clients until shutdown.
    ///
    /// Each wait for a pending connection is bounded by the accept cadence,
    /// and shutdown is observed between and during waits.
    pub async fn accept_loop(&self, shutdown: &Shutdown) -> BridgeResult<()> {
        info!(addr = %self.local_addr, "Accepting clients");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = tokio::time::timeout(self.accept_poll, self.listener.accept()) => {
                    match accepted {
                        // Nothing pending this tick
                        Err(_) => {}
                        Ok(Ok((stream, addr))) => self.admit(stream, addr).await,
                        Ok(Err(e)) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(self.accept_poll) => {}
                            }
                        }
                    }
                }
            }
        }

        info!(addr = %self.local_addr, "Stopped accepting clients");
        Ok(())
    }

    async fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %addr, error = %e, "Failed to disable Nagle on client socket");
        }

        let connection = ClientConnection::new(stream, addr, self.write_timeout);
        let id = connection.id();
        self.registry.add(connection).await;
        let clients = self.registry.count().await;

        info!(peer = %addr, client_id = %id, clients, "Accepted client");
    }

    /// Send one serial payload to every registered client.
    pub async fn broadcast(&self, payload: &[u8]) -> BroadcastReport {
        broadcast_to(&self.registry, payload).await
    }

    /// Close every client connection.
    pub async fn close_clients(&self) -> usize {
        let closed = self.registry.clear().await;
        if closed > 0 {
            info!(closed, "Closed client connections");
        }
        closed
    }
}

/// Fan `payload` out to every client in `registry`.
///
/// Disconnected clients are removed without a write; a failed write removes
/// that client only and the pass continues with the rest. An empty payload
/// touches nothing.
pub async fn broadcast_to<C: ClientSink>(registry: &ClientRegistry<C>, payload: &[u8]) -> BroadcastReport {
    if payload.is_empty() {
        return BroadcastReport::default();
    }

    let attempted = AtomicUsize::new(0);
    let delivered = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let pruned = AtomicUsize::new(0);

    registry
        .for_each(|client| {
            let (attempted, delivered, failed, pruned) = (&attempted, &delivered, &failed, &pruned);
            async move {
                if !client.is_connected() {
                    debug!(peer = %client.peer_addr(), "Client disconnected, removing");
                    pruned.fetch_add(1, Ordering::Relaxed);
                    client.close().await;
                    return Visit::Remove;
                }

                attempted.fetch_add(1, Ordering::Relaxed);
                match client.send(payload).await {
                    Ok(()) => {
                        delivered.fetch_add(1, Ordering::Relaxed);
                        Visit::Keep
                    }
                    Err(e) => {
                        error!(peer = %client.peer_addr(), error = %e, "[TCP Server] Failed to write to client");
                        failed.fetch_add(1, Ordering::Relaxed);
                        client.close().await;
                        Visit::Remove
                    }
                }
            }
        })
        .await;

    BroadcastReport {
        attempted: attempted.into_inner(),
        delivered: delivered.into_inner(),
        failed: failed.into_inner(),
        pruned: pruned.into_inner(),
    }
}
