//! Bridge orchestration.
//!
//! [`Bridge::run`] opens the serial link, starts the broadcast server, then
//! runs three things side by side until shutdown:
//!
//! - the serial task, draining the device and recovering from faults,
//! - the dispatcher, broadcasting each drained payload to every client,
//! - the accept loop, registering new clients.
//!
//! Payloads travel from the serial task to the dispatcher over a bounded
//! channel, so each one is broadcast exactly once and in order. When the
//! dispatcher falls behind, the serial task stops draining and bytes pile up
//! in the OS buffer, coming out as one larger drain later.

use crate::core::backoff::BackoffPolicy;
use crate::core::shutdown::Shutdown;
use crate::domain::config::BridgeConfig;
use crate::domain::error::{BridgeError, BridgeResult};
use crate::infrastructure::serial::{LinkState, SerialDriver, SerialLink, SerialMessage};
use crate::infrastructure::tcp::{BroadcastServer, ClientRegistry};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Payloads queued between the serial task and the dispatcher.
const EVENT_QUEUE_DEPTH: usize = 64;

pub struct Bridge<D: SerialDriver> {
    config: BridgeConfig,
    link: SerialLink<D>,
    registry: Arc<ClientRegistry>,
    shutdown: Shutdown,
}

impl<D: SerialDriver> Bridge<D> {
    pub fn new(config: BridgeConfig, driver: D, shutdown: Shutdown) -> Self {
        let policy = BackoffPolicy::from_config(&config.backoff);
        let link = SerialLink::new(config.serial.port.clone(), driver, policy, shutdown.clone())
            .with_poll_interval(config.serial.poll_interval());

        Self {
            config,
            link,
            registry: Arc::new(ClientRegistry::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Follow the serial link's state.
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// The set of connected clients.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run until shutdown or an unrecoverable error.
    ///
    /// Shutdown during startup is a clean exit. Client sockets and the
    /// serial handle are released on every path out.
    pub async fn run(self) -> BridgeResult<()> {
        let Bridge {
            config,
            mut link,
            registry,
            shutdown,
        } = self;
        let policy = BackoffPolicy::from_config(&config.backoff);

        info!(
            serial_port = %config.serial.port,
            tcp_port = config.tcp.port,
            "Starting serial bridge"
        );

        match link.open().await {
            Ok(()) => {}
            Err(BridgeError::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        }

        let server = match BroadcastServer::start(
            &config.tcp.bind_address,
            config.tcp.port,
            Arc::clone(&registry),
            &policy,
            &shutdown,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                link.close();
                return match e {
                    BridgeError::Cancelled => Ok(()),
                    other => Err(other),
                };
            }
        };
        let server = Arc::new(
            server
                .with_accept_poll(config.tcp.accept_poll())
                .with_write_timeout(config.tcp.write_timeout()),
        );

        let (events, receiver) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let serial_task = {
            // Fires even if the task unwinds: the accept loop never outlives
            // the serial side
            let stop = StopOnExit(shutdown.clone());
            tokio::spawn(async move {
                let _stop = stop;
                let result = link.run(events).await;
                if let Err(e) = &result {
                    error!(error = %e, "Serial link stopped");
                }
                result
            })
        };
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&server), receiver));

        let accept_result = server.accept_loop(&shutdown).await;

        // Whatever ended the accept loop ends everything else too
        shutdown.trigger();
        let serial_result = serial_task.await;
        let dispatch_result = dispatcher.await;

        server.close_clients().await;
        info!("Serial bridge stopped");

        serial_result??;
        dispatch_result?;
        accept_result
    }
}

/// Triggers shutdown when dropped.
struct StopOnExit(Shutdown);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

/// Broadcast every payload posted by the serial task, one at a time.
async fn dispatch(server: Arc<BroadcastServer>, mut events: mpsc::Receiver<SerialMessage>) {
    while let Some(message) = events.recv().await {
        let report = server.broadcast(&message.data).await;
        debug!(
            bytes = message.data.len(),
            delivered = report.delivered,
            failed = report.failed,
            pruned = report.pruned,
            "Broadcast serial payload"
        );
    }
}
