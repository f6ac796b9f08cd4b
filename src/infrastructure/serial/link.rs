use crate::core::backoff::{BackoffPolicy, RetryError, RetryState};
use crate::core::shutdown::Shutdown;
use crate::domain::config::BAUD_RATE;
use crate::domain::error::{BridgeError, BridgeResult, SerialFault, SerialFaultKind};
use crate::infrastructure::serial::driver::{SerialDriver, SerialStream};
use std::future::ready;
use std::io;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Bytes drained from the serial device in one read.
#[derive(Debug, Clone)]
pub struct SerialMessage {
    pub timestamp: SystemTime,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Faulted,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Closed => write!(f, "closed"),
            LinkState::Opening => write!(f, "opening"),
            LinkState::Open => write!(f, "open"),
            LinkState::Faulted => write!(f, "faulted"),
        }
    }
}

/// Device handle as seen by recovery.
enum Handle<S> {
    /// Never constructed, or the device disappeared underneath it
    Missing,
    /// Constructed but not open
    Closed,
    Open(S),
}

/// The managed connection to the serial device.
///
/// Owns the only handle to the device; reads and fault recovery both run on
/// the task that drives [`SerialLink::run`], so they never overlap.
pub struct SerialLink<D: SerialDriver> {
    device: String,
    baud_rate: u32,
    driver: D,
    handle: Handle<D::Stream>,
    policy: BackoffPolicy,
    shutdown: Shutdown,
    poll_interval: Duration,
    state: watch::Sender<LinkState>,
    buffer: Vec<u8>,
}

impl<D: SerialDriver> SerialLink<D> {
    pub fn new(device: impl Into<String>, driver: D, policy: BackoffPolicy, shutdown: Shutdown) -> Self {
        let (state, _) = watch::channel(LinkState::Closed);

        Self {
            device: device.into(),
            baud_rate: BAUD_RATE,
            driver,
            handle: Handle::Missing,
            policy,
            shutdown,
            poll_interval: Duration::from_millis(10),
            state,
            buffer: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Follow state transitions from another task.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(device = %self.device, from = %previous, to = %state, "Serial link state changed");
        }
    }

    /// Bring the link from `Closed` (or a missing handle) to `Open`.
    pub async fn open(&mut self) -> BridgeResult<()> {
        self.set_state(LinkState::Opening);

        // Restarts share one schedule so a device that keeps vanishing
        // between construct and open is still retried at a bounded rate.
        let mut restart: u32 = 0;
        loop {
            self.construct_with_retry().await?;

            match self.open_with_retry().await {
                Ok(()) => break,
                Err(BridgeError::Device { kind: SerialFaultKind::NotFound, message, .. }) => {
                    self.handle = Handle::Missing;
                    let delay = self.policy.delay_for(restart);
                    warn!(
                        device = %self.device,
                        attempt = restart,
                        delay_ms = delay.as_millis() as u64,
                        "Serial device disappeared while opening, starting over: {}",
                        message
                    );
                    restart = restart.saturating_add(1);

                    if !BackoffPolicy::pause(&self.shutdown, delay).await {
                        return Err(BridgeError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!(device = %self.device, baud_rate = self.baud_rate, "Opened serial port");
        self.set_state(LinkState::Open);
        Ok(())
    }

    async fn construct_with_retry(&mut self) -> BridgeResult<()> {
        let device = self.device.clone();
        let baud_rate = self.baud_rate;
        let driver = &mut self.driver;

        self.policy
            .retry_forever(
                &self.shutdown,
                || ready(driver.construct(&device, baud_rate)),
                |fault: &SerialFault| {
                    matches!(fault.kind, SerialFaultKind::Busy | SerialFaultKind::NotFound)
                },
                |fault, retry| log_retry(&device, "construct", fault, retry),
            )
            .await
            .map_err(|e| into_bridge_error(&self.device, e))?;

        self.handle = Handle::Closed;
        Ok(())
    }

    async fn open_with_retry(&mut self) -> BridgeResult<()> {
        let device = self.device.clone();
        let baud_rate = self.baud_rate;
        let driver = &mut self.driver;

        let stream = self
            .policy
            .retry_forever(
                &self.shutdown,
                || ready(driver.open(&device, baud_rate)),
                |fault: &SerialFault| {
                    matches!(fault.kind, SerialFaultKind::Busy | SerialFaultKind::AccessDenied)
                },
                |fault, retry| log_retry(&device, "open", fault, retry),
            )
            .await
            .map_err(|e| into_bridge_error(&self.device, e))?;

        self.handle = Handle::Open(stream);
        Ok(())
    }

    /// Read everything the device currently has buffered.
    ///
    /// Returns `Ok(None)` when nothing is waiting or the link is not open.
    pub fn drain(&mut self) -> Result<Option<Vec<u8>>, SerialFault> {
        let stream = match &mut self.handle {
            Handle::Open(stream) => stream,
            _ => return Ok(None),
        };

        let available = stream.bytes_available()? as usize;
        if available == 0 {
            return Ok(None);
        }

        self.buffer.resize(available, 0);
        let read = match stream.read_bytes(&mut self.buffer) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e.into()),
        };

        if read == 0 {
            return Ok(None);
        }
        Ok(Some(self.buffer[..read].to_vec()))
    }

    /// Handle a device error and bring the link back to `Open`.
    ///
    /// A device that vanished gets the full construct-and-open sequence; a
    /// handle that merely closed only retries the open step.
    pub async fn recover(&mut self, fault: SerialFault) -> BridgeResult<()> {
        self.set_state(LinkState::Faulted);
        error!(device = %self.device, kind = %fault.kind, error = %fault.message, "Serial port error");

        // Release the stream before any new open attempt
        self.handle = match fault.kind {
            SerialFaultKind::NotFound => Handle::Missing,
            _ => Handle::Closed,
        };

        if matches!(self.handle, Handle::Missing) {
            return self.open().await;
        }

        self.set_state(LinkState::Opening);
        match self.open_with_retry().await {
            Ok(()) => {
                info!(device = %self.device, "Reopened serial port");
                self.set_state(LinkState::Open);
                Ok(())
            }
            Err(BridgeError::Device { kind: SerialFaultKind::NotFound, .. }) => {
                self.handle = Handle::Missing;
                self.open().await
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the device handle.
    pub fn close(&mut self) {
        let was_open = matches!(self.handle, Handle::Open(_));
        self.handle = Handle::Missing;
        self.set_state(LinkState::Closed);
        if was_open {
            info!(device = %self.device, "Closed serial port");
        }
    }

    /// Drain the device until shutdown, posting every non-empty drain to
    /// `events` and recovering from device errors in place.
    ///
    /// Opens the link first if it is not open yet. The handle is released on
    /// every exit path.
    pub async fn run(mut self, events: mpsc::Sender<SerialMessage>) -> BridgeResult<()> {
        let result = self.pump(&events).await;
        self.close();

        match result {
            Err(BridgeError::Cancelled) => Ok(()),
            other => other,
        }
    }

    async fn pump(&mut self, events: &mpsc::Sender<SerialMessage>) -> BridgeResult<()> {
        if self.state() != LinkState::Open {
            self.open().await?;
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match self.drain() {
                Ok(Some(data)) => {
                    debug!(
                        device = %self.device,
                        bytes = data.len(),
                        data = %describe_payload(&data),
                        "Received serial data"
                    );

                    let message = SerialMessage {
                        timestamp: SystemTime::now(),
                        data,
                    };
                    if events.send(message).await.is_err() {
                        debug!(device = %self.device, "Serial event consumer gone, stopping");
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(fault) => self.recover(fault).await?,
            }
        }
    }
}

fn log_retry(device: &str, step: &str, fault: &SerialFault, retry: RetryState) {
    error!(
        device,
        step,
        kind = %fault.kind,
        attempt = retry.attempt,
        delay_ms = retry.delay.as_millis() as u64,
        "Serial port unavailable: {}",
        fault.message
    );
}

fn into_bridge_error(device: &str, error: RetryError<SerialFault>) -> BridgeError {
    match error {
        RetryError::Cancelled => BridgeError::Cancelled,
        RetryError::Permanent(fault) => BridgeError::Device {
            device: device.to_string(),
            kind: fault.kind,
            message: fault.message,
        },
    }
}

/// Render a payload for diagnostics: UTF-8 when it decodes, hex otherwise.
pub fn describe_payload(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.escape_debug().to_string(),
        Err(_) => hex::encode(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::serial::memory::MemoryDevice;
    use proptest::prelude::*;
    use std::time::Instant;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn link(device: &MemoryDevice, shutdown: &Shutdown) -> SerialLink<crate::infrastructure::serial::MemoryDriver> {
        SerialLink::new("virtual0", device.driver(), fast_policy(), shutdown.clone())
            .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_open_transitions_to_open() {
        let device = MemoryDevice::new();
        let shutdown = Shutdown::new();
        let mut link = link(&device, &shutdown);

        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(link.baud_rate(), 9600);
        link.open().await.unwrap();
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(device.open_streams(), 1);

        link.close();
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(device.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_open_retries_each_step_with_its_own_kinds() {
        let device = MemoryDevice::new();
        device.fail_construct(&[SerialFaultKind::NotFound, SerialFaultKind::Busy]);
        device.fail_open(&[SerialFaultKind::AccessDenied, SerialFaultKind::Busy]);
        let shutdown = Shutdown::new();
        let mut link = link(&device, &shutdown);

        link.open().await.unwrap();

        assert_eq!(device.construct_calls(), 3);
        assert_eq!(device.open_calls(), 3);
        assert_eq!(link.state(), LinkState::Open);
    }

    #[tokio::test]
    async fn test_invalid_device_is_structural() {
        let device = MemoryDevice::new();
        device.fail_construct(&[SerialFaultKind::Invalid]);
        let shutdown = Shutdown::new();
        let mut link = link(&device, &shutdown);

        let err = link.open().await.unwrap_err();
        assert!(matches!(err, BridgeError::Device { kind: SerialFaultKind::Invalid, .. }));
        assert_eq!(device.construct_calls(), 1);
        assert_eq!(device.open_calls(), 0);
    }

    #[tokio::test]
    async fn test_access_denied_is_not_retried_when_constructing() {
        let device = MemoryDevice::new();
        device.fail_construct(&[SerialFaultKind::AccessDenied]);
        let shutdown = Shutdown::new();
        let mut link = link(&device, &shutdown);

        let err = link.open().await.unwrap_err();
        assert!(matches!(err, BridgeError::Device { kind: SerialFaultKind::AccessDenied, .. }));
    }

    #[tokio::test]
    async fn test_drain_reads_everything_buffered() {
        let device = MemoryDevice::new();
        let shutdown = Shutdown::new();
        let mut link = link(&device, &shutdown);
        link.open().await.unwrap();

        assert_eq!(link.drain().unwrap(), None);

        device.feed(b"STATUS:");
        device.feed(b"OK\n");
        assert_eq!(link.drain().unwrap(), Some(b"STATUS:OK\n".to_vec()));
        assert_eq!(link.drain().unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_error_only_reopens() {
        let device = MemoryDevice::new();
        let shutdown = Shutdown::new();
        let mut link = link(&device, &shutdown);
        link.open().await.unwrap();

        device.fail_next_read(io::ErrorKind::Other);
        let fault = link.drain().unwrap_err();
        link.recover(fault).await.unwrap();

        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(device.construct_calls(), 1);
        assert_eq!(device.open_calls(), 2);
        assert_eq!(device.open_streams(), 1);
    }

    #[tokio::test]
    async fn test_unplug_triggers_full_reopen() {
        let device = MemoryDevice::new();
        let shutdown = Shutdown::new();
        let mut link = link(&device, &shutdown);
        link.open().await.unwrap();

        device.unplug();
        let fault = link.drain().unwrap_err();
        assert_eq!(fault.kind, SerialFaultKind::NotFound);

        let replug = device.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            replug.plug_in();
        });

        link.recover(fault).await.unwrap();
        assert_eq!(link.state(), LinkState::Open);
        assert!(device.construct_calls() > 2);
        assert_eq!(device.open_streams(), 1);
    }

    #[tokio::test]
    async fn test_run_posts_payloads_and_stops_on_shutdown() {
        let device = MemoryDevice::new();
        let shutdown = Shutdown::new();
        let link = link(&device, &shutdown);
        let mut states = link.subscribe();
        let (tx, mut rx) = mpsc::channel(8);

        let task = tokio::spawn(link.run(tx));
        states.wait_for(|s| *s == LinkState::Open).await.unwrap();

        device.feed(b"hello\n");
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.data, b"hello\n");

        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(device.open_streams(), 0);
        assert_eq!(*states.borrow(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_device() {
        let device = MemoryDevice::absent();
        let shutdown = Shutdown::new();
        let link = SerialLink::new(
            "virtual0",
            device.driver(),
            BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(10)),
            shutdown.clone(),
        );
        let (tx, _rx) = mpsc::channel(1);

        let task = tokio::spawn(link.run(tx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(device.construct_calls(), 1);
    }

    #[tokio::test]
    async fn test_repeated_not_found_on_open_backs_off() {
        let device = MemoryDevice::new();
        device.fail_open(&[SerialFaultKind::NotFound; 4]);
        let shutdown = Shutdown::new();
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40));
        let mut link = SerialLink::new("virtual0", device.driver(), policy, shutdown.clone());

        let started = Instant::now();
        link.open().await.unwrap();

        // 10 + 20 + 40 + 40
        assert!(started.elapsed() >= Duration::from_millis(110), "{:?}", started.elapsed());
        assert_eq!(device.construct_calls(), 5);
        assert_eq!(device.open_calls(), 5);
        assert_eq!(device.open_streams(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_between_restarts() {
        let device = MemoryDevice::new();
        device.fail_open(&[SerialFaultKind::NotFound]);
        let shutdown = Shutdown::new();
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(30));
        let mut link = SerialLink::new("virtual0", device.driver(), policy, shutdown.clone());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let err = tokio::time::timeout(Duration::from_secs(1), link.open())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert_eq!(device.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_reopen_falls_back_to_full_sequence_when_device_vanished() {
        let device = MemoryDevice::new();
        let shutdown = Shutdown::new();
        let mut link = link(&device, &shutdown);
        link.open().await.unwrap();

        device.fail_next_read(io::ErrorKind::Other);
        device.fail_open(&[SerialFaultKind::NotFound]);
        let fault = link.drain().unwrap_err();
        assert_eq!(fault.kind, SerialFaultKind::Io);

        link.recover(fault).await.unwrap();

        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(device.construct_calls(), 2);
        assert_eq!(device.open_calls(), 3);
        assert_eq!(device.open_streams(), 1);
    }

    fn read_fault() -> impl Strategy<Value = io::ErrorKind> {
        prop_oneof![
            Just(io::ErrorKind::Other),
            Just(io::ErrorKind::BrokenPipe),
            Just(io::ErrorKind::NotFound),
            Just(io::ErrorKind::PermissionDenied),
        ]
    }

    // Only kinds each step retries; anything else is structural and ends recovery.
    fn construct_fault() -> impl Strategy<Value = SerialFaultKind> {
        prop_oneof![Just(SerialFaultKind::Busy), Just(SerialFaultKind::NotFound)]
    }

    fn open_fault() -> impl Strategy<Value = SerialFaultKind> {
        prop_oneof![
            Just(SerialFaultKind::Busy),
            Just(SerialFaultKind::AccessDenied),
            Just(SerialFaultKind::NotFound),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_any_fault_sequence_ends_open(
            events in prop::collection::vec(
                (
                    read_fault(),
                    prop::collection::vec(construct_fault(), 0..4),
                    prop::collection::vec(open_fault(), 0..4),
                ),
                1..5,
            )
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            let injected: usize = events.iter().map(|(_, c, o)| c.len() + o.len()).sum();

            let (state, streams, elapsed) = runtime.block_on(async {
                let device = MemoryDevice::new();
                let shutdown = Shutdown::new();
                let policy = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2));
                let mut link = SerialLink::new("virtual0", device.driver(), policy, shutdown);
                link.open().await.unwrap();

                let started = Instant::now();
                for (read, construct, open) in &events {
                    device.fail_construct(construct);
                    device.fail_open(open);
                    device.fail_next_read(*read);

                    let fault = link.drain().unwrap_err();
                    link.recover(fault).await.unwrap();
                }

                (link.state(), device.open_streams(), started.elapsed())
            });

            prop_assert_eq!(state, LinkState::Open);
            prop_assert_eq!(streams, 1);
            // Every injected fault waits at most the cap, plus scheduling slack
            prop_assert!(elapsed < Duration::from_millis(2) * (injected as u32 + 1) + Duration::from_secs(2));
        }
    }

    #[test]
    fn test_describe_payload() {
        assert_eq!(describe_payload(b"STATUS:OK\n"), "STATUS:OK\\n");
        assert_eq!(describe_payload(&[0xff, 0x00]), "ff00");
    }
}
