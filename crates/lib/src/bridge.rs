//! Device bridge: owns the single outbound TCP connection to the device.
//!
//! One bridge exists per relay process and is shared by every session. State,
//! the connection handle, the pending reconnect timer, and the subscriber set sit
//! behind one mutex; each transition publishes its event while the lock is held,
//! so subscribers see events in the order they were generated.
//!
//! Every connection attempt gets a generation number. A connection task whose
//! generation is no longer current has been superseded or torn down and its
//! results are dropped.

use crate::config::DeviceConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Target device: host (IP or name) and TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub host: String,
    pub port: u16,
}

impl DeviceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
}

/// Published to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Status {
        connected: bool,
        error: Option<String>,
    },
    /// Bytes as received from the device, one transport read per event.
    Data(Vec<u8>),
}

impl BridgeEvent {
    fn connected() -> Self {
        BridgeEvent::Status {
            connected: true,
            error: None,
        }
    }

    fn disconnected(error: Option<String>) -> Self {
        BridgeEvent::Status {
            connected: false,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("device not connected")]
    NotConnected,
}

/// Why a connection attempt failed. Never fatal: it drives the reconnect loop.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type SubscriberId = u64;

/// A session's view of the bridge: its id (for [`DeviceBridge::leave`]) and event stream.
pub struct Subscription {
    pub id: SubscriberId,
    pub events: mpsc::UnboundedReceiver<BridgeEvent>,
}

/// The live (connecting or connected) connection.
struct Link {
    generation: u64,
    task: JoinHandle<()>,
    /// Set once the stream is open; the connection task drains it into the socket.
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

struct PendingReconnect {
    ticket: u64,
    task: JoinHandle<()>,
}

struct Inner {
    state: BridgeState,
    address: Option<DeviceAddress>,
    generation: u64,
    link: Option<Link>,
    reconnect: Option<PendingReconnect>,
    next_ticket: u64,
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<BridgeEvent>>,
    next_subscriber: SubscriberId,
}

impl Inner {
    fn publish(&self, event: BridgeEvent) {
        for tx in self.subscribers.values() {
            // A closed receiver belongs to a session that is on its way out.
            let _ = tx.send(event.clone());
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link
            .as_ref()
            .map_or(false, |l| l.generation == generation)
    }

    fn cancel_reconnect(&mut self) {
        if let Some(pending) = self.reconnect.take() {
            pending.task.abort();
            log::debug!("cancelled pending device reconnect");
        }
    }

    fn teardown(&mut self) {
        self.cancel_reconnect();
        if let Some(link) = self.link.take() {
            link.task.abort();
            if let Some(addr) = &self.address {
                log::info!("closed device connection to {}", addr);
            }
        }
        self.state = BridgeState::Disconnected;
        self.address = None;
    }
}

/// Shared handle to the device connection. Create with [`DeviceBridge::new`] and
/// pass the `Arc` to every session.
pub struct DeviceBridge {
    inner: Mutex<Inner>,
    settings: DeviceConfig,
}

impl DeviceBridge {
    pub fn new(settings: DeviceConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: BridgeState::Disconnected,
                address: None,
                generation: 0,
                link: None,
                reconnect: None,
                next_ticket: 0,
                subscribers: HashMap::new(),
                next_subscriber: 0,
            }),
            settings,
        })
    }

    pub async fn state(&self) -> BridgeState {
        self.inner.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == BridgeState::Connected
    }

    /// Address of the current or most recent connection request; `None` after teardown.
    pub async fn address(&self) -> Option<DeviceAddress> {
        self.inner.lock().await.address.clone()
    }

    /// Number of live subscribers (sessions).
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// Register an event sink. Events published after this call are delivered in order.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        inner.subscribers.insert(id, tx);
        Subscription { id, events: rx }
    }

    /// Remove a subscriber. When it was the last one the bridge is torn down under the
    /// same lock, so a session arriving concurrently cannot lose its fresh connection.
    /// Returns the number of subscribers left.
    pub async fn leave(&self, id: SubscriberId) -> usize {
        let mut inner = self.inner.lock().await;
        inner.subscribers.remove(&id);
        let remaining = inner.subscribers.len();
        if remaining == 0 {
            inner.teardown();
        }
        remaining
    }

    /// Connect to `address`, replacing any existing connection (last request wins).
    /// Completion is reported through a status event, not the return value.
    pub async fn connect(self: &Arc<Self>, address: DeviceAddress) {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner, address);
    }

    fn connect_locked(self: &Arc<Self>, inner: &mut Inner, address: DeviceAddress) {
        inner.cancel_reconnect();
        if let Some(old) = inner.link.take() {
            old.task.abort();
            if let Some(prev) = &inner.address {
                log::info!("closing device connection to {} for new request to {}", prev, address);
            }
            inner.publish(BridgeEvent::disconnected(None));
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.state = BridgeState::Connecting;
        inner.address = Some(address.clone());
        log::info!("connecting to device at {}", address);

        let bridge = Arc::clone(self);
        let task = tokio::spawn(async move { bridge.run_link(generation, address).await });
        inner.link = Some(Link {
            generation,
            task,
            writer: None,
        });
    }

    /// Queue bytes for the device. Rejected unless the bridge is Connected.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), BridgeError> {
        let inner = self.inner.lock().await;
        if inner.state != BridgeState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let writer = inner
            .link
            .as_ref()
            .and_then(|l| l.writer.as_ref())
            .ok_or(BridgeError::NotConnected)?;
        writer.send(bytes).map_err(|_| BridgeError::NotConnected)
    }

    /// Close the connection if any, cancel a pending reconnect, and reset to Disconnected.
    pub async fn teardown(&self) {
        self.inner.lock().await.teardown();
    }

    async fn run_link(self: Arc<Self>, generation: u64, address: DeviceAddress) {
        let timeout = self.settings.connect_timeout();
        let attempt =
            tokio::time::timeout(timeout, TcpStream::connect((address.host.as_str(), address.port)))
                .await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.link_failed(generation, ConnectError::Io(e)).await,
            Err(_) => return self.link_failed(generation, ConnectError::Timeout(timeout)).await,
        };
        let _ = stream.set_nodelay(true);

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if !self.link_established(generation, writer_tx).await {
            return;
        }

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; self.settings.read_buffer_size.max(1)];
        let error = loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break None,
                    Ok(n) => self.publish_data(generation, &buf[..n]).await,
                    Err(e) => break Some(e.to_string()),
                },
                outgoing = writer_rx.recv() => match outgoing {
                    Some(bytes) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            break Some(e.to_string());
                        }
                    }
                    None => break None,
                },
            }
        };
        self.link_lost(generation, error).await;
    }

    async fn link_established(&self, generation: u64, writer: mpsc::UnboundedSender<Vec<u8>>) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(generation) {
            return false;
        }
        if let Some(link) = inner.link.as_mut() {
            link.writer = Some(writer);
        }
        inner.state = BridgeState::Connected;
        if let Some(addr) = &inner.address {
            log::info!("connected to device at {}", addr);
        }
        inner.publish(BridgeEvent::connected());
        true
    }

    async fn link_failed(self: &Arc<Self>, generation: u64, error: ConnectError) {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(generation) {
            return;
        }
        inner.link = None;
        inner.state = BridgeState::Disconnected;
        if let Some(addr) = &inner.address {
            log::warn!("device connection to {} failed: {}", addr, error);
        }
        inner.publish(BridgeEvent::disconnected(Some(error.to_string())));
        self.schedule_reconnect(&mut inner);
    }

    async fn link_lost(self: &Arc<Self>, generation: u64, error: Option<String>) {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(generation) {
            return;
        }
        inner.link = None;
        inner.state = BridgeState::Disconnected;
        match (&inner.address, &error) {
            (Some(addr), Some(e)) => log::warn!("device connection to {} lost: {}", addr, e),
            (Some(addr), None) => log::info!("device connection to {} closed", addr),
            _ => {}
        }
        inner.publish(BridgeEvent::disconnected(error));
        self.schedule_reconnect(&mut inner);
    }

    async fn publish_data(&self, generation: u64, bytes: &[u8]) {
        let inner = self.inner.lock().await;
        if inner.is_current(generation) {
            inner.publish(BridgeEvent::Data(bytes.to_vec()));
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        if inner.subscribers.is_empty() {
            log::debug!("no sessions left; not scheduling device reconnect");
            return;
        }
        if inner.address.is_none() {
            return;
        }
        inner.cancel_reconnect();
        inner.next_ticket += 1;
        let ticket = inner.next_ticket;
        let delay = self.settings.reconnect_delay();
        let bridge = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bridge.fire_reconnect(ticket).await;
        });
        inner.reconnect = Some(PendingReconnect { ticket, task });
        log::debug!("device reconnect scheduled in {:?}", delay);
    }

    async fn fire_reconnect(self: &Arc<Self>, ticket: u64) {
        let mut inner = self.inner.lock().await;
        // A cancelled timer may already be past its sleep; the ticket decides.
        if inner.reconnect.as_ref().map(|p| p.ticket) != Some(ticket) {
            return;
        }
        inner.reconnect = None;
        if inner.subscribers.is_empty() {
            return;
        }
        let Some(address) = inner.address.clone() else {
            return;
        };
        log::info!("attempting to reconnect to device at {}", address);
        self.connect_locked(&mut inner, address);
    }
}
