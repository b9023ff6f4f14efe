//! Live vehicle position store.
//!
//! [`VehicleStore`] owns one logical subscription to the position feed. A
//! single background task per connection cycle signs a fresh URL, opens the
//! transport, subscribes to the wildcard topic and folds every inbound message
//! into the vehicle table. All mutations go through one `watch` sender, so
//! readers always see a consistent [`Snapshot`].
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──CONNACK──▶ Connected
//!                                 ▲  │                   │
//!                      backoff    │  └──── error ────┐   │ error
//!                                 │                  ▼   ▼
//!                                 └────────────── Errored(reason)
//!
//! any state ──disconnect()──▶ Disconnected
//! ```
//!
//! Errors never clear the table: last known positions stay visible through
//! an outage. Reconnection uses a constant period and never gives up.

pub mod table;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sigv4::Signer;
use crate::transport::{Transport, TransportError, TransportEvent};
pub use table::{parse_message, vehicle_id, MessageError, VehiclePosition, VehicleTable};

/// Capacity of the [`StoreEvent`] broadcast channel.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored(String),
}

/// Consistent view of the store at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub vehicles: VehicleTable,
    pub state: ConnectionState,
    /// Mirrors `state == Connected`; kept as a field for serialized consumers.
    pub is_connected: bool,
    /// Most recent connection failure. Cleared once a connection succeeds.
    pub connection_error: Option<String>,
}

impl Snapshot {
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }
}

/// Change notifications for observers that want deltas instead of snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    VehicleUpdated(VehiclePosition),
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Topic filter covering every vehicle, e.g. `vehicles/#`.
    pub topic: String,
    /// Prepended to 8 random hex characters to form the MQTT client id.
    pub client_id_prefix: String,
    /// Fixed delay between a failure and the next attempt.
    pub reconnect_period: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            topic: "vehicles/#".to_string(),
            client_id_prefix: "VeloApp-".to_string(),
            reconnect_period: Duration::from_millis(2000),
        }
    }
}

/// Handle to the background connection task.
struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    signer: Signer,
    transport: Arc<dyn Transport>,
    settings: StoreSettings,
    snapshot: watch::Sender<Snapshot>,
    events: broadcast::Sender<StoreEvent>,
    worker: Mutex<Option<Worker>>,
}

/// Cheaply cloneable handle; all clones share one connection and table.
#[derive(Clone)]
pub struct VehicleStore {
    shared: Arc<Shared>,
}

impl VehicleStore {
    pub fn new(signer: Signer, transport: Arc<dyn Transport>, settings: StoreSettings) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                signer,
                transport,
                settings,
                snapshot,
                events,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Start connecting in the background and return immediately.
    ///
    /// No-op while a connection task is alive, including while it waits out
    /// the backoff after an error. The task runs until [`Self::disconnect`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn connect(&self) {
        let mut worker = self.shared.lock_worker();
        if worker.is_some() {
            debug!("Store: connect ignored, connection already active");
            return;
        }
        self.shared.set_state(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&self.shared), cancel.clone()));
        *worker = Some(Worker { cancel, handle });
    }

    /// Close the transport, cancel any pending retry and wait for the
    /// connection task to finish. The vehicle table is kept.
    pub async fn disconnect(&self) {
        let worker = self.shared.lock_worker().take();
        if let Some(Worker { cancel, handle }) = worker {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Store: connection task ended abnormally: {e}");
            }
        }
        // A concurrent connect() may already have started a new task.
        if self.shared.lock_worker().is_none() {
            self.shared.set_state(ConnectionState::Disconnected);
            info!("Store: disconnected");
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot.borrow().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.snapshot.borrow().is_connected()
    }

    pub fn vehicle(&self, id: &str) -> Option<VehiclePosition> {
        self.shared.snapshot.borrow().vehicles.get(id).cloned()
    }

    /// Receiver that is marked changed on every table or state update.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Stream of individual changes. Slow receivers observe `Lagged`.
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.shared.events.subscribe()
    }
}

impl Shared {
    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.snapshot.send_if_modified(|snap| {
            if snap.state == state {
                return false;
            }
            match &state {
                ConnectionState::Connected => snap.connection_error = None,
                ConnectionState::Errored(reason) => snap.connection_error = Some(reason.clone()),
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }
            snap.is_connected = state == ConnectionState::Connected;
            snap.state = state.clone();
            true
        });
        if changed {
            let _ = self.events.send(StoreEvent::StateChanged(state));
        }
    }

    fn apply_message(&self, topic: &str, payload: &[u8]) {
        match parse_message(topic, payload) {
            Ok(position) => {
                self.snapshot.send_modify(|snap| {
                    snap.vehicles.insert(position.id.clone(), position.clone());
                });
                let _ = self.events.send(StoreEvent::VehicleUpdated(position));
            }
            Err(MessageError::NoVehicleId(_)) => {
                debug!("Store: dropping message on {topic:?}, no vehicle id");
            }
            Err(e) => warn!("Store: failed to parse message on {topic:?}: {e}"),
        }
    }

    /// Publish `Errored` and return the instant the backoff starts from.
    fn fail(&self, reason: String) -> Instant {
        warn!(
            "Store: connection error: {reason}, reconnecting in {}ms",
            self.settings.reconnect_period.as_millis()
        );
        self.set_state(ConnectionState::Errored(reason));
        Instant::now()
    }

    /// One connection cycle. Returns when the cycle failed, or `None` when
    /// cancelled. The failure is published before the transport is closed.
    async fn attempt(&self, cancel: &CancellationToken) -> Option<Instant> {
        let url = self.signer.sign();
        let client_id = client_id(&self.settings.client_id_prefix);
        info!(
            "Store: connecting to {} ({}) as {client_id}",
            self.signer.host(),
            self.signer.region()
        );

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            opened = self.transport.open(&url, &client_id) => opened,
        };
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(e) => return Some(self.fail(e.to_string())),
        };

        let mut subscribed = false;
        let outcome = loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break None,
                event = conn.next_event() => event,
            };
            match event {
                Some(TransportEvent::Connected) => {
                    info!("Store: connected, subscribing to {}", self.settings.topic);
                    if let Err(e) = conn.subscribe(&self.settings.topic).await {
                        break Some(e.to_string());
                    }
                    subscribed = true;
                    self.set_state(ConnectionState::Connected);
                }
                Some(TransportEvent::Message { topic, payload }) => {
                    if subscribed {
                        self.apply_message(&topic, &payload);
                    } else {
                        debug!("Store: ignoring message on {topic:?} before connect");
                    }
                }
                Some(TransportEvent::Error(reason)) => break Some(reason),
                None => break Some(TransportError::Closed.to_string()),
            }
        };
        let failed_at = outcome.map(|reason| self.fail(reason));
        conn.close().await;
        failed_at
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let period = shared.settings.reconnect_period;
    loop {
        let Some(failed_at) = shared.attempt(&cancel).await else {
            return;
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(failed_at + period) => {}
        }
        shared.set_state(ConnectionState::Connecting);
    }
}

fn client_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &suffix[..8])
}
