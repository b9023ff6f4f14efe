//! Offline demo feed.
//!
//! Three vehicles shuttle back and forth along short road paths in central
//! Kathmandu. Every tick each vehicle advances one step and publishes a
//! position on `<prefix>/<id>/position`, where `<prefix>` is the first level of
//! the subscribed topic filter. No network is involved; the signed URL is
//! ignored.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde_json::json;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::info;

use super::{Connection, Transport, TransportError, TransportEvent};
use crate::sigv4::SignedUrl;

/// Intermediate points inserted between consecutive waypoints.
const STEPS_PER_LEG: usize = 20;

/// Prefix used when the filter starts with a wildcard.
const FALLBACK_PREFIX: &str = "fleet";

/// Durbar Marg → Tripureshwor.
const ROUTE_CITY: &[(f64, f64)] = &[
    (27.7120, 85.3220),
    (27.7105, 85.3218),
    (27.7080, 85.3215),
    (27.7050, 85.3210),
    (27.7020, 85.3200),
    (27.6980, 85.3180),
];

/// Ring Road, Koteshwor → Satdobato.
const ROUTE_RING_ROAD: &[(f64, f64)] = &[
    (27.6750, 85.3450),
    (27.6720, 85.3400),
    (27.6690, 85.3350),
    (27.6670, 85.3300),
    (27.6650, 85.3250),
];

/// Thamel loop.
const ROUTE_THAMEL: &[(f64, f64)] = &[
    (27.7150, 85.3100),
    (27.7160, 85.3120),
    (27.7170, 85.3140),
    (27.7180, 85.3150),
    (27.7190, 85.3130),
];

/// Densify `route` with `steps` linear steps per leg. The final waypoint is
/// kept exactly.
pub fn interpolate_route(route: &[(f64, f64)], steps: usize) -> Vec<(f64, f64)> {
    let Some(&last) = route.last() else {
        return Vec::new();
    };
    let mut path = Vec::with_capacity((route.len() - 1) * steps + 1);
    for leg in route.windows(2) {
        let ((lat0, lng0), (lat1, lng1)) = (leg[0], leg[1]);
        for j in 0..steps {
            #[allow(clippy::cast_precision_loss)]
            let t = j as f64 / steps as f64;
            path.push((lat0 + (lat1 - lat0) * t, lng0 + (lng1 - lng0) * t));
        }
    }
    path.push(last);
    path
}

/// A vehicle bouncing between the ends of its path.
#[derive(Debug, Clone)]
pub struct SimulatedVehicle {
    pub id: String,
    path: Vec<(f64, f64)>,
    index: usize,
    forward: bool,
}

impl SimulatedVehicle {
    pub fn new(id: impl Into<String>, path: Vec<(f64, f64)>) -> Self {
        Self {
            id: id.into(),
            path,
            index: 0,
            forward: true,
        }
    }

    /// Move one step, reversing direction on reaching either end.
    pub fn advance(&mut self) {
        if self.path.len() < 2 {
            return;
        }
        if self.forward {
            self.index += 1;
        } else {
            self.index -= 1;
        }
        if self.index == 0 || self.index >= self.path.len() - 1 {
            self.forward = !self.forward;
        }
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        self.path.get(self.index).copied()
    }
}

/// The stock three-vehicle fleet.
pub fn default_fleet() -> Vec<SimulatedVehicle> {
    vec![
        SimulatedVehicle::new("Demo-Tesla", interpolate_route(ROUTE_CITY, STEPS_PER_LEG)),
        SimulatedVehicle::new("Demo-Truck", interpolate_route(ROUTE_RING_ROAD, STEPS_PER_LEG)),
        SimulatedVehicle::new("Demo-Bus", interpolate_route(ROUTE_THAMEL, STEPS_PER_LEG)),
    ]
}

/// First level of a topic filter, unless it is a wildcard.
fn topic_prefix(filter: &str) -> &str {
    match filter.split('/').next() {
        Some(level) if !level.is_empty() && level != "+" && level != "#" => level,
        _ => FALLBACK_PREFIX,
    }
}

pub struct DemoTransport {
    interval: Duration,
}

impl DemoTransport {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Transport for DemoTransport {
    async fn open(
        &self,
        _url: &SignedUrl,
        client_id: &str,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let fleet = default_fleet();
        info!("Demo: simulating {} vehicles for {client_id}", fleet.len());
        Ok(Box::new(DemoConnection::new(fleet, self.interval)))
    }
}

pub struct DemoConnection {
    fleet: Vec<SimulatedVehicle>,
    ticker: Interval,
    prefix: Option<String>,
    pending: VecDeque<TransportEvent>,
    closed: bool,
}

impl DemoConnection {
    pub fn new(fleet: Vec<SimulatedVehicle>, interval: Duration) -> Self {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            fleet,
            ticker,
            prefix: None,
            pending: VecDeque::from([TransportEvent::Connected]),
            closed: false,
        }
    }

    fn publish_fleet(&mut self, prefix: &str) {
        let mut rng = rand::thread_rng();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        for vehicle in &mut self.fleet {
            vehicle.advance();
            let Some((latitude, longitude)) = vehicle.position() else {
                continue;
            };
            let payload = json!({
                "id": vehicle.id,
                "latitude": latitude,
                "longitude": longitude,
                "speed": f64::from(rng.gen_range(10_u8..50)),
                "timestamp": timestamp,
            });
            self.pending.push_back(TransportEvent::Message {
                topic: format!("{prefix}/{}/position", vehicle.id),
                payload: payload.to_string().into_bytes(),
            });
        }
    }
}

#[async_trait]
impl Connection for DemoConnection {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.prefix = Some(topic_prefix(topic).to_string());
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            self.ticker.tick().await;
            if let Some(prefix) = self.prefix.clone() {
                self.publish_fleet(&prefix);
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}
