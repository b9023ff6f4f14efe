//! Position records and the topic/payload parsing that produces them.
//!
//! Topics follow `<prefix>/<vehicle id>/...`. Payloads are JSON objects with
//! at least `latitude`, `longitude` and `timestamp`; `speed` is optional and
//! any other field is carried along untouched. Each record replaces the
//! previous one for the same vehicle wholesale, so a payload without `speed`
//! clears a previously known speed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Latest known position of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Producer-supplied ISO-8601 timestamp, stored as sent.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Unrecognised payload fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Vehicle id → latest position. Entries are never evicted.
pub type VehicleTable = HashMap<String, VehiclePosition>;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("topic {0:?} carries no vehicle id")]
    NoVehicleId(String),
    #[error("invalid position payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct PositionPayload {
    latitude: f64,
    longitude: f64,
    timestamp: String,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Second topic level, if present and non-empty.
pub fn vehicle_id(topic: &str) -> Option<&str> {
    topic.split('/').nth(1).filter(|id| !id.is_empty())
}

/// Build a position record from one inbound message. The id always comes
/// from the topic; an `id` field in the payload is discarded.
pub fn parse_message(topic: &str, payload: &[u8]) -> Result<VehiclePosition, MessageError> {
    let id = vehicle_id(topic).ok_or_else(|| MessageError::NoVehicleId(topic.to_string()))?;
    let PositionPayload {
        latitude,
        longitude,
        timestamp,
        speed,
        mut extra,
    } = serde_json::from_slice(payload)?;
    extra.remove("id");

    Ok(VehiclePosition {
        id: id.to_string(),
        latitude,
        longitude,
        timestamp,
        speed,
        extra,
    })
}
