#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

//! velo library — the connection core behind the fleet tracker.
//!
//! - `sigv4` — presigned `wss://` URLs for the IoT device gateway
//! - `store` — vehicle position table fed by a reconnecting subscription
//! - `transport` — pub/sub seam with MQTT-over-WebSocket and demo backends
//! - `config` — TOML + env-var configuration

pub mod config;
pub mod sigv4;
pub mod store;
pub mod transport;

pub use config::Config;
pub use sigv4::{build_signed_url, build_signed_url_at, Credential, SignError, SignedUrl, Signer};
pub use store::{ConnectionState, Snapshot, StoreEvent, StoreSettings, VehiclePosition, VehicleStore, VehicleTable};
