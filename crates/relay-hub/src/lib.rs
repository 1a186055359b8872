//! # relay-hub
//!
//! Hub role: accepts subscriber WebSockets, keeps one session per peer, and
//! fans each broadcast round out to every session.
//!
//! - Session registry with per-round acknowledgment tracking
//! - Broadcast engine with a cancellable deadline watcher per (peer, round)
//! - Periodic cadence pulling payloads from a [`relay_core::DataSource`]
//! - Axum `/ws` and `/health` endpoints
//! - Shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broadcast;
pub mod cadence;
pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod socket;

pub use broadcast::{BroadcastEngine, DeliveryEvent, RoundReport};
pub use config::HubConfig;
pub use registry::{AckStatus, SessionRegistry};
pub use server::{DeliverySummary, HealthResponse, HubServer};
pub use shutdown::ShutdownCoordinator;
