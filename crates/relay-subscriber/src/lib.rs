//! # relay-subscriber
//!
//! Subscriber role: dials a hub, applies each envelope's payload to local
//! state and acknowledges it. A supervisor loop redials with exponential
//! backoff until shutdown.

#![deny(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod state;
pub mod subscriber;

pub use backoff::Backoff;
pub use config::SubscriberConfig;
pub use state::LocalState;
pub use subscriber::{connect_url, Subscriber, SubscriberState};
