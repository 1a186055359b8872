//! Shared types for the relay hub and subscriber: identifiers, payloads,
//! wire envelopes, the data-source seam and the error taxonomy.

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod payload;
pub mod source;

pub use envelope::{AckMessage, Envelope, PeerMessage};
pub use errors::RelayError;
pub use ids::{PeerId, RoundId};
pub use payload::Payload;
pub use source::{DataSource, StaticSource};
