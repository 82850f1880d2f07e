//! Data Relay Module
//!
//! Handles bidirectional data relay between an inbound client and the
//! configured target.

pub mod engine;
pub mod pump;
pub mod session;

pub use engine::{RelayEngine, SessionOutcome};
pub use pump::{pump, Direction, PumpOutcome};
pub use session::{ConnectionStats, RelaySession, SessionState};
