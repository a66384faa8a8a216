//! Test helpers for kronos lobbies.
//!
//! - [`chaos`]: reorder, duplicate and drop membership events before delivery
//! - [`verify`]: record lobby notifications and check their ordering

pub mod chaos;
pub mod verify;

pub use chaos::{ChaosAction, EventChaos};
pub use verify::{verify_lifecycle_chain, EventRecorder};
