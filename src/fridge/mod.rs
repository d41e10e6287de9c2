//! Fridge liveness monitoring and door control.
//!
//! - `liveness`: heartbeat staleness state machine
//! - `door`: door state encoding and the actuator
//! - `card`: per-fridge monitor owning subscriptions and the poll timer
//! - `collection`: roster-driven set of cards with client-side sorting

pub mod card;
pub mod collection;
pub mod door;
pub mod liveness;

pub use card::{CardSnapshot, FridgeCard};
pub use collection::{
    FridgeCollection, FridgeRow, RosterChange, RosterSource, SortKey, sort_fridges,
};
pub use door::{DoorActuator, DoorCommand, DoorState};
pub use liveness::{CardPhase, Heartbeat, LivenessEvaluator, LivenessSettings};

use crate::api::models::Fridge;
use serde::Serialize;

/// Identity of a fridge for the lifetime of a mounted card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Realtime store namespace; the fridge account number.
    pub id: String,
    pub account: String,
    pub address: String,
}

impl From<&Fridge> for Device {
    fn from(fridge: &Fridge) -> Self {
        Self {
            id: fridge.device_id().to_string(),
            account: fridge.account.clone(),
            address: fridge.address.clone(),
        }
    }
}
