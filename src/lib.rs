//! Fridge fleet monitor library.
//!
//! Tracks whether remote vending fridges are alive from their heartbeat
//! telemetry and lets an operator open or close their doors.

pub mod api;
pub mod config;
pub mod error;
pub mod fridge;
pub mod session;
pub mod telemetry;
