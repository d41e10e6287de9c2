//! Admin REST API client.

mod admin;
mod client;
pub mod models;

pub use client::ApiClient;
