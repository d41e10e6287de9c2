//! Realtime telemetry store abstraction.
//!
//! Each fridge owns a namespace keyed by its id in a realtime key-path store.
//! The device bumps `{id}/timer/timer` while it is powered and connected,
//! and `{id}/door/doorOpen` holds the commanded door state (0 or 1).
//!
//! Backends:
//! - `memory`: in-process store, used by tests and local simulation
//! - `mqtt`: retained MQTT topics via rumqttc
//! - `firebase`: Firebase Realtime Database REST + event streams
//!
//! `simulation` drives fake fridges against any backend.

mod firebase;
mod memory;
mod mqtt;
pub mod simulation;

pub use firebase::FirebaseStore;
pub use memory::MemoryStore;
pub use mqtt::MqttStore;

use crate::config::{Config, TelemetryBackend};
use crate::error::{DashboardError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Key path into the realtime store, e.g. `42/timer/timer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TelemetryPath(String);

impl TelemetryPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim_matches('/').to_string())
    }

    /// Heartbeat counter the device updates on its own cadence.
    pub fn heartbeat(device_id: &str) -> Self {
        Self::new(format!("{}/timer/timer", device_id))
    }

    /// Commanded door state, 0 = closed, 1 = open.
    pub fn door(device_id: &str) -> Self {
        Self::new(format!("{}/door/doorOpen", device_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TelemetryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Releases a store listener. Runs at most once, on `cancel()` or drop.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn cancel(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }

    pub fn is_active(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Live view of one store path.
///
/// The first value delivered is the current one (Null when the path is
/// empty), followed by every later change.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Value>,
    unsubscribe: Unsubscribe,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Value>, unsubscribe: Unsubscribe) -> Self {
        Self { rx, unsubscribe }
    }

    /// Next delivered value, or `None` once the listener is released.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Split into the value stream and the release handle so the owner can
    /// release synchronously while another task drains the stream.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Value>, Unsubscribe) {
        (self.rx, self.unsubscribe)
    }
}

/// Key-path addressable realtime store.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Subscribe to changes at `path`. Fires with the current value first.
    async fn subscribe(&self, path: &TelemetryPath) -> Result<Subscription>;

    /// One-shot read of the current value. Null when the path is empty.
    async fn read(&self, path: &TelemetryPath) -> Result<Value>;

    /// Write `value` at `path`. Resolves once the store accepted the write.
    async fn write(&self, path: &TelemetryPath, value: Value) -> Result<()>;
}

/// Build the store selected by configuration.
pub fn connect(config: &Config) -> Result<Arc<dyn TelemetryStore>> {
    let store: Arc<dyn TelemetryStore> = match config.telemetry.backend {
        TelemetryBackend::Mqtt => Arc::new(MqttStore::connect(
            &config.mqtt,
            config.telemetry.read_timeout(),
        )),
        TelemetryBackend::Firebase => {
            let url = config.firebase.database_url.as_deref().ok_or_else(|| {
                DashboardError::Config(
                    "FIREBASE_DATABASE_URL is required for the firebase backend".to_string(),
                )
            })?;
            Arc::new(FirebaseStore::new(
                url,
                config.firebase.auth.clone(),
                config.telemetry.read_timeout(),
            )?)
        }
        TelemetryBackend::Memory => Arc::new(MemoryStore::new()),
    };
    log::info!("Telemetry backend: {}", config.telemetry.backend);
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_device_paths() {
        assert_eq!(TelemetryPath::heartbeat("42").as_str(), "42/timer/timer");
        assert_eq!(TelemetryPath::door("42").as_str(), "42/door/doorOpen");
        assert_eq!(TelemetryPath::new("/7/door/").as_str(), "7/door");
    }

    #[test]
    fn test_unsubscribe_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut handle = Unsubscribe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.is_active());

        handle.cancel();
        handle.cancel();
        assert!(!handle.is_active());
        drop(handle);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_firebase_backend_requires_url() {
        let mut config = Config::default();
        config.telemetry.backend = TelemetryBackend::Firebase;
        assert!(matches!(connect(&config), Err(DashboardError::Config(_))));
    }
}
