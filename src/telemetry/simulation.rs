//! Fridge device simulation for development and testing.
//!
//! A simulated fridge increments its heartbeat counter on a fixed period and
//! logs door commands written for it.

use super::{TelemetryPath, TelemetryStore};
use log::{info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval};

/// How a simulated fridge behaves.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedFridge {
    /// Heartbeat period of the device.
    pub tick: Duration,
    /// Stop ticking after this long, as if the device lost power.
    pub stall_after: Option<Duration>,
}

/// Spawn a task that publishes an incrementing heartbeat for `device_id`.
///
/// Counting resumes from whatever value is already stored. Failed writes
/// are logged and the next tick tries again.
pub fn run_heartbeat_simulation(
    store: Arc<dyn TelemetryStore>,
    device_id: String,
    fridge: SimulatedFridge,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = TelemetryPath::heartbeat(&device_id);
        let mut counter = match store.read(&path).await {
            Ok(value) => value.as_u64().unwrap_or(0),
            Err(e) => {
                warn!("[Sim {}] Could not read heartbeat: {}", device_id, e);
                0
            }
        };
        let stall_at = fridge.stall_after.map(|d| Instant::now() + d);

        let mut ticker = interval(fridge.tick);
        loop {
            ticker.tick().await;
            if stall_at.is_some_and(|at| Instant::now() >= at) {
                info!("[Sim {}] Stalled at heartbeat {}", device_id, counter);
                return;
            }
            counter += 1;
            if let Err(e) = store.write(&path, json!(counter)).await {
                warn!("[Sim {}] Heartbeat write failed: {}", device_id, e);
            }
        }
    })
}

/// Spawn a task that logs every door value written for `device_id`.
pub fn run_door_listener(store: Arc<dyn TelemetryStore>, device_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = TelemetryPath::door(&device_id);
        let mut subscription = match store.subscribe(&path).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("[Sim {}] Door subscribe failed: {}", device_id, e);
                return;
            }
        };
        while let Some(value) = subscription.recv().await {
            match value {
                Value::Null => {}
                value => info!("[Sim {}] Door set to {}", device_id, value),
            }
        }
    })
}
