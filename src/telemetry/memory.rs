//! In-process realtime store.
//!
//! Behaves like the hosted stores: subscribers get the current value on
//! subscribe and every later write, last write wins. Faults can be injected
//! to exercise the failure paths of the liveness monitor.

use super::{Subscription, TelemetryPath, TelemetryStore, Unsubscribe};
use crate::error::{DashboardError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

type Listeners = HashMap<TelemetryPath, Vec<(u64, mpsc::UnboundedSender<Value>)>>;

#[derive(Default)]
struct Inner {
    values: RwLock<HashMap<TelemetryPath, Value>>,
    listeners: RwLock<Listeners>,
    next_listener_id: AtomicU64,
    fail_reads: AtomicBool,
    reject_writes: AtomicBool,
    failing_subscriptions: RwLock<HashSet<TelemetryPath>>,
}

/// Thread-safe in-memory telemetry store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value as if a device (or another operator) wrote it.
    pub fn set(&self, path: &TelemetryPath, value: Value) {
        self.inner.values.write().insert(path.clone(), value.clone());
        self.notify(path, value);
    }

    /// Current value without going through the async trait.
    pub fn get(&self, path: &TelemetryPath) -> Value {
        self.inner
            .values
            .read()
            .get(path)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Number of live listeners on `path`.
    pub fn listener_count(&self, path: &TelemetryPath) -> usize {
        self.inner
            .listeners
            .read()
            .get(path)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Number of live listeners across every path.
    pub fn total_listeners(&self) -> usize {
        self.inner.listeners.read().values().map(|l| l.len()).sum()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn reject_writes(&self, reject: bool) {
        self.inner.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Make subscribe calls for `path` fail until cleared.
    pub fn fail_subscribe(&self, path: &TelemetryPath, fail: bool) {
        let mut failing = self.inner.failing_subscriptions.write();
        if fail {
            failing.insert(path.clone());
        } else {
            failing.remove(path);
        }
    }

    fn notify(&self, path: &TelemetryPath, value: Value) {
        let mut listeners = self.inner.listeners.write();
        if let Some(entries) = listeners.get_mut(path) {
            // Receivers dropped without unsubscribing are pruned here
            entries.retain(|(_, tx)| tx.send(value.clone()).is_ok());
            if entries.is_empty() {
                listeners.remove(path);
            }
        }
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn subscribe(&self, path: &TelemetryPath) -> Result<Subscription> {
        if self.inner.failing_subscriptions.read().contains(path) {
            return Err(DashboardError::SubscribeFailed {
                path: path.to_string(),
                reason: "subscription refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);

        {
            // Hold the listener lock while reading the value so no write
            // can slip between the initial delivery and registration.
            let mut listeners = self.inner.listeners.write();
            let _ = tx.send(self.get(path));
            listeners
                .entry(path.clone())
                .or_default()
                .push((id, tx));
        }

        let inner = Arc::downgrade(&self.inner);
        let key = path.clone();
        let unsubscribe = Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut listeners = inner.listeners.write();
                if let Some(entries) = listeners.get_mut(&key) {
                    entries.retain(|(entry_id, _)| *entry_id != id);
                    if entries.is_empty() {
                        listeners.remove(&key);
                    }
                }
            }
        });

        Ok(Subscription::new(rx, unsubscribe))
    }

    async fn read(&self, path: &TelemetryPath) -> Result<Value> {
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(DashboardError::Telemetry(format!(
                "read of {} failed",
                path
            )));
        }
        Ok(self.get(path))
    }

    async fn write(&self, path: &TelemetryPath, value: Value) -> Result<()> {
        if self.inner.reject_writes.load(Ordering::SeqCst) {
            return Err(DashboardError::WriteRejected {
                path: path.to_string(),
                reason: "permission denied".to_string(),
            });
        }
        self.set(path, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_delivers_current_then_changes() {
        let store = MemoryStore::new();
        let path = TelemetryPath::heartbeat("42");
        store.set(&path, json!(100));

        let mut sub = store.subscribe(&path).await.unwrap();
        assert_eq!(sub.recv().await, Some(json!(100)));

        store.write(&path, json!(101)).await.unwrap();
        assert_eq!(sub.recv().await, Some(json!(101)));
    }

    #[tokio::test]
    async fn test_subscribe_to_empty_path_delivers_null() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&TelemetryPath::door("9")).await.unwrap();
        assert_eq!(sub.recv().await, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_listener() {
        let store = MemoryStore::new();
        let path = TelemetryPath::door("42");

        let sub = store.subscribe(&path).await.unwrap();
        let other = store.subscribe(&path).await.unwrap();
        assert_eq!(store.listener_count(&path), 2);

        drop(sub);
        assert_eq!(store.listener_count(&path), 1);

        let (_rx, mut unsubscribe) = other.into_parts();
        unsubscribe.cancel();
        assert_eq!(store.listener_count(&path), 0);
        assert_eq!(store.total_listeners(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        let path = TelemetryPath::door("42");

        store.reject_writes(true);
        assert!(matches!(
            store.write(&path, json!(1)).await,
            Err(DashboardError::WriteRejected { .. })
        ));
        assert_eq!(store.get(&path), Value::Null);

        store.fail_reads(true);
        assert!(store.read(&path).await.is_err());

        store.fail_subscribe(&path, true);
        assert!(store.subscribe(&path).await.is_err());
        store.fail_subscribe(&path, false);
        assert!(store.subscribe(&path).await.is_ok());
    }
}
