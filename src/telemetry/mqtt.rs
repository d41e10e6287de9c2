//! MQTT-backed telemetry store.
//!
//! Every store path maps to one topic. Values are JSON payloads published
//! retained, so the broker hands a new subscriber the current value first,
//! the same way a realtime database fires on subscribe.

use super::{Subscription, TelemetryPath, TelemetryStore, Unsubscribe};
use crate::config::MqttConfig;
use crate::error::{DashboardError, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Listeners = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>;

#[derive(Default)]
struct Shared {
    listeners: RwLock<Listeners>,
    /// Last payload seen per subscribed topic.
    latest: RwLock<HashMap<String, Value>>,
    next_listener_id: AtomicU64,
    /// Ack waiters for publishes the event loop has not sent yet, in
    /// request order.
    queued_acks: Mutex<VecDeque<oneshot::Sender<()>>>,
    /// Ack waiters by packet id for publishes awaiting PUBACK.
    inflight_acks: Mutex<HashMap<u16, oneshot::Sender<()>>>,
}

impl Shared {
    /// The event loop wrote a publish with packet id `pkid`.
    fn publish_sent(&self, pkid: u16) {
        let mut inflight = self.inflight_acks.lock();
        // Retransmits after a reconnect reuse their packet id. A fresh
        // publish never takes an id that is still waiting for its PUBACK.
        if inflight.contains_key(&pkid) {
            return;
        }
        if let Some(tx) = self.queued_acks.lock().pop_front() {
            inflight.insert(pkid, tx);
        }
    }

    fn publish_acked(&self, pkid: u16) {
        if let Some(tx) = self.inflight_acks.lock().remove(&pkid) {
            let _ = tx.send(());
        }
    }

    fn dispatch(&self, topic: &str, value: Value) {
        self.latest.write().insert(topic.to_string(), value.clone());
        let listeners = self.listeners.read();
        if let Some(entries) = listeners.get(topic) {
            for (_, tx) in entries {
                let _ = tx.send(value.clone());
            }
        }
    }

    fn subscribed_topics(&self) -> Vec<String> {
        self.listeners.read().keys().cloned().collect()
    }
}

/// Telemetry store speaking to an MQTT broker.
pub struct MqttStore {
    client: AsyncClient,
    shared: Arc<Shared>,
    topic_prefix: Option<String>,
    read_timeout: Duration,
    /// Keeps ack waiters queued in the same order as the publishes.
    publish_lock: tokio::sync::Mutex<()>,
    event_loop: JoinHandle<()>,
}

impl MqttStore {
    /// Create the client and start its event loop on the current runtime.
    pub fn connect(config: &MqttConfig, read_timeout: Duration) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));

        // Set credentials if provided
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);
        let shared = Arc::new(Shared::default());

        info!(
            "[MQTT] Connecting to {}:{}",
            config.broker_host, config.broker_port
        );
        let event_loop = tokio::spawn(run_event_loop(event_loop, client.clone(), shared.clone()));

        Self {
            client,
            shared,
            topic_prefix: config.topic_prefix.clone(),
            read_timeout,
            publish_lock: tokio::sync::Mutex::new(()),
            event_loop,
        }
    }

    fn topic(&self, path: &TelemetryPath) -> String {
        topic_for(self.topic_prefix.as_deref(), path)
    }
}

impl Drop for MqttStore {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

fn topic_for(prefix: Option<&str>, path: &TelemetryPath) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, path),
        _ => path.to_string(),
    }
}

/// Decode a retained payload. An empty payload clears a retained topic.
fn decode_payload(payload: &[u8]) -> Option<Value> {
    if payload.is_empty() {
        return Some(Value::Null);
    }
    let text = std::str::from_utf8(payload).ok()?.trim();
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        // Devices publishing bare words are passed through as strings
        Err(_) => Some(Value::String(text.to_string())),
    }
}

async fn run_event_loop(mut event_loop: EventLoop, client: AsyncClient, shared: Arc<Shared>) {
    info!("[MQTT] Starting event loop");

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Clean sessions drop subscriptions on reconnect
                let topics = shared.subscribed_topics();
                if !topics.is_empty() {
                    info!("[MQTT] Connected, restoring {} subscription(s)", topics.len());
                }
                for topic in topics {
                    if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                        warn!("[MQTT] Failed to resubscribe to {}: {:?}", topic, e);
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.publish_sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => shared.publish_acked(ack.pkid),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match decode_payload(&publish.payload) {
                    Some(value) => {
                        debug!("[MQTT] {} <- {}", publish.topic, value);
                        shared.dispatch(&publish.topic, value);
                    }
                    None => warn!("[MQTT] Invalid UTF-8 payload on {}", publish.topic),
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("[MQTT] Connection error: {:?}", e);
                // Wait before reconnecting
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

#[async_trait]
impl TelemetryStore for MqttStore {
    async fn subscribe(&self, path: &TelemetryPath) -> Result<Subscription> {
        let topic = self.topic(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);

        let first_listener = {
            let mut listeners = self.shared.listeners.write();
            let entries = listeners.entry(topic.clone()).or_default();
            let first = entries.is_empty();
            if !first {
                // Broker will not resend the retained value; replay the cached one
                if let Some(value) = self.shared.latest.read().get(&topic) {
                    let _ = tx.send(value.clone());
                }
            }
            entries.push((id, tx));
            first
        };

        let release = {
            let shared = Arc::downgrade(&self.shared);
            let client = self.client.clone();
            let topic = topic.clone();
            move || {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let mut listeners = shared.listeners.write();
                if let Some(entries) = listeners.get_mut(&topic) {
                    entries.retain(|(entry_id, _)| *entry_id != id);
                    if entries.is_empty() {
                        listeners.remove(&topic);
                        shared.latest.write().remove(&topic);
                        if let Err(e) = client.try_unsubscribe(topic.as_str()) {
                            debug!("[MQTT] Failed to unsubscribe from {}: {:?}", topic, e);
                        }
                    }
                }
            }
        };
        let mut unsubscribe = Unsubscribe::new(release);

        if first_listener {
            info!("[MQTT] Subscribing to {}", topic);
            if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
                unsubscribe.cancel();
                return Err(DashboardError::SubscribeFailed {
                    path: path.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(Subscription::new(rx, unsubscribe))
    }

    async fn read(&self, path: &TelemetryPath) -> Result<Value> {
        let topic = self.topic(path);
        let cached = {
            let listeners = self.shared.listeners.read();
            if listeners.contains_key(&topic) {
                // Subscribed but nothing retained yet: the path is empty
                Some(
                    self.shared
                        .latest
                        .read()
                        .get(&topic)
                        .cloned()
                        .unwrap_or(Value::Null),
                )
            } else {
                None
            }
        };
        if let Some(value) = cached {
            return Ok(value);
        }

        // Nobody is listening: ask the broker for the retained value
        let mut subscription = self.subscribe(path).await?;
        match tokio::time::timeout(self.read_timeout, subscription.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(DashboardError::Telemetry(format!(
                "subscription to {} closed",
                topic
            ))),
            Err(_) => Err(DashboardError::Telemetry(format!(
                "no retained value on {} within {:?}",
                topic, self.read_timeout
            ))),
        }
    }

    /// Resolves once the broker acknowledges the publish, or fails after
    /// the read timeout.
    async fn write(&self, path: &TelemetryPath, value: Value) -> Result<()> {
        let topic = self.topic(path);
        let rejected = |reason: String| DashboardError::WriteRejected {
            path: path.to_string(),
            reason,
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _guard = self.publish_lock.lock().await;
            self.shared.queued_acks.lock().push_back(ack_tx);
            debug!("[MQTT] Publishing to {}: {}", topic, value);
            if let Err(e) = self
                .client
                .publish(&topic, QoS::AtLeastOnce, true, value.to_string().into_bytes())
                .await
            {
                self.shared.queued_acks.lock().pop_back();
                return Err(rejected(e.to_string()));
            }
        }

        match tokio::time::timeout(self.read_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(rejected("connection closed before ack".to_string())),
            Err(_) => Err(rejected(format!(
                "broker did not acknowledge within {:?}",
                self.read_timeout
            ))),
        }
    }
}
