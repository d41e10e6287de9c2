//! Firebase Realtime Database backend.
//!
//! Uses the REST API: `GET`/`PUT {database}/{path}.json` for one-shot reads
//! and writes, and a `text/event-stream` request for subscriptions. The
//! stream sends `put`/`patch` events relative to the subscribed path, which
//! are folded into a local copy and delivered whole.

use super::{Subscription, TelemetryPath, TelemetryStore, Unsubscribe};
use crate::error::{DashboardError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser tolerant of arbitrary chunking.
#[derive(Default)]
pub(crate) struct SseParser {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.event.take() {
                    events.push(SseEvent {
                        event,
                        data: self.data.join("\n"),
                    });
                }
                self.data.clear();
            } else if let Some(name) = line.strip_prefix("event:") {
                self.event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.trim_start().to_string());
            }
            // Comments (":") and unknown fields are ignored
        }

        events
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    path: String,
    data: Value,
}

/// Apply a `put` (replace) or `patch` (merge children) at `path` relative
/// to the subscribed location.
fn apply_update(root: &mut Value, path: &str, data: Value, merge: bool) {
    let mut target = root;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !target.is_object() {
            *target = Value::Object(Default::default());
        }
        target = match target {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => unreachable!("target was just made an object"),
        };
    }

    match (merge, data) {
        (true, Value::Object(children)) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(map) = target {
                for (key, value) in children {
                    if value.is_null() {
                        map.remove(&key);
                    } else {
                        map.insert(key, value);
                    }
                }
            }
        }
        (_, data) => *target = data,
    }
}

/// Firebase Realtime Database store.
pub struct FirebaseStore {
    http: reqwest::Client,
    database_url: String,
    auth: Option<String>,
    read_timeout: Duration,
    reconnect_delay: Duration,
}

impl FirebaseStore {
    pub fn new(database_url: &str, auth: Option<String>, read_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(read_timeout)
            .build()?;
        Ok(Self {
            http,
            database_url: database_url.trim_end_matches('/').to_string(),
            auth,
            read_timeout,
            reconnect_delay: RECONNECT_DELAY,
        })
    }

    fn url(&self, path: &TelemetryPath) -> String {
        match &self.auth {
            Some(auth) => format!("{}/{}.json?auth={}", self.database_url, path, auth),
            None => format!("{}/{}.json", self.database_url, path),
        }
    }

    async fn open_stream(&self, path: &TelemetryPath) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(self.url(path))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DashboardError::SubscribeFailed {
                path: path.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        Ok(response)
    }
}

async fn pump_stream(
    response: reqwest::Response,
    path: &TelemetryPath,
    tx: &mpsc::UnboundedSender<Value>,
    current: &mut Value,
) -> std::result::Result<(), String> {
    let mut parser = SseParser::default();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        for event in parser.feed(&chunk) {
            match event.event.as_str() {
                "put" | "patch" => {
                    let payload: StreamPayload =
                        serde_json::from_str(&event.data).map_err(|e| e.to_string())?;
                    apply_update(current, &payload.path, payload.data, event.event == "patch");
                    if tx.send(current.clone()).is_err() {
                        return Ok(());
                    }
                }
                "keep-alive" => {}
                "cancel" | "auth_revoked" => {
                    return Err(format!("stream {} by server", event.event));
                }
                other => debug!("[Firebase] Ignoring event '{}' on {}", other, path),
            }
        }
    }

    Err("stream ended".to_string())
}

#[async_trait]
impl TelemetryStore for FirebaseStore {
    async fn subscribe(&self, path: &TelemetryPath) -> Result<Subscription> {
        let response = self
            .open_stream(path)
            .await
            .map_err(|e| match e {
                DashboardError::SubscribeFailed { .. } => e,
                other => DashboardError::SubscribeFailed {
                    path: path.to_string(),
                    reason: other.to_string(),
                },
            })?;
        info!("[Firebase] Subscribed to {}", path);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let store = Self {
            http: self.http.clone(),
            database_url: self.database_url.clone(),
            auth: self.auth.clone(),
            read_timeout: self.read_timeout,
            reconnect_delay: self.reconnect_delay,
        };
        let stream_path = path.clone();
        let stream_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut response = Some(response);
            let mut current = Value::Null;
            loop {
                let result = match response.take() {
                    Some(r) => {
                        tokio::select! {
                            _ = stream_cancel.cancelled() => return,
                            r = pump_stream(r, &stream_path, &tx, &mut current) => r,
                        }
                    }
                    None => Err("not connected".to_string()),
                };
                if tx.is_closed() {
                    return;
                }
                if let Err(e) = result {
                    warn!("[Firebase] Stream for {} interrupted: {}", stream_path, e);
                }

                tokio::select! {
                    _ = stream_cancel.cancelled() => return,
                    _ = tokio::time::sleep(store.reconnect_delay) => {}
                }
                match store.open_stream(&stream_path).await {
                    Ok(r) => response = Some(r),
                    Err(e) => warn!("[Firebase] Reconnect to {} failed: {}", stream_path, e),
                }
            }
        });

        let unsubscribe = Unsubscribe::new(move || cancel.cancel());
        Ok(Subscription::new(rx, unsubscribe))
    }

    async fn read(&self, path: &TelemetryPath) -> Result<Value> {
        let response = self
            .http
            .get(self.url(path))
            .timeout(self.read_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DashboardError::Telemetry(format!(
                "read of {} returned HTTP {}",
                path, status
            )));
        }
        Ok(response.json().await?)
    }

    async fn write(&self, path: &TelemetryPath, value: Value) -> Result<()> {
        let response = self
            .http
            .put(self.url(path))
            .timeout(self.read_timeout)
            .json(&value)
            .send()
            .await
            .map_err(|e| DashboardError::WriteRejected {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DashboardError::WriteRejected {
                path: path.to_string(),
                reason: format!("HTTP {}", status),
            });
        }
        debug!("[Firebase] {} <- {}", path, value);
        Ok(())
    }
}
