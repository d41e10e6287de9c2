//! Per-fridge liveness monitor.
//!
//! A mounted card owns exactly one heartbeat subscription, one door
//! subscription and one poll timer, acquired together in `mount()` and
//! released together in `unmount()` (or on drop). State is published through
//! a `watch` channel so any number of views can follow it.

use super::Device;
use super::door::{DoorActuator, DoorCommand, DoorState};
use super::liveness::{
    CardPhase, Heartbeat, LivenessEvaluator, LivenessSettings, PushOutcome,
};
use crate::error::{DashboardError, Result};
use crate::telemetry::{TelemetryPath, TelemetryStore, Unsubscribe};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// What a view renders for one fridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardSnapshot {
    pub device_id: String,
    pub phase: CardPhase,
    pub available: bool,
    pub last_heartbeat: Option<Heartbeat>,
    /// Last store-confirmed door state.
    pub door: DoorState,
    pub mounted: bool,
}

impl CardSnapshot {
    fn initial(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            phase: CardPhase::Initializing,
            available: false,
            last_heartbeat: None,
            door: DoorState::Closed,
            mounted: true,
        }
    }

    /// Unavailable fridges hide door controls and show an error badge.
    pub fn door_controls_visible(&self) -> bool {
        self.mounted && self.available
    }
}

/// Resources held while mounted. Released together, exactly once.
struct Mounted {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    heartbeat: Unsubscribe,
    door: Unsubscribe,
}

impl Mounted {
    fn release(mut self) {
        self.cancel.cancel();
        self.task.abort();
        self.heartbeat.cancel();
        self.door.cancel();
    }
}

/// Liveness monitor and door control for one fridge.
pub struct FridgeCard {
    device: Device,
    actuator: DoorActuator,
    state_tx: Arc<watch::Sender<CardSnapshot>>,
    state_rx: watch::Receiver<CardSnapshot>,
    mounted: Option<Mounted>,
}

impl FridgeCard {
    /// Subscribe to the fridge's heartbeat and door paths and start polling.
    ///
    /// If either subscription fails, whatever was already acquired is
    /// released before the error is returned.
    pub async fn mount(
        device: Device,
        store: Arc<dyn TelemetryStore>,
        settings: LivenessSettings,
    ) -> Result<Self> {
        let heartbeat_path = TelemetryPath::heartbeat(&device.id);
        let heartbeat = store.subscribe(&heartbeat_path).await?;
        // An error here drops `heartbeat`, which unsubscribes it
        let door = store.subscribe(&TelemetryPath::door(&device.id)).await?;

        let (heartbeat_rx, heartbeat_unsub) = heartbeat.into_parts();
        let (door_rx, door_unsub) = door.into_parts();

        let (state_tx, state_rx) = watch::channel(CardSnapshot::initial(&device.id));
        let state_tx = Arc::new(state_tx);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_card(CardTask {
            device_id: device.id.clone(),
            store: store.clone(),
            settings,
            heartbeat_path,
            heartbeat_rx,
            door_rx,
            state_tx: state_tx.clone(),
            cancel: cancel.clone(),
        }));

        info!(
            "[Fridge {}] Mounted (poll every {:?})",
            device.id, settings.poll_interval
        );

        Ok(Self {
            actuator: DoorActuator::new(device.id.clone(), store),
            device,
            state_tx,
            state_rx,
            mounted: Some(Mounted {
                cancel,
                task,
                heartbeat: heartbeat_unsub,
                door: door_unsub,
            }),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    pub fn snapshot(&self) -> CardSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Follow state changes.
    pub fn watch(&self) -> watch::Receiver<CardSnapshot> {
        self.state_rx.clone()
    }

    pub async fn open_door(&self) -> Result<()> {
        self.door_command(DoorCommand::Open).await
    }

    pub async fn close_door(&self) -> Result<()> {
        self.door_command(DoorCommand::Close).await
    }

    /// Flip the door relative to the last confirmed state.
    pub async fn toggle_door(&self) -> Result<()> {
        self.door_command(DoorCommand::Toggle).await
    }

    /// Send a door command. The displayed state is left alone until the
    /// door subscription confirms the change.
    pub async fn door_command(&self, command: DoorCommand) -> Result<()> {
        let snapshot = self.snapshot();
        if !snapshot.mounted {
            return Err(DashboardError::NotMounted(self.device.id.clone()));
        }
        if !snapshot.available {
            return Err(DashboardError::DeviceUnavailable(self.device.id.clone()));
        }
        self.actuator.execute(command, snapshot.door).await
    }

    /// Release subscriptions and cancel the poll timer. Safe to call twice.
    pub fn unmount(&mut self) {
        let Some(mounted) = self.mounted.take() else {
            return;
        };
        mounted.release();
        self.state_tx.send_modify(|s| s.mounted = false);
        info!("[Fridge {}] Unmounted", self.device.id);
    }
}

impl Drop for FridgeCard {
    fn drop(&mut self) {
        self.unmount();
    }
}

struct CardTask {
    device_id: String,
    store: Arc<dyn TelemetryStore>,
    settings: LivenessSettings,
    heartbeat_path: TelemetryPath,
    heartbeat_rx: mpsc::UnboundedReceiver<Value>,
    door_rx: mpsc::UnboundedReceiver<Value>,
    state_tx: Arc<watch::Sender<CardSnapshot>>,
    cancel: CancellationToken,
}

async fn run_card(mut task: CardTask) {
    let interval = task.settings.poll_interval;
    let mut evaluator = LivenessEvaluator::new(task.device_id.clone());
    let mut door = DoorState::Closed;
    let mut heartbeat_open = true;
    let mut door_open = true;

    let poll = sleep(interval);
    tokio::pin!(poll);

    loop {
        tokio::select! {
            biased;

            _ = task.cancel.cancelled() => break,

            value = task.heartbeat_rx.recv(), if heartbeat_open => match value {
                Some(value) => {
                    if evaluator.on_heartbeat_push(&value) == PushOutcome::Changed {
                        poll.as_mut().reset(Instant::now() + interval);
                    }
                }
                None => {
                    warn!("[Fridge {}] Heartbeat subscription closed", task.device_id);
                    heartbeat_open = false;
                }
            },

            value = task.door_rx.recv(), if door_open => match value {
                Some(value) => match DoorState::from_value(&value) {
                    Some(state) => {
                        if state != door {
                            info!("[Fridge {}] Door {}", task.device_id, state);
                        }
                        door = state;
                    }
                    None => warn!(
                        "[Fridge {}] Ignoring malformed door state: {}",
                        task.device_id, value
                    ),
                },
                None => {
                    warn!("[Fridge {}] Door subscription closed", task.device_id);
                    door_open = false;
                }
            },

            _ = &mut poll => {
                match task.store.read(&task.heartbeat_path).await {
                    Ok(value) => {
                        evaluator.on_poll(&value);
                    }
                    Err(e) => evaluator.on_poll_failed(&e),
                }
                poll.as_mut().reset(Instant::now() + interval);
            }
        }

        if !publish(&task.state_tx, &evaluator, door) {
            break;
        }
    }

    debug!("[Fridge {}] Monitor task stopped", task.device_id);
}

/// Push the evaluator's view into the watch channel. Returns false once the
/// card has been unmounted, which freezes the published state.
fn publish(
    state_tx: &watch::Sender<CardSnapshot>,
    evaluator: &LivenessEvaluator,
    door: DoorState,
) -> bool {
    let mut still_mounted = true;
    state_tx.send_if_modified(|s| {
        if !s.mounted {
            still_mounted = false;
            return false;
        }
        let last_heartbeat = evaluator.last_observed().cloned();
        let modified = s.phase != evaluator.phase()
            || s.last_heartbeat != last_heartbeat
            || s.door != door;
        s.phase = evaluator.phase();
        s.available = evaluator.is_available();
        s.last_heartbeat = last_heartbeat;
        s.door = door;
        modified
    });
    still_mounted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    const POLL: Duration = Duration::from_secs(10);

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            account: id.to_string(),
            address: "Main St 1".to_string(),
        }
    }

    fn settings() -> LivenessSettings {
        LivenessSettings {
            poll_interval: POLL,
        }
    }

    async fn mount(store: &MemoryStore, id: &str) -> FridgeCard {
        FridgeCard::mount(device(id), Arc::new(store.clone()), settings())
            .await
            .unwrap()
    }

    /// Let the card task drain its channels.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_at_mount_makes_available_then_poll_demotes() {
        // Scenario A
        let store = MemoryStore::new();
        store.set(&TelemetryPath::heartbeat("42"), json!(100));
        let card = mount(&store, "42").await;
        settle().await;

        let snapshot = card.snapshot();
        assert!(snapshot.available);
        assert_eq!(snapshot.last_heartbeat, Some(Heartbeat::from(100)));

        tokio::time::sleep(POLL + Duration::from_millis(1)).await;
        settle().await;
        let snapshot = card.snapshot();
        assert!(!snapshot.available);
        assert_eq!(snapshot.phase, CardPhase::Unavailable);
        assert!(!snapshot.door_controls_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_promotes_without_waiting_for_poll() {
        // Scenario B
        let store = MemoryStore::new();
        let path = TelemetryPath::heartbeat("42");
        store.set(&path, json!(100));
        let card = mount(&store, "42").await;

        tokio::time::sleep(POLL + Duration::from_millis(1)).await;
        settle().await;
        assert!(!card.snapshot().available);

        tokio::time::sleep(Duration::from_secs(3)).await;
        store.set(&path, json!(101));
        settle().await;
        let snapshot = card.snapshot();
        assert!(snapshot.available);
        assert_eq!(snapshot.last_heartbeat, Some(Heartbeat::from(101)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticking_fridge_stays_available() {
        let store = MemoryStore::new();
        let path = TelemetryPath::heartbeat("42");
        let card = mount(&store, "42").await;

        for tick in 0..10u64 {
            store.set(&path, json!(tick));
            tokio::time::sleep(Duration::from_secs(4)).await;
            settle().await;
            assert!(card.snapshot().available, "tick {}", tick);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_after_second_tick_without_push() {
        // P2: a full interval with no change demotes
        let store = MemoryStore::new();
        let path = TelemetryPath::heartbeat("42");
        let card = mount(&store, "42").await;

        store.set(&path, json!(5));
        settle().await;
        assert!(card.snapshot().available);

        tokio::time::sleep(POLL - Duration::from_secs(1)).await;
        settle().await;
        assert!(card.snapshot().available);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(!card.snapshot().available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_alone_never_promotes() {
        // P3: the value moves in the store but no push reaches the card
        let store = MemoryStore::new();
        let path = TelemetryPath::heartbeat("42");
        store.set(&path, json!(1));
        let mut card = mount(&store, "42").await;
        settle().await;

        // Cut the push path, keep the store readable
        if let Some(mounted) = card.mounted.as_mut() {
            mounted.heartbeat.cancel();
        }
        tokio::time::sleep(POLL + Duration::from_millis(1)).await;
        settle().await;
        assert!(!card.snapshot().available);

        for value in 2..5 {
            store.set(&path, json!(value));
            tokio::time::sleep(POLL).await;
            settle().await;
            assert!(!card.snapshot().available);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_read_keeps_availability() {
        let store = MemoryStore::new();
        store.set(&TelemetryPath::heartbeat("42"), json!(100));
        let card = mount(&store, "42").await;
        settle().await;

        store.fail_reads(true);
        tokio::time::sleep(POLL * 3).await;
        settle().await;
        assert!(card.snapshot().available);

        store.fail_reads(false);
        tokio::time::sleep(POLL).await;
        settle().await;
        assert!(!card.snapshot().available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_confirmed_by_subscription() {
        // Scenario C
        let store = MemoryStore::new();
        let door_path = TelemetryPath::door("42");
        store.set(&TelemetryPath::heartbeat("42"), json!(1));
        store.set(&door_path, json!(0));
        let card = mount(&store, "42").await;
        settle().await;
        assert_eq!(card.snapshot().door, DoorState::Closed);

        card.toggle_door().await.unwrap();
        settle().await;
        assert_eq!(store.get(&door_path), json!(1));
        assert_eq!(card.snapshot().door, DoorState::Open);

        // Rejected write: displayed state stays at the last confirmed value
        store.reject_writes(true);
        assert!(card.toggle_door().await.is_err());
        settle().await;
        assert_eq!(card.snapshot().door, DoorState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_does_not_touch_displayed_state() {
        let store = MemoryStore::new();
        let door_path = TelemetryPath::door("42");
        store.set(&TelemetryPath::heartbeat("42"), json!(1));
        let card = mount(&store, "42").await;
        settle().await;

        // No settle between the write and the check: the card task has not
        // run, so the snapshot cannot have changed yet.
        card.open_door().await.unwrap();
        assert_eq!(card.snapshot().door, DoorState::Closed);

        settle().await;
        assert_eq!(card.snapshot().door, DoorState::Open);

        // Another operator closes it: the card follows the store
        store.set(&door_path, json!(0));
        settle().await;
        assert_eq!(card.snapshot().door, DoorState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_door_commands_refused_while_unavailable() {
        let store = MemoryStore::new();
        let card = mount(&store, "42").await;
        settle().await;

        assert!(matches!(
            card.open_door().await,
            Err(DashboardError::DeviceUnavailable(_))
        ));
        assert_eq!(store.get(&TelemetryPath::door("42")), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_is_idempotent_and_releases_everything() {
        // P5
        let store = MemoryStore::new();
        let mut card = mount(&store, "42").await;
        assert_eq!(store.total_listeners(), 2);

        // Unmount before any callback fired
        card.unmount();
        card.unmount();
        assert!(!card.is_mounted());
        assert_eq!(store.total_listeners(), 0);
        assert!(!card.snapshot().mounted);

        // No further transitions after unmount
        store.set(&TelemetryPath::heartbeat("42"), json!(9));
        tokio::time::sleep(POLL * 2).await;
        settle().await;
        let snapshot = card.snapshot();
        assert_eq!(snapshot.phase, CardPhase::Initializing);
        assert!(!snapshot.available);
        assert!(matches!(
            card.open_door().await,
            Err(DashboardError::NotMounted(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_subscriptions() {
        let store = MemoryStore::new();
        let card = mount(&store, "42").await;
        let other = mount(&store, "7").await;
        assert_eq!(store.total_listeners(), 4);

        drop(card);
        assert_eq!(store.total_listeners(), 2);
        drop(other);
        assert_eq!(store.total_listeners(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mount_releases_acquired_subscription() {
        let store = MemoryStore::new();
        store.fail_subscribe(&TelemetryPath::door("42"), true);

        let result = FridgeCard::mount(device("42"), Arc::new(store.clone()), settings()).await;
        assert!(matches!(result, Err(DashboardError::SubscribeFailed { .. })));
        assert_eq!(store.total_listeners(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remount_starts_fresh() {
        let store = MemoryStore::new();
        let path = TelemetryPath::heartbeat("42");
        store.set(&path, json!(100));
        let mut card = mount(&store, "42").await;
        settle().await;
        assert!(card.snapshot().available);
        tokio::time::sleep(POLL + Duration::from_millis(1)).await;
        settle().await;
        assert!(!card.snapshot().available);
        card.unmount();

        // Prior liveness is not carried over: the first push promotes again
        let card = mount(&store, "42").await;
        assert_eq!(card.snapshot().phase, CardPhase::Initializing);
        settle().await;
        assert_eq!(card.snapshot().phase, CardPhase::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_receives_transitions() {
        let store = MemoryStore::new();
        let card = mount(&store, "42").await;
        let mut rx = card.watch();

        store.set(&TelemetryPath::heartbeat("42"), json!(1));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().available);
    }

    /// Store whose device ticks while a heartbeat read is in flight, so the
    /// poll sees the new value just before the subscription delivers it.
    struct TickDuringRead {
        inner: MemoryStore,
        next_tick: parking_lot::Mutex<Option<Value>>,
    }

    #[async_trait::async_trait]
    impl TelemetryStore for TickDuringRead {
        async fn subscribe(&self, path: &TelemetryPath) -> Result<crate::telemetry::Subscription> {
            self.inner.subscribe(path).await
        }

        async fn read(&self, path: &TelemetryPath) -> Result<Value> {
            let next = self.next_tick.lock().take();
            if let Some(value) = next {
                self.inner.set(path, value);
            }
            self.inner.read(path).await
        }

        async fn write(&self, path: &TelemetryPath, value: Value) -> Result<()> {
            self.inner.write(path, value).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_landing_after_poll_still_promotes() {
        let inner = MemoryStore::new();
        inner.set(&TelemetryPath::heartbeat("42"), json!(100));
        let store = Arc::new(TickDuringRead {
            inner: inner.clone(),
            next_tick: parking_lot::Mutex::new(None),
        });
        let card = FridgeCard::mount(device("42"), store.clone(), settings())
            .await
            .unwrap();
        settle().await;

        tokio::time::sleep(POLL + Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(card.snapshot().phase, CardPhase::Unavailable);

        *store.next_tick.lock() = Some(json!(101));
        tokio::time::sleep(POLL).await;
        settle().await;

        let snapshot = card.snapshot();
        assert_eq!(snapshot.phase, CardPhase::Available);
        assert_eq!(snapshot.last_heartbeat, Some(Heartbeat::from(101)));
    }
}
