//! Heartbeat-based availability detection.
//!
//! A fridge bumps its heartbeat counter while it is powered and connected.
//! The evaluator never trusts wall-clock time: a fridge is available once a
//! heartbeat change is pushed by the store subscription, and unavailable
//! once a poll finds the heartbeat where it was a full interval earlier.
//!
//! The poll deadline is re-armed by every observed change, so a fridge that
//! keeps ticking faster than the poll interval is never polled stale.

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Number, Value};
use std::fmt;
use std::time::Duration;

/// Default poll interval when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Last seen value of a fridge's heartbeat counter.
///
/// Only compared for equality; it may be a counter or a device timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Heartbeat(Number);

impl Heartbeat {
    /// Decode a store value. Null (no heartbeat yet) and non-numeric values
    /// yield `None`; numeric strings are accepted.
    pub fn from_value(value: &Value) -> Option<Self> {
        let number = match value {
            Value::Number(n) => n.clone(),
            Value::String(s) => serde_json::from_str::<Number>(s.trim()).ok()?,
            _ => return None,
        };
        Some(Self(normalize(number)))
    }
}

/// Integral floats compare equal to the integer a store may send instead.
fn normalize(number: Number) -> Number {
    if number.is_f64()
        && let Some(f) = number.as_f64()
        && f.is_finite()
        && f.fract() == 0.0
    {
        if f >= 0.0 && f < u64::MAX as f64 {
            return Number::from(f as u64);
        }
        if f < 0.0 && f >= i64::MIN as f64 {
            return Number::from(f as i64);
        }
    }
    number
}

impl From<u64> for Heartbeat {
    fn from(v: u64) -> Self {
        Self(Number::from(v))
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Card lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CardPhase {
    /// Mounted, no heartbeat pushed yet.
    Initializing,
    Available,
    Unavailable,
}

impl fmt::Display for CardPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CardPhase::Initializing => "initializing",
            CardPhase::Available => "available",
            CardPhase::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Liveness evaluator tuning.
#[derive(Debug, Clone, Copy)]
pub struct LivenessSettings {
    /// Must exceed the device's real heartbeat period with margin.
    pub poll_interval: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// What a heartbeat push did to the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New value recorded; the poll deadline should be re-armed.
    Changed,
    /// Same value re-delivered, nothing changed.
    Unchanged,
    /// Null or malformed value, ignored.
    Ignored,
}

/// What a poll read did to the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Heartbeat unchanged since last observation, fridge marked unavailable.
    Stale,
    /// Heartbeat moved without a push; recorded, availability untouched.
    Advanced,
    /// Nothing to compare against, nothing changed.
    Ignored,
}

/// Per-fridge availability state machine.
#[derive(Debug, Clone)]
pub struct LivenessEvaluator {
    device_id: String,
    phase: CardPhase,
    /// Last value seen by either the subscription or a poll.
    last_observed: Option<Heartbeat>,
    /// Last value delivered by the subscription. Polls never touch it, so a
    /// value a poll saw first still promotes when its push arrives.
    last_pushed: Option<Heartbeat>,
}

impl LivenessEvaluator {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            phase: CardPhase::Initializing,
            last_observed: None,
            last_pushed: None,
        }
    }

    pub fn phase(&self) -> CardPhase {
        self.phase
    }

    pub fn is_available(&self) -> bool {
        self.phase == CardPhase::Available
    }

    pub fn last_observed(&self) -> Option<&Heartbeat> {
        self.last_observed.as_ref()
    }

    /// Handle a heartbeat delivered by the store subscription.
    ///
    /// The only path that can make the fridge available: the first delivery
    /// after mounting, or any delivery with a value that differs from the
    /// last one pushed.
    pub fn on_heartbeat_push(&mut self, value: &Value) -> PushOutcome {
        let Some(heartbeat) = Heartbeat::from_value(value) else {
            if !value.is_null() {
                warn!(
                    "[Fridge {}] Ignoring malformed heartbeat: {}",
                    self.device_id, value
                );
            }
            return PushOutcome::Ignored;
        };

        let changed = self.last_pushed.as_ref() != Some(&heartbeat);
        if !changed && self.phase != CardPhase::Initializing {
            debug!(
                "[Fridge {}] Heartbeat {} re-delivered",
                self.device_id, heartbeat
            );
            return PushOutcome::Unchanged;
        }

        if self.phase != CardPhase::Available {
            info!(
                "[Fridge {}] Available (heartbeat {})",
                self.device_id, heartbeat
            );
        }
        self.last_observed = Some(heartbeat.clone());
        self.last_pushed = Some(heartbeat);
        self.phase = CardPhase::Available;
        PushOutcome::Changed
    }

    /// Handle the value read by a poll tick.
    pub fn on_poll(&mut self, value: &Value) -> PollOutcome {
        let Some(heartbeat) = Heartbeat::from_value(value) else {
            // No data is not evidence of a dead fridge
            debug!(
                "[Fridge {}] Poll read no heartbeat ({})",
                self.device_id, value
            );
            return PollOutcome::Ignored;
        };

        if self.last_observed.as_ref() == Some(&heartbeat) {
            if self.phase != CardPhase::Unavailable {
                info!(
                    "[Fridge {}] Unavailable (heartbeat stuck at {})",
                    self.device_id, heartbeat
                );
            }
            self.phase = CardPhase::Unavailable;
            PollOutcome::Stale
        } else {
            debug!(
                "[Fridge {}] Poll saw heartbeat {} before the subscription did",
                self.device_id, heartbeat
            );
            self.last_observed = Some(heartbeat);
            PollOutcome::Advanced
        }
    }

    /// A failed poll read never changes availability.
    pub fn on_poll_failed(&self, error: &dyn fmt::Display) {
        warn!(
            "[Fridge {}] Heartbeat poll failed, retrying next tick: {}",
            self.device_id, error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heartbeat_decoding() {
        assert_eq!(Heartbeat::from_value(&json!(100)), Some(Heartbeat::from(100)));
        assert_eq!(Heartbeat::from_value(&json!("100")), Some(Heartbeat::from(100)));
        assert!(Heartbeat::from_value(&json!(1.5)).is_some());
        assert_eq!(Heartbeat::from_value(&Value::Null), None);
        assert_eq!(Heartbeat::from_value(&json!("soon")), None);
        assert_eq!(Heartbeat::from_value(&json!({"t": 1})), None);
    }

    #[test]
    fn test_initial_state() {
        let evaluator = LivenessEvaluator::new("42");
        assert_eq!(evaluator.phase(), CardPhase::Initializing);
        assert!(!evaluator.is_available());
        assert!(evaluator.last_observed().is_none());
    }

    #[test]
    fn test_push_with_new_value_sets_available() {
        let mut evaluator = LivenessEvaluator::new("42");
        assert_eq!(evaluator.on_heartbeat_push(&json!(100)), PushOutcome::Changed);
        assert!(evaluator.is_available());
        assert_eq!(evaluator.last_observed(), Some(&Heartbeat::from(100)));

        assert_eq!(evaluator.on_heartbeat_push(&json!(101)), PushOutcome::Changed);
        assert_eq!(evaluator.last_observed(), Some(&Heartbeat::from(101)));
    }

    #[test]
    fn test_first_push_promotes_even_if_poll_saw_value() {
        let mut evaluator = LivenessEvaluator::new("42");
        assert_eq!(evaluator.on_poll(&json!(100)), PollOutcome::Advanced);
        assert!(!evaluator.is_available());

        assert_eq!(evaluator.on_heartbeat_push(&json!(100)), PushOutcome::Changed);
        assert!(evaluator.is_available());
    }

    #[test]
    fn test_poll_with_unchanged_value_demotes() {
        // Scenario A
        let mut evaluator = LivenessEvaluator::new("42");
        evaluator.on_heartbeat_push(&json!(100));
        assert_eq!(evaluator.on_poll(&json!(100)), PollOutcome::Stale);
        assert_eq!(evaluator.phase(), CardPhase::Unavailable);
    }

    #[test]
    fn test_poll_never_promotes() {
        let mut evaluator = LivenessEvaluator::new("42");
        evaluator.on_heartbeat_push(&json!(100));
        evaluator.on_poll(&json!(100));
        assert!(!evaluator.is_available());

        assert_eq!(evaluator.on_poll(&json!(250)), PollOutcome::Advanced);
        assert!(!evaluator.is_available());
        assert_eq!(evaluator.on_poll(&json!(300)), PollOutcome::Advanced);
        assert!(!evaluator.is_available());
    }

    #[test]
    fn test_redelivered_value_does_not_promote_unavailable() {
        let mut evaluator = LivenessEvaluator::new("42");
        evaluator.on_heartbeat_push(&json!(100));
        evaluator.on_poll(&json!(100));

        assert_eq!(evaluator.on_heartbeat_push(&json!(100)), PushOutcome::Unchanged);
        assert_eq!(evaluator.phase(), CardPhase::Unavailable);

        assert_eq!(evaluator.on_heartbeat_push(&json!(101)), PushOutcome::Changed);
        assert_eq!(evaluator.phase(), CardPhase::Available);
    }

    #[test]
    fn test_push_after_poll_saw_same_value_promotes() {
        let mut evaluator = LivenessEvaluator::new("42");
        evaluator.on_heartbeat_push(&json!(100));
        evaluator.on_poll(&json!(100));
        assert_eq!(evaluator.phase(), CardPhase::Unavailable);

        // The device ticked while the poll read was in flight
        assert_eq!(evaluator.on_poll(&json!(101)), PollOutcome::Advanced);
        assert_eq!(evaluator.phase(), CardPhase::Unavailable);

        assert_eq!(evaluator.on_heartbeat_push(&json!(101)), PushOutcome::Changed);
        assert_eq!(evaluator.phase(), CardPhase::Available);
        assert_eq!(evaluator.last_observed(), Some(&Heartbeat::from(101)));

        assert_eq!(evaluator.on_poll(&json!(101)), PollOutcome::Stale);
    }

    #[test]
    fn test_integral_float_equals_integer() {
        assert_eq!(Heartbeat::from_value(&json!(100.0)), Some(Heartbeat::from(100)));
        assert_eq!(Heartbeat::from_value(&json!("100.0")), Some(Heartbeat::from(100)));
        assert_ne!(Heartbeat::from_value(&json!(100.5)), Some(Heartbeat::from(100)));
        assert_eq!(
            Heartbeat::from_value(&json!(-3.0)),
            Heartbeat::from_value(&json!(-3))
        );

        let mut evaluator = LivenessEvaluator::new("42");
        evaluator.on_heartbeat_push(&json!(100));
        assert_eq!(evaluator.on_poll(&json!(100.0)), PollOutcome::Stale);
    }

    #[test]
    fn test_null_and_malformed_values_are_ignored() {
        let mut evaluator = LivenessEvaluator::new("42");
        assert_eq!(evaluator.on_heartbeat_push(&Value::Null), PushOutcome::Ignored);
        assert_eq!(evaluator.on_heartbeat_push(&json!(true)), PushOutcome::Ignored);
        assert_eq!(evaluator.phase(), CardPhase::Initializing);

        evaluator.on_heartbeat_push(&json!(7));
        assert_eq!(evaluator.on_poll(&Value::Null), PollOutcome::Ignored);
        assert!(evaluator.is_available());
    }

    #[test]
    fn test_unchanged_poll_before_any_push_marks_unavailable() {
        let mut evaluator = LivenessEvaluator::new("42");
        evaluator.on_poll(&json!(5));
        assert_eq!(evaluator.on_poll(&json!(5)), PollOutcome::Stale);
        assert_eq!(evaluator.phase(), CardPhase::Unavailable);
    }
}
