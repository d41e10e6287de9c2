//! Remote door actuation.
//!
//! A command is a single write of `1` (open) or `0` (closed) to the fridge's
//! door path. The actuator never reports the door as moved: the displayed
//! state only follows what the door subscription delivers back, so a
//! rejected write or a stuck latch leaves the last confirmed state on screen.
//!
//! Concurrent commands from several operators are last-write-wins.

use crate::error::Result;
use crate::telemetry::{TelemetryPath, TelemetryStore};
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use strum::{Display, EnumString};

/// Door state as stored in `{id}/door/doorOpen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DoorState {
    #[default]
    Closed,
    Open,
}

impl DoorState {
    /// Decode a store value. Null reads as closed; any non-zero number and
    /// `true` read as open.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(DoorState::Closed),
            Value::Bool(open) => Some(Self::from_open(*open)),
            Value::Number(n) => n.as_f64().map(|v| Self::from_open(v != 0.0)),
            Value::String(s) => match s.trim() {
                "0" => Some(DoorState::Closed),
                "1" => Some(DoorState::Open),
                _ => None,
            },
            _ => None,
        }
    }

    fn from_open(open: bool) -> Self {
        if open { DoorState::Open } else { DoorState::Closed }
    }

    pub fn is_open(self) -> bool {
        self == DoorState::Open
    }

    /// Wire encoding: 0 = closed, 1 = open.
    pub fn to_value(self) -> Value {
        Value::from(self.is_open() as u8)
    }

    pub fn toggled(self) -> Self {
        match self {
            DoorState::Open => DoorState::Closed,
            DoorState::Closed => DoorState::Open,
        }
    }
}

/// Operator door command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DoorCommand {
    Open,
    Close,
    Toggle,
}

impl DoorCommand {
    /// State to write given the last confirmed state.
    pub fn target(self, current: DoorState) -> DoorState {
        match self {
            DoorCommand::Open => DoorState::Open,
            DoorCommand::Close => DoorState::Closed,
            DoorCommand::Toggle => current.toggled(),
        }
    }
}

/// Writes door commands for one fridge.
#[derive(Clone)]
pub struct DoorActuator {
    device_id: String,
    path: TelemetryPath,
    store: Arc<dyn TelemetryStore>,
}

impl DoorActuator {
    pub fn new(device_id: impl Into<String>, store: Arc<dyn TelemetryStore>) -> Self {
        let device_id = device_id.into();
        Self {
            path: TelemetryPath::door(&device_id),
            device_id,
            store,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn open(&self) -> Result<()> {
        self.send(DoorState::Open).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send(DoorState::Closed).await
    }

    /// Write the opposite of `current`, the last store-confirmed state.
    pub async fn toggle(&self, current: DoorState) -> Result<()> {
        self.send(current.toggled()).await
    }

    pub async fn execute(&self, command: DoorCommand, current: DoorState) -> Result<()> {
        self.send(command.target(current)).await
    }

    async fn send(&self, target: DoorState) -> Result<()> {
        match self.store.write(&self.path, target.to_value()).await {
            Ok(()) => {
                info!(
                    "[Fridge {}] Door command sent: {}",
                    self.device_id, target
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[Fridge {}] Door command {} rejected: {}",
                    self.device_id, target, e
                );
                Err(e)
            }
        }
    }
}
