// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command envelope and actuator addressing.
//!
//! This module is the canonical source for the JSON command surface: every
//! adapter (WebSocket, gamepad, tests) submits [`CommandEnvelope`] values and
//! receives reply objects built by [`reply_ok`] / [`reply_err`]. Channel
//! identity uses the `"dN_chM"` string form on the wire; callers get a typed
//! [`ChannelId`] after parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ChannelLimits;
use crate::error::CommandError;
use crate::transport::scheduler::Priority;

// -- Addressing ---------------------------------------------------------------

/// One of the two servo controllers sharing the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceId {
    D1,
    D2,
}

impl DeviceId {
    pub const ALL: [DeviceId; 2] = [DeviceId::D1, DeviceId::D2];

    /// Zero-based index into per-device tables.
    pub fn index(self) -> usize {
        match self {
            Self::D1 => 0,
            Self::D2 => 1,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::D1 => f.write_str("d1"),
            Self::D2 => f.write_str("d2"),
        }
    }
}

/// Number of servo outputs on each controller.
pub const CHANNELS_PER_DEVICE: u8 = 18;

/// Address of a single servo output: device plus channel number.
///
/// Wire form is `"d1_ch0"` .. `"d2_ch17"`; the type serializes as that string
/// so it can key JSON maps directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    pub device: DeviceId,
    pub channel: u8,
}

impl ChannelId {
    pub fn new(device: DeviceId, channel: u8) -> Result<Self, CommandError> {
        if channel >= CHANNELS_PER_DEVICE {
            return Err(CommandError::UnknownChannel(format!("{device}_ch{channel}")));
        }
        Ok(Self { device, channel })
    }
}

impl FromStr for ChannelId {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || CommandError::UnknownChannel(s.to_owned());
        let (dev, ch) = s.split_once("_ch").ok_or_else(bad)?;
        let device = match dev {
            "d1" => DeviceId::D1,
            "d2" => DeviceId::D2,
            _ => return Err(bad()),
        };
        let channel: u8 = ch.parse().map_err(|_| bad())?;
        Self::new(device, channel)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_ch{}", self.device, self.channel)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = CommandError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> String {
        id.to_string()
    }
}

// -- Command envelope ---------------------------------------------------------

/// A single inbound command, dispatched by `System::handle_command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Direct servo move.
    Servo {
        channel: ChannelId,
        position: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        acceleration: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<Priority>,
    },
    /// Start a scene from the catalog.
    Scene {
        scene_name: String,
        #[serde(default)]
        replace: bool,
    },
    /// Cancel the active scene, if any.
    SceneStop,
    /// Move the stepper to an absolute position or by a relative distance.
    StepperMove {
        #[serde(skip_serializing_if = "Option::is_none")]
        position_cm: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        distance_cm: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    StepperHome,
    StepperEnable,
    StepperDisable,
    /// Clear a stepper fault; the axis must re-home afterwards.
    StepperClearFault,
    EmergencyStop,
    /// Explicit `Emergency → Normal` clear.
    EmergencyClear,
    EnableFailsafe,
    DisableFailsafe,
    /// One-shot telemetry snapshot.
    GetTelemetry,
    /// Scene catalog dump.
    GetSceneList,
    /// Uptime, link state, scheduler stats, active scene.
    GetSystemStatus,
    GetServoConfig {
        channel: ChannelId,
    },
    SetServoConfig {
        channel: ChannelId,
        limits: ChannelLimits,
    },
}

/// Inbound message: an optional correlation id plus the command itself.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub command: Command,
}

// -- Replies ------------------------------------------------------------------

/// Successful reply envelope. `data` fields are merged into the object.
pub fn reply_ok(id: Option<&serde_json::Value>, data: serde_json::Value) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    if let Some(id) = id {
        obj.insert("id".to_owned(), id.clone());
    }
    obj.insert("ok".to_owned(), serde_json::Value::Bool(true));
    if let serde_json::Value::Object(extra) = data {
        obj.extend(extra);
    }
    serde_json::Value::Object(obj)
}

/// Error reply envelope carrying the taxonomy code and message.
pub fn reply_err(id: Option<&serde_json::Value>, err: &CommandError) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    if let Some(id) = id {
        obj.insert("id".to_owned(), id.clone());
    }
    obj.insert("ok".to_owned(), serde_json::Value::Bool(false));
    obj.insert(
        "error".to_owned(),
        serde_json::json!({ "code": err.code(), "message": err.to_string() }),
    );
    serde_json::Value::Object(obj)
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
