// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broadcast event types and the fan-out hub.
//!
//! Every adapter that wants pushed state (telemetry ticks, scene lifecycle,
//! safety transitions, alerts) subscribes here. The channel is lossy by
//! design: a slow subscriber misses intermediate events but always catches
//! the latest, which is the right trade for periodic telemetry.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::safety::SystemState;
use crate::telemetry::TelemetrySnapshot;

/// Alert classes carried in telemetry and pushed as `alert` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCode {
    SensorDegraded,
    TransportDown,
    LimitUnexpected,
    LowVoltage,
    Overcurrent,
}

/// Events pushed to all subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Periodic telemetry snapshot.
    Telemetry { snapshot: TelemetrySnapshot },
    SceneStarted { scene: String },
    SceneCompleted { scene: String },
    SceneCancelled { scene: String, reason: String },
    SceneError { scene: String, reason: String },
    /// Safety supervisor transition.
    StateChanged { prev: SystemState, next: SystemState },
    Alert {
        alert: AlertCode,
        message: String,
    },
}

/// Event hub — fans out core events to subscribers via a lossy broadcast.
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Send failures mean no subscribers, which is fine.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
