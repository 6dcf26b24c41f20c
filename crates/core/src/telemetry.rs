// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Telemetry aggregation: periodic consistent snapshots of actuator and
//! sensor state, published through the lossy event broadcast.
//!
//! `t_ms` is monotonic (process-start relative) and strictly increasing
//! across published snapshots, so consumers can totally order them even
//! after missing intermediate ticks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::command::ChannelId;
use crate::events::{AlertCode, Event, EventHub};
use crate::safety::{StateView, SystemState};
use crate::sensors::SensorSampler;
use crate::servo::ServoController;
use crate::stepper::{StepperController, StepperStatus};
use crate::transport::scheduler::LinkScheduler;

/// One consistent, by-value snapshot of system state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub t_ms: u64,
    pub voltage_v: f64,
    pub current_a_ch1: f64,
    pub current_a_ch2: f64,
    /// Last commanded target per channel, microseconds.
    pub servo_positions: HashMap<ChannelId, u16>,
    pub stepper: StepperStatus,
    pub state: SystemState,
    pub alerts: Vec<AlertCode>,
}

/// Composes snapshots from the live components.
pub struct TelemetryAggregator {
    servos: [Arc<ServoController>; 2],
    stepper: Arc<StepperController>,
    sensors: Arc<SensorSampler>,
    state: StateView,
    scheduler: Arc<LinkScheduler>,
    started: Instant,
    last_t_ms: AtomicU64,
}

impl TelemetryAggregator {
    pub fn new(
        servos: [Arc<ServoController>; 2],
        stepper: Arc<StepperController>,
        sensors: Arc<SensorSampler>,
        state: StateView,
        scheduler: Arc<LinkScheduler>,
    ) -> Self {
        Self {
            servos,
            stepper,
            sensors,
            state,
            scheduler,
            started: Instant::now(),
            last_t_ms: AtomicU64::new(0),
        }
    }

    /// Compose a fresh snapshot. `t_ms` is bumped past the previous snapshot
    /// if the clock has not advanced a full millisecond.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let elapsed = self.started.elapsed().as_millis() as u64;
        // The closure never returns None, so fetch_update always yields the
        // previous value; the stored value is what we hand out.
        let prev = self
            .last_t_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(elapsed.max(last + 1))
            })
            .unwrap_or(elapsed);
        let t_ms = elapsed.max(prev + 1);

        let mut servo_positions = HashMap::new();
        for servo in &self.servos {
            servo_positions.extend(servo.cached_positions());
        }

        let readings = self.sensors.latest();
        let mut alerts = Vec::new();
        if readings.stale {
            alerts.push(AlertCode::SensorDegraded);
        }
        if self.scheduler.link_down() {
            alerts.push(AlertCode::TransportDown);
        }

        TelemetrySnapshot {
            t_ms,
            voltage_v: readings.voltage_v,
            current_a_ch1: readings.current_a_ch1,
            current_a_ch2: readings.current_a_ch2,
            servo_positions,
            stepper: self.stepper.status(),
            state: self.state.current(),
            alerts,
        }
    }

    /// Spawn the periodic publisher at `interval`.
    pub fn spawn(
        self: &Arc<Self>,
        interval: std::time::Duration,
        events: Arc<EventHub>,
        cancel: CancellationToken,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                events.publish(Event::Telemetry { snapshot: this.snapshot() });
            }
        });
    }
}

#[cfg(test)]
#[path = "telemetry_tests.rs"]
mod tests;
