// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Safety supervisor: the authoritative system state machine.
//!
//! Legal transitions: `Idle → Normal` at startup, `Normal ⇄ Failsafe`,
//! `Normal → Emergency`, `Failsafe → Emergency`, and `Emergency → Normal`
//! only via an explicit clear. Adapters cannot bypass the supervisor; every
//! transition is published on a watch channel (for gating reads) and as a
//! `state_changed` event (for subscribers).
//!
//! The supervisor only owns the state atom. Halt orchestration on an
//! emergency (stop_all, stepper halt, scene cancel) runs in `System`, which
//! is the sole executor for both command-initiated and E-stop-pin-initiated
//! stops.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SafetyConfig;
use crate::error::CommandError;
use crate::events::{AlertCode, Event, EventHub};
use crate::gpio::{GpioPort, PinDirection, PinPull};
use crate::sensors::SensorSnapshot;

/// Global system state, owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// Booting; actuators not yet commandable.
    Idle,
    Normal,
    /// Track motors and stepper held safe; other servos remain commandable.
    Failsafe,
    /// Everything halted until an explicit clear.
    Emergency,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Normal => f.write_str("normal"),
            Self::Failsafe => f.write_str("failsafe"),
            Self::Emergency => f.write_str("emergency"),
        }
    }
}

/// Read-only view of the state atom. Cheap to clone; components that only
/// gate on state get this and nothing more.
#[derive(Clone)]
pub struct StateView {
    rx: watch::Receiver<SystemState>,
}

impl StateView {
    pub fn current(&self) -> SystemState {
        *self.rx.borrow()
    }

    /// A receiver positioned at the current value, for transition waits.
    pub fn subscribe(&self) -> watch::Receiver<SystemState> {
        self.rx.clone()
    }
}

/// Authoritative owner of [`SystemState`].
pub struct SafetySupervisor {
    tx: watch::Sender<SystemState>,
    events: Arc<EventHub>,
}

impl SafetySupervisor {
    pub fn new(events: Arc<EventHub>) -> Self {
        let (tx, _) = watch::channel(SystemState::Idle);
        Self { tx, events }
    }

    pub fn current(&self) -> SystemState {
        *self.tx.borrow()
    }

    pub fn view(&self) -> StateView {
        StateView { rx: self.tx.subscribe() }
    }

    fn transition(&self, next: SystemState) -> SystemState {
        let mut prev = next;
        self.tx.send_modify(|state| {
            prev = *state;
            *state = next;
        });
        if prev != next {
            tracing::info!(prev = %prev, next = %next, "system state changed");
            self.events.publish(Event::StateChanged { prev, next });
        }
        prev
    }

    /// Startup handoff once all components are wired.
    pub fn mark_ready(&self) {
        if self.current() == SystemState::Idle {
            self.transition(SystemState::Normal);
        }
    }

    /// Enter `Emergency` from any state. Idempotent; returns whether the
    /// state actually changed.
    pub fn request_emergency(&self) -> bool {
        if self.current() == SystemState::Emergency {
            return false;
        }
        self.transition(SystemState::Emergency);
        true
    }

    /// Explicit clear: `Emergency → Normal`. Rejected in other states.
    pub fn clear_emergency(&self) -> Result<(), CommandError> {
        if self.current() != SystemState::Emergency {
            return Err(CommandError::Busy("no emergency to clear".to_owned()));
        }
        self.transition(SystemState::Normal);
        Ok(())
    }

    /// `Normal ⇄ Failsafe`. Entering or leaving during an emergency is
    /// rejected; the emergency must be cleared first.
    pub fn set_failsafe(&self, on: bool) -> Result<bool, CommandError> {
        let current = self.current();
        match (current, on) {
            (SystemState::Emergency, _) | (SystemState::Idle, _) => {
                Err(CommandError::Busy(format!("cannot change failsafe while {current}")))
            }
            (SystemState::Failsafe, true) | (SystemState::Normal, false) => Ok(false),
            (SystemState::Normal, true) => {
                self.transition(SystemState::Failsafe);
                Ok(true)
            }
            (SystemState::Failsafe, false) => {
                self.transition(SystemState::Normal);
                Ok(true)
            }
        }
    }
}

// -- E-stop input -------------------------------------------------------------

/// Consecutive active samples (1 ms apart) before an E-stop edge counts.
pub const ESTOP_DEBOUNCE_SAMPLES: u32 = 3;

/// Watch the physical E-stop input and report active edges.
///
/// The pin is pulled up and active-low. An edge counts after
/// `debounce_samples` consecutive active reads on a 1 ms poll.
pub fn spawn_estop_watcher(
    gpio: Arc<dyn GpioPort>,
    pin: u8,
    debounce_samples: u32,
    edge_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        if let Err(e) = gpio.configure(pin, PinDirection::Input, PinPull::Up) {
            tracing::error!(pin, err = %e, "failed to configure E-stop input");
            return;
        }

        let mut interval = tokio::time::interval(Duration::from_millis(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut active_count = 0u32;
        let mut latched = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let active = match gpio.read(pin) {
                Ok(level) => !level.is_high(),
                Err(e) => {
                    tracing::warn!(pin, err = %e, "E-stop read failed");
                    continue;
                }
            };

            if active {
                active_count = active_count.saturating_add(1);
                if active_count >= debounce_samples && !latched {
                    latched = true;
                    tracing::warn!(pin, "E-stop input asserted");
                    if edge_tx.send(()).await.is_err() {
                        break;
                    }
                }
            } else {
                active_count = 0;
                latched = false;
            }
        }
    });
}

// -- Threshold monitor --------------------------------------------------------

/// Escalate `Normal → Failsafe` when voltage sags or current spikes past the
/// configured thresholds for the dwell time; recover with hysteresis.
///
/// Only failsafe entered *here* auto-recovers; an operator-commanded failsafe
/// stays until commanded off.
pub fn spawn_threshold_monitor(
    supervisor: Arc<SafetySupervisor>,
    mut sensors: watch::Receiver<SensorSnapshot>,
    config: SafetyConfig,
    events: Arc<EventHub>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let dwell = Duration::from_secs_f64(config.dwell_s);
        let recover = Duration::from_secs_f64(config.recover_s);
        let mut breach_since: Option<tokio::time::Instant> = None;
        let mut good_since: Option<tokio::time::Instant> = None;
        let mut auto_engaged = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = sensors.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let snapshot = sensors.borrow_and_update().clone();
            if snapshot.stale {
                continue;
            }

            let now = tokio::time::Instant::now();
            let current_max = snapshot.current_a_ch1.max(snapshot.current_a_ch2);
            let breached = snapshot.voltage_v < config.v_low || current_max > config.i_max;
            let recovered = snapshot.voltage_v >= config.v_low + config.recover_margin_v
                && current_max <= config.i_max;

            if breached {
                good_since = None;
                let since = *breach_since.get_or_insert(now);
                if now.duration_since(since) >= dwell
                    && supervisor.current() == SystemState::Normal
                {
                    let alert = if snapshot.voltage_v < config.v_low {
                        AlertCode::LowVoltage
                    } else {
                        AlertCode::Overcurrent
                    };
                    events.publish(Event::Alert {
                        alert,
                        message: format!(
                            "v={:.2}V i={:.2}A past threshold for {:.1}s",
                            snapshot.voltage_v,
                            current_max,
                            config.dwell_s
                        ),
                    });
                    if supervisor.set_failsafe(true).is_ok() {
                        auto_engaged = true;
                    }
                }
            } else {
                breach_since = None;
                if recovered && auto_engaged && supervisor.current() == SystemState::Failsafe {
                    let since = *good_since.get_or_insert(now);
                    if now.duration_since(since) >= recover {
                        if supervisor.set_failsafe(false).is_ok() {
                            auto_engaged = false;
                        }
                        good_since = None;
                    }
                } else {
                    good_since = None;
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "safety_tests.rs"]
mod tests;
