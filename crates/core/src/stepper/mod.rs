// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stepper motion controller: homing, soft limits, ramped step generation.
//!
//! The state machine lives on a dedicated emitter thread that owns the
//! step/dir pins and yields only between steps; everything the rest of the
//! system needs (position, mode, homed, enabled) is mirrored in atomics so
//! readers never block the emitter. Command submission is non-blocking with
//! at most one motion in flight; a second `move_to` while moving follows the
//! configured conflict policy.
//!
//! Safety gating: the supervisor's halt flag is checked at every step
//! boundary, so an emergency stops the motor mid-ramp but never mid-pulse.

pub mod ramp;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::{MotionConflictPolicy, StepperConfig};
use crate::error::CommandError;
use crate::events::{AlertCode, Event, EventHub};
use crate::gpio::{GpioPort, Level, PinDirection, PinPull};
use crate::safety::{StateView, SystemState};

use ramp::RampPlanner;

/// Stepper state machine modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepperMode {
    Idle,
    Homing,
    Moving,
    Faulted,
}

impl StepperMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Homing,
            2 => Self::Moving,
            3 => Self::Faulted,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Homing => 1,
            Self::Moving => 2,
            Self::Faulted => 3,
        }
    }
}

/// Copy of the stepper's observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepperStatus {
    pub position_steps: i64,
    pub homed: bool,
    pub enabled: bool,
    pub mode: StepperMode,
    pub soft_min_steps: i64,
    pub soft_max_steps: i64,
}

struct SharedState {
    position: AtomicI64,
    homed: AtomicBool,
    enabled: AtomicBool,
    mode: AtomicU8,
    /// Set by the supervisor; the emitter halts at the next step boundary.
    halt: AtomicBool,
    /// Whether a halt should fault (emergency) or just idle (disable).
    halt_is_fault: AtomicBool,
}

impl SharedState {
    fn mode(&self) -> StepperMode {
        StepperMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn set_mode(&self, mode: StepperMode) {
        self.mode.store(mode.as_u8(), Ordering::Release);
    }
}

enum EmitterCommand {
    Home { done: oneshot::Sender<Result<(), CommandError>> },
    Move {
        target_steps: i64,
        v_cruise: f64,
        done: oneshot::Sender<Result<(), CommandError>>,
    },
    Shutdown,
}

/// Public handle to the stepper. Cheap operations run inline; motion executes
/// on the emitter thread.
pub struct StepperController {
    config: StepperConfig,
    gpio: Arc<dyn GpioPort>,
    state: StateView,
    shared: Arc<SharedState>,
    tx: mpsc::Sender<EmitterCommand>,
    worker: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl StepperController {
    /// Configure pins and start the emitter thread. The motor starts
    /// disabled and un-homed.
    pub fn start(
        config: StepperConfig,
        gpio: Arc<dyn GpioPort>,
        state: StateView,
        events: Arc<EventHub>,
    ) -> anyhow::Result<Self> {
        gpio.configure(config.step_pin, PinDirection::Output, PinPull::None)?;
        gpio.configure(config.dir_pin, PinDirection::Output, PinPull::None)?;
        gpio.configure(config.enable_pin, PinDirection::Output, PinPull::None)?;
        gpio.configure(config.limit_pin, PinDirection::Input, PinPull::Up)?;
        // Drivers are enable-active-low; start disabled.
        gpio.write(config.enable_pin, Level::High)?;

        let shared = Arc::new(SharedState {
            position: AtomicI64::new(0),
            homed: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            mode: AtomicU8::new(StepperMode::Idle.as_u8()),
            halt: AtomicBool::new(false),
            halt_is_fault: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::channel();
        let emitter = Emitter {
            config: config.clone(),
            gpio: Arc::clone(&gpio),
            shared: Arc::clone(&shared),
            events,
            rx,
        };
        let worker = std::thread::Builder::new()
            .name("step-emitter".to_owned())
            .spawn(move || emitter.run())?;

        Ok(Self {
            config,
            gpio,
            state,
            shared,
            tx,
            worker: parking_lot::Mutex::new(Some(worker)),
        })
    }

    pub fn status(&self) -> StepperStatus {
        StepperStatus {
            position_steps: self.shared.position.load(Ordering::Acquire),
            homed: self.shared.homed.load(Ordering::Acquire),
            enabled: self.shared.enabled.load(Ordering::Acquire),
            mode: self.shared.mode(),
            soft_min_steps: 0,
            soft_max_steps: self.config.soft_max_steps(),
        }
    }

    /// Energize the driver.
    pub fn enable(&self) -> Result<(), CommandError> {
        self.authorize()?;
        self.gpio
            .write(self.config.enable_pin, Level::Low)
            .map_err(|e| CommandError::Internal(e.to_string()))?;
        // A disable that raced a completing motion can leave its halt flag
        // unconsumed; it must not kill the next move.
        self.shared.halt.store(false, Ordering::Release);
        self.shared.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// De-energize the driver. A motion in flight halts at the next step
    /// boundary and the mode returns to idle.
    pub fn disable(&self) -> Result<(), CommandError> {
        self.shared.enabled.store(false, Ordering::Release);
        if self.shared.mode() == StepperMode::Moving || self.shared.mode() == StepperMode::Homing {
            self.shared.halt_is_fault.store(false, Ordering::Release);
            self.shared.halt.store(true, Ordering::Release);
        }
        self.gpio
            .write(self.config.enable_pin, Level::High)
            .map_err(|e| CommandError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Emergency halt: stop at the next step boundary and fault.
    pub fn emergency_halt(&self) {
        self.shared.halt_is_fault.store(true, Ordering::Release);
        self.shared.halt.store(true, Ordering::Release);
        let _ = self.gpio.write(self.config.enable_pin, Level::High);
        self.shared.enabled.store(false, Ordering::Release);
        if !matches!(self.shared.mode(), StepperMode::Moving | StepperMode::Homing) {
            self.shared.set_mode(StepperMode::Faulted);
        }
    }

    /// Clear a fault. The position reference is no longer trusted, so the
    /// axis must re-home before the next move.
    pub fn clear_fault(&self) -> Result<(), CommandError> {
        if self.shared.mode() != StepperMode::Faulted {
            return Err(CommandError::Busy("no fault to clear".to_owned()));
        }
        self.shared.homed.store(false, Ordering::Release);
        self.shared.halt.store(false, Ordering::Release);
        self.shared.set_mode(StepperMode::Idle);
        Ok(())
    }

    /// Home toward the limit switch. Completes when the debounced limit edge
    /// arrives; fails with `HomingTimeout` past the configured step bound.
    pub async fn home(&self) -> Result<(), CommandError> {
        self.authorize()?;
        if !self.shared.enabled.load(Ordering::Acquire) {
            return Err(CommandError::Busy("stepper disabled".to_owned()));
        }
        if self.shared.mode() != StepperMode::Idle {
            return Err(CommandError::Busy(format!("stepper {:?} busy", self.shared.mode())));
        }

        let (done, rx) = oneshot::channel();
        self.tx
            .send(EmitterCommand::Home { done })
            .map_err(|_| CommandError::Internal("step emitter gone".to_owned()))?;
        rx.await
            .map_err(|_| CommandError::Internal("step emitter dropped homing".to_owned()))?
    }

    /// Move to an absolute step position within the soft limits.
    pub async fn move_to_steps(
        &self,
        target_steps: i64,
        speed_sps: Option<f64>,
    ) -> Result<(), CommandError> {
        self.authorize()?;
        if !self.shared.enabled.load(Ordering::Acquire) {
            return Err(CommandError::Busy("stepper disabled".to_owned()));
        }
        if !self.shared.homed.load(Ordering::Acquire) {
            return Err(CommandError::Busy("stepper not homed".to_owned()));
        }
        let soft_max = self.config.soft_max_steps();
        if target_steps < 0 || target_steps > soft_max {
            return Err(CommandError::OutOfRange(format!(
                "target {target_steps} steps outside [0, {soft_max}]"
            )));
        }
        match self.shared.mode() {
            StepperMode::Idle | StepperMode::Moving => {}
            other => return Err(CommandError::Busy(format!("stepper {other:?} busy"))),
        }

        let v_cruise = speed_sps
            .unwrap_or(self.config.normal_sps)
            .min(self.config.max_sps);

        let (done, rx) = oneshot::channel();
        self.tx
            .send(EmitterCommand::Move { target_steps, v_cruise, done })
            .map_err(|_| CommandError::Internal("step emitter gone".to_owned()))?;
        rx.await
            .map_err(|_| CommandError::Internal("step emitter dropped motion".to_owned()))?
    }

    /// Move to an absolute position in centimeters from home.
    pub async fn move_to_cm(
        &self,
        position_cm: f64,
        speed_sps: Option<f64>,
    ) -> Result<(), CommandError> {
        let target = (position_cm * self.config.steps_per_cm()).round() as i64;
        self.move_to_steps(target, speed_sps).await
    }

    /// Move by a relative distance in centimeters.
    pub async fn move_by_cm(
        &self,
        distance_cm: f64,
        speed_sps: Option<f64>,
    ) -> Result<(), CommandError> {
        let delta = (distance_cm * self.config.steps_per_cm()).round() as i64;
        let target = self.shared.position.load(Ordering::Acquire) + delta;
        self.move_to_steps(target, speed_sps).await
    }

    fn authorize(&self) -> Result<(), CommandError> {
        match self.state.current() {
            SystemState::Normal => Ok(()),
            state => Err(CommandError::StateForbidsWrite { state: state.to_string() }),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(EmitterCommand::Shutdown);
        self.shared.halt_is_fault.store(false, Ordering::Release);
        self.shared.halt.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StepperController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// -- Emitter thread -----------------------------------------------------------

struct Emitter {
    config: StepperConfig,
    gpio: Arc<dyn GpioPort>,
    shared: Arc<SharedState>,
    events: Arc<EventHub>,
    rx: mpsc::Receiver<EmitterCommand>,
}

enum MotionEnd {
    Reached,
    Halted,
    Fault(CommandError),
}

impl Emitter {
    fn run(self) {
        loop {
            let cmd = match self.rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => return,
            };
            match cmd {
                EmitterCommand::Shutdown => return,
                EmitterCommand::Home { done } => {
                    let result = self.run_homing();
                    let _ = done.send(result);
                }
                EmitterCommand::Move { target_steps, v_cruise, done } => {
                    self.run_motion(target_steps, v_cruise, done);
                }
            }
        }
    }

    /// One step pulse: high for the configured pulse width, then the caller
    /// sleeps out the rest of the interval.
    fn pulse(&self) {
        let high = Duration::from_nanos(self.config.pulse_high_ns);
        let _ = self.gpio.pulse(self.config.step_pin, high, Duration::ZERO);
    }

    fn set_direction(&self, positive: bool) {
        // Positive travel is away from the limit switch.
        let level = if positive { Level::High } else { Level::Low };
        let _ = self.gpio.write(self.config.dir_pin, level);
    }

    fn limit_active(&self) -> bool {
        // Pulled up, active low.
        matches!(self.gpio.read(self.config.limit_pin), Ok(Level::Low))
    }

    /// Debounce the limit input: N consecutive active samples.
    fn limit_confirmed(&self) -> bool {
        let interval = Duration::from_micros(self.config.debounce_interval_us);
        for _ in 0..self.config.debounce_samples {
            if !self.limit_active() {
                return false;
            }
            std::thread::sleep(interval);
        }
        true
    }

    /// Check the halt flag; returns the fault/idle outcome if halted.
    fn halted(&self) -> Option<MotionEnd> {
        if !self.shared.halt.swap(false, Ordering::AcqRel) {
            return None;
        }
        if self.shared.halt_is_fault.load(Ordering::Acquire) {
            self.shared.set_mode(StepperMode::Faulted);
            Some(MotionEnd::Fault(CommandError::Busy("halted by emergency stop".to_owned())))
        } else {
            self.shared.set_mode(StepperMode::Idle);
            Some(MotionEnd::Halted)
        }
    }

    fn run_homing(&self) -> Result<(), CommandError> {
        self.shared.set_mode(StepperMode::Homing);
        self.set_direction(false);
        let interval = Duration::from_secs_f64(1.0 / self.config.homing_sps.max(1.0));

        let mut steps: u64 = 0;
        loop {
            if let Some(end) = self.halted() {
                return match end {
                    MotionEnd::Halted => Err(CommandError::Busy("homing halted".to_owned())),
                    MotionEnd::Fault(e) => Err(e),
                    MotionEnd::Reached => Ok(()),
                };
            }
            if self.limit_active() && self.limit_confirmed() {
                self.shared.position.store(0, Ordering::Release);
                self.shared.homed.store(true, Ordering::Release);
                self.shared.set_mode(StepperMode::Idle);
                tracing::info!(steps, "stepper homed");
                return Ok(());
            }
            if steps >= self.config.max_homing_steps {
                self.shared.set_mode(StepperMode::Faulted);
                return Err(CommandError::HomingTimeout { max_steps: self.config.max_homing_steps });
            }

            self.pulse();
            steps += 1;
            self.shared.position.fetch_sub(1, Ordering::AcqRel);
            std::thread::sleep(interval);
        }
    }

    fn run_motion(
        &self,
        target_steps: i64,
        v_cruise: f64,
        done: oneshot::Sender<Result<(), CommandError>>,
    ) {
        self.shared.set_mode(StepperMode::Moving);
        let mut done = Some(done);
        let mut target = target_steps;
        let mut planner = RampPlanner::new(v_cruise, self.config.accel_sps2);
        let mut position = self.shared.position.load(Ordering::Acquire);
        let positive = target >= position;
        self.set_direction(positive);

        let end = loop {
            if let Some(end) = self.halted() {
                break end;
            }
            if !self.shared.enabled.load(Ordering::Acquire) {
                self.shared.set_mode(StepperMode::Idle);
                break MotionEnd::Halted;
            }

            // Travel toward the limit switch must stop the instant it trips.
            if !positive && self.limit_active() && self.limit_confirmed() {
                self.shared.set_mode(StepperMode::Faulted);
                self.events.publish(Event::Alert {
                    alert: AlertCode::LimitUnexpected,
                    message: format!("limit switch hit at {position} steps"),
                });
                break MotionEnd::Fault(CommandError::LimitUnexpected { position_steps: position });
            }

            if position == target {
                self.shared.set_mode(StepperMode::Idle);
                break MotionEnd::Reached;
            }

            // A replacement target may arrive between steps.
            match self.rx.try_recv() {
                Ok(EmitterCommand::Shutdown) => {
                    self.shared.set_mode(StepperMode::Idle);
                    break MotionEnd::Halted;
                }
                Ok(EmitterCommand::Home { done: home_done }) => {
                    let _ = home_done.send(Err(CommandError::Busy("motion in flight".to_owned())));
                }
                Ok(EmitterCommand::Move { target_steps: new_target, done: new_done, .. }) => {
                    match self.try_replace(&mut target, new_target, position, positive, &planner) {
                        Ok(()) => {
                            // The superseded submitter's motion was absorbed.
                            if let Some(old) = done.replace(new_done) {
                                let _ = old.send(Ok(()));
                            }
                        }
                        Err(e) => {
                            let _ = new_done.send(Err(e));
                        }
                    }
                }
                Err(_) => {}
            }

            let remaining = (target - position).unsigned_abs();
            let interval = planner.advance(remaining);

            self.pulse();
            position += if positive { 1 } else { -1 };
            self.shared.position.store(position, Ordering::Release);

            let high = Duration::from_nanos(self.config.pulse_high_ns);
            std::thread::sleep(interval.saturating_sub(high));
        };

        if let Some(done) = done.take() {
            let _ = done.send(match end {
                MotionEnd::Reached => Ok(()),
                MotionEnd::Halted => Err(CommandError::Busy("motion halted".to_owned())),
                MotionEnd::Fault(e) => Err(e),
            });
        }
    }

    /// Conflict policy for a second `move_to` while moving: replace when the
    /// direction matches and the remaining run can absorb braking, reject
    /// otherwise (or always, under the `reject` policy).
    fn try_replace(
        &self,
        target: &mut i64,
        new_target: i64,
        position: i64,
        positive: bool,
        planner: &RampPlanner,
    ) -> Result<(), CommandError> {
        if self.config.on_conflict == MotionConflictPolicy::Reject {
            return Err(CommandError::Busy("motion in flight".to_owned()));
        }
        let new_positive = new_target >= position;
        if new_positive != positive {
            return Err(CommandError::Busy("opposing motion in flight".to_owned()));
        }
        let remaining = (new_target - position).unsigned_abs();
        if !planner.can_stop_within(remaining) {
            return Err(CommandError::Busy("replacement target too close to brake".to_owned()));
        }
        *target = new_target;
        Ok(())
    }
}

#[cfg(test)]
#[path = "stepper_tests.rs"]
mod tests;
