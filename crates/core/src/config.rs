// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted configuration: structures, validation, and the atomically
//! swappable [`ConfigStore`].
//!
//! Three JSON files live in the config directory: `hardware_config.json`,
//! `servo_config.json`, and `scenes_config.json`. A reload validates the
//! candidate fully before swapping it in; on rejection the prior config stays
//! active and the caller gets the complete error list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::command::{ChannelId, DeviceId};
use crate::error::CommandError;

/// Hardware-legal servo pulse width bounds, microseconds.
pub const SERVO_US_MIN: u16 = 992;
pub const SERVO_US_MAX: u16 = 2000;

// -- hardware_config.json -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { port: "/dev/ttyAMA0".to_owned(), baud: 9600 }
    }
}

/// Protocol device numbers for the two controllers on the shared link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceNumbers {
    pub d1: u8,
    pub d2: u8,
}

impl Default for DeviceNumbers {
    fn default() -> Self {
        Self { d1: 12, d2: 13 }
    }
}

impl DeviceNumbers {
    pub fn for_device(&self, device: DeviceId) -> u8 {
        match device {
            DeviceId::D1 => self.d1,
            DeviceId::D2 => self.d2,
        }
    }
}

/// What a second `move_to` does while a motion is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionConflictPolicy {
    /// Replace the pending target when directions match; reject otherwise.
    Replace,
    /// Always reject with `Busy`.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    pub steps_per_rev: u32,
    pub lead_pitch_mm: f64,
    pub max_travel_cm: f64,
    /// Step rates, steps per second.
    pub homing_sps: f64,
    pub normal_sps: f64,
    pub max_sps: f64,
    /// Acceleration, steps per second squared.
    pub accel_sps2: f64,
    pub pulse_high_ns: u64,
    /// Homing gives up after this many steps without a limit edge.
    pub max_homing_steps: u64,
    pub step_pin: u8,
    pub dir_pin: u8,
    pub enable_pin: u8,
    pub limit_pin: u8,
    pub on_conflict: MotionConflictPolicy,
    /// Limit debounce: consecutive active samples required, and the interval
    /// between samples in microseconds.
    pub debounce_samples: u32,
    pub debounce_interval_us: u64,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            steps_per_rev: 3200,
            lead_pitch_mm: 8.0,
            max_travel_cm: 15.0,
            homing_sps: 800.0,
            normal_sps: 2000.0,
            max_sps: 4000.0,
            accel_sps2: 8000.0,
            pulse_high_ns: 2_000,
            max_homing_steps: 40_000,
            step_pin: 17,
            dir_pin: 27,
            enable_pin: 22,
            limit_pin: 23,
            on_conflict: MotionConflictPolicy::Replace,
            debounce_samples: 3,
            debounce_interval_us: 500,
        }
    }
}

impl StepperConfig {
    /// Steps per centimeter of travel, derived from the leadscrew geometry.
    pub fn steps_per_cm(&self) -> f64 {
        self.steps_per_rev as f64 / (self.lead_pitch_mm / 10.0)
    }

    /// Upper soft limit in steps. Lower soft limit is always zero (home).
    pub fn soft_max_steps(&self) -> i64 {
        (self.max_travel_cm * self.steps_per_cm()) as i64
    }
}

/// Linear calibration: `engineering = scale * raw + offset`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Calibration {
    pub scale: f64,
    pub offset: f64,
}

impl Calibration {
    pub fn apply(&self, raw: i16) -> f64 {
        self.scale * raw as f64 + self.offset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub sample_hz: f64,
    /// Consecutive read failures before a `SensorDegraded` alert.
    pub max_failures: u32,
    pub voltage: Calibration,
    pub current_ch1: Calibration,
    pub current_ch2: Calibration,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            sample_hz: 5.0,
            max_failures: 10,
            voltage: Calibration { scale: 0.00488, offset: 0.0 },
            current_ch1: Calibration { scale: 0.0264, offset: -13.51 },
            current_ch2: Calibration { scale: 0.0264, offset: -13.51 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub estop_pin: u8,
    /// Escalate to failsafe below this voltage...
    pub v_low: f64,
    /// ...or above this current...
    pub i_max: f64,
    /// ...sustained for this long.
    pub dwell_s: f64,
    /// Recovery needs `v >= v_low + recover_margin_v` for `recover_s`.
    pub recover_margin_v: f64,
    pub recover_s: f64,
    /// Channels forced to a safe level while in failsafe (track motors).
    pub failsafe_channels: Vec<ChannelId>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            estop_pin: 24,
            v_low: 11.1,
            i_max: 18.0,
            dwell_s: 2.0,
            recover_margin_v: 0.4,
            recover_s: 5.0,
            failsafe_channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Player command; the clip path is appended as the final argument.
    pub player: String,
    pub clip_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { player: "aplay".to_owned(), clip_dir: PathBuf::from("audio") }
    }
}

/// Timeouts, intervals, and scheduler tuning. Tests shrink these to keep
/// wall time down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Scheduler request timeout when no reply is expected.
    pub request_timeout_ms: u64,
    /// Scheduler request timeout when a reply is expected.
    pub reply_timeout_ms: u64,
    /// Transient-IO retry backoff schedule. Length bounds the retry count.
    pub retry_backoff_ms: Vec<u64>,
    /// Reopen attempt interval while the link is quarantined.
    pub reopen_interval_ms: u64,
    /// Max same-device commands coalesced into one write.
    pub batch_max: usize,
    /// Per-class scheduler queue capacity.
    pub queue_capacity: usize,
    pub telemetry_interval_ms: u64,
    pub scene_dispatch_ms: u64,
    pub audio_start_ms: u64,
    pub homing_timeout_s: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 500,
            reply_timeout_ms: 1000,
            retry_backoff_ms: vec![10, 40, 160],
            reopen_interval_ms: 1000,
            batch_max: 8,
            queue_capacity: 64,
            telemetry_interval_ms: 200,
            scene_dispatch_ms: 250,
            audio_start_ms: 500,
            homing_timeout_s: 30,
        }
    }
}

impl TimingConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn reopen_interval(&self) -> Duration {
        Duration::from_millis(self.reopen_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub serial: SerialConfig,
    pub devices: DeviceNumbers,
    pub stepper: StepperConfig,
    pub adc: AdcConfig,
    pub safety: SafetyConfig,
    pub audio: AudioConfig,
    pub timing: TimingConfig,
}

impl HardwareConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.stepper.lead_pitch_mm <= 0.0 {
            errors.push("stepper.lead_pitch_mm must be positive".to_owned());
        }
        if self.stepper.max_travel_cm <= 0.0 {
            errors.push("stepper.max_travel_cm must be positive".to_owned());
        }
        if self.stepper.homing_sps <= 0.0 || self.stepper.normal_sps <= 0.0 {
            errors.push("stepper step rates must be positive".to_owned());
        }
        if self.stepper.normal_sps > self.stepper.max_sps {
            errors.push("stepper.normal_sps exceeds stepper.max_sps".to_owned());
        }
        if self.stepper.accel_sps2 <= 0.0 {
            errors.push("stepper.accel_sps2 must be positive".to_owned());
        }
        if self.stepper.debounce_samples == 0 {
            errors.push("stepper.debounce_samples must be at least 1".to_owned());
        }
        if self.timing.retry_backoff_ms.is_empty() {
            errors.push("timing.retry_backoff_ms must not be empty".to_owned());
        }
        if self.timing.batch_max == 0 {
            errors.push("timing.batch_max must be at least 1".to_owned());
        }
        if self.timing.queue_capacity == 0 {
            errors.push("timing.queue_capacity must be at least 1".to_owned());
        }
        if self.adc.sample_hz <= 0.0 {
            errors.push("adc.sample_hz must be positive".to_owned());
        }
        if self.safety.dwell_s < 0.0 || self.safety.recover_s < 0.0 {
            errors.push("safety dwell/recover times must not be negative".to_owned());
        }
        errors
    }
}

// -- servo_config.json --------------------------------------------------------

/// Soft limits and metadata for one servo channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLimits {
    pub min_us: u16,
    pub max_us: u16,
    pub home_us: u16,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
}

impl ChannelLimits {
    fn validate(&self, id: ChannelId) -> Vec<String> {
        let mut errors = Vec::new();
        if self.min_us < SERVO_US_MIN || self.max_us > SERVO_US_MAX {
            errors.push(format!(
                "{id}: limits [{}, {}] outside hardware range [{SERVO_US_MIN}, {SERVO_US_MAX}]",
                self.min_us, self.max_us
            ));
        }
        if !(self.min_us <= self.home_us && self.home_us <= self.max_us) {
            errors.push(format!(
                "{id}: home {} outside [{}, {}]",
                self.home_us, self.min_us, self.max_us
            ));
        }
        errors
    }
}

/// Per-channel limit table, keyed by `"dN_chM"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServoConfig {
    pub channels: HashMap<ChannelId, ChannelLimits>,
}

impl ServoConfig {
    pub fn limits(&self, id: ChannelId) -> Option<&ChannelLimits> {
        self.channels.get(&id)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (id, limits) in &self.channels {
            errors.extend(limits.validate(*id));
        }
        errors
    }
}

// -- scenes_config.json -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneAudio {
    pub clip: String,
    #[serde(default)]
    pub delay_s: f64,
}

/// On-device script subroutines to kick off at scene start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneScripts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d1: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d2: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServoMove {
    pub target_us: u16,
    pub speed: u8,
    pub accel: u8,
}

/// A named, time-bounded program of synchronized servo moves and audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub name: String,
    pub duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<SceneAudio>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts: Option<SceneScripts>,
    #[serde(default)]
    pub servo_moves: HashMap<ChannelId, ServoMove>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneCatalog {
    pub scenes: Vec<Scene>,
}

impl SceneCatalog {
    pub fn get(&self, name: &str) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.name == name)
    }

    fn validate(&self, servo: &ServoConfig) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for scene in &self.scenes {
            if !seen.insert(scene.name.as_str()) {
                errors.push(format!("scene '{}' defined twice", scene.name));
            }
            if scene.duration_s <= 0.0 {
                errors.push(format!("scene '{}': duration must be positive", scene.name));
            }
            if let Some(ref audio) = scene.audio {
                if audio.delay_s < 0.0 || audio.delay_s > scene.duration_s {
                    errors.push(format!(
                        "scene '{}': audio delay {} outside [0, {}]",
                        scene.name, audio.delay_s, scene.duration_s
                    ));
                }
            }
            for (id, mv) in &scene.servo_moves {
                match servo.limits(*id) {
                    None => {
                        errors.push(format!("scene '{}': unknown channel {id}", scene.name));
                    }
                    Some(limits) => {
                        if mv.target_us < limits.min_us || mv.target_us > limits.max_us {
                            errors.push(format!(
                                "scene '{}': {id} target {} outside [{}, {}]",
                                scene.name, mv.target_us, limits.min_us, limits.max_us
                            ));
                        }
                    }
                }
            }
        }
        errors
    }
}

// -- Store --------------------------------------------------------------------

pub const HARDWARE_CONFIG: &str = "hardware_config.json";
pub const SERVO_CONFIG: &str = "servo_config.json";
pub const SCENES_CONFIG: &str = "scenes_config.json";

/// Atomically swappable configuration root.
///
/// Readers hold `Arc` snapshots, so a reload never tears a consumer mid-read:
/// scene edits take effect for the next `play`, servo-limit changes on the
/// next command.
#[derive(Debug)]
pub struct ConfigStore {
    dir: PathBuf,
    hardware: RwLock<Arc<HardwareConfig>>,
    servo: RwLock<Arc<ServoConfig>>,
    scenes: RwLock<Arc<SceneCatalog>>,
}

impl ConfigStore {
    /// Load all config files from `dir`. Missing files fall back to defaults;
    /// present-but-invalid files fail startup.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, CommandError> {
        let dir = dir.into();
        let hardware: HardwareConfig = read_or_default(&dir.join(HARDWARE_CONFIG))?;
        let servo: ServoConfig = read_or_default(&dir.join(SERVO_CONFIG))?;
        let scenes: SceneCatalog = read_or_default(&dir.join(SCENES_CONFIG))?;

        let mut errors = hardware.validate();
        errors.extend(servo.validate());
        errors.extend(scenes.validate(&servo));
        if !errors.is_empty() {
            return Err(CommandError::ConfigInvalid { errors });
        }

        Ok(Self {
            dir,
            hardware: RwLock::new(Arc::new(hardware)),
            servo: RwLock::new(Arc::new(servo)),
            scenes: RwLock::new(Arc::new(scenes)),
        })
    }

    /// Build a store from in-memory values (tests, embedded defaults).
    pub fn from_parts(
        hardware: HardwareConfig,
        servo: ServoConfig,
        scenes: SceneCatalog,
    ) -> Result<Self, CommandError> {
        let mut errors = hardware.validate();
        errors.extend(servo.validate());
        errors.extend(scenes.validate(&servo));
        if !errors.is_empty() {
            return Err(CommandError::ConfigInvalid { errors });
        }
        Ok(Self {
            dir: PathBuf::new(),
            hardware: RwLock::new(Arc::new(hardware)),
            servo: RwLock::new(Arc::new(servo)),
            scenes: RwLock::new(Arc::new(scenes)),
        })
    }

    pub fn hardware(&self) -> Arc<HardwareConfig> {
        Arc::clone(&self.hardware.read())
    }

    pub fn servo(&self) -> Arc<ServoConfig> {
        Arc::clone(&self.servo.read())
    }

    pub fn scenes(&self) -> Arc<SceneCatalog> {
        Arc::clone(&self.scenes.read())
    }

    /// Re-read one config file by name, validate against the other live
    /// configs, and swap it in atomically. On any validation error the prior
    /// config is kept and the full error list is returned.
    pub fn reload(&self, name: &str) -> Result<(), CommandError> {
        match name {
            HARDWARE_CONFIG => {
                let candidate: HardwareConfig = read_file(&self.dir.join(HARDWARE_CONFIG))?;
                let errors = candidate.validate();
                if !errors.is_empty() {
                    return Err(CommandError::ConfigInvalid { errors });
                }
                *self.hardware.write() = Arc::new(candidate);
            }
            SERVO_CONFIG => {
                let candidate: ServoConfig = read_file(&self.dir.join(SERVO_CONFIG))?;
                let mut errors = candidate.validate();
                errors.extend(self.scenes().validate(&candidate));
                if !errors.is_empty() {
                    return Err(CommandError::ConfigInvalid { errors });
                }
                *self.servo.write() = Arc::new(candidate);
            }
            SCENES_CONFIG => {
                let candidate: SceneCatalog = read_file(&self.dir.join(SCENES_CONFIG))?;
                let errors = candidate.validate(&self.servo());
                if !errors.is_empty() {
                    return Err(CommandError::ConfigInvalid { errors });
                }
                *self.scenes.write() = Arc::new(candidate);
            }
            other => {
                return Err(CommandError::ConfigInvalid {
                    errors: vec![format!("unknown config file '{other}'")],
                });
            }
        }
        tracing::info!(config = name, "configuration reloaded");
        Ok(())
    }

    /// Update one channel's limits and persist the servo config file
    /// (write-temp-then-rename so a crash never leaves a torn file).
    pub fn set_channel_limits(
        &self,
        id: ChannelId,
        limits: ChannelLimits,
    ) -> Result<(), CommandError> {
        let errors = limits.validate(id);
        if !errors.is_empty() {
            return Err(CommandError::ConfigInvalid { errors });
        }

        let mut guard = self.servo.write();
        let mut next = (**guard).clone();
        next.channels.insert(id, limits);

        let errors = self.scenes.read().validate(&next);
        if !errors.is_empty() {
            return Err(CommandError::ConfigInvalid { errors });
        }

        if !self.dir.as_os_str().is_empty() {
            persist_json(&self.dir.join(SERVO_CONFIG), &next)?;
        }
        *guard = Arc::new(next);
        Ok(())
    }
}

fn read_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, CommandError> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_file(path)
}

fn read_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CommandError> {
    let contents = std::fs::read_to_string(path).map_err(|e| CommandError::ConfigInvalid {
        errors: vec![format!("{}: {e}", path.display())],
    })?;
    serde_json::from_str(&contents).map_err(|e| CommandError::ConfigInvalid {
        errors: vec![format!("{}: {e}", path.display())],
    })
}

fn persist_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CommandError> {
    let io_err = |e: std::io::Error| CommandError::ConfigInvalid {
        errors: vec![format!("{}: {e}", path.display())],
    };
    let json = serde_json::to_string_pretty(value).map_err(|e| CommandError::ConfigInvalid {
        errors: vec![format!("{}: {e}", path.display())],
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
