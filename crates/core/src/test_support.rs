// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deterministic hardware doubles and config fixtures shared by unit and
//! integration tests. Compiled into the library so the `waldo-specs` suite
//! can drive a full `System` without real hardware.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::AudioSink;
use crate::command::ChannelId;
use crate::config::{
    ChannelLimits, ConfigStore, HardwareConfig, Scene, SceneAudio, SceneCatalog, ServoConfig,
    ServoMove,
};
use crate::gpio::{GpioPort, Level, PinDirection, PinPull};
use crate::sensors::{AdcChannel, AdcReader};
use crate::transport::serial::{SerialLink, TransportError};

// -- Serial -------------------------------------------------------------------

#[derive(Default)]
struct FakeSerialState {
    frames: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    transient_failures: u32,
    fatal: bool,
    reopen_calls: u32,
    reopen_ok_after: u32,
}

/// Scripted serial link. The link side goes to the scheduler; the handle side
/// stays with the test to inspect frames and inject faults.
pub struct FakeSerial {
    state: Arc<Mutex<FakeSerialState>>,
}

#[derive(Clone)]
pub struct FakeSerialHandle {
    state: Arc<Mutex<FakeSerialState>>,
}

impl FakeSerial {
    pub fn new() -> (Box<dyn SerialLink>, FakeSerialHandle) {
        let state = Arc::new(Mutex::new(FakeSerialState::default()));
        (Box::new(Self { state: Arc::clone(&state) }), FakeSerialHandle { state })
    }

    fn check_faults(state: &mut FakeSerialState) -> Result<(), TransportError> {
        if state.fatal {
            return Err(TransportError::Fatal(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "device removed",
            )));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(TransportError::Transient(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "injected timeout",
            )));
        }
        Ok(())
    }
}

impl SerialLink for FakeSerial {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_faults(&mut state)?;
        state.frames.push(bytes.to_vec());
        Ok(())
    }

    fn read_exact(&mut self, n: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        Self::check_faults(&mut state)?;
        match state.replies.pop_front() {
            Some(mut reply) => {
                reply.resize(n, 0);
                Ok(reply)
            }
            None => Err(TransportError::Transient(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no scripted reply",
            ))),
        }
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.reopen_calls += 1;
        if state.fatal && state.reopen_calls >= state.reopen_ok_after {
            state.fatal = false;
            return Ok(());
        }
        if state.fatal {
            return Err(TransportError::Fatal(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "still gone",
            )));
        }
        Ok(())
    }
}

impl FakeSerialHandle {
    /// Frames written so far, one entry per `write_all`.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().frames.clone()
    }

    pub fn frame_count(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn clear_frames(&self) {
        self.state.lock().frames.clear();
    }

    /// Queue a reply for the next read.
    pub fn push_reply(&self, reply: &[u8]) {
        self.state.lock().replies.push_back(reply.to_vec());
    }

    /// Fail the next `n` operations with a transient timeout.
    pub fn fail_transient(&self, n: u32) {
        self.state.lock().transient_failures = n;
    }

    /// Remove the device: everything fails fatally until `reopen_ok_after`
    /// reopen attempts have been made.
    pub fn fail_fatal(&self, reopen_ok_after: u32) {
        let mut state = self.state.lock();
        state.fatal = true;
        state.reopen_calls = 0;
        state.reopen_ok_after = reopen_ok_after;
    }

    pub fn reopen_calls(&self) -> u32 {
        self.state.lock().reopen_calls
    }
}

// -- GPIO ---------------------------------------------------------------------

struct PulseRule {
    watch_pin: u8,
    set_pin: u8,
    set_level: Level,
    after_pulses: u64,
}

#[derive(Default)]
struct FakeGpioState {
    levels: HashMap<u8, Level>,
    pulses: HashMap<u8, u64>,
    rules: Vec<PulseRule>,
}

/// In-memory pin table. `pulse` never sleeps, and rules let a test script
/// "the limit switch goes active after N step pulses".
#[derive(Default)]
pub struct FakeGpio {
    state: Mutex<FakeGpioState>,
}

impl FakeGpio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_level(&self, pin: u8, level: Level) {
        self.state.lock().levels.insert(pin, level);
    }

    pub fn level(&self, pin: u8) -> Level {
        self.state.lock().levels.get(&pin).copied().unwrap_or(Level::High)
    }

    pub fn pulse_count(&self, pin: u8) -> u64 {
        self.state.lock().pulses.get(&pin).copied().unwrap_or(0)
    }

    /// After `after_pulses` pulses on `watch_pin`, force `set_pin` to
    /// `set_level` (e.g. the homing run tripping the limit switch).
    pub fn trip_after(&self, watch_pin: u8, set_pin: u8, set_level: Level, after_pulses: u64) {
        self.state.lock().rules.push(PulseRule { watch_pin, set_pin, set_level, after_pulses });
    }
}

impl GpioPort for FakeGpio {
    fn configure(&self, pin: u8, direction: PinDirection, pull: PinPull) -> anyhow::Result<()> {
        let level = match (direction, pull) {
            (PinDirection::Input, PinPull::Down) => Level::Low,
            (PinDirection::Input, _) => Level::High,
            (PinDirection::Output, _) => Level::Low,
        };
        self.state.lock().levels.entry(pin).or_insert(level);
        Ok(())
    }

    fn write(&self, pin: u8, level: Level) -> anyhow::Result<()> {
        self.state.lock().levels.insert(pin, level);
        Ok(())
    }

    fn read(&self, pin: u8) -> anyhow::Result<Level> {
        Ok(self.level(pin))
    }

    fn pulse(&self, pin: u8, _high: Duration, _low: Duration) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let count = state.pulses.entry(pin).or_insert(0);
        *count += 1;
        let count = *count;
        let mut to_set = Vec::new();
        for rule in &state.rules {
            if rule.watch_pin == pin && count >= rule.after_pulses {
                to_set.push((rule.set_pin, rule.set_level));
            }
        }
        for (set_pin, level) in to_set {
            state.levels.insert(set_pin, level);
        }
        Ok(())
    }
}

// -- ADC ----------------------------------------------------------------------

#[derive(Default)]
struct FakeAdcState {
    voltage: i16,
    current1: i16,
    current2: i16,
    failing: bool,
}

#[derive(Default)]
pub struct FakeAdc {
    state: Mutex<FakeAdcState>,
}

impl FakeAdc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_raw(&self, channel: AdcChannel, raw: i16) {
        let mut state = self.state.lock();
        match channel {
            AdcChannel::Voltage => state.voltage = raw,
            AdcChannel::Current1 => state.current1 = raw,
            AdcChannel::Current2 => state.current2 = raw,
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }
}

impl AdcReader for FakeAdc {
    fn read_raw(&self, channel: AdcChannel) -> anyhow::Result<i16> {
        let state = self.state.lock();
        if state.failing {
            anyhow::bail!("bus failure");
        }
        Ok(match channel {
            AdcChannel::Voltage => state.voltage,
            AdcChannel::Current1 => state.current1,
            AdcChannel::Current2 => state.current2,
        })
    }
}

// -- Audio --------------------------------------------------------------------

#[derive(Default)]
struct FakeAudioState {
    started: Vec<PathBuf>,
    stops: u32,
}

#[derive(Default)]
pub struct FakeAudio {
    state: Mutex<FakeAudioState>,
}

impl FakeAudio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<PathBuf> {
        self.state.lock().started.clone()
    }

    pub fn stops(&self) -> u32 {
        self.state.lock().stops
    }
}

impl AudioSink for FakeAudio {
    fn start(&self, clip: &Path) -> anyhow::Result<()> {
        self.state.lock().started.push(clip.to_path_buf());
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().stops += 1;
    }
}

// -- Fixtures -----------------------------------------------------------------

/// `d1_ch0` with the limits used throughout the scenario tests.
pub fn test_channel() -> ChannelId {
    ChannelId { device: crate::command::DeviceId::D1, channel: 0 }
}

/// Servo config with a couple of channels on each device.
pub fn test_servo_config() -> ServoConfig {
    let mut channels = HashMap::new();
    channels.insert(
        test_channel(),
        ChannelLimits {
            min_us: 1000,
            max_us: 2000,
            home_us: 1500,
            name: "head_pan".to_owned(),
            accel: None,
            speed: None,
        },
    );
    channels.insert(
        ChannelId { device: crate::command::DeviceId::D1, channel: 1 },
        ChannelLimits {
            min_us: 1100,
            max_us: 1900,
            home_us: 1500,
            name: "head_tilt".to_owned(),
            accel: Some(30),
            speed: None,
        },
    );
    channels.insert(
        ChannelId { device: crate::command::DeviceId::D2, channel: 0 },
        ChannelLimits {
            min_us: 992,
            max_us: 2000,
            home_us: 1496,
            name: "arm_left".to_owned(),
            accel: None,
            speed: None,
        },
    );
    ServoConfig { channels }
}

/// One short scene (`happy_beep`) exercising moves, a subscript, and audio.
pub fn test_scene_catalog() -> SceneCatalog {
    let mut servo_moves = HashMap::new();
    servo_moves.insert(
        test_channel(),
        ServoMove { target_us: 1800, speed: 40, accel: 20 },
    );
    SceneCatalog {
        scenes: vec![Scene {
            name: "happy_beep".to_owned(),
            duration_s: 2.5,
            audio: Some(SceneAudio { clip: "beep".to_owned(), delay_s: 0.5 }),
            scripts: None,
            servo_moves,
            categories: vec!["demo".to_owned()],
            emoji: Some("🤖".to_owned()),
        }],
    }
}

/// Config store with test fixtures and default hardware settings.
#[allow(clippy::expect_used)]
pub fn test_config_store() -> Arc<ConfigStore> {
    let store = ConfigStore::from_parts(
        HardwareConfig::default(),
        test_servo_config(),
        test_scene_catalog(),
    )
    .expect("test fixtures validate");
    Arc::new(store)
}
