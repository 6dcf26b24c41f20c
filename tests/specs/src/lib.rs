// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end rig: a full `System` wired to in-memory hardware doubles with
//! timing shrunk so whole scenarios run in well under a second.

use std::collections::HashMap;
use std::sync::Arc;

use waldo_core::command::{ChannelId, DeviceId};
use waldo_core::config::{
    ChannelLimits, ConfigStore, HardwareConfig, Scene, SceneAudio, SceneCatalog, ServoConfig,
    ServoMove,
};
use waldo_core::system::{Hardware, System};
use waldo_core::test_support::{
    FakeAdc, FakeAudio, FakeGpio, FakeSerial, FakeSerialHandle,
};

pub struct TestRig {
    pub system: Arc<System>,
    pub serial: FakeSerialHandle,
    pub gpio: Arc<FakeGpio>,
    pub adc: Arc<FakeAdc>,
    pub audio: Arc<FakeAudio>,
    pub config: Arc<ConfigStore>,
    _clips: tempfile::TempDir,
}

pub fn head_pan() -> ChannelId {
    ChannelId { device: DeviceId::D1, channel: 0 }
}

pub fn track_motor() -> ChannelId {
    ChannelId { device: DeviceId::D2, channel: 0 }
}

fn fast_hardware_config(clip_dir: &std::path::Path) -> HardwareConfig {
    let mut hw = HardwareConfig::default();

    // S3 geometry: 1000 steps/cm, 10 cm of travel, rates high enough that a
    // five-thousand-step move finishes quickly.
    hw.stepper.steps_per_rev = 1000;
    hw.stepper.lead_pitch_mm = 10.0;
    hw.stepper.max_travel_cm = 10.0;
    hw.stepper.homing_sps = 20_000.0;
    hw.stepper.normal_sps = 20_000.0;
    hw.stepper.max_sps = 40_000.0;
    hw.stepper.accel_sps2 = 400_000.0;
    hw.stepper.pulse_high_ns = 100;
    hw.stepper.debounce_interval_us = 10;

    hw.timing.retry_backoff_ms = vec![1, 2, 4];
    hw.timing.reopen_interval_ms = 10;
    hw.timing.telemetry_interval_ms = 20;

    hw.safety.failsafe_channels = vec![track_motor()];
    hw.audio.clip_dir = clip_dir.to_path_buf();
    hw
}

fn rig_servo_config() -> ServoConfig {
    let mut channels = HashMap::new();
    channels.insert(
        head_pan(),
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
        track_motor(),
        ChannelLimits {
            min_us: 992,
            max_us: 2000,
            home_us: 1496,
            name: "track_left".to_owned(),
            accel: None,
            speed: None,
        },
    );
    ServoConfig { channels }
}

fn rig_scene_catalog() -> SceneCatalog {
    let mut servo_moves = HashMap::new();
    servo_moves.insert(head_pan(), ServoMove { target_us: 1800, speed: 40, accel: 20 });
    SceneCatalog {
        scenes: vec![Scene {
            name: "happy_beep".to_owned(),
            duration_s: 0.5,
            audio: Some(SceneAudio { clip: "beep".to_owned(), delay_s: 0.2 }),
            scripts: None,
            servo_moves,
            categories: vec!["demo".to_owned()],
            emoji: Some("🤖".to_owned()),
        }],
    }
}

/// Boot a full system on fakes. Must run inside a multi-thread tokio runtime.
pub fn boot() -> anyhow::Result<TestRig> {
    let clips = tempfile::tempdir()?;
    std::fs::write(clips.path().join("beep.wav"), b"riff")?;

    let config = Arc::new(ConfigStore::from_parts(
        fast_hardware_config(clips.path()),
        rig_servo_config(),
        rig_scene_catalog(),
    )?);

    let (serial_link, serial) = FakeSerial::new();
    let gpio = FakeGpio::new();
    let adc = FakeAdc::new();
    let audio = FakeAudio::new();

    let system = System::start(
        Arc::clone(&config),
        Hardware {
            serial: serial_link,
            gpio: Arc::clone(&gpio) as Arc<dyn waldo_core::gpio::GpioPort>,
            adc: Arc::clone(&adc) as Arc<dyn waldo_core::sensors::AdcReader>,
            audio: Arc::clone(&audio) as Arc<dyn waldo_core::audio::AudioSink>,
        },
    )?;

    Ok(TestRig { system, serial, gpio, adc, audio, config, _clips: clips })
}
