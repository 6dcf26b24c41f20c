// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::command::DeviceId;
use crate::test_support::{test_scene_catalog, test_servo_config};

fn ch(device: DeviceId, channel: u8) -> ChannelId {
    ChannelId { device, channel }
}

#[test]
fn defaults_validate() {
    let store = ConfigStore::from_parts(
        HardwareConfig::default(),
        test_servo_config(),
        test_scene_catalog(),
    );
    assert!(store.is_ok());
}

#[test]
fn limits_reject_inverted_home() {
    let mut servo = test_servo_config();
    servo.channels.insert(
        ch(DeviceId::D1, 2),
        ChannelLimits {
            min_us: 1400,
            max_us: 1600,
            home_us: 1300,
            name: "bad".to_owned(),
            accel: None,
            speed: None,
        },
    );
    let err = ConfigStore::from_parts(HardwareConfig::default(), servo, SceneCatalog::default());
    match err {
        Err(CommandError::ConfigInvalid { errors }) => {
            assert!(errors.iter().any(|e| e.contains("d1_ch2")));
        }
        other => panic!("expected ConfigInvalid, got {other:?}"),
    }
}

#[test]
fn limits_reject_outside_hardware_range() {
    let mut servo = ServoConfig::default();
    servo.channels.insert(
        ch(DeviceId::D1, 0),
        ChannelLimits {
            min_us: 900,
            max_us: 2000,
            home_us: 1500,
            name: "wide".to_owned(),
            accel: None,
            speed: None,
        },
    );
    let err = ConfigStore::from_parts(HardwareConfig::default(), servo, SceneCatalog::default());
    assert!(matches!(err, Err(CommandError::ConfigInvalid { .. })));
}

#[test]
fn scenes_must_resolve_channels() {
    let mut catalog = test_scene_catalog();
    catalog.scenes[0]
        .servo_moves
        .insert(ch(DeviceId::D2, 15), ServoMove { target_us: 1500, speed: 0, accel: 0 });
    let err = ConfigStore::from_parts(HardwareConfig::default(), test_servo_config(), catalog);
    match err {
        Err(CommandError::ConfigInvalid { errors }) => {
            assert!(errors.iter().any(|e| e.contains("d2_ch15")));
        }
        other => panic!("expected ConfigInvalid, got {other:?}"),
    }
}

#[test]
fn scene_audio_delay_bounded_by_duration() {
    let mut catalog = test_scene_catalog();
    catalog.scenes[0].audio = Some(SceneAudio { clip: "beep".to_owned(), delay_s: 99.0 });
    let err = ConfigStore::from_parts(HardwareConfig::default(), test_servo_config(), catalog);
    assert!(matches!(err, Err(CommandError::ConfigInvalid { .. })));
}

#[test]
fn steps_per_cm_derivation() {
    let stepper = StepperConfig {
        steps_per_rev: 1000,
        lead_pitch_mm: 10.0,
        max_travel_cm: 10.0,
        ..StepperConfig::default()
    };
    assert!((stepper.steps_per_cm() - 1000.0).abs() < f64::EPSILON);
    assert_eq!(stepper.soft_max_steps(), 10_000);
}

#[test]
fn catalog_round_trips_through_json() {
    let catalog = test_scene_catalog();
    let json = serde_json::to_string(&catalog).unwrap();
    let parsed: SceneCatalog = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, catalog);
}

#[test]
fn servo_config_round_trips_through_json() {
    let servo = test_servo_config();
    let json = serde_json::to_string(&servo).unwrap();
    let parsed: ServoConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, servo);
}

#[test]
fn reload_rejects_invalid_and_keeps_prior() {
    let dir = tempfile::tempdir().unwrap();
    let servo_path = dir.path().join(SERVO_CONFIG);
    std::fs::write(&servo_path, serde_json::to_string(&test_servo_config()).unwrap()).unwrap();

    let store = ConfigStore::load(dir.path()).unwrap();
    let before = store.servo();
    assert!(before.limits(ch(DeviceId::D1, 0)).is_some());

    // Break the file: min above max.
    std::fs::write(
        &servo_path,
        r#"{"d1_ch0": {"min_us": 1900, "max_us": 1000, "home_us": 1500, "name": "broken"}}"#,
    )
    .unwrap();

    let err = store.reload(SERVO_CONFIG);
    assert!(matches!(err, Err(CommandError::ConfigInvalid { .. })));
    assert_eq!(store.servo().channels, before.channels);
}

#[test]
fn reload_applies_valid_scene_edits() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(SERVO_CONFIG),
        serde_json::to_string(&test_servo_config()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join(SCENES_CONFIG),
        serde_json::to_string(&test_scene_catalog()).unwrap(),
    )
    .unwrap();

    let store = ConfigStore::load(dir.path()).unwrap();
    let mut catalog = test_scene_catalog();
    catalog.scenes[0].duration_s = 4.0;
    std::fs::write(dir.path().join(SCENES_CONFIG), serde_json::to_string(&catalog).unwrap())
        .unwrap();

    store.reload(SCENES_CONFIG).unwrap();
    assert_eq!(store.scenes().scenes[0].duration_s, 4.0);
}

#[test]
fn reload_unknown_name_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::load(dir.path()).unwrap();
    assert!(matches!(
        store.reload("controller_config.json"),
        Err(CommandError::ConfigInvalid { .. })
    ));
}

#[test]
fn set_channel_limits_persists_atomically() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(SERVO_CONFIG),
        serde_json::to_string(&test_servo_config()).unwrap(),
    )
    .unwrap();
    let store = ConfigStore::load(dir.path()).unwrap();

    let limits = ChannelLimits {
        min_us: 1200,
        max_us: 1800,
        home_us: 1500,
        name: "head_pan".to_owned(),
        accel: Some(12),
        speed: None,
    };
    store.set_channel_limits(ch(DeviceId::D1, 0), limits.clone()).unwrap();

    // Live view and on-disk file both updated.
    assert_eq!(store.servo().limits(ch(DeviceId::D1, 0)), Some(&limits));
    let on_disk: ServoConfig =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(SERVO_CONFIG)).unwrap())
            .unwrap();
    assert_eq!(on_disk.limits(ch(DeviceId::D1, 0)), Some(&limits));
    assert!(!dir.path().join("servo_config.json.tmp").exists());
}

#[test]
fn set_channel_limits_rejects_when_scene_breaks() {
    let store = ConfigStore::from_parts(
        HardwareConfig::default(),
        test_servo_config(),
        test_scene_catalog(),
    )
    .unwrap();

    // happy_beep targets d1_ch0 at 1800; shrinking the max below that must fail.
    let err = store.set_channel_limits(
        ch(DeviceId::D1, 0),
        ChannelLimits {
            min_us: 1000,
            max_us: 1500,
            home_us: 1500,
            name: "head_pan".to_owned(),
            accel: None,
            speed: None,
        },
    );
    assert!(matches!(err, Err(CommandError::ConfigInvalid { .. })));
}
