// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios driving the full system through its command surface.

use std::time::Duration;

use waldo_core::command::{ChannelId, Command};
use waldo_core::error::CommandError;
use waldo_core::events::Event;
use waldo_core::gpio::Level;
use waldo_core::safety::SystemState;
use waldo_core::stepper::StepperMode;
use waldo_core::transport::scheduler::Priority;

use waldo_specs::{boot, head_pan};

fn servo_command(channel: ChannelId, position: u16) -> Command {
    Command::Servo { channel, position, speed: None, acceleration: None, priority: None }
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_servo_limit_enforced_end_to_end() {
    let rig = boot().unwrap();

    let err = rig.system.handle_command(servo_command(head_pan(), 2001)).await;
    assert!(matches!(err, Err(CommandError::OutOfRange(_))));
    assert_eq!(rig.serial.frame_count(), 0, "rejected command must not reach the wire");

    rig.system.handle_command(servo_command(head_pan(), 2000)).await.unwrap();
    assert_eq!(rig.system.servo_position(head_pan()), Some(2000));
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_homing_then_absolute_move() {
    let rig = boot().unwrap();
    let stepper_cfg = rig.config.hardware().stepper.clone();

    rig.system.handle_command(Command::StepperEnable).await.unwrap();
    rig.gpio.trip_after(stepper_cfg.step_pin, stepper_cfg.limit_pin, Level::Low, 1_200);
    rig.system.handle_command(Command::StepperHome).await.unwrap();

    let status = rig.system.stepper().status();
    assert_eq!(status.position_steps, 0);
    assert!(status.homed);
    assert_eq!(status.mode, StepperMode::Idle);

    rig.gpio.set_level(stepper_cfg.limit_pin, Level::High);
    rig.system
        .handle_command(Command::StepperMove {
            position_cm: Some(5.0),
            distance_cm: None,
            speed: None,
        })
        .await
        .unwrap();
    assert_eq!(rig.system.stepper().status().position_steps, 5_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_emergency_during_scene() {
    let rig = boot().unwrap();
    let mut events = rig.system.subscribe();

    rig.system
        .handle_command(Command::Scene { scene_name: "happy_beep".to_owned(), replace: false })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    rig.system.handle_command(Command::EmergencyStop).await.unwrap();
    assert_eq!(rig.system.state(), SystemState::Emergency);

    // Event order: the state change lands before the scene cancellation.
    let mut ordered = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            Event::StateChanged { next: SystemState::Emergency, .. } => {
                ordered.push("state_changed")
            }
            Event::SceneCancelled { ref reason, .. } if reason == "emergency" => {
                ordered.push("scene_cancelled")
            }
            _ => {}
        }
    }
    assert_eq!(ordered, vec!["state_changed", "scene_cancelled"]);

    // Both devices received their stop frames.
    let frames = rig.serial.frames();
    for device_number in [12u8, 13] {
        assert!(
            frames.iter().any(|f| f.starts_with(&[0xAA, device_number, 0x24])),
            "no stop frame for device {device_number}"
        );
    }

    // The stepper is halted and disabled.
    let stepper = rig.system.stepper().status();
    assert!(!stepper.enabled);

    // Writes stay forbidden until the emergency is cleared.
    let err = rig.system.handle_command(servo_command(head_pan(), 1500)).await;
    assert!(matches!(err, Err(CommandError::StateForbidsWrite { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_transport_loss_and_recovery() {
    let rig = boot().unwrap();

    // Warm write proves the link works.
    rig.system.handle_command(servo_command(head_pan(), 1500)).await.unwrap();

    // Device disappears: the in-flight command fails and the link quarantines.
    rig.serial.fail_fatal(2);
    let err = rig.system.handle_command(servo_command(head_pan(), 1600)).await;
    assert!(matches!(
        err,
        Err(CommandError::TransportDown | CommandError::TransportFailed)
    ));

    // Fast-fail while quarantined.
    if rig.system.scheduler().link_down() {
        let err = rig.system.handle_command(servo_command(head_pan(), 1700)).await;
        assert!(matches!(err, Err(CommandError::TransportDown)));
    }

    // Reopen loop brings the link back; traffic resumes.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while rig.system.scheduler().link_down() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!rig.system.scheduler().link_down());
    rig.system.handle_command(servo_command(head_pan(), 1800)).await.unwrap();
    assert_eq!(rig.system.servo_position(head_pan()), Some(1800));
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_telemetry_ordering_under_command_load() {
    let rig = boot().unwrap();
    let mut last_t = 0u64;
    let mut last_target = 0u16;

    for i in 0..200u16 {
        let target = 1000 + (i % 100) * 10;
        rig.system.handle_command(servo_command(head_pan(), target)).await.unwrap();
        last_target = target;

        if i % 10 == 0 {
            let snapshot = rig.system.telemetry().snapshot();
            assert!(snapshot.t_ms > last_t, "t_ms regressed");
            last_t = snapshot.t_ms;
            assert_eq!(
                snapshot.servo_positions.get(&head_pan()),
                Some(&target),
                "snapshot must reflect the most recent successful target"
            );
        }
    }

    let final_snapshot = rig.system.telemetry().snapshot();
    assert!(final_snapshot.t_ms > last_t);
    assert_eq!(final_snapshot.servo_positions.get(&head_pan()), Some(&last_target));
}

#[tokio::test(flavor = "multi_thread")]
async fn emergency_stop_is_idempotent() {
    let rig = boot().unwrap();

    rig.system.handle_command(Command::EmergencyStop).await.unwrap();
    rig.system.handle_command(Command::EmergencyStop).await.unwrap();
    rig.system.handle_command(Command::EmergencyStop).await.unwrap();
    assert_eq!(rig.system.state(), SystemState::Emergency);

    rig.system.handle_command(Command::EmergencyClear).await.unwrap();
    assert_eq!(rig.system.state(), SystemState::Normal);
    rig.system.handle_command(servo_command(head_pan(), 1500)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn physical_estop_edge_triggers_the_same_stop() {
    let rig = boot().unwrap();
    let estop_pin = rig.config.hardware().safety.estop_pin;

    rig.gpio.set_level(estop_pin, Level::Low);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while rig.system.state() != SystemState::Emergency
        && std::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(rig.system.state(), SystemState::Emergency);
}

#[tokio::test(flavor = "multi_thread")]
async fn failsafe_parks_track_channels_but_not_others() {
    let rig = boot().unwrap();

    rig.system.handle_command(Command::EnableFailsafe).await.unwrap();
    assert_eq!(rig.system.state(), SystemState::Failsafe);

    // Track motor writes rejected; head stays commandable.
    let track = rig
        .system
        .handle_command(servo_command(waldo_specs::track_motor(), 1500))
        .await;
    assert!(matches!(track, Err(CommandError::StateForbidsWrite { .. })));
    rig.system.handle_command(servo_command(head_pan(), 1500)).await.unwrap();

    rig.system.handle_command(Command::DisableFailsafe).await.unwrap();
    assert_eq!(rig.system.state(), SystemState::Normal);
}

#[tokio::test(flavor = "multi_thread")]
async fn scene_catalog_round_trips_through_the_wire_shape() {
    let rig = boot().unwrap();

    let reply = rig.system.handle_command(Command::GetSceneList).await.unwrap();
    let parsed: Vec<waldo_core::config::Scene> =
        serde_json::from_value(reply["scenes"].clone()).unwrap();
    assert_eq!(parsed, rig.config.scenes().scenes);
}

#[tokio::test(flavor = "multi_thread")]
async fn servo_config_updates_apply_to_the_next_command() {
    let rig = boot().unwrap();

    rig.system.handle_command(servo_command(head_pan(), 1100)).await.unwrap();

    let reply = rig.system.handle_command(Command::GetServoConfig { channel: head_pan() }).await.unwrap();
    let mut limits: waldo_core::config::ChannelLimits =
        serde_json::from_value(reply["limits"].clone()).unwrap();

    limits.min_us = 1200;
    rig.system
        .handle_command(Command::SetServoConfig { channel: head_pan(), limits })
        .await
        .unwrap();

    let err = rig.system.handle_command(servo_command(head_pan(), 1100)).await;
    assert!(matches!(err, Err(CommandError::OutOfRange(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn scene_priority_traffic_reaches_the_wire() {
    let rig = boot().unwrap();
    rig.system
        .handle_command(Command::Scene { scene_name: "happy_beep".to_owned(), replace: false })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(rig.system.servo_position(head_pan()), Some(1800));
    assert_eq!(rig.audio.started().len(), 1);

    // Direct commands still work at a different priority class.
    rig.system
        .handle_command(Command::Servo {
            channel: head_pan(),
            position: 1200,
            speed: None,
            acceleration: None,
            priority: Some(Priority::High),
        })
        .await
        .unwrap();
    assert_eq!(rig.system.servo_position(head_pan()), Some(1200));
}

#[tokio::test(flavor = "multi_thread")]
async fn stepper_move_rejected_without_home() {
    let rig = boot().unwrap();
    rig.system.handle_command(Command::StepperEnable).await.unwrap();

    let err = rig
        .system
        .handle_command(Command::StepperMove {
            position_cm: Some(1.0),
            distance_cm: None,
            speed: None,
        })
        .await;
    assert!(matches!(err, Err(CommandError::Busy(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn stepper_move_requires_exactly_one_target_form() {
    let rig = boot().unwrap();
    let err = rig
        .system
        .handle_command(Command::StepperMove { position_cm: None, distance_cm: None, speed: None })
        .await;
    assert!(matches!(err, Err(CommandError::BadRequest(_))));

    let err = rig
        .system
        .handle_command(Command::StepperMove {
            position_cm: Some(1.0),
            distance_cm: Some(1.0),
            speed: None,
        })
        .await;
    assert!(matches!(err, Err(CommandError::BadRequest(_))));
}
