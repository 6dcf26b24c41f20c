// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;
use crate::command::DeviceId;
use crate::events::EventHub;
use crate::gpio::GpioPort;
use crate::safety::SafetySupervisor;
use crate::sensors::{AdcChannel, AdcReader};
use crate::test_support::{test_channel, test_config_store, FakeAdc, FakeGpio, FakeSerial};
use crate::transport::scheduler::{Priority, SchedulerTuning};
use tokio_util::sync::CancellationToken;

struct Rig {
    aggregator: Arc<TelemetryAggregator>,
    servo: Arc<ServoController>,
    supervisor: Arc<SafetySupervisor>,
    events: Arc<EventHub>,
}

fn rig() -> Rig {
    let events = Arc::new(EventHub::new());
    let supervisor = Arc::new(SafetySupervisor::new(Arc::clone(&events)));
    supervisor.mark_ready();

    let config = test_config_store();
    let mut timing = config.hardware().timing.clone();
    timing.retry_backoff_ms = vec![1];
    let (link, _serial) = FakeSerial::new();
    let scheduler = Arc::new(LinkScheduler::start(
        link,
        SchedulerTuning::from_timing(&timing),
        Arc::clone(&events),
    ));

    let servos = [DeviceId::D1, DeviceId::D2].map(|device| {
        Arc::new(ServoController::new(
            device,
            Arc::clone(&scheduler),
            Arc::clone(&config),
            supervisor.view(),
        ))
    });
    let servo = Arc::clone(&servos[0]);

    let gpio = FakeGpio::new();
    let stepper = Arc::new(
        StepperController::start(
            config.hardware().stepper.clone(),
            gpio as Arc<dyn GpioPort>,
            supervisor.view(),
            Arc::clone(&events),
        )
        .unwrap(),
    );

    let adc = FakeAdc::new();
    adc.set_raw(AdcChannel::Voltage, 2460);
    let sensors = Arc::new(SensorSampler::spawn(
        adc as Arc<dyn AdcReader>,
        config.hardware().adc.clone(),
        Arc::clone(&events),
        CancellationToken::new(),
    ));

    let aggregator = Arc::new(TelemetryAggregator::new(
        servos,
        stepper,
        sensors,
        supervisor.view(),
        scheduler,
    ));
    Rig { aggregator, servo, supervisor, events }
}

#[tokio::test(flavor = "multi_thread")]
async fn t_ms_strictly_increases() {
    let rig = rig();
    let mut last = 0u64;
    for _ in 0..200 {
        let snapshot = rig.aggregator.snapshot();
        assert!(snapshot.t_ms > last, "t_ms {} not past {last}", snapshot.t_ms);
        last = snapshot.t_ms;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_reflects_last_commanded_targets() {
    let rig = rig();
    rig.servo.set_target(test_channel(), 1400, Priority::Normal).await.unwrap();
    rig.servo.set_target(test_channel(), 1600, Priority::Normal).await.unwrap();

    let snapshot = rig.aggregator.snapshot();
    assert_eq!(snapshot.servo_positions.get(&test_channel()), Some(&1600));
    assert_eq!(snapshot.state, crate::safety::SystemState::Normal);
    assert!(!snapshot.stepper.homed);
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_tracks_system_state() {
    let rig = rig();
    rig.supervisor.request_emergency();
    let snapshot = rig.aggregator.snapshot();
    assert_eq!(snapshot.state, crate::safety::SystemState::Emergency);
}

#[tokio::test(flavor = "multi_thread")]
async fn ticker_publishes_ordered_snapshots() {
    let rig = rig();
    let mut rx = rig.events.subscribe();
    rig.aggregator.spawn(
        Duration::from_millis(10),
        Arc::clone(&rig.events),
        CancellationToken::new(),
    );

    let mut last = 0u64;
    let mut seen = 0;
    while seen < 5 {
        if let Ok(Event::Telemetry { snapshot }) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap_or_else(|_| panic!("telemetry tick never arrived"))
        {
            assert!(snapshot.t_ms > last);
            last = snapshot.t_ms;
            seen += 1;
        }
    }
}
