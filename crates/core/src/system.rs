// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The root `System`: constructs and exclusively owns every component, wires
//! the safety gating between them, and dispatches commands from adapters.
//!
//! Adapters only ever see this type (plus the event hub's receivers), so all
//! authorization and orchestration decisions stay in one place. Emergency
//! handling in particular has a single executor: both the `emergency_stop`
//! command and the physical E-stop edge funnel into [`System::emergency_stop`].

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioPlayer, AudioSink};
use crate::command::{ChannelId, Command, DeviceId};
use crate::config::ConfigStore;
use crate::error::CommandError;
use crate::events::{Event, EventHub};
use crate::gpio::GpioPort;
use crate::safety::{self, SafetySupervisor, SystemState};
use crate::scene::SceneEngine;
use crate::sensors::{AdcReader, SensorSampler};
use crate::servo::ServoController;
use crate::stepper::StepperController;
use crate::telemetry::TelemetryAggregator;
use crate::transport::scheduler::{LinkScheduler, Priority, SchedulerTuning};
use crate::transport::serial::SerialLink;

/// Hardware handed to the system at startup. Production builds these from
/// `hardware_config.json`; tests hand in the doubles from `test_support`.
pub struct Hardware {
    pub serial: Box<dyn SerialLink>,
    pub gpio: Arc<dyn GpioPort>,
    pub adc: Arc<dyn AdcReader>,
    pub audio: Arc<dyn AudioSink>,
}

pub struct System {
    config: Arc<ConfigStore>,
    events: Arc<EventHub>,
    supervisor: Arc<SafetySupervisor>,
    scheduler: Arc<LinkScheduler>,
    servos: [Arc<ServoController>; 2],
    stepper: Arc<StepperController>,
    audio: Arc<AudioPlayer>,
    scenes: SceneEngine,
    telemetry: Arc<TelemetryAggregator>,
    started: Instant,
    cancel: CancellationToken,
}

impl System {
    /// Build every component, spawn the worker loops, and transition the
    /// supervisor to `Normal`.
    pub fn start(config: Arc<ConfigStore>, hardware: Hardware) -> anyhow::Result<Arc<Self>> {
        let hw = config.hardware();
        let cancel = CancellationToken::new();
        let events = Arc::new(EventHub::new());
        let supervisor = Arc::new(SafetySupervisor::new(Arc::clone(&events)));

        let scheduler = Arc::new(LinkScheduler::start(
            hardware.serial,
            SchedulerTuning::from_timing(&hw.timing),
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

        let stepper = Arc::new(StepperController::start(
            hw.stepper.clone(),
            Arc::clone(&hardware.gpio),
            supervisor.view(),
            Arc::clone(&events),
        )?);

        let sensors = Arc::new(SensorSampler::spawn(
            Arc::clone(&hardware.adc),
            hw.adc.clone(),
            Arc::clone(&events),
            cancel.child_token(),
        ));

        safety::spawn_threshold_monitor(
            Arc::clone(&supervisor),
            sensors.subscribe(),
            hw.safety.clone(),
            Arc::clone(&events),
            cancel.child_token(),
        );

        let audio = Arc::new(AudioPlayer::new(Arc::clone(&hardware.audio), &hw.audio));

        let scenes = SceneEngine::new(
            Arc::clone(&config),
            [Arc::clone(&servos[0]), Arc::clone(&servos[1])],
            Arc::clone(&audio),
            supervisor.view(),
            Arc::clone(&events),
        );

        let telemetry = Arc::new(TelemetryAggregator::new(
            [Arc::clone(&servos[0]), Arc::clone(&servos[1])],
            Arc::clone(&stepper),
            Arc::clone(&sensors),
            supervisor.view(),
            Arc::clone(&scheduler),
        ));
        telemetry.spawn(hw.timing.telemetry_interval(), Arc::clone(&events), cancel.child_token());

        let system = Arc::new(Self {
            config,
            events,
            supervisor,
            scheduler,
            servos,
            stepper,
            audio,
            scenes,
            telemetry,
            started: Instant::now(),
            cancel: cancel.clone(),
        });

        // Physical E-stop edges run through the same executor as the command.
        let (edge_tx, mut edge_rx) = mpsc::channel(1);
        safety::spawn_estop_watcher(
            Arc::clone(&hardware.gpio),
            hw.safety.estop_pin,
            safety::ESTOP_DEBOUNCE_SAMPLES,
            edge_tx,
            cancel.child_token(),
        );
        {
            let system = Arc::clone(&system);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        edge = edge_rx.recv() => {
                            if edge.is_none() {
                                break;
                            }
                            system.emergency_stop().await;
                        }
                    }
                }
            });
        }

        system.supervisor.mark_ready();
        tracing::info!("system ready");
        Ok(system)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SystemState {
        self.supervisor.current()
    }

    /// Reload one config file by name. See `ConfigStore::reload`.
    pub fn reload(&self, name: &str) -> Result<(), CommandError> {
        self.config.reload(name)
    }

    /// Dispatch one command, returning reply data to merge into the wire
    /// envelope.
    pub async fn handle_command(
        &self,
        command: Command,
    ) -> Result<serde_json::Value, CommandError> {
        match command {
            Command::Servo { channel, position, speed, acceleration, priority } => {
                let servo = &self.servos[channel.device.index()];
                if let Some(speed) = speed {
                    servo.set_speed(channel, speed).await?;
                }
                if let Some(accel) = acceleration {
                    servo.set_acceleration(channel, accel).await?;
                }
                servo
                    .set_target(channel, position, priority.unwrap_or(Priority::Normal))
                    .await?;
                Ok(serde_json::json!({ "channel": channel, "position": position }))
            }

            Command::Scene { scene_name, replace } => {
                self.scenes.play(&scene_name, replace)?;
                Ok(serde_json::json!({ "scene": scene_name }))
            }

            Command::SceneStop => {
                let cancelled = self.scenes.cancel("requested");
                Ok(serde_json::json!({ "cancelled": cancelled }))
            }

            Command::StepperMove { position_cm, distance_cm, speed } => {
                let speed_sps = speed
                    .map(|cm_s| cm_s * self.config.hardware().stepper.steps_per_cm());
                match (position_cm, distance_cm) {
                    (Some(position), None) => {
                        self.stepper.move_to_cm(position, speed_sps).await?
                    }
                    (None, Some(distance)) => self.stepper.move_by_cm(distance, speed_sps).await?,
                    _ => {
                        return Err(CommandError::BadRequest(
                            "stepper_move needs exactly one of position_cm or distance_cm"
                                .to_owned(),
                        ));
                    }
                }
                Ok(serde_json::json!({ "stepper": self.stepper.status() }))
            }

            Command::StepperHome => {
                self.stepper.home().await?;
                Ok(serde_json::json!({ "stepper": self.stepper.status() }))
            }

            Command::StepperEnable => {
                self.stepper.enable()?;
                Ok(serde_json::json!({}))
            }

            Command::StepperDisable => {
                self.stepper.disable()?;
                Ok(serde_json::json!({}))
            }

            Command::StepperClearFault => {
                self.stepper.clear_fault()?;
                Ok(serde_json::json!({ "stepper": self.stepper.status() }))
            }

            Command::EmergencyStop => {
                // Always succeeds: halting is best-effort but unconditional.
                self.emergency_stop().await;
                Ok(serde_json::json!({ "state": self.state() }))
            }

            Command::EmergencyClear => {
                self.supervisor.clear_emergency()?;
                Ok(serde_json::json!({ "state": self.state() }))
            }

            Command::EnableFailsafe => {
                self.set_failsafe(true).await?;
                Ok(serde_json::json!({ "state": self.state() }))
            }

            Command::DisableFailsafe => {
                self.set_failsafe(false).await?;
                Ok(serde_json::json!({ "state": self.state() }))
            }

            Command::GetTelemetry => {
                Ok(serde_json::json!({ "telemetry": self.telemetry.snapshot() }))
            }

            Command::GetSceneList => {
                let catalog = self.config.scenes();
                Ok(serde_json::json!({ "scenes": catalog.scenes }))
            }

            Command::GetSystemStatus => Ok(serde_json::json!({
                "uptime_s": self.started.elapsed().as_secs(),
                "state": self.state(),
                "active_scene": self.scenes.active_scene(),
                "scheduler": self.scheduler.stats(),
            })),

            Command::GetServoConfig { channel } => {
                let servo = self.config.servo();
                let limits = servo
                    .limits(channel)
                    .ok_or_else(|| CommandError::UnknownChannel(channel.to_string()))?;
                Ok(serde_json::json!({ "channel": channel, "limits": limits }))
            }

            Command::SetServoConfig { channel, limits } => {
                self.config.set_channel_limits(channel, limits)?;
                Ok(serde_json::json!({ "channel": channel }))
            }
        }
    }

    /// Transition to `Emergency` and halt everything. Idempotent; errors
    /// from individual halt commands are logged, never surfaced — the stop
    /// itself always reports success.
    pub async fn emergency_stop(&self) {
        self.supervisor.request_emergency();
        self.scenes.cancel("emergency");
        self.stepper.emergency_halt();
        for servo in &self.servos {
            if let Err(e) = servo.stop_all().await {
                tracing::warn!(device = %servo.device(), err = %e, "stop_all failed");
            }
        }
    }

    async fn set_failsafe(&self, on: bool) -> Result<(), CommandError> {
        let changed = self.supervisor.set_failsafe(on)?;
        if on && changed {
            let hw = self.config.hardware();
            for channel in &hw.safety.failsafe_channels {
                let servo = &self.servos[channel.device.index()];
                if let Err(e) = servo.park_channel(*channel).await {
                    tracing::warn!(channel = %channel, err = %e, "failsafe park failed");
                }
            }
            self.stepper.disable()?;
        }
        Ok(())
    }

    /// Drain workers and disable actuators on the way out.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.scenes.cancel("shutdown");
        self.audio.stop();
        self.stepper.shutdown();
        self.scheduler.shutdown();
        tracing::info!("system stopped");
    }

    // Accessors for adapters and tests.

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn servo(&self, device: DeviceId) -> &Arc<ServoController> {
        &self.servos[device.index()]
    }

    pub fn stepper(&self) -> &Arc<StepperController> {
        &self.stepper
    }

    pub fn scheduler(&self) -> &Arc<LinkScheduler> {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> {
        &self.telemetry
    }

    /// Cached position lookup used by the scenario suite.
    pub fn servo_position(&self, channel: ChannelId) -> Option<u16> {
        self.servos[channel.device.index()].cached_position(channel)
    }
}
