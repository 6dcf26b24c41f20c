// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scene engine: executes one timed, multi-actuator program at a time.
//!
//! A scene dispatches its servo moves and device subscripts at t=0, starts
//! audio at `delay_s`, and completes at `duration_s`. Cancellation is
//! cooperative: pending timeline waits abort, audio stops, and servos stay
//! at their last commanded positions. Frames already on the wire are not
//! rewound.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioPlayer;
use crate::command::DeviceId;
use crate::config::{ConfigStore, Scene};
use crate::error::CommandError;
use crate::events::{Event, EventHub};
use crate::safety::{StateView, SystemState};
use crate::servo::ServoController;
use crate::transport::scheduler::Priority;

struct ActiveScene {
    name: String,
    token: CancellationToken,
    /// Generation counter so a finished run can only clear its own entry.
    run_id: u64,
}

pub struct SceneEngine {
    config: Arc<ConfigStore>,
    servos: [Arc<ServoController>; 2],
    audio: Arc<AudioPlayer>,
    state: StateView,
    events: Arc<EventHub>,
    active: Arc<Mutex<Option<ActiveScene>>>,
    next_run: std::sync::atomic::AtomicU64,
}

impl SceneEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        servos: [Arc<ServoController>; 2],
        audio: Arc<AudioPlayer>,
        state: StateView,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            config,
            servos,
            audio,
            state,
            events,
            active: Arc::new(Mutex::new(None)),
            next_run: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Name of the playing scene, if any.
    pub fn active_scene(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.name.clone())
    }

    /// Start a scene. Rejected while another is playing unless `replace`,
    /// which cancels the current scene first. Scene playback requires
    /// `Normal` state.
    pub fn play(&self, name: &str, replace: bool) -> Result<(), CommandError> {
        let state = self.state.current();
        if state != SystemState::Normal {
            return Err(CommandError::StateForbidsScene { state: state.to_string() });
        }

        let catalog = self.config.scenes();
        let scene = catalog
            .get(name)
            .cloned()
            .ok_or_else(|| CommandError::UnknownScene(name.to_owned()))?;

        {
            let mut active = self.active.lock();
            if let Some(current) = active.take() {
                if !replace {
                    let name = current.name.clone();
                    *active = Some(current);
                    return Err(CommandError::SceneBusy { active: name });
                }
                current.token.cancel();
                self.audio.stop();
                self.events.publish(Event::SceneCancelled {
                    scene: current.name,
                    reason: "replaced".to_owned(),
                });
            }

            let token = CancellationToken::new();
            let run_id = self.next_run.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            *active = Some(ActiveScene { name: name.to_owned(), token: token.clone(), run_id });
            self.events.publish(Event::SceneStarted { scene: name.to_owned() });
            self.spawn_timeline(scene, token, run_id);
        }

        Ok(())
    }

    /// Cancel the active scene, if any. Audio stops immediately; the
    /// cancellation event is emitted before this returns so subscribers see
    /// it ahead of any follow-up corrective commands.
    pub fn cancel(&self, reason: &str) -> bool {
        let Some(current) = self.active.lock().take() else {
            return false;
        };
        current.token.cancel();
        self.audio.stop();
        self.events.publish(Event::SceneCancelled {
            scene: current.name,
            reason: reason.to_owned(),
        });
        true
    }

    fn spawn_timeline(&self, scene: Scene, token: CancellationToken, run_id: u64) {
        let servos = [Arc::clone(&self.servos[0]), Arc::clone(&self.servos[1])];
        let audio = Arc::clone(&self.audio);
        let events = Arc::clone(&self.events);
        let active = Arc::clone(&self.active);
        let dispatch_timeout =
            Duration::from_millis(self.config.hardware().timing.scene_dispatch_ms);

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let name = scene.name.clone();

            // t=0: servo moves and device subscripts.
            let dispatch = dispatch_moves(&servos, &scene);
            tokio::select! {
                _ = token.cancelled() => return,
                result = tokio::time::timeout(dispatch_timeout, dispatch) => {
                    if result.is_err() {
                        tracing::warn!(scene = %name, "scene dispatch ran past its deadline");
                    }
                }
            }

            // t=delay: audio cue. Failure is logged, never fatal.
            if let Some(ref cue) = scene.audio {
                let at = started + Duration::from_secs_f64(cue.delay_s);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(at) => {}
                }
                if let Err(e) = audio.play(&cue.clip, Duration::ZERO) {
                    tracing::warn!(scene = %name, err = %e, "scene audio failed");
                    events.publish(Event::SceneError {
                        scene: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            // Run out the clock, then complete.
            let end = started + Duration::from_secs_f64(scene.duration_s);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(end) => {}
            }

            let mut active = active.lock();
            if active.as_ref().is_some_and(|a| a.run_id == run_id) {
                *active = None;
                events.publish(Event::SceneCompleted { scene: name });
            }
        });
    }
}

/// Issue every servo move (speed, acceleration, then target) plus any device
/// subscripts. Individual failures are logged and do not stop the rest.
async fn dispatch_moves(servos: &[Arc<ServoController>; 2], scene: &Scene) {
    for (channel, mv) in &scene.servo_moves {
        let servo = &servos[channel.device.index()];
        if let Err(e) = servo.set_speed(*channel, mv.speed).await {
            tracing::warn!(channel = %channel, err = %e, "scene speed write failed");
            continue;
        }
        if let Err(e) = servo.set_acceleration(*channel, mv.accel).await {
            tracing::warn!(channel = %channel, err = %e, "scene accel write failed");
            continue;
        }
        if let Err(e) = servo.set_target(*channel, mv.target_us, Priority::Normal).await {
            tracing::warn!(channel = %channel, err = %e, "scene target write failed");
        }
    }

    if let Some(ref scripts) = scene.scripts {
        for (device, sub) in [(DeviceId::D1, scripts.d1), (DeviceId::D2, scripts.d2)] {
            if let Some(sub) = sub {
                if let Err(e) = servos[device.index()].run_subscript(sub).await {
                    tracing::warn!(device = %device, err = %e, "scene subscript failed");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "scene_tests.rs"]
mod tests;
