// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Servo controller driver: validation, command encoding, position cache.
//!
//! One instance per device; both share the link scheduler. Limit violations
//! are rejected at submission so the caller sees their intent fail — nothing
//! is clamped on the way to the wire.

pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::command::{ChannelId, DeviceId, CHANNELS_PER_DEVICE};
use crate::config::ConfigStore;
use crate::error::CommandError;
use crate::safety::{StateView, SystemState};
use crate::transport::scheduler::{LinkScheduler, Priority, WireRequest};

/// Driver for one servo controller on the shared link.
pub struct ServoController {
    device: DeviceId,
    scheduler: Arc<LinkScheduler>,
    config: Arc<ConfigStore>,
    state: StateView,
    /// Last successfully commanded target per channel, microseconds.
    cache: Mutex<HashMap<u8, u16>>,
}

impl ServoController {
    pub fn new(
        device: DeviceId,
        scheduler: Arc<LinkScheduler>,
        config: Arc<ConfigStore>,
        state: StateView,
    ) -> Self {
        Self { device, scheduler, config, state, cache: Mutex::new(HashMap::new()) }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn device_number(&self) -> u8 {
        self.config.hardware().devices.for_device(self.device)
    }

    /// Reject writes the safety supervisor forbids in the current state.
    fn authorize_write(&self, channel: ChannelId) -> Result<(), CommandError> {
        match self.state.current() {
            SystemState::Emergency | SystemState::Idle => Err(CommandError::StateForbidsWrite {
                state: self.state.current().to_string(),
            }),
            SystemState::Failsafe => {
                let hw = self.config.hardware();
                if hw.safety.failsafe_channels.contains(&channel) {
                    Err(CommandError::StateForbidsWrite {
                        state: SystemState::Failsafe.to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            SystemState::Normal => Ok(()),
        }
    }

    /// Command a channel to `target_us`. Validated against the channel's soft
    /// limits; the cache updates only after the wire write succeeds.
    pub async fn set_target(
        &self,
        channel: ChannelId,
        target_us: u16,
        priority: Priority,
    ) -> Result<(), CommandError> {
        debug_assert_eq!(channel.device, self.device);
        self.authorize_write(channel)?;

        let servo = self.config.servo();
        let limits = servo
            .limits(channel)
            .ok_or_else(|| CommandError::UnknownChannel(channel.to_string()))?;
        if target_us < limits.min_us || target_us > limits.max_us {
            return Err(CommandError::OutOfRange(format!(
                "{channel}: target {target_us}us outside [{}, {}]",
                limits.min_us, limits.max_us
            )));
        }

        let payload = protocol::set_target(self.device_number(), channel.channel, target_us);
        self.submit_no_reply(payload, priority, true).await?;
        self.cache.lock().insert(channel.channel, target_us);
        Ok(())
    }

    pub async fn set_speed(&self, channel: ChannelId, speed: u8) -> Result<(), CommandError> {
        self.authorize_write(channel)?;
        let payload = protocol::set_speed(self.device_number(), channel.channel, speed);
        self.submit_no_reply(payload, Priority::Normal, true).await
    }

    pub async fn set_acceleration(
        &self,
        channel: ChannelId,
        accel: u8,
    ) -> Result<(), CommandError> {
        self.authorize_write(channel)?;
        let payload = protocol::set_acceleration(self.device_number(), channel.channel, accel);
        self.submit_no_reply(payload, Priority::Normal, true).await
    }

    /// Last commanded target, if any write has succeeded for the channel.
    pub fn cached_position(&self, channel: ChannelId) -> Option<u16> {
        self.cache.lock().get(&channel.channel).copied()
    }

    /// Snapshot of every cached channel position, for telemetry.
    pub fn cached_positions(&self) -> HashMap<ChannelId, u16> {
        let cache = self.cache.lock();
        cache
            .iter()
            .filter_map(|(&ch, &us)| ChannelId::new(self.device, ch).ok().map(|id| (id, us)))
            .collect()
    }

    /// Cached last-commanded target, or a wire poll when nothing is cached.
    pub async fn get_position(&self, channel: ChannelId) -> Result<u16, CommandError> {
        if let Some(us) = self.cached_position(channel) {
            return Ok(us);
        }
        let payload = protocol::get_position(self.device_number(), channel.channel);
        let reply = self
            .scheduler
            .submit(WireRequest {
                device: self.device,
                priority: Priority::Normal,
                payload,
                reply_len: Some(protocol::REPLY_LEN_U16),
                deadline: None,
                batchable: false,
            })
            .await?
            .wait()
            .await?;
        let quarter_us = protocol::decode_u16(&reply)
            .ok_or_else(|| CommandError::Internal("short position reply".to_owned()))?;
        Ok(protocol::quarter_us_to_us(quarter_us))
    }

    /// Kick off an on-device script subroutine (scene startup).
    pub async fn run_subscript(&self, subroutine: u8) -> Result<(), CommandError> {
        let payload = protocol::run_subroutine(self.device_number(), subroutine);
        self.submit_no_reply(payload, Priority::High, false).await
    }

    /// Emergency halt: stop the device script and park every channel.
    ///
    /// Pending lower-priority writes for this device are purged so nothing
    /// re-commands a servo after the stop frame lands. Always dispatched at
    /// `Emergency` priority and never blocked by safety gating.
    pub async fn stop_all(&self) -> Result<(), CommandError> {
        self.scheduler.purge_device(self.device, Priority::Emergency);

        let device_number = self.device_number();
        let mut payload = protocol::stop_script(device_number);
        for channel in 0..CHANNELS_PER_DEVICE {
            payload.extend_from_slice(&protocol::set_target(device_number, channel, 0));
        }

        let result = self.submit_no_reply(payload, Priority::Emergency, false).await;
        if result.is_ok() {
            self.cache.lock().clear();
        }
        result
    }

    /// Force a channel's output off (failsafe parking). Deliberately not
    /// gated: it runs while the supervisor already forbids normal writes.
    pub async fn park_channel(&self, channel: ChannelId) -> Result<(), CommandError> {
        let payload = protocol::set_target(self.device_number(), channel.channel, 0);
        let result = self.submit_no_reply(payload, Priority::High, false).await;
        if result.is_ok() {
            self.cache.lock().remove(&channel.channel);
        }
        result
    }

    async fn submit_no_reply(
        &self,
        payload: Vec<u8>,
        priority: Priority,
        batchable: bool,
    ) -> Result<(), CommandError> {
        self.scheduler
            .submit(WireRequest {
                device: self.device,
                priority,
                payload,
                reply_len: None,
                deadline: None,
                batchable,
            })
            .await?
            .wait()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "servo_tests.rs"]
mod tests;
