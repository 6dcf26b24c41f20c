// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Waldo core: real-time coordination for a multi-actuator animatronic.

pub mod audio;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod gpio;
pub mod safety;
pub mod scene;
pub mod sensors;
pub mod servo;
pub mod stepper;
pub mod system;
pub mod telemetry;
pub mod test_support;
pub mod transport;
