// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the control core.
//!
//! Components return these errors untranslated; the command dispatcher
//! attaches the offending message id and serializes the stable `code()`
//! string into the wire reply. Safety-critical kinds are additionally
//! published as events by the components that raise them.

use serde::{Deserialize, Serialize};

/// Failure kinds surfaced to command submitters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// Input violated a validated domain. No side effects occurred.
    #[error("{0}")]
    OutOfRange(String),

    /// A conflicting operation is active.
    #[error("{0}")]
    Busy(String),

    /// A scene is already playing and `replace` was not set.
    #[error("scene '{active}' is already playing")]
    SceneBusy { active: String },

    /// System state forbids starting a scene.
    #[error("system state {state} forbids scene playback")]
    StateForbidsScene { state: String },

    /// System state forbids this actuator write.
    #[error("system state {state} forbids actuator writes")]
    StateForbidsWrite { state: String },

    /// Deadline expired before the operation completed.
    #[error("deadline expired before dispatch")]
    Timeout,

    /// Retries exhausted on the serial link.
    #[error("serial transport failed after retries")]
    TransportFailed,

    /// The serial link is quarantined; fast-fail until it reopens.
    #[error("serial transport down")]
    TransportDown,

    /// Homing did not reach the limit switch within the step bound.
    #[error("homing exceeded {max_steps} steps without reaching the limit switch")]
    HomingTimeout { max_steps: u64 },

    /// Limit switch asserted during a normal move.
    #[error("limit switch asserted unexpectedly at {position_steps} steps")]
    LimitUnexpected { position_steps: i64 },

    /// Configuration reload rejected; prior config kept.
    #[error("invalid configuration: {}", errors.join("; "))]
    ConfigInvalid { errors: Vec<String> },

    /// Named audio clip does not exist. Non-fatal inside a scene.
    #[error("audio clip '{clip}' not found")]
    AudioMissing { clip: String },

    /// Named scene does not exist in the catalog.
    #[error("unknown scene '{0}'")]
    UnknownScene(String),

    /// Channel id does not resolve to a configured servo channel.
    #[error("unknown servo channel '{0}'")]
    UnknownChannel(String),

    /// Malformed command envelope.
    #[error("{0}")]
    BadRequest(String),

    /// Internal wiring failure (a worker dropped a completion handle).
    #[error("internal: {0}")]
    Internal(String),
}

impl CommandError {
    /// Stable machine-readable code for wire replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfRange(_) => "OUT_OF_RANGE",
            Self::Busy(_) => "BUSY",
            Self::SceneBusy { .. } => "SCENE_BUSY",
            Self::StateForbidsScene { .. } => "STATE_FORBIDS_SCENE",
            Self::StateForbidsWrite { .. } => "STATE_FORBIDS_WRITE",
            Self::Timeout => "TIMEOUT",
            Self::TransportFailed => "TRANSPORT_FAILED",
            Self::TransportDown => "TRANSPORT_DOWN",
            Self::HomingTimeout { .. } => "HOMING_TIMEOUT",
            Self::LimitUnexpected { .. } => "LIMIT_UNEXPECTED",
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::AudioMissing { .. } => "AUDIO_MISSING",
            Self::UnknownScene(_) => "UNKNOWN_SCENE",
            Self::UnknownChannel(_) => "UNKNOWN_CHANNEL",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Wire-format error body with machine code and human message.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody { code: self.code().to_owned(), message: self.to_string() }
    }
}

/// Error body embedded in command replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
