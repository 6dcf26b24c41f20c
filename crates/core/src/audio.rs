// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audio cue playback: at most one clip at a time, no mixing.
//!
//! Clips play through an [`AudioSink`]; production spawns the configured
//! external player process per clip and kills it on stop. A `play` with a
//! delay schedules the start; `stop` cancels both a pending start and an
//! active clip.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::AudioConfig;
use crate::error::CommandError;

/// Clip start/stop backend.
pub trait AudioSink: Send + Sync {
    fn start(&self, clip: &Path) -> anyhow::Result<()>;
    fn stop(&self);
}

pub struct AudioPlayer {
    sink: Arc<dyn AudioSink>,
    clip_dir: PathBuf,
    pending: Mutex<Option<CancellationToken>>,
}

impl AudioPlayer {
    pub fn new(sink: Arc<dyn AudioSink>, config: &AudioConfig) -> Self {
        Self { sink, clip_dir: config.clip_dir.clone(), pending: Mutex::new(None) }
    }

    /// Resolve a clip name to a file. Exact name first, then `.wav`.
    fn resolve(&self, clip: &str) -> Result<PathBuf, CommandError> {
        let direct = self.clip_dir.join(clip);
        if direct.is_file() {
            return Ok(direct);
        }
        let wav = self.clip_dir.join(format!("{clip}.wav"));
        if wav.is_file() {
            return Ok(wav);
        }
        Err(CommandError::AudioMissing { clip: clip.to_owned() })
    }

    /// Schedule `clip` to start after `delay`. Any current or pending clip
    /// stops first. Fails with `AudioMissing` when the clip does not resolve;
    /// callers in a scene log and continue.
    pub fn play(&self, clip: &str, delay: Duration) -> Result<(), CommandError> {
        let path = self.resolve(clip)?;
        self.stop();

        if delay.is_zero() {
            if let Err(e) = self.sink.start(&path) {
                tracing::warn!(clip, err = %e, "audio start failed");
            }
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.pending.lock() = Some(token.clone());
        let sink = Arc::clone(&self.sink);
        let clip = clip.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = sink.start(&path) {
                        tracing::warn!(clip, err = %e, "audio start failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// Immediately stop the active clip and cancel a pending start.
    pub fn stop(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
        self.sink.stop();
    }
}

/// Spawns the configured player command per clip (`player <args> <path>`),
/// killing the previous child first so only one clip ever plays.
pub struct ProcessSink {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<tokio::process::Child>>,
}

impl ProcessSink {
    pub fn new(player: &str) -> Self {
        let mut parts = player.split_whitespace().map(str::to_owned);
        let program = parts.next().unwrap_or_else(|| "aplay".to_owned());
        Self { program, args: parts.collect(), child: Mutex::new(None) }
    }
}

impl AudioSink for ProcessSink {
    fn start(&self, clip: &Path) -> anyhow::Result<()> {
        self.stop();
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(clip)
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(clip = %clip.display(), player = %self.program, "audio clip started");
        *self.child.lock() = Some(child);
        Ok(())
    }

    fn stop(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
#[path = "audio_tests.rs"]
mod tests;
