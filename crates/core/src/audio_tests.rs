// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::config::AudioConfig;
use crate::test_support::FakeAudio;

fn player_with_clips(clips: &[&str]) -> (AudioPlayer, Arc<FakeAudio>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    for clip in clips {
        std::fs::write(dir.path().join(clip), b"riff").unwrap();
    }
    let sink = FakeAudio::new();
    let config = AudioConfig { player: "aplay".to_owned(), clip_dir: dir.path().to_path_buf() };
    (AudioPlayer::new(sink.clone() as Arc<dyn AudioSink>, &config), sink, dir)
}

#[tokio::test]
async fn missing_clip_is_audio_missing() {
    let (player, sink, _dir) = player_with_clips(&[]);
    let err = player.play("beep", Duration::ZERO);
    assert!(matches!(err, Err(CommandError::AudioMissing { .. })));
    assert!(sink.started().is_empty());
}

#[tokio::test]
async fn immediate_play_starts_clip() {
    let (player, sink, _dir) = player_with_clips(&["beep.wav"]);
    player.play("beep", Duration::ZERO).unwrap();

    let started = sink.started();
    assert_eq!(started.len(), 1);
    assert!(started[0].ends_with("beep.wav"));
}

#[tokio::test]
async fn exact_name_wins_over_wav_fallback() {
    let (player, sink, _dir) = player_with_clips(&["beep", "beep.wav"]);
    player.play("beep", Duration::ZERO).unwrap();
    assert!(sink.started()[0].ends_with("beep"));
}

#[tokio::test(start_paused = true)]
async fn delayed_play_waits_for_its_cue() {
    let (player, sink, _dir) = player_with_clips(&["beep.wav"]);
    player.play("beep", Duration::from_millis(500)).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.started().is_empty());

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(sink.started().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_a_pending_start() {
    let (player, sink, _dir) = player_with_clips(&["beep.wav"]);
    player.play("beep", Duration::from_millis(500)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    player.stop();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(sink.started().is_empty());
    assert!(sink.stops() >= 1);
}

#[tokio::test]
async fn new_play_replaces_the_active_clip() {
    let (player, sink, _dir) = player_with_clips(&["a.wav", "b.wav"]);
    player.play("a", Duration::ZERO).unwrap();
    player.play("b", Duration::ZERO).unwrap();

    let started = sink.started();
    assert_eq!(started.len(), 2);
    // The first clip was stopped before the second started.
    assert!(sink.stops() >= 1);
}
