// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config directory watcher: hot-reloads edited JSON files.
//!
//! Uses `notify` for filesystem events with an mtime-polling fallback, then
//! calls `System::reload` for each known config file that changed. A rejected
//! reload logs the validation errors and leaves the prior config active.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use waldo_core::config::{HARDWARE_CONFIG, SCENES_CONFIG, SERVO_CONFIG};
use waldo_core::system::System;

const KNOWN_FILES: [&str; 3] = [HARDWARE_CONFIG, SERVO_CONFIG, SCENES_CONFIG];

/// Debounce window: editors write twice (truncate + content) in quick
/// succession.
const SETTLE: Duration = Duration::from_millis(200);

pub fn spawn_config_watcher(dir: PathBuf, system: Arc<System>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let (wake_tx, mut wake_rx) = mpsc::channel::<PathBuf>(16);
        let _watcher = setup_notify_watcher(&dir, wake_tx);
        let mut mtimes = scan_mtimes(&dir);
        let mut poll = tokio::time::interval(Duration::from_secs(30));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.tick().await; // immediate first tick

        loop {
            let mut dirty: HashSet<String> = HashSet::new();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    // Fallback for platforms where notify is unavailable.
                    let current = scan_mtimes(&dir);
                    for (name, mtime) in &current {
                        if mtimes.get(name) != Some(mtime) {
                            dirty.insert(name.clone());
                        }
                    }
                    mtimes = current;
                }
                changed = wake_rx.recv() => {
                    let Some(path) = changed else { break };
                    note_changed(&mut dirty, &path);
                    // Collect everything else that lands in the settle window.
                    let settle = tokio::time::sleep(SETTLE);
                    tokio::pin!(settle);
                    loop {
                        tokio::select! {
                            _ = &mut settle => break,
                            more = wake_rx.recv() => {
                                match more {
                                    Some(path) => note_changed(&mut dirty, &path),
                                    None => break,
                                }
                            }
                        }
                    }
                    mtimes = scan_mtimes(&dir);
                }
            }

            for name in &dirty {
                match system.reload(name) {
                    Ok(()) => tracing::info!(config = %name, "hot-reloaded"),
                    Err(e) => tracing::warn!(config = %name, err = %e, "reload rejected"),
                }
            }
        }
    });
}

fn scan_mtimes(dir: &Path) -> HashMap<String, SystemTime> {
    let mut mtimes = HashMap::new();
    for name in KNOWN_FILES {
        if let Ok(meta) = std::fs::metadata(dir.join(name)) {
            if let Ok(mtime) = meta.modified() {
                mtimes.insert(name.to_owned(), mtime);
            }
        }
    }
    mtimes
}

fn note_changed(dirty: &mut HashSet<String>, path: &Path) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    if KNOWN_FILES.contains(&name) {
        dirty.insert(name.to_owned());
    }
}

/// Set up a `notify` watcher on the config directory. Returns the watcher
/// handle (must be kept alive).
fn setup_notify_watcher(
    dir: &Path,
    wake_tx: mpsc::Sender<PathBuf>,
) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            for path in event.paths {
                let _ = wake_tx.try_send(path);
            }
        }
    })
    .ok()?;

    watcher.watch(dir, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}
