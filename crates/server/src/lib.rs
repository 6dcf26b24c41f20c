// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! waldod: network adapter for the waldo control core.
//!
//! Owns process concerns only — building the hardware backends, the axum
//! router, the config file watcher, and graceful shutdown. All control
//! decisions live in `waldo_core::system::System`.

pub mod config;
pub mod transport;
pub mod watcher;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use waldo_core::config::ConfigStore;
use waldo_core::system::{Hardware, System};

use crate::config::ServerConfig;

/// Run the control server until shutdown.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let shutdown = CancellationToken::new();

    let store = Arc::new(ConfigStore::load(&config.config_dir)?);
    let hardware = build_hardware(&store, config.sim)?;
    let system = System::start(Arc::clone(&store), hardware)?;

    if config.watch_config {
        watcher::spawn_config_watcher(
            config.config_dir.clone(),
            Arc::clone(&system),
            shutdown.child_token(),
        );
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    tracing::info!(%addr, sim = config.sim, "waldod listening");
    let router = transport::build_router(Arc::clone(&system));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    system.shutdown();
    Ok(())
}

/// Build the hardware backends: real devices from the hardware config, or
/// the in-memory doubles under `--sim`.
fn build_hardware(store: &Arc<ConfigStore>, sim: bool) -> anyhow::Result<Hardware> {
    let hw = store.hardware();

    if sim {
        let (serial, _) = waldo_core::test_support::FakeSerial::new();
        return Ok(Hardware {
            serial,
            gpio: waldo_core::test_support::FakeGpio::new(),
            adc: waldo_core::test_support::FakeAdc::new(),
            audio: Arc::new(waldo_core::audio::ProcessSink::new(&hw.audio.player)),
        });
    }

    real_hardware(store)
}

#[cfg(feature = "raspi")]
fn real_hardware(store: &Arc<ConfigStore>) -> anyhow::Result<Hardware> {
    let hw = store.hardware();
    let serial = waldo_core::transport::serial::SystemSerial::open(hw.serial.clone())?;
    Ok(Hardware {
        serial: Box::new(serial),
        gpio: Arc::new(waldo_core::gpio::RaspiGpio::new()?),
        adc: Arc::new(waldo_core::sensors::Ads1015::new(0x48)?),
        audio: Arc::new(waldo_core::audio::ProcessSink::new(&hw.audio.player)),
    })
}

#[cfg(not(feature = "raspi"))]
fn real_hardware(_store: &Arc<ConfigStore>) -> anyhow::Result<Hardware> {
    anyhow::bail!("built without the `raspi` feature; run with --sim or rebuild for the Pi")
}
