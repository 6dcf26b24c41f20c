// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Analog sensing: periodic ADC sampling scaled into engineering units.
//!
//! The sampler reads one voltage and two current channels each tick and
//! publishes a [`SensorSnapshot`] on a watch channel. Read failures keep the
//! last good values with `stale` set; after a configured run of consecutive
//! failures a `SensorDegraded` alert goes out (once per degradation).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::AdcConfig;
use crate::events::{AlertCode, Event, EventHub};

/// ADC input channels used by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcChannel {
    Voltage,
    Current1,
    Current2,
}

/// Raw ADC access. Object-safe; the `raspi` feature provides an ADS1015
/// backend, tests use a scripted double.
pub trait AdcReader: Send + Sync {
    fn read_raw(&self, channel: AdcChannel) -> anyhow::Result<i16>;
}

/// Engineering-unit sensor values, published by value each tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub voltage_v: f64,
    pub current_a_ch1: f64,
    pub current_a_ch2: f64,
    /// True when the values are a carried-forward last-good reading.
    pub stale: bool,
}

/// Periodic sampler task over an [`AdcReader`].
pub struct SensorSampler {
    rx: watch::Receiver<SensorSnapshot>,
}

impl SensorSampler {
    /// Spawn the sampling loop at the configured cadence.
    pub fn spawn(
        adc: Arc<dyn AdcReader>,
        config: AdcConfig,
        events: Arc<EventHub>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(SensorSnapshot::default());
        tokio::spawn(sample_loop(adc, config, events, tx, cancel));
        Self { rx }
    }

    /// Latest snapshot, by value.
    pub fn latest(&self) -> SensorSnapshot {
        self.rx.borrow().clone()
    }

    /// Watch handle for consumers that react to changes (threshold monitor).
    pub fn subscribe(&self) -> watch::Receiver<SensorSnapshot> {
        self.rx.clone()
    }
}

async fn sample_loop(
    adc: Arc<dyn AdcReader>,
    config: AdcConfig,
    events: Arc<EventHub>,
    tx: watch::Sender<SensorSnapshot>,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / config.sample_hz);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_good = SensorSnapshot::default();
    let mut failures = 0u32;
    let mut degraded_reported = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let reading = read_all(adc.as_ref(), &config);
        match reading {
            Ok(snapshot) => {
                failures = 0;
                degraded_reported = false;
                last_good = snapshot.clone();
                let _ = tx.send(snapshot);
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::debug!(err = %e, failures, "ADC read failed");
                if failures > config.max_failures && !degraded_reported {
                    degraded_reported = true;
                    events.publish(Event::Alert {
                        alert: AlertCode::SensorDegraded,
                        message: format!("{failures} consecutive ADC failures"),
                    });
                }
                let mut stale = last_good.clone();
                stale.stale = true;
                let _ = tx.send(stale);
            }
        }
    }
}

fn read_all(adc: &dyn AdcReader, config: &AdcConfig) -> anyhow::Result<SensorSnapshot> {
    let voltage = adc.read_raw(AdcChannel::Voltage)?;
    let current1 = adc.read_raw(AdcChannel::Current1)?;
    let current2 = adc.read_raw(AdcChannel::Current2)?;
    Ok(SensorSnapshot {
        voltage_v: config.voltage.apply(voltage),
        current_a_ch1: config.current_ch1.apply(current1),
        current_a_ch2: config.current_ch2.apply(current2),
        stale: false,
    })
}

#[cfg(feature = "raspi")]
pub use ads1015::Ads1015;

#[cfg(feature = "raspi")]
mod ads1015 {
    use parking_lot::Mutex;
    use rppal::i2c::I2c;

    use super::{AdcChannel, AdcReader};

    const REG_CONVERSION: u8 = 0x00;
    const REG_CONFIG: u8 = 0x01;

    /// ADS1015 over the Pi's I²C bus: single-shot, single-ended reads.
    pub struct Ads1015 {
        bus: Mutex<I2c>,
    }

    impl Ads1015 {
        pub fn new(address: u16) -> anyhow::Result<Self> {
            let mut bus = I2c::new()?;
            bus.set_slave_address(address)?;
            Ok(Self { bus: Mutex::new(bus) })
        }

        fn mux_bits(channel: AdcChannel) -> u16 {
            // Single-ended AINx vs GND.
            match channel {
                AdcChannel::Voltage => 0b100,
                AdcChannel::Current1 => 0b101,
                AdcChannel::Current2 => 0b110,
            }
        }
    }

    impl AdcReader for Ads1015 {
        fn read_raw(&self, channel: AdcChannel) -> anyhow::Result<i16> {
            let mut bus = self.bus.lock();

            // Single-shot start, ±4.096 V range, 1600 SPS.
            let config: u16 =
                (1 << 15) | (Self::mux_bits(channel) << 12) | (0b001 << 9) | (1 << 8) | (0b100 << 5) | 0b11;
            bus.write(&[REG_CONFIG, (config >> 8) as u8, config as u8])?;

            // Conversion takes ~625 us at 1600 SPS.
            std::thread::sleep(std::time::Duration::from_millis(1));

            let mut buf = [0u8; 2];
            bus.write_read(&[REG_CONVERSION], &mut buf)?;
            let raw = i16::from_be_bytes(buf) >> 4;
            Ok(raw)
        }
    }
}

#[cfg(test)]
#[path = "sensors_tests.rs"]
mod tests;
