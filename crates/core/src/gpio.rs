// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Digital input/output primitives.
//!
//! The stepper emitter and the E-stop watcher run against [`GpioPort`];
//! production uses the `rppal` backend (feature `raspi`), tests use the
//! deterministic `FakeGpio` double in `test_support`.
//!
//! `pulse` timing is best-effort ≥ the requested durations. Callers needing
//! tight inter-pulse intervals own their own timing loop and use `pulse` only
//! for the high phase.

use std::time::Duration;

/// Pin direction at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Output,
    Input,
}

/// Input pull configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPull {
    None,
    Up,
    Down,
}

/// Logic level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        matches!(self, Level::High)
    }
}

/// Minimal GPIO contract. Object-safe; components hold `Arc<dyn GpioPort>`.
pub trait GpioPort: Send + Sync {
    fn configure(&self, pin: u8, direction: PinDirection, pull: PinPull) -> anyhow::Result<()>;

    fn write(&self, pin: u8, level: Level) -> anyhow::Result<()>;

    fn read(&self, pin: u8) -> anyhow::Result<Level>;

    /// Drive `pin` high for at least `high`, then low for at least `low`.
    fn pulse(&self, pin: u8, high: Duration, low: Duration) -> anyhow::Result<()>;
}

#[cfg(feature = "raspi")]
pub use raspi::RaspiGpio;

#[cfg(feature = "raspi")]
mod raspi {
    use std::collections::HashMap;
    use std::time::Duration;

    use parking_lot::Mutex;
    use rppal::gpio::{Gpio, IoPin, Mode, PullUpDown};

    use super::{GpioPort, Level, PinDirection, PinPull};

    /// Raspberry Pi GPIO backend over `rppal`.
    pub struct RaspiGpio {
        gpio: Gpio,
        pins: Mutex<HashMap<u8, IoPin>>,
    }

    impl RaspiGpio {
        pub fn new() -> anyhow::Result<Self> {
            Ok(Self { gpio: Gpio::new()?, pins: Mutex::new(HashMap::new()) })
        }

        fn with_pin<T>(
            &self,
            pin: u8,
            f: impl FnOnce(&mut IoPin) -> anyhow::Result<T>,
        ) -> anyhow::Result<T> {
            let mut pins = self.pins.lock();
            let entry = match pins.entry(pin) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let io = self.gpio.get(pin)?.into_io(Mode::Input);
                    e.insert(io)
                }
            };
            f(entry)
        }
    }

    impl GpioPort for RaspiGpio {
        fn configure(
            &self,
            pin: u8,
            direction: PinDirection,
            pull: PinPull,
        ) -> anyhow::Result<()> {
            self.with_pin(pin, |io| {
                match direction {
                    PinDirection::Output => io.set_mode(Mode::Output),
                    PinDirection::Input => {
                        io.set_mode(Mode::Input);
                        io.set_pullupdown(match pull {
                            PinPull::None => PullUpDown::Off,
                            PinPull::Up => PullUpDown::PullUp,
                            PinPull::Down => PullUpDown::PullDown,
                        });
                    }
                }
                Ok(())
            })
        }

        fn write(&self, pin: u8, level: Level) -> anyhow::Result<()> {
            self.with_pin(pin, |io| {
                match level {
                    Level::High => io.set_high(),
                    Level::Low => io.set_low(),
                }
                Ok(())
            })
        }

        fn read(&self, pin: u8) -> anyhow::Result<Level> {
            self.with_pin(pin, |io| {
                Ok(if io.is_high() { Level::High } else { Level::Low })
            })
        }

        fn pulse(&self, pin: u8, high: Duration, low: Duration) -> anyhow::Result<()> {
            self.write(pin, Level::High)?;
            spin_wait(high);
            self.write(pin, Level::Low)?;
            spin_wait(low);
            Ok(())
        }
    }

    /// Busy-wait for sub-millisecond durations; `thread::sleep` otherwise.
    fn spin_wait(d: Duration) {
        if d >= Duration::from_millis(1) {
            std::thread::sleep(d);
            return;
        }
        let start = std::time::Instant::now();
        while start.elapsed() < d {
            std::hint::spin_loop();
        }
    }
}
