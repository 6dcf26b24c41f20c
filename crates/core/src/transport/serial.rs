// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial port ownership and I/O error classification.
//!
//! One port, 9600 8N1, owned exclusively by the scheduler worker. The
//! interface is deliberately blocking — the worker is a dedicated thread and
//! every read carries a timeout.

use std::io::{Read, Write};
use std::time::Duration;

use crate::config::SerialConfig;

/// I/O failures, split by whether a retry can help.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Timeout or partial read; retrying may succeed.
    #[error("transient serial error: {0}")]
    Transient(std::io::Error),
    /// Device gone, permission denied; the link must be reopened.
    #[error("fatal serial error: {0}")]
    Fatal(std::io::Error),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    fn classify(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
                Self::Transient(e)
            }
            _ => Self::Fatal(e),
        }
    }
}

/// Byte-level access to the half-duplex link. Object-safe so tests can swap
/// in a scripted double.
pub trait SerialLink: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `n` bytes within `timeout`.
    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Discard any unread input.
    fn drain(&mut self) -> Result<(), TransportError>;

    /// Re-establish the link after a fatal error.
    fn reopen(&mut self) -> Result<(), TransportError>;
}

/// Production link over the `serialport` crate.
pub struct SystemSerial {
    config: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SystemSerial {
    pub fn open(config: SerialConfig) -> Result<Self, TransportError> {
        let mut link = Self { config, port: None };
        link.reopen()?;
        Ok(link)
    }

    fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, TransportError> {
        self.port.as_mut().ok_or_else(|| {
            TransportError::Fatal(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "serial port not open",
            ))
        })
    }
}

impl SerialLink for SystemSerial {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(bytes).map_err(TransportError::classify)?;
        port.flush().map_err(TransportError::classify)
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(|e| TransportError::Fatal(e.into()))?;
        let mut buf = vec![0u8; n];
        port.read_exact(&mut buf).map_err(TransportError::classify)?;
        Ok(buf)
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        let port = self.port()?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| TransportError::Transient(e.into()))
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        self.port = None;
        let port = serialport::new(&self.config.port, self.config.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(|e| TransportError::Fatal(e.into()))?;
        self.port = Some(port);
        tracing::info!(port = %self.config.port, baud = self.config.baud, "serial link open");
        Ok(())
    }
}
