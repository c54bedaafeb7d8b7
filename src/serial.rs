/*
    FluxBridge
    https://github.com/dbalsom/fluxbridge

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/serial.rs

    The seam between the bridge and the host's serial stack. The bridge never
    opens an OS port itself; an embedder supplies a [SerialPortProvider] and
    the adapters drive whatever [SerialLink] it hands back. Reads must honour
    the configured timeout and return Ok(0) when it elapses, so a worker
    blocked on a dead device always gets control back.
*/

use std::time::Duration;

use thiserror::Error;

/// How an adapter identifies the port it wants opened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PortSelector {
    /// A numbered serial port (COM1..COM9 or /dev/ttyUSBn equivalent).
    ComPort(u8),
    /// Scan the bus for the first port whose USB descriptors identify the
    /// expected controller.
    UsbAutoDetect,
}

/// Errors raised by the host serial layer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SerialError {
    #[error("port not found")]
    NotFound,
    #[error("port in use")]
    InUse,
    #[error("access denied")]
    AccessDenied,
    #[error("port configuration rejected: {0}")]
    ConfigError(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Read/write deadlines for a link.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SerialTimeouts {
    pub read: Duration,
    pub write: Duration,
}

impl SerialTimeouts {
    /// Relaxed timeouts used for command/response traffic.
    pub fn command() -> Self {
        SerialTimeouts {
            read: Duration::from_millis(2000),
            write: Duration::from_millis(2000),
        }
    }

    /// Tight timeouts used while streaming, so abort requests and stalled
    /// drives are noticed within a handful of milliseconds.
    pub fn streaming() -> Self {
        SerialTimeouts {
            read: Duration::from_millis(10),
            write: Duration::from_millis(2000),
        }
    }
}

/// An open serial connection, 8-N-1 at whatever rate the adapter asked for.
pub trait SerialLink: Send {
    /// Read up to `buf.len()` bytes. Returns `Ok(0)` if the read timeout
    /// elapses with nothing available.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError>;

    /// Write the entire buffer or fail.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SerialError>;

    /// Replace the link's deadlines.
    fn set_timeouts(&mut self, timeouts: SerialTimeouts);

    /// Discard anything buffered in either direction.
    fn purge(&mut self);
}

/// Opens serial ports on behalf of the adapters. Implemented by the embedder
/// over the host OS; implemented over in-memory scripts in tests.
pub trait SerialPortProvider: Send {
    /// Open `selector` at `baud`, 8-N-1, with [SerialTimeouts::command]
    /// deadlines applied.
    fn open(&mut self, selector: &PortSelector, baud: u32) -> Result<Box<dyn SerialLink>, SerialError>;
}
