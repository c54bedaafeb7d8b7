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

    src/error.rs

    Error taxonomy for the bridge. Every device failure carries the command
    that was executing when it happened, which turns a bare "status error"
    into something a user can act on.
*/

use thiserror::Error;

use crate::serial::SerialError;

/// The command a [DeviceError] was raised during, for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub enum DeviceCommand {
    OpenPort,
    GetVersion,
    Rewind,
    EnableMotor,
    DisableMotor,
    Seek,
    SelectHead,
    CheckDisk,
    CheckWriteProtect,
    ReadStream,
    WriteTrack,
    SetParameters,
    Reset,
}

/// What actually went wrong talking to the device.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeviceErrorKind {
    // Link errors, recoverable by re-opening the port.
    #[error("the serial port was not found")]
    PortNotFound,
    #[error("the serial port is in use by another application")]
    PortInUse,
    #[error("access to the serial port was denied")]
    AccessDenied,
    #[error("the serial port could not be configured: {0}")]
    PortConfigError(String),

    // Protocol errors, fatal within the session.
    #[error("the device returned an unexpected string when its version was requested")]
    MalformedVersion,
    #[error("the device firmware is too old for streaming operation, please update it")]
    OldFirmware,
    #[error("the device is in firmware-update mode")]
    InUpdateMode,

    // Transient per-command errors.
    #[error("failed to read a response from the device")]
    ReadResponseFailed,
    #[error("failed to send data to the device")]
    SendFailed,
    #[error("an unknown status was received from the device")]
    StatusError,
    #[error("the device received data faster than it could handle")]
    SerialOverrun,
    #[error("the device received badly framed data")]
    FramingError,
    #[error("the device could not be fed write data quickly enough")]
    WriteTimeout,
    #[error("the device reported an error stepping to the requested cylinder")]
    SeekError,
    #[error("the head never reached the cylinder 0 sensor")]
    RewindFailure,

    // Media state, reflected in status flags rather than surfaced.
    #[error("no disk in drive")]
    NoDiskInDrive,
    #[error("the disk is write protected")]
    WriteProtected,

    // Caller errors.
    #[error("cylinder {0} is out of range")]
    TrackRangeError(u8),
}

/// A failure from a flux device adapter, tagged with the command in flight.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind} (while executing {command})")]
pub struct DeviceError {
    pub command: DeviceCommand,
    pub kind: DeviceErrorKind,
}

impl DeviceError {
    pub fn new(command: DeviceCommand, kind: DeviceErrorKind) -> Self {
        DeviceError { command, kind }
    }

    #[inline]
    pub fn kind(&self) -> &DeviceErrorKind {
        &self.kind
    }

    /// True for errors worth one blind retry of an idempotent command.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DeviceErrorKind::ReadResponseFailed
                | DeviceErrorKind::SendFailed
                | DeviceErrorKind::StatusError
                | DeviceErrorKind::SerialOverrun
                | DeviceErrorKind::FramingError
        )
    }
}

/// Map a raw serial-layer failure into a device error for `command`.
pub(crate) fn serial_to_device(command: DeviceCommand, e: SerialError) -> DeviceError {
    let kind = match e {
        SerialError::NotFound => DeviceErrorKind::PortNotFound,
        SerialError::InUse => DeviceErrorKind::PortInUse,
        SerialError::AccessDenied => DeviceErrorKind::AccessDenied,
        SerialError::ConfigError(msg) => DeviceErrorKind::PortConfigError(msg),
        SerialError::Io(_) => DeviceErrorKind::SendFailed,
    };
    DeviceError::new(command, kind)
}

/// Top-level error for bridge initialisation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Device(#[from] DeviceError),
    #[error("serial link error: {0}")]
    Link(#[from] SerialError),
    #[error("the bridge has not been initialised")]
    NotInitialised,
}
