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

    src/device/drawbridge.rs

    Adapter for the Arduino-based controller speaking the packed framed
    protocol: single ASCII command bytes at 2M baud, single-digit responses,
    and a read stream packing two cell runs per byte. Streaming firmware
    (V1.8+) is required.
*/

use crate::codec::packed;
use crate::device::{FirmwareVersion, FluxDevice, PollIntervals, StreamInterrupt};
use crate::error::{serial_to_device, DeviceCommand, DeviceError, DeviceErrorKind};
use crate::serial::{PortSelector, SerialLink, SerialPortProvider, SerialTimeouts};
use crate::stream::{RevolutionAssembler, StreamSink};
use crate::{DiskSurface, SeekSpeed, MAX_CYLINDERS};

const BAUD: u32 = 2_000_000;

const CMD_VERSION: u8 = b'?';
const CMD_REWIND: u8 = b'.';
// '#' is the legacy no-report seek; '=' also returns disk/write-protect
// status and exists on every firmware new enough to stream.
const CMD_SEEK_REPORT: u8 = b'=';
const CMD_HEAD_UPPER: u8 = b'[';
const CMD_HEAD_LOWER: u8 = b']';
const CMD_MOTOR_ON: u8 = b'+';
const CMD_MOTOR_ON_NOWAIT: u8 = b'*';
const CMD_MOTOR_OFF: u8 = b'-';
const CMD_READ_STREAM: u8 = b'{';
const CMD_WRITE_PRECOMP: u8 = b'}';
const CMD_CHECK_DISK: u8 = b'^';
const CMD_CHECK_WRITE_PROTECT: u8 = b'$';

/// Sent mid-stream to stop it; the device acknowledges with "XYZx1".
const ABORT_CHAR: u8 = b'x';
const ABORT_ACK: [u8; 5] = [b'X', b'Y', b'Z', b'x', b'1'];

pub struct DrawBridge {
    com_port: u8,
    ports: Box<dyn SerialPortProvider>,
    link: Option<Box<dyn SerialLink>>,
    version: FirmwareVersion,
    disk_present: bool,
    write_protected: bool,
    interrupt: StreamInterrupt,
}

impl DrawBridge {
    pub fn new(com_port: u8, ports: Box<dyn SerialPortProvider>) -> Self {
        DrawBridge {
            com_port,
            ports,
            link: None,
            version: FirmwareVersion::default(),
            disk_present: false,
            write_protected: false,
            interrupt: StreamInterrupt::new(),
        }
    }

    pub fn firmware(&self) -> FirmwareVersion {
        self.version
    }

    fn link_mut(&mut self, command: DeviceCommand) -> Result<&mut dyn SerialLink, DeviceError> {
        match self.link.as_mut() {
            Some(link) => Ok(link.as_mut()),
            None => Err(DeviceError::new(command, DeviceErrorKind::PortNotFound)),
        }
    }

    fn write_bytes(&mut self, command: DeviceCommand, bytes: &[u8]) -> Result<(), DeviceError> {
        self.link_mut(command)?
            .write_all(bytes)
            .map_err(|_| DeviceError::new(command, DeviceErrorKind::SendFailed))
    }

    fn read_byte(&mut self, command: DeviceCommand) -> Result<u8, DeviceError> {
        let mut byte = [0u8; 1];
        let link = self.link_mut(command)?;
        match link.read(&mut byte) {
            Ok(1) => Ok(byte[0]),
            _ => Err(DeviceError::new(command, DeviceErrorKind::ReadResponseFailed)),
        }
    }

    fn read_exact(&mut self, command: DeviceCommand, buf: &mut [u8]) -> Result<(), DeviceError> {
        let mut filled = 0;
        while filled < buf.len() {
            let link = self.link_mut(command)?;
            match link.read(&mut buf[filled..]) {
                Ok(0) | Err(_) => return Err(DeviceError::new(command, DeviceErrorKind::ReadResponseFailed)),
                Ok(n) => filled += n,
            }
        }
        Ok(())
    }

    /// Send a one-byte command (plus optional parameter) and return the raw
    /// response byte; '1' is success, '0' an error, anything else protocol
    /// noise interpreted by the caller.
    fn run_command(&mut self, command: DeviceCommand, cmd: u8, param: Option<u8>) -> Result<u8, DeviceError> {
        let mut frame = [0u8; 2];
        frame[0] = cmd;
        let len = match param {
            Some(p) => {
                frame[1] = p;
                2
            }
            None => 1,
        };
        self.write_bytes(command, &frame[..len])?;
        self.read_byte(command)
    }

    /// Drain stale bytes off the link until the read timeout bites.
    fn drain_link(&mut self) {
        if let Some(link) = self.link.as_mut() {
            let mut scratch = [0u8; 64];
            while matches!(link.read(&mut scratch), Ok(n) if n > 0) {}
        }
    }
}

impl FluxDevice for DrawBridge {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.close();

        let mut link = self
            .ports
            .open(&PortSelector::ComPort(self.com_port), BAUD)
            .map_err(|e| serial_to_device(DeviceCommand::OpenPort, e))?;
        link.set_timeouts(SerialTimeouts::command());

        // In case the device was left streaming by a crashed session, knock
        // it out of that mode and discard anything buffered.
        link.write_all(&[ABORT_CHAR])
            .map_err(|_| DeviceError::new(DeviceCommand::OpenPort, DeviceErrorKind::SendFailed))?;
        self.link = Some(link);
        self.drain_link();

        let response = self.run_command(DeviceCommand::GetVersion, CMD_VERSION, None)?;
        if response != b'1' {
            self.close();
            return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::MalformedVersion));
        }

        let mut vbuf = [0u8; 4];
        if self.read_exact(DeviceCommand::GetVersion, &mut vbuf).is_err() {
            self.close();
            return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::MalformedVersion));
        }

        // A ',' separator advertises the hardware sense mod.
        let full_control = vbuf[2] == b',';
        if vbuf[0] != b'V'
            || (vbuf[2] != b'.' && !full_control)
            || !vbuf[1].is_ascii_digit()
            || !vbuf[3].is_ascii_digit()
        {
            self.close();
            return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::MalformedVersion));
        }

        self.version = FirmwareVersion {
            major: vbuf[1] - b'0',
            minor: vbuf[3] - b'0',
            full_control,
        };

        // Streaming arrived in V1.8; without it this bridge cannot work.
        if self.version.major == 0 || (self.version.major == 1 && self.version.minor < 8) {
            log::error!(
                "DrawBridge::open(): firmware V{}.{} too old, V1.8 required",
                self.version.major,
                self.version.minor
            );
            self.close();
            return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::OldFirmware));
        }

        log::debug!(
            "DrawBridge::open(): connected, firmware V{}.{}{}",
            self.version.major,
            self.version.minor,
            if full_control { " (sense mod)" } else { "" }
        );
        Ok(())
    }

    fn close(&mut self) {
        if self.link.is_some() {
            // Power the drive down; best effort, the device may be gone.
            let _ = self.run_command(DeviceCommand::DisableMotor, CMD_MOTOR_OFF, None);
            if let Some(link) = self.link.as_mut() {
                link.purge();
            }
        }
        self.link = None;
        self.disk_present = false;
        self.write_protected = false;
    }

    fn drive_id_name(&self) -> &'static str {
        "DrawBridge Arduino Floppy Reader/Writer"
    }

    fn interrupt(&self) -> StreamInterrupt {
        self.interrupt.clone()
    }

    fn poll_intervals(&self) -> PollIntervals {
        if self.version.full_control {
            PollIntervals {
                present_ms: 500,
                absent_ms: 2500,
            }
        }
        else {
            // Without the sense mod a probe disturbs the drive, so go easy.
            PollIntervals {
                present_ms: 3000,
                absent_ms: 3000,
            }
        }
    }

    fn find_track0(&mut self) -> Result<(), DeviceError> {
        match self.run_command(DeviceCommand::Rewind, CMD_REWIND, None)? {
            b'1' => Ok(()),
            b'#' => Err(DeviceError::new(DeviceCommand::Rewind, DeviceErrorKind::RewindFailure)),
            b'0' => Err(DeviceError::new(DeviceCommand::Rewind, DeviceErrorKind::RewindFailure)),
            _ => Err(DeviceError::new(DeviceCommand::Rewind, DeviceErrorKind::StatusError)),
        }
    }

    fn seek(&mut self, cylinder: u8, speed: SeekSpeed, skip_disk_check: bool) -> Result<(), DeviceError> {
        if cylinder >= MAX_CYLINDERS {
            return Err(DeviceError::new(DeviceCommand::Seek, DeviceErrorKind::TrackRangeError(cylinder)));
        }

        let mut flags: u8 = match speed {
            SeekSpeed::Slow => 0,
            SeekSpeed::Normal => 1,
            SeekSpeed::Fast => 2,
            SeekSpeed::VeryFast => 3,
        };
        if !skip_disk_check {
            flags |= 4;
        }

        // The cylinder travels as two ASCII digits; easy to eyeball on a
        // serial monitor.
        let frame = [CMD_SEEK_REPORT, b'0' + cylinder / 10, b'0' + cylinder % 10, flags];
        self.write_bytes(DeviceCommand::Seek, &frame)?;

        match self.read_byte(DeviceCommand::Seek)? {
            // Already on the requested cylinder; nothing moved.
            b'2' => Ok(()),
            b'1' => {
                // Updated media status rides along: disk presence ('x' if
                // the check was skipped) and write protect.
                let disk = self.read_byte(DeviceCommand::Seek)?;
                if disk != b'x' {
                    self.disk_present = disk == b'1';
                }
                let wp = self.read_byte(DeviceCommand::Seek)?;
                self.write_protected = wp == b'1';
                Ok(())
            }
            b'0' => Err(DeviceError::new(DeviceCommand::Seek, DeviceErrorKind::SeekError)),
            _ => Err(DeviceError::new(DeviceCommand::Seek, DeviceErrorKind::StatusError)),
        }
    }

    fn select_head(&mut self, side: DiskSurface) -> Result<(), DeviceError> {
        let cmd = match side {
            DiskSurface::Upper => CMD_HEAD_UPPER,
            DiskSurface::Lower => CMD_HEAD_LOWER,
        };
        match self.run_command(DeviceCommand::SelectHead, cmd, None)? {
            b'1' => Ok(()),
            _ => Err(DeviceError::new(DeviceCommand::SelectHead, DeviceErrorKind::StatusError)),
        }
    }

    fn motor(&mut self, on: bool, no_wait: bool) -> Result<(), DeviceError> {
        let (tag, cmd) = if on {
            (
                DeviceCommand::EnableMotor,
                if no_wait { CMD_MOTOR_ON_NOWAIT } else { CMD_MOTOR_ON },
            )
        }
        else {
            (DeviceCommand::DisableMotor, CMD_MOTOR_OFF)
        };
        match self.run_command(tag, cmd, None)? {
            b'1' => Ok(()),
            _ => Err(DeviceError::new(tag, DeviceErrorKind::StatusError)),
        }
    }

    fn check_disk(&mut self, force: bool) -> Result<bool, DeviceError> {
        if !force {
            return Ok(self.disk_present);
        }

        let response = self.run_command(DeviceCommand::CheckDisk, CMD_CHECK_DISK, None)?;
        let present = match response {
            b'#' => false,
            b'1' => true,
            _ => return Err(DeviceError::new(DeviceCommand::CheckDisk, DeviceErrorKind::StatusError)),
        };
        // Write protect status follows the presence answer.
        let wp = self.read_byte(DeviceCommand::CheckDisk)?;
        self.disk_present = present;
        self.write_protected = wp == b'1';
        Ok(present)
    }

    fn is_disk_present(&self) -> bool {
        self.disk_present
    }

    fn is_write_protected(&mut self, force: bool) -> Result<bool, DeviceError> {
        if force {
            match self.run_command(DeviceCommand::CheckWriteProtect, CMD_CHECK_WRITE_PROTECT, None)? {
                b'1' => self.write_protected = true,
                b'0' => self.write_protected = false,
                _ => {
                    return Err(DeviceError::new(
                        DeviceCommand::CheckWriteProtect,
                        DeviceErrorKind::StatusError,
                    ))
                }
            }
        }
        Ok(self.write_protected)
    }

    fn read_stream(
        &mut self,
        max_revolutions: u32,
        fingerprint: &mut Vec<u8>,
        sink: StreamSink,
    ) -> Result<(), DeviceError> {
        self.interrupt.clear();

        // Kick off streaming, with one retry after draining a confused
        // device.
        if self.run_command(DeviceCommand::ReadStream, CMD_READ_STREAM, None)? != b'1' {
            log::warn!("DrawBridge::read_stream(): stream start refused, retrying");
            self.drain_link();
            if self.run_command(DeviceCommand::ReadStream, CMD_READ_STREAM, None)? != b'1' {
                return Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::StatusError));
            }
        }

        let interrupt = self.interrupt.clone();
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::PortNotFound)),
        };
        link.set_timeouts(SerialTimeouts::streaming());

        let mut assembler = RevolutionAssembler::new(max_revolutions, fingerprint, sink);

        let mut abort_signalled = false;
        let mut ack_matched = 0usize;
        let mut read_fail = 0u32;
        let mut buf = [0u8; 64];

        let result = 'stream: loop {
            // Once aborted, step a byte at a time hunting the ack tail.
            let want = if abort_signalled { 1 } else { buf.len() };
            let got = link.read(&mut buf[..want]).unwrap_or(0);

            if got == 0 {
                read_fail += 1;
                if read_fail > 20 {
                    log::error!("DrawBridge::read_stream(): device stopped sending");
                    let _ = link.write_all(&[ABORT_CHAR]);
                    break Err(DeviceError::new(
                        DeviceCommand::ReadStream,
                        DeviceErrorKind::ReadResponseFailed,
                    ));
                }
                continue;
            }
            read_fail = 0;

            for &byte in &buf[..got] {
                if abort_signalled {
                    if byte == ABORT_ACK[ack_matched] {
                        ack_matched += 1;
                        if ack_matched == ABORT_ACK.len() {
                            break 'stream Ok(());
                        }
                    }
                    else {
                        ack_matched = 0;
                    }
                }
                else {
                    let (first, second) = packed::unpack_stream_byte(byte);
                    assembler.push(first);
                    assembler.push(second);
                }
            }

            if !abort_signalled && (assembler.is_aborted() || interrupt.is_raised()) {
                if link.write_all(&[ABORT_CHAR]).is_err() {
                    break Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::SendFailed));
                }
                abort_signalled = true;
            }
        };

        link.purge();
        link.set_timeouts(SerialTimeouts::command());
        self.interrupt.clear();
        result
    }

    fn write_track_precomp(&mut self, mfm: &[u8], from_index: bool, precomp: bool) -> Result<(), DeviceError> {
        let encoded = packed::encode_track_precomp(mfm, precomp);
        if encoded.len() > u16::MAX as usize {
            return Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::SendFailed));
        }

        if self.run_command(DeviceCommand::WriteTrack, CMD_WRITE_PRECOMP, None)? != b'1' {
            return Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::StatusError));
        }

        // The device answers whether the media will take a write at all.
        match self.read_byte(DeviceCommand::WriteTrack)? {
            b'Y' => {}
            b'N' => {
                self.write_protected = true;
                return Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::WriteProtected));
            }
            _ => return Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::StatusError)),
        }

        let len = encoded.len() as u16;
        self.write_bytes(DeviceCommand::WriteTrack, &[(len >> 8) as u8, (len & 0xFF) as u8])?;
        self.write_bytes(DeviceCommand::WriteTrack, &[from_index as u8])?;

        if self.read_byte(DeviceCommand::WriteTrack)? != b'!' {
            return Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::StatusError));
        }

        self.write_bytes(DeviceCommand::WriteTrack, &encoded)?;

        match self.read_byte(DeviceCommand::WriteTrack)? {
            b'1' => Ok(()),
            b'X' => Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::WriteTimeout)),
            b'Y' => Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::FramingError)),
            b'Z' => Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::SerialOverrun)),
            b'N' => {
                self.write_protected = true;
                Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::WriteProtected))
            }
            _ => Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::StatusError)),
        }
    }
}
