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

    src/device/greaseweazle.rs

    Adapter for the GreaseWeazle controller speaking the opcode flux
    protocol: framed [cmd, len, params...] requests with [cmd, ack]
    responses, and raw flux tick streams terminated by a zero byte. Flux
    timing is converted against the device-reported sample frequency.
*/

use std::collections::VecDeque;
use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};

use crate::codec::flux_rle::{self, FluxDecoder, FluxStep, FLUX_TERMINATOR};
use crate::device::{FluxDevice, PollIntervals, StreamInterrupt};
use crate::error::{serial_to_device, DeviceCommand, DeviceError, DeviceErrorKind};
use crate::serial::{PortSelector, SerialLink, SerialPortProvider, SerialTimeouts};
use crate::stream::{RevolutionAssembler, StreamSink};
use crate::{DiskSurface, SeekSpeed, MAX_CYLINDERS};

const BAUD: u32 = 9600; // USB CDC; the rate is nominal

/// Wire command bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
#[repr(u8)]
enum GwCmd {
    GetInfo = 0,
    Seek = 2,
    Head = 3,
    SetParams = 4,
    GetParams = 5,
    Motor = 6,
    ReadFlux = 7,
    WriteFlux = 8,
    GetFluxStatus = 9,
    Select = 12,
    Deselect = 13,
    SetBusType = 14,
    Reset = 16,
}

/// Wire acknowledgement codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
enum GwAck {
    Okay,
    BadCommand,
    NoIndex,
    NoTrk0,
    FluxOverflow,
    FluxUnderflow,
    WriteProtected,
    NoUnit,
    NoBus,
    BadUnit,
    BadPin,
    BadCylinder,
    Unknown,
}

impl From<u8> for GwAck {
    fn from(value: u8) -> Self {
        match value {
            0 => GwAck::Okay,
            1 => GwAck::BadCommand,
            2 => GwAck::NoIndex,
            3 => GwAck::NoTrk0,
            4 => GwAck::FluxOverflow,
            5 => GwAck::FluxUnderflow,
            6 => GwAck::WriteProtected,
            7 => GwAck::NoUnit,
            8 => GwAck::NoBus,
            9 => GwAck::BadUnit,
            10 => GwAck::BadPin,
            11 => GwAck::BadCylinder,
            _ => GwAck::Unknown,
        }
    }
}

/// GetParams/SetParams parameter block index.
const PARAMS_DELAYS: u8 = 0;
/// GetInfo query index.
const GETINFO_FIRMWARE: u8 = 0;
/// SetBusType value for PC-style drive cabling.
const BUS_TYPE_IBMPC: u8 = 1;

/// Firmware info block returned by GetInfo.
#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default)]
struct GwFirmwareInfo {
    major: u8,
    minor: u8,
    is_main_firmware: u8,
    max_cmd: u8,
    /// Flux sample clock in Hz.
    sample_freq: u32,
    hw_model: u8,
    hw_submodel: u8,
    usb_speed: u8,
    padding: [u8; 21],
}

/// Drive timing parameters, read at handshake and rewritten on demand.
#[binrw]
#[brw(little)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct GwDriveDelays {
    /// In microseconds.
    select_delay: u16,
    step_delay: u16,
    /// In milliseconds.
    seek_settle_delay: u16,
    motor_delay: u16,
    watchdog_delay: u16,
}

/// ReadFlux parameter frame.
#[binrw]
#[brw(little)]
#[derive(Clone, Copy, Debug, Default)]
struct GwReadFlux {
    /// Maximum ticks to read for (0 = no limit).
    ticks: u32,
    /// Maximum index pulses to read (0 = no limit).
    max_index: u16,
    /// Ticks to linger after the final index pulse.
    max_index_linger: u32,
}

/// WriteFlux parameter frame.
#[binrw]
#[brw(little)]
#[derive(Clone, Copy, Debug, Default)]
struct GwWriteFlux {
    cue_at_index: u8,
    terminate_at_index: u8,
}

macro_rules! impl_frame_bytes {
    ($($frame:ty),+) => {
        $(impl $frame {
            /// Serialise this frame for the wire. Writing a fixed-layout
            /// frame to a Vec cannot fail.
            #[allow(dead_code)]
            fn frame_bytes(&self) -> Vec<u8> {
                let mut bytes = Vec::new();
                let _ = self.write(&mut Cursor::new(&mut bytes));
                bytes
            }
        })+
    };
}

impl_frame_bytes!(GwFirmwareInfo, GwDriveDelays, GwReadFlux, GwWriteFlux);

/// Size of the drive-delay parameter block on the wire.
const DELAYS_FRAME_LEN: u8 = 10;

pub struct GreaseWeazle {
    drive_a: bool,
    ports: Box<dyn SerialPortProvider>,
    link: Option<Box<dyn SerialLink>>,
    info: GwFirmwareInfo,
    delays: GwDriveDelays,
    motor_enabled: bool,
    disk_present: bool,
    write_protected: bool,
    interrupt: StreamInterrupt,
}

impl GreaseWeazle {
    pub fn new(drive_a: bool, ports: Box<dyn SerialPortProvider>) -> Self {
        GreaseWeazle {
            drive_a,
            ports,
            link: None,
            info: GwFirmwareInfo::default(),
            delays: GwDriveDelays::default(),
            motor_enabled: false,
            disk_present: false,
            write_protected: false,
            interrupt: StreamInterrupt::new(),
        }
    }

    fn drive_index(&self) -> u8 {
        if self.drive_a {
            0
        }
        else {
            1
        }
    }

    fn link_mut(&mut self, command: DeviceCommand) -> Result<&mut dyn SerialLink, DeviceError> {
        match self.link.as_mut() {
            Some(link) => Ok(link.as_mut()),
            None => Err(DeviceError::new(command, DeviceErrorKind::PortNotFound)),
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

    /// Send `[cmd, len, params...]` and read the `[cmd, ack]` response.
    /// `extra_response` asks the device to follow the ack with that many
    /// bytes of payload (read separately by the caller).
    fn send_command(
        &mut self,
        tag: DeviceCommand,
        cmd: GwCmd,
        params: &[u8],
        extra_response: Option<u8>,
    ) -> Result<GwAck, DeviceError> {
        let mut frame = Vec::with_capacity(params.len() + 3);
        frame.push(cmd as u8);
        frame.push(2 + params.len() as u8 + extra_response.map_or(0, |_| 1));
        frame.extend_from_slice(params);
        if let Some(size) = extra_response {
            frame.push(size);
        }

        self.link_mut(tag)?
            .write_all(&frame)
            .map_err(|_| DeviceError::new(tag, DeviceErrorKind::SendFailed))?;

        let mut response = [0u8; 2];
        self.read_exact(tag, &mut response)?;

        if response[0] != cmd as u8 {
            log::warn!(
                "GreaseWeazle::send_command(): {} answered for command {:02x}",
                cmd,
                response[0]
            );
            return Err(DeviceError::new(tag, DeviceErrorKind::StatusError));
        }
        Ok(GwAck::from(response[1]))
    }

    fn select_drive(&mut self, tag: DeviceCommand, select: bool) -> Result<GwAck, DeviceError> {
        if select {
            self.send_command(tag, GwCmd::Select, &[self.drive_index()], None)
        }
        else {
            self.send_command(tag, GwCmd::Deselect, &[], None)
        }
    }

    fn push_drive_delays(&mut self, tag: DeviceCommand) -> Result<(), DeviceError> {
        let mut params = vec![PARAMS_DELAYS];
        params.extend(self.delays.frame_bytes());
        match self.send_command(tag, GwCmd::SetParams, &params, None)? {
            GwAck::Okay => Ok(()),
            ack => {
                log::warn!("GreaseWeazle::push_drive_delays(): rejected ({})", ack);
                Err(DeviceError::new(tag, DeviceErrorKind::StatusError))
            }
        }
    }

    /// Read raw flux bytes until the stream terminator, discarding them.
    fn drain_flux_stream(&mut self, tag: DeviceCommand) -> Result<(), DeviceError> {
        let mut empty_reads = 0u32;
        let mut buf = [0u8; 256];
        loop {
            let link = self.link_mut(tag)?;
            let got = link.read(&mut buf).unwrap_or(0);
            if got == 0 {
                empty_reads += 1;
                if empty_reads > 200 {
                    return Err(DeviceError::new(tag, DeviceErrorKind::ReadResponseFailed));
                }
                continue;
            }
            empty_reads = 0;
            if buf[..got].contains(&FLUX_TERMINATOR) {
                return Ok(());
            }
        }
    }
}

impl FluxDevice for GreaseWeazle {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.close();

        let mut link = self
            .ports
            .open(&PortSelector::UsbAutoDetect, BAUD)
            .map_err(|e| serial_to_device(DeviceCommand::OpenPort, e))?;
        link.set_timeouts(SerialTimeouts::command());
        link.purge();
        self.link = Some(link);

        // Firmware query, with one retry after a purge; the device may have
        // been mid-stream when we attached.
        let ack = match self.send_command(DeviceCommand::GetVersion, GwCmd::GetInfo, &[GETINFO_FIRMWARE], None) {
            Ok(ack) => ack,
            Err(_) => {
                if let Some(link) = self.link.as_mut() {
                    link.purge();
                }
                match self.send_command(DeviceCommand::GetVersion, GwCmd::GetInfo, &[GETINFO_FIRMWARE], None) {
                    Ok(ack) => ack,
                    Err(_) => {
                        self.close();
                        return Err(DeviceError::new(
                            DeviceCommand::GetVersion,
                            DeviceErrorKind::MalformedVersion,
                        ));
                    }
                }
            }
        };
        if ack != GwAck::Okay {
            self.close();
            return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::MalformedVersion));
        }

        let mut info_bytes = [0u8; 32];
        if self.read_exact(DeviceCommand::GetVersion, &mut info_bytes).is_err() {
            self.close();
            return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::MalformedVersion));
        }
        let info = match GwFirmwareInfo::read(&mut Cursor::new(&info_bytes[..])) {
            Ok(info) => info,
            Err(_) => {
                self.close();
                return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::MalformedVersion));
            }
        };

        if info.major == 0 && info.minor < 25 {
            self.close();
            return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::OldFirmware));
        }
        if info.is_main_firmware == 0 {
            self.close();
            return Err(DeviceError::new(DeviceCommand::GetVersion, DeviceErrorKind::InUpdateMode));
        }

        log::debug!(
            "GreaseWeazle::open(): firmware v{}.{}, model {}.{}, {}MHz sample clock",
            info.major,
            info.minor,
            info.hw_model,
            info.hw_submodel,
            info.sample_freq / 1_000_000
        );
        self.info = info;

        // Known state, then learn the drive timing parameters.
        if self.send_command(DeviceCommand::Reset, GwCmd::Reset, &[], None)? != GwAck::Okay {
            self.close();
            return Err(DeviceError::new(DeviceCommand::Reset, DeviceErrorKind::StatusError));
        }

        if self.send_command(
            DeviceCommand::SetParameters,
            GwCmd::GetParams,
            &[PARAMS_DELAYS],
            Some(DELAYS_FRAME_LEN),
        )? != GwAck::Okay
        {
            self.close();
            return Err(DeviceError::new(DeviceCommand::SetParameters, DeviceErrorKind::StatusError));
        }
        let mut delay_bytes = [0u8; 10];
        if self.read_exact(DeviceCommand::SetParameters, &mut delay_bytes).is_err() {
            self.close();
            return Err(DeviceError::new(
                DeviceCommand::SetParameters,
                DeviceErrorKind::ReadResponseFailed,
            ));
        }
        self.delays = GwDriveDelays::read(&mut Cursor::new(&delay_bytes[..])).unwrap_or_default();

        if self.send_command(DeviceCommand::OpenPort, GwCmd::SetBusType, &[BUS_TYPE_IBMPC], None)? != GwAck::Okay {
            self.close();
            return Err(DeviceError::new(DeviceCommand::OpenPort, DeviceErrorKind::StatusError));
        }

        Ok(())
    }

    fn close(&mut self) {
        if self.link.is_some() && self.motor_enabled {
            let _ = self.motor(false, false);
        }
        self.link = None;
        self.motor_enabled = false;
        self.disk_present = false;
        self.write_protected = false;
    }

    fn drive_id_name(&self) -> &'static str {
        "GreaseWeazle Floppy Reader/Writer"
    }

    fn interrupt(&self) -> StreamInterrupt {
        self.interrupt.clone()
    }

    fn poll_intervals(&self) -> PollIntervals {
        // Probing spins the drive, so poll gently in both states.
        PollIntervals {
            present_ms: 4000,
            absent_ms: 3000,
        }
    }

    fn find_track0(&mut self) -> Result<(), DeviceError> {
        self.seek(0, SeekSpeed::Fast, true)
            .map_err(|e| DeviceError::new(DeviceCommand::Rewind, e.kind))
    }

    fn seek(&mut self, cylinder: u8, speed: SeekSpeed, skip_disk_check: bool) -> Result<(), DeviceError> {
        if cylinder >= MAX_CYLINDERS {
            return Err(DeviceError::new(DeviceCommand::Seek, DeviceErrorKind::TrackRangeError(cylinder)));
        }

        let step_delay = match speed {
            SeekSpeed::Slow => 8000,
            SeekSpeed::Normal => 7000,
            SeekSpeed::Fast => 6000,
            SeekSpeed::VeryFast => 5000,
        };
        if step_delay != self.delays.step_delay {
            self.delays.step_delay = step_delay;
            self.push_drive_delays(DeviceCommand::Seek)?;
        }

        self.select_drive(DeviceCommand::Seek, true)?;
        let ack = self.send_command(DeviceCommand::Seek, GwCmd::Seek, &[cylinder], None)?;
        self.select_drive(DeviceCommand::Seek, false)?;

        // This hardware reports nothing about the media on a seek; probe
        // separately unless the caller said not to bother.
        if !skip_disk_check {
            self.check_disk(true)?;
        }

        match ack {
            GwAck::Okay => Ok(()),
            GwAck::NoTrk0 => Err(DeviceError::new(DeviceCommand::Seek, DeviceErrorKind::RewindFailure)),
            GwAck::BadCylinder => Err(DeviceError::new(
                DeviceCommand::Seek,
                DeviceErrorKind::TrackRangeError(cylinder),
            )),
            _ => Err(DeviceError::new(DeviceCommand::Seek, DeviceErrorKind::SeekError)),
        }
    }

    fn select_head(&mut self, side: DiskSurface) -> Result<(), DeviceError> {
        let head = match side {
            DiskSurface::Upper => 1u8,
            DiskSurface::Lower => 0u8,
        };
        match self.send_command(DeviceCommand::SelectHead, GwCmd::Head, &[head], None)? {
            GwAck::Okay => Ok(()),
            _ => Err(DeviceError::new(DeviceCommand::SelectHead, DeviceErrorKind::StatusError)),
        }
    }

    fn motor(&mut self, on: bool, no_wait: bool) -> Result<(), DeviceError> {
        let tag = if on {
            DeviceCommand::EnableMotor
        }
        else {
            DeviceCommand::DisableMotor
        };

        // The device owns the spin-up wait; trim it to nothing when the
        // caller is running its own spin-up timer.
        let motor_delay = if no_wait { 10 } else { 750 };
        if motor_delay != self.delays.motor_delay {
            self.delays.motor_delay = motor_delay;
            self.push_drive_delays(tag)?;
        }

        match self.send_command(tag, GwCmd::Motor, &[self.drive_index(), on as u8], None)? {
            GwAck::Okay => {
                self.motor_enabled = on;
                Ok(())
            }
            _ => Err(DeviceError::new(tag, DeviceErrorKind::StatusError)),
        }
    }

    fn check_disk(&mut self, force: bool) -> Result<bool, DeviceError> {
        if !force {
            return Ok(self.disk_present);
        }

        // A short flux read expecting two index pulses; no pulses means no
        // disk is spinning under the head.
        let was_spinning = self.motor_enabled;
        if !was_spinning {
            self.motor(true, false)?;
        }
        self.select_drive(DeviceCommand::CheckDisk, true)?;

        let header = GwReadFlux {
            ticks: 0,
            max_index: 2,
            max_index_linger: 0,
        };
        let ack = self.send_command(DeviceCommand::CheckDisk, GwCmd::ReadFlux, &header.frame_bytes(), None)?;
        if ack == GwAck::Okay {
            self.drain_flux_stream(DeviceCommand::CheckDisk)?;
        }
        let status = self.send_command(DeviceCommand::CheckDisk, GwCmd::GetFluxStatus, &[], None)?;

        self.select_drive(DeviceCommand::CheckDisk, false)?;
        if !was_spinning {
            self.motor(false, false)?;
        }

        self.disk_present = status != GwAck::NoIndex;
        Ok(self.disk_present)
    }

    fn is_disk_present(&self) -> bool {
        self.disk_present
    }

    fn is_write_protected(&mut self, _force: bool) -> Result<bool, DeviceError> {
        // Only learned from a refused write on this hardware.
        Ok(self.write_protected)
    }

    fn read_stream(
        &mut self,
        max_revolutions: u32,
        fingerprint: &mut Vec<u8>,
        sink: StreamSink,
    ) -> Result<(), DeviceError> {
        self.interrupt.clear();

        self.select_drive(DeviceCommand::ReadStream, true)?;

        let linger_ticks = (210_000_000u64 * self.info.sample_freq as u64 / 1_000_000_000) as u32;
        let header = GwReadFlux {
            ticks: 0,
            max_index: max_revolutions.min(u16::MAX as u32) as u16,
            max_index_linger: linger_ticks,
        };
        let ack = self.send_command(DeviceCommand::ReadStream, GwCmd::ReadFlux, &header.frame_bytes(), None)?;
        if ack != GwAck::Okay {
            let _ = self.select_drive(DeviceCommand::ReadStream, false);
            return Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::ReadResponseFailed));
        }

        let sample_freq = self.info.sample_freq;
        let interrupt = self.interrupt.clone();
        {
            let link = match self.link.as_mut() {
                Some(link) => link,
                None => return Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::PortNotFound)),
            };
            link.set_timeouts(SerialTimeouts::streaming());

            let mut decoder = FluxDecoder::new(sample_freq);
            let mut assembler = RevolutionAssembler::new(max_revolutions, fingerprint, sink);
            let mut queue: VecDeque<u8> = VecDeque::with_capacity(1024);

            let mut buf = [0u8; 256];
            let mut terminated = false;
            let mut aborting = false;
            let mut empty_reads = 0u32;

            while !terminated {
                let got = link.read(&mut buf).unwrap_or(0);
                if got == 0 {
                    empty_reads += 1;
                    if empty_reads > 200 {
                        log::error!("GreaseWeazle::read_stream(): device stopped sending");
                        break;
                    }
                    continue;
                }
                empty_reads = 0;

                for &byte in &buf[..got] {
                    if byte == FLUX_TERMINATOR {
                        terminated = true;
                        break;
                    }
                    if !aborting {
                        queue.push_back(byte);
                    }
                }

                if aborting {
                    // The device streams to its own end; just swallow it.
                    continue;
                }

                loop {
                    match decoder.step(&mut queue) {
                        FluxStep::Run(run) => {
                            if !assembler.push(run) {
                                aborting = true;
                                break;
                            }
                        }
                        FluxStep::Consumed => {}
                        FluxStep::NeedMore => break,
                    }
                }

                if interrupt.is_raised() {
                    aborting = true;
                }
            }

            if terminated && !aborting && !assembler.is_aborted() {
                assembler.drain();
            }

            link.set_timeouts(SerialTimeouts::command());
        }

        let status = self.send_command(DeviceCommand::ReadStream, GwCmd::GetFluxStatus, &[], None)?;
        let _ = self.select_drive(DeviceCommand::ReadStream, false);
        self.interrupt.clear();

        self.disk_present = status != GwAck::NoIndex;
        match status {
            GwAck::Okay => Ok(()),
            GwAck::NoIndex => Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::NoDiskInDrive)),
            GwAck::FluxOverflow => Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::SerialOverrun)),
            _ => Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::ReadResponseFailed)),
        }
    }

    fn write_track_precomp(&mut self, mfm: &[u8], from_index: bool, precomp: bool) -> Result<(), DeviceError> {
        let encoded = flux_rle::encode_track_precomp(mfm, precomp, self.info.sample_freq);

        self.select_drive(DeviceCommand::WriteTrack, true)?;

        let header = GwWriteFlux {
            cue_at_index: from_index as u8,
            terminate_at_index: 0,
        };
        let ack = self.send_command(DeviceCommand::WriteTrack, GwCmd::WriteFlux, &header.frame_bytes(), None)?;
        match ack {
            GwAck::Okay => {}
            GwAck::WriteProtected => {
                self.write_protected = true;
                let _ = self.select_drive(DeviceCommand::WriteTrack, false);
                return Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::WriteProtected));
            }
            _ => {
                let _ = self.select_drive(DeviceCommand::WriteTrack, false);
                return Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::ReadResponseFailed));
            }
        }

        if let Err(e) = self
            .link_mut(DeviceCommand::WriteTrack)
            .and_then(|link| {
                link.write_all(&encoded)
                    .map_err(|_| DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::SendFailed))
            })
        {
            let _ = self.select_drive(DeviceCommand::WriteTrack, false);
            return Err(e);
        }

        // One sync byte confirms the device consumed the stream.
        let mut sync = [0u8; 1];
        if self.read_exact(DeviceCommand::WriteTrack, &mut sync).is_err() {
            let _ = self.select_drive(DeviceCommand::WriteTrack, false);
            return Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::WriteTimeout));
        }

        let status = self.send_command(DeviceCommand::WriteTrack, GwCmd::GetFluxStatus, &[], None)?;
        let _ = self.select_drive(DeviceCommand::WriteTrack, false);

        match status {
            GwAck::Okay => Ok(()),
            GwAck::WriteProtected => {
                self.write_protected = true;
                Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::WriteProtected))
            }
            GwAck::FluxUnderflow => Err(DeviceError::new(DeviceCommand::WriteTrack, DeviceErrorKind::SerialOverrun)),
            _ => Err(DeviceError::new(
                DeviceCommand::WriteTrack,
                DeviceErrorKind::ReadResponseFailed,
            )),
        }
    }
}
