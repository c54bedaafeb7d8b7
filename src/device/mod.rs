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

    src/device/mod.rs

    The capability set shared by every supported flux controller. The bridge
    worker drives exactly this surface; the two hardware families implement
    it over their own wire protocols in the submodules.
*/

pub mod drawbridge;
pub mod greaseweazle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::DeviceError;
use crate::stream::StreamSink;
use crate::{DiskSurface, SeekSpeed};

/// Firmware revision reported by a device at handshake.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    /// The controller advertises hardware able to sense disk presence
    /// without disturbing the head.
    pub full_control: bool,
}

/// How often the worker should probe the drive for media changes, which on
/// most of this hardware cannot be sensed passively.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PollIntervals {
    /// Interval while a disk is present (watching for removal).
    pub present_ms: u64,
    /// Interval while the drive is empty (watching for insertion).
    pub absent_ms: u64,
}

/// A clonable handle that asks an in-flight read stream to stop. Raised from
/// the emulator thread whenever it enqueues work, so background streaming
/// never delays a command by more than a packet or two.
#[derive(Clone, Debug, Default)]
pub struct StreamInterrupt {
    raised: Arc<AtomicBool>,
}

impl StreamInterrupt {
    pub fn new() -> Self {
        StreamInterrupt::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

/// A flux-level floppy controller. One worker thread owns the device; only
/// the [StreamInterrupt] is shared across threads.
pub trait FluxDevice: Send {
    /// Open the serial link and perform the protocol handshake. Fails with
    /// `OldFirmware` when the device cannot stream, and with the usual link
    /// errors when the port is unavailable.
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Idempotent. Disables the motor before releasing the port.
    fn close(&mut self);

    /// Human-readable name of the attached interface. Stable for the life
    /// of the process.
    fn drive_id_name(&self) -> &'static str;

    /// Handle used to cancel an in-flight [FluxDevice::read_stream] from
    /// another thread.
    fn interrupt(&self) -> StreamInterrupt;

    /// How often the bridge should poll for disk changes with this hardware.
    fn poll_intervals(&self) -> PollIntervals;

    /// Step the head back to cylinder 0 using a fast search.
    fn find_track0(&mut self) -> Result<(), DeviceError>;

    /// Step the head to `cylinder`. When the firmware supports it, this also
    /// refreshes the cached disk-present and write-protect flags unless
    /// `skip_disk_check` is set.
    fn seek(&mut self, cylinder: u8, speed: SeekSpeed, skip_disk_check: bool) -> Result<(), DeviceError>;

    /// Select the read/write head.
    fn select_head(&mut self, side: DiskSurface) -> Result<(), DeviceError>;

    /// Switch the drive motor. With `no_wait` the device returns before the
    /// spindle is up to speed and the caller owns the spin-up delay.
    fn motor(&mut self, on: bool, no_wait: bool) -> Result<(), DeviceError>;

    /// Is a disk in the drive? `force` performs a physical probe; otherwise
    /// the cached answer from the last probe is returned.
    fn check_disk(&mut self, force: bool) -> Result<bool, DeviceError>;

    /// Cached disk-present flag, updated by probes and seeks.
    fn is_disk_present(&self) -> bool;

    /// Is the disk write protected? `force` probes where the hardware can;
    /// adapters that only learn this from a failed write return the cached
    /// flag either way.
    fn is_write_protected(&mut self, force: bool) -> Result<bool, DeviceError>;

    /// Stream MFM samples from the current track into `sink`, cutting exact
    /// revolutions against `fingerprint` (see [crate::stream]). Returns when
    /// the sink declines more data, the interrupt is raised, or the device
    /// ends the stream. The fingerprint is updated in place.
    fn read_stream(
        &mut self,
        max_revolutions: u32,
        fingerprint: &mut Vec<u8>,
        sink: StreamSink,
    ) -> Result<(), DeviceError>;

    /// Write an MFM track image, optionally starting at the index pulse and
    /// optionally with write precompensation.
    fn write_track_precomp(&mut self, mfm: &[u8], from_index: bool, precomp: bool) -> Result<(), DeviceError>;
}
