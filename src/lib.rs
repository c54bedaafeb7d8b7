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
*/

//! FluxBridge connects a cycle-exact Amiga emulator to a real 3.5" floppy
//! drive attached through a USB flux-level controller. The emulator sees a
//! continuous stream of MFM bits keyed by head position; the hardware speaks
//! raw flux timing over a serial link. The [bridge::FloppyBridge] façade sits
//! between the two, capturing whole index-aligned revolutions into a track
//! cache on a background worker thread so that the emulator's tick loop is
//! never stalled waiting on the drive.

pub mod align;
pub mod bridge;
pub mod cache;
pub mod codec;
pub mod device;
pub mod error;
pub mod samples;
pub mod serial;
pub mod stream;

use std::fmt;
use std::fmt::{Display, Formatter};

/// Number of cylinders the bridge will address. Amiga drives commonly step to
/// 81 or 82; anything beyond risks mechanical damage on some mechanisms.
pub const MAX_CYLINDERS: u8 = 82;

/// Maximum MFM sample storage for one revolution, in bytes.
/// A 300 RPM revolution at 500 kbps is 12,500 bytes; this allows ~12% slack
/// for slow-spinning drives.
pub const MFM_BUFFER_MAX_BYTES: usize = 0x3800;

/// Maximum MFM sample storage for one revolution, in bits.
pub const MFM_BUFFER_MAX_BITS: usize = MFM_BUFFER_MAX_BYTES * 8;

/// The smallest number of bits a healthy revolution can contain, assuming the
/// drive spins no more than 3% fast. Reported to the emulator while the first
/// capture of a track is still in flight, so its position counter has
/// something sane to wrap against.
pub const THEORETICAL_MIN_TRACK_BITS: usize = 12_134 * 8;

/// Width of the revolution fingerprint, in cell runs. The hardware index
/// pulse only locates the revolution boundary to within a few bit-cells, so
/// this many run-length codes from the first revolution are kept and matched
/// against later ones to find the true cut point.
pub const ALIGN_WINDOW: usize = 32;

/// Bits handed to the stream sink per callback while capturing.
pub const STREAM_CHUNK_BITS: usize = 128;

/// Nominal duration of a single MFM bit-cell on double-density media.
pub const BITCELL_NS: u32 = 2000;

/// Cylinder at which write precompensation switches on. Inner tracks pack
/// flux transitions closer together, which is where bit-shift bites.
pub const WRITE_PRECOMP_START_CYLINDER: u8 = 40;

/// Which physical head of the drive is selected.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum DiskSurface {
    #[default]
    Lower,
    Upper,
}

impl DiskSurface {
    /// Index of this surface within per-track tables.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            DiskSurface::Lower => 0,
            DiskSurface::Upper => 1,
        }
    }
}

impl From<bool> for DiskSurface {
    fn from(upper: bool) -> Self {
        if upper {
            DiskSurface::Upper
        }
        else {
            DiskSurface::Lower
        }
    }
}

impl Display for DiskSurface {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DiskSurface::Lower => write!(f, "lower"),
            DiskSurface::Upper => write!(f, "upper"),
        }
    }
}

/// How quickly the head should step during a seek.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SeekSpeed {
    Slow,
    #[default]
    Normal,
    Fast,
    VeryFast,
}

/// The kind of drive mechanism a bridge reports to the emulator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DriveType {
    /// 3.5" double density. The only type currently bridged.
    Dd35,
    /// 3.5" high density.
    Hd35,
    /// 5.25" single density.
    Sd525,
}

pub use crate::bridge::{DriverConfig, FloppyBridge};
pub use crate::device::FluxDevice;
pub use crate::error::{BridgeError, DeviceError, DeviceErrorKind};
pub use crate::samples::{RevolutionBuffer, SampleChunk};
