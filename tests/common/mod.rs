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

    tests/common/mod.rs

    Test support: a mock flux drive with deterministic per-track media,
    index jitter like the real hardware, and full bookkeeping of every seek
    and write so scenarios can assert on physical drive activity.
*/
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fluxbridge::codec::CellRun;
use fluxbridge::device::{FluxDevice, PollIntervals, StreamInterrupt};
use fluxbridge::error::{DeviceCommand, DeviceError, DeviceErrorKind};
use fluxbridge::stream::{RevolutionAssembler, StreamSink};
use fluxbridge::{DiskSurface, SeekSpeed, MAX_CYLINDERS};

/// Bits in every synthetic revolution. Comfortably above the minimum a
/// healthy disk yields.
pub const MOCK_TRACK_BITS: usize = 100_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spin until `condition` holds or `timeout` passes; true on success.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn lcg(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
    *state >> 33
}

/// Generate a run-length sequence (gaps of 2..=4 cells) totalling exactly
/// `total_bits`, deterministically from `seed`.
pub fn track_gaps(seed: u64, total_bits: usize) -> Vec<u8> {
    let mut state = seed ^ 0x9e37_79b9_7f4a_7c15;
    let mut gaps: Vec<u8> = Vec::with_capacity(total_bits / 3);
    let mut bits = 0usize;

    while bits + 5 <= total_bits {
        let g = 2 + (lcg(&mut state) % 3) as u8;
        gaps.push(g);
        bits += g as usize;
    }
    let mut remainder = total_bits - bits;
    if remainder == 1 {
        // Gaps of one cell are not representable; borrow from the last gap.
        if let Some(last) = gaps.last_mut() {
            *last += 1;
            remainder = 0;
        }
    }
    if remainder >= 2 {
        gaps.push(remainder as u8);
    }
    debug_assert_eq!(gaps.iter().map(|&g| g as usize).sum::<usize>(), total_bits);
    gaps
}

/// Render a gap sequence into packed MFM bytes, MSB first. Every gap is
/// `g - 1` zero bits followed by a one.
pub fn gaps_to_bytes(gaps: &[u8]) -> Vec<u8> {
    let total_bits: usize = gaps.iter().map(|&g| g as usize).sum();
    let mut bytes = vec![0u8; total_bits.div_ceil(8)];
    let mut pos = 0usize;
    for &gap in gaps {
        pos += gap as usize - 1;
        bytes[pos / 8] |= 0x80 >> (pos % 8);
        pos += 1;
    }
    bytes
}

/// Recover the gap sequence from packed MFM bytes, the way a drive's write
/// head would lay flux down. Trailing zeros after the final transition are
/// dropped.
pub fn bytes_to_gaps(bytes: &[u8]) -> Vec<u8> {
    let mut gaps = Vec::new();
    let mut since_last = 0u32;
    for &byte in bytes {
        for bit in 0..8 {
            since_last += 1;
            if byte & (0x80 >> bit) != 0 {
                gaps.push(since_last.clamp(2, 5) as u8);
                since_last = 0;
            }
        }
    }
    gaps
}

/// Expand a gap sequence into individual bits for comparisons.
pub fn gaps_to_bits(gaps: &[u8]) -> Vec<bool> {
    let mut bits = Vec::new();
    for &gap in gaps {
        for _ in 0..gap - 1 {
            bits.push(false);
        }
        bits.push(true);
    }
    bits
}

/// One track write captured by the mock.
#[derive(Clone)]
pub struct WrittenTrack {
    pub cylinder: u8,
    pub side: DiskSurface,
    pub bytes: Vec<u8>,
    pub from_index: bool,
    pub precomp: bool,
}

#[derive(Default)]
pub struct MockState {
    pub disk_present: bool,
    pub write_protected: bool,
    /// Simulated head travel time per seek.
    pub seek_delay: Duration,
    /// Every physical seek the device performed, in order.
    pub seeks: Vec<u8>,
    pub head_selects: Vec<DiskSurface>,
    pub motor_events: Vec<bool>,
    pub writes: Vec<WrittenTrack>,
    /// Media content overridden by a write; read back in preference to the
    /// synthetic track.
    pub written_media: HashMap<(u8, usize), Vec<u8>>,
    /// Streams started and streams cut short by the sink or interrupt.
    pub streams_started: usize,
    pub streams_aborted: usize,
}

/// A deterministic in-memory flux drive. Each (cylinder, side) has its own
/// pseudo-random but stable media; the index pulse jitters by up to one run
/// either way per revolution, exercising the aligner exactly as real
/// hardware does.
pub struct MockDrive {
    pub state: Arc<Mutex<MockState>>,
    interrupt: StreamInterrupt,
    cylinder: u8,
    side: DiskSurface,
}

impl MockDrive {
    pub fn new() -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState {
            disk_present: true,
            ..MockState::default()
        }));
        (
            MockDrive {
                state: Arc::clone(&state),
                interrupt: StreamInterrupt::new(),
                cylinder: 0,
                side: DiskSurface::Lower,
            },
            state,
        )
    }

    fn media_gaps(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        if let Some(bytes) = state.written_media.get(&(self.cylinder, self.side.index())) {
            bytes_to_gaps(bytes)
        }
        else {
            let seed = (self.cylinder as u64) << 8 | self.side.index() as u64;
            track_gaps(seed, MOCK_TRACK_BITS)
        }
    }
}

impl FluxDevice for MockDrive {
    fn open(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn drive_id_name(&self) -> &'static str {
        "Mock Flux Drive"
    }

    fn interrupt(&self) -> StreamInterrupt {
        self.interrupt.clone()
    }

    fn poll_intervals(&self) -> PollIntervals {
        // Tight intervals keep media-change scenarios fast.
        PollIntervals {
            present_ms: 120,
            absent_ms: 120,
        }
    }

    fn find_track0(&mut self) -> Result<(), DeviceError> {
        self.cylinder = 0;
        Ok(())
    }

    fn seek(&mut self, cylinder: u8, _speed: SeekSpeed, _skip_disk_check: bool) -> Result<(), DeviceError> {
        if cylinder >= MAX_CYLINDERS {
            return Err(DeviceError::new(
                DeviceCommand::Seek,
                DeviceErrorKind::TrackRangeError(cylinder),
            ));
        }
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.seeks.push(cylinder);
            state.seek_delay
        };
        self.cylinder = cylinder;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn select_head(&mut self, side: DiskSurface) -> Result<(), DeviceError> {
        self.side = side;
        self.state.lock().unwrap().head_selects.push(side);
        Ok(())
    }

    fn motor(&mut self, on: bool, _no_wait: bool) -> Result<(), DeviceError> {
        self.state.lock().unwrap().motor_events.push(on);
        Ok(())
    }

    fn check_disk(&mut self, _force: bool) -> Result<bool, DeviceError> {
        Ok(self.state.lock().unwrap().disk_present)
    }

    fn is_disk_present(&self) -> bool {
        self.state.lock().unwrap().disk_present
    }

    fn is_write_protected(&mut self, _force: bool) -> Result<bool, DeviceError> {
        Ok(self.state.lock().unwrap().write_protected)
    }

    fn read_stream(
        &mut self,
        max_revolutions: u32,
        fingerprint: &mut Vec<u8>,
        sink: StreamSink,
    ) -> Result<(), DeviceError> {
        self.interrupt.clear();

        if !self.state.lock().unwrap().disk_present {
            return Err(DeviceError::new(DeviceCommand::ReadStream, DeviceErrorKind::NoDiskInDrive));
        }
        self.state.lock().unwrap().streams_started += 1;

        let gaps = self.media_gaps();
        let n = gaps.len();

        // The head starts somewhere mid-track: stream the tail of one
        // revolution first, then whole revolutions with a jittering pulse.
        let pre_runs = 60.min(n);
        let revolutions = 12usize;
        let total_runs = pre_runs + revolutions * n;

        let mut index_positions = vec![false; total_runs + 2];
        for rev in 0..revolutions {
            let jitter: i64 = match rev % 3 {
                0 => 0,
                1 => 1,
                _ => -1,
            };
            let pos = (pre_runs + rev * n) as i64 + jitter;
            if pos >= 0 && (pos as usize) < index_positions.len() {
                index_positions[pos as usize] = true;
            }
        }

        let mut assembler = RevolutionAssembler::new(max_revolutions, fingerprint, sink);
        let mut cut_short = false;

        for p in 0..total_runs {
            if self.interrupt.is_raised() {
                cut_short = true;
                break;
            }
            let gap = gaps[(p + n - pre_runs) % n];
            if !assembler.push(CellRun::new(gap, 100, index_positions[p])) {
                cut_short = true;
                break;
            }
        }
        if !cut_short {
            assembler.drain();
        }
        else {
            self.state.lock().unwrap().streams_aborted += 1;
        }

        self.interrupt.clear();
        Ok(())
    }

    fn write_track_precomp(&mut self, mfm: &[u8], from_index: bool, precomp: bool) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.write_protected {
            return Err(DeviceError::new(
                DeviceCommand::WriteTrack,
                DeviceErrorKind::WriteProtected,
            ));
        }
        state.written_media.insert((self.cylinder, self.side.index()), mfm.to_vec());
        state.writes.push(WrittenTrack {
            cylinder: self.cylinder,
            side: self.side,
            bytes: mfm.to_vec(),
            from_index,
            precomp,
        });
        Ok(())
    }
}
