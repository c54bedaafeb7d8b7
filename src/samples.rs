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

    src/samples.rs

    MFM sample storage. A sample is one decoded MFM bit plus the speed the
    drive delivered it at, as a percentage of the nominal 2µs bit-cell
    (100 = on time). Bits are packed MSB-first eight to a byte, which is the
    layout BitVec::to_bytes() produces and the layout the emulator's DMA
    expects.
*/

use bit_vec::BitVec;

use crate::MFM_BUFFER_MAX_BITS;

/// Nominal per-bit speed, in percent.
pub const NOMINAL_SPEED_PERCENT: u16 = 100;

/// A short run of MFM samples in flight between the stream decoder and the
/// track cache. The decoder owns the chunk and reuses it across sink
/// callbacks; a sink must finish with the contents before returning.
#[derive(Clone, Debug, Default)]
pub struct SampleChunk {
    bits: BitVec,
    speeds: Vec<u16>,
}

impl SampleChunk {
    pub fn new() -> Self {
        SampleChunk::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        SampleChunk {
            bits: BitVec::with_capacity(bits),
            speeds: Vec::with_capacity(bits),
        }
    }

    /// Append one sample.
    #[inline]
    pub fn push(&mut self, bit: bool, speed: u16) {
        self.bits.push(bit);
        self.speeds.push(speed);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        self.bits[index]
    }

    #[inline]
    pub fn speed(&self, index: usize) -> u16 {
        self.speeds[index]
    }

    pub fn clear(&mut self) {
        self.bits.clear();
        self.speeds.clear();
    }

    /// The bits of this chunk packed MSB-first, padded with zeros to a byte
    /// boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }
}

/// One captured revolution of a track: the decoded MFM bits plus a parallel
/// per-bit speed table. `ready` means the capture covers a complete
/// index-aligned revolution and may be served to the emulator.
#[derive(Clone, Debug, Default)]
pub struct RevolutionBuffer {
    bits: BitVec,
    speeds: Vec<u16>,
    ready: bool,
}

impl RevolutionBuffer {
    pub fn new() -> Self {
        RevolutionBuffer::default()
    }

    /// Number of sample bits captured so far. Zero when empty; grows
    /// monotonically during a capture.
    #[inline]
    pub fn bits_filled(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Append a chunk of samples. Returns false once the buffer is full, at
    /// which point the capture should stop; an over-long revolution means
    /// something is wrong with the drive or the index sensor.
    pub fn push_chunk(&mut self, chunk: &SampleChunk) -> bool {
        for i in 0..chunk.len() {
            if self.bits.len() >= MFM_BUFFER_MAX_BITS {
                log::warn!(
                    "RevolutionBuffer::push_chunk(): capture exceeded {} bits, truncating",
                    MFM_BUFFER_MAX_BITS
                );
                return false;
            }
            self.bits.push(chunk.bit(i));
            self.speeds.push(chunk.speed(i));
        }
        true
    }

    /// Flag the capture as a complete revolution, if it holds anything.
    pub fn mark_ready(&mut self) {
        if !self.bits.is_empty() {
            self.ready = true;
        }
    }

    #[inline]
    pub fn bit_at(&self, pos: usize) -> Option<bool> {
        self.bits.get(pos)
    }

    /// Raw speed (percent of nominal) for the bit at `pos`.
    #[inline]
    pub fn speed_at(&self, pos: usize) -> Option<u16> {
        self.speeds.get(pos).copied()
    }

    pub fn clear(&mut self) {
        self.bits.clear();
        self.speeds.clear();
        self.ready = false;
    }

    /// Hand the whole buffer over, leaving this one empty. Used when a
    /// freshly captured revolution is promoted to the live buffer.
    pub fn take(&mut self) -> RevolutionBuffer {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_packs_msb_first() {
        let mut chunk = SampleChunk::new();
        // 0b10100000
        chunk.push(true, 100);
        chunk.push(false, 100);
        chunk.push(true, 100);
        assert_eq!(chunk.to_bytes(), vec![0b1010_0000]);
    }

    #[test]
    fn revolution_buffer_not_ready_when_empty() {
        let mut buf = RevolutionBuffer::new();
        buf.mark_ready();
        assert!(!buf.is_ready());
    }

    #[test]
    fn revolution_buffer_appends_and_serves_bits() {
        let mut buf = RevolutionBuffer::new();
        let mut chunk = SampleChunk::new();
        chunk.push(true, 98);
        chunk.push(false, 103);
        assert!(buf.push_chunk(&chunk));
        buf.mark_ready();

        assert!(buf.is_ready());
        assert_eq!(buf.bits_filled(), 2);
        assert_eq!(buf.bit_at(0), Some(true));
        assert_eq!(buf.bit_at(1), Some(false));
        assert_eq!(buf.speed_at(1), Some(103));
        assert_eq!(buf.bit_at(2), None);
    }

    #[test]
    fn revolution_buffer_refuses_overflow() {
        let mut buf = RevolutionBuffer::new();
        let mut chunk = SampleChunk::new();
        for _ in 0..4096 {
            chunk.push(true, 100);
        }
        let mut pushes = 0;
        while buf.push_chunk(&chunk) {
            pushes += 1;
            assert!(pushes < 100, "buffer never filled");
        }
        assert_eq!(buf.bits_filled(), crate::MFM_BUFFER_MAX_BITS);
    }
}
