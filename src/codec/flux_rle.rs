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

    src/codec/flux_rle.rs

    Codec for the run-length/opcode flux protocol. Flux intervals arrive as
    tick counts against the device's sample clock:

        1..249          literal tick count
        250..254        two bytes: 250 + (v-250)*255 + (next-1)
        255             opcode follows: Index, Space or Astable, then a
                        28-bit value spread over four odd-tagged bytes
        0               stream terminator

    The same encoding is produced on the write side, with precompensation
    folded into the interval timings before conversion to ticks.
*/

use std::collections::VecDeque;

use crate::codec::{precomp_for_window, run_speed_percent, CellRun, GapWalker, PrecompDirection};
use crate::BITCELL_NS;

/// End-of-stream marker byte.
pub const FLUX_TERMINATOR: u8 = 0;

/// Default precompensation shift for this protocol, in nanoseconds.
pub const PRECOMP_SHIFT_NS: i64 = 140;

/// Opcodes introduced by a 255 byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FluxOp {
    Index = 1,
    Space = 2,
    Astable = 3,
}

/// Result of one decoder step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FluxStep {
    /// A complete cell run was decoded.
    Run(CellRun),
    /// Bytes were consumed without completing a run (opcode or sub-cell
    /// interval); call again.
    Consumed,
    /// Not enough bytes buffered to make progress.
    NeedMore,
}

/// Read a 28-bit value from four odd-tagged bytes. The queue must hold them.
pub fn read_28bit(queue: &mut VecDeque<u8>) -> u32 {
    let mut next = || queue.pop_front().unwrap_or(0) as u32;
    let mut x = next() >> 1;
    x |= (next() & 0xFE) << 6;
    x |= (next() & 0xFE) << 13;
    x |= (next() & 0xFE) << 20;
    x
}

/// Write a 28-bit value as four odd-tagged bytes.
pub fn write_28bit(value: u32, out: &mut Vec<u8>) {
    out.push((1 | (value << 1)) as u8);
    out.push((1 | (value >> 6)) as u8);
    out.push((1 | (value >> 13)) as u8);
    out.push((1 | (value >> 20)) as u8);
}

#[inline]
fn ticks_to_ns(ticks: u64, sample_freq_hz: u32) -> u64 {
    ticks * 1_000_000_000 / sample_freq_hz as u64
}

#[inline]
fn ns_to_ticks(ns: i64, sample_freq_hz: u32) -> i64 {
    ns * sample_freq_hz as i64 / 1_000_000_000
}

/// Incremental decoder from raw flux bytes to cell runs. Intervals shorter
/// than a bit-cell accumulate until enough time has passed to clock out a
/// run, which keeps the decoder restartable at any byte boundary.
pub struct FluxDecoder {
    sample_freq_hz: u32,
    ticks: u64,
    pending_index: bool,
}

impl FluxDecoder {
    pub fn new(sample_freq_hz: u32) -> Self {
        FluxDecoder {
            sample_freq_hz,
            ticks: 0,
            pending_index: false,
        }
    }

    /// Attempt to decode one event from the front of `queue`.
    pub fn step(&mut self, queue: &mut VecDeque<u8>) -> FluxStep {
        let first = match queue.front() {
            Some(&b) => b,
            None => return FluxStep::NeedMore,
        };

        if first == 255 {
            // Largest possible event: opcode byte plus 28-bit value.
            if queue.len() < 6 {
                return FluxStep::NeedMore;
            }
            queue.pop_front();
            let opcode = queue.pop_front().unwrap_or(0);
            match opcode {
                x if x == FluxOp::Index as u8 => {
                    let _ticks_since = read_28bit(queue);
                    self.pending_index = true;
                }
                x if x == FluxOp::Space as u8 => {
                    self.ticks += read_28bit(queue) as u64;
                }
                x if x == FluxOp::Astable as u8 => {
                    // No flux area; nothing to clock out.
                    let _ = read_28bit(queue);
                    log::warn!("FluxDecoder::step(): astable area in stream");
                }
                _ => {
                    log::warn!("FluxDecoder::step(): unknown flux opcode {}", opcode);
                    let _ = read_28bit(queue);
                }
            }
            return FluxStep::Consumed;
        }

        let value = if first < 250 {
            queue.pop_front();
            first as u32
        }
        else {
            if queue.len() < 2 {
                return FluxStep::NeedMore;
            }
            queue.pop_front();
            let next = queue.pop_front().unwrap_or(1) as u32;
            250 + (first as u32 - 250) * 255 + next.saturating_sub(1)
        };

        self.ticks += value as u64;
        let interval_ns = ticks_to_ns(self.ticks, self.sample_freq_hz);

        if interval_ns <= BITCELL_NS as u64 {
            // Not a full bit-cell yet; keep accumulating.
            return FluxStep::Consumed;
        }

        // Round the interval to whole bit-cells: the remainder past the last
        // whole cell counts as a cell if it exceeds half a cell.
        let t0 = interval_ns - BITCELL_NS as u64;
        let extra_cells = if t0 > (BITCELL_NS / 2) as u64 {
            (t0 - (BITCELL_NS / 2) as u64).div_ceil(BITCELL_NS as u64)
        }
        else {
            0
        };
        let cells = (extra_cells.max(1) + 1).min(u8::MAX as u64) as u8;

        let run = CellRun::new(
            cells,
            run_speed_percent(interval_ns.min(u32::MAX as u64) as u32, cells.clamp(2, 5)),
            self.pending_index,
        );
        self.pending_index = false;
        self.ticks = 0;

        FluxStep::Run(run)
    }
}

/// Re-encode an MFM buffer as a flux tick stream, applying precompensation
/// per the window table when `use_precomp` is set. A transition moved early
/// shortens its interval and lengthens the next by the same amount, so the
/// adjustment is carried forward rather than accumulating drift. Terminated
/// with [FLUX_TERMINATOR].
pub fn encode_track_precomp(mfm: &[u8], use_precomp: bool, sample_freq_hz: u32) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(mfm.len() * 3 + 16);
    let mut walker = GapWalker::new(mfm);
    let mut carry_ns: i64 = 0;

    // Intervals past this are unformatted space, not data.
    let nfa_thresh = ns_to_ticks(150_000, sample_freq_hz);

    while walker.pos() < mfm.len() + 1 {
        let gap = walker.next_gap();
        let mut interval_ns: i64 = carry_ns + gap.cells as i64 * BITCELL_NS as i64;

        if use_precomp {
            match precomp_for_window(gap.window) {
                PrecompDirection::Early => {
                    interval_ns -= PRECOMP_SHIFT_NS;
                    carry_ns = PRECOMP_SHIFT_NS;
                }
                PrecompDirection::Late => {
                    interval_ns += PRECOMP_SHIFT_NS;
                    carry_ns = -PRECOMP_SHIFT_NS;
                }
                PrecompDirection::None => {
                    carry_ns = 0;
                }
            }
        }
        else {
            carry_ns = 0;
        }

        let ticks = ns_to_ticks(interval_ns, sample_freq_hz);
        if ticks <= 0 {
            continue;
        }

        if ticks < 250 {
            out.push(ticks as u8);
        }
        else {
            let high = (ticks - 250) / 255;
            if high < 5 && ticks <= nfa_thresh {
                out.push((250 + high) as u8);
                out.push((1 + (ticks - 250) % 255) as u8);
            }
            else {
                // Long gap: emit it as dead space followed by a minimal
                // closing interval carrying the transition.
                out.push(255);
                out.push(FluxOp::Space as u8);
                write_28bit((ticks - 249) as u32, &mut out);
                out.push(249);
            }
        }
    }

    out.push(FLUX_TERMINATOR);
    log::trace!(
        "encode_track_precomp(): {} MFM bytes -> {} flux bytes (precomp {})",
        mfm.len(),
        out.len(),
        use_precomp
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ: u32 = 72_000_000;

    #[test]
    fn twenty_eight_bit_round_trip() {
        for value in [0u32, 1, 249, 250, 300, 65_535, 0x0FFF_FFFF] {
            let mut bytes = Vec::new();
            write_28bit(value, &mut bytes);
            // Every byte is odd-tagged so a zero terminator can't appear.
            assert!(bytes.iter().all(|b| b & 1 == 1));
            let mut queue: VecDeque<u8> = bytes.into_iter().collect();
            assert_eq!(read_28bit(&mut queue), value);
        }
    }

    #[test]
    fn two_byte_tick_values_round_trip() {
        // 300 ticks encodes as 250, 51.
        let mut queue: VecDeque<u8> = vec![250u8, 51].into_iter().collect();
        let mut decoder = FluxDecoder::new(FREQ);
        // 300 ticks at 72MHz is ~4166ns: a two-cell run.
        match decoder.step(&mut queue) {
            FluxStep::Run(run) => {
                assert_eq!(run.cells, 2);
                assert!((95..=110).contains(&run.speed), "speed {}", run.speed);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn decoder_counts_cells_from_ticks() {
        let mut decoder = FluxDecoder::new(FREQ);
        for (us, cells) in [(4u64, 2u8), (6, 3), (8, 4), (10, 5)] {
            let ticks = (us * 1000) as i64 * FREQ as i64 / 1_000_000_000;
            let mut out = Vec::new();
            if ticks < 250 {
                out.push(ticks as u8);
            }
            else {
                out.push((250 + (ticks - 250) / 255) as u8);
                out.push((1 + (ticks - 250) % 255) as u8);
            }
            let mut queue: VecDeque<u8> = out.into_iter().collect();
            match decoder.step(&mut queue) {
                FluxStep::Run(run) => assert_eq!(run.cells, cells, "{}us", us),
                other => panic!("expected run for {}us, got {:?}", us, other),
            }
        }
    }

    #[test]
    fn index_opcode_tags_next_run() {
        // 40MHz keeps a 4µs interval within a single literal byte.
        let freq = 40_000_000;
        let mut bytes = vec![255u8, FluxOp::Index as u8];
        write_28bit(1234, &mut bytes);
        bytes.push((4000i64 * freq as i64 / 1_000_000_000) as u8);

        let mut queue: VecDeque<u8> = bytes.into_iter().collect();
        let mut decoder = FluxDecoder::new(freq);

        assert_eq!(decoder.step(&mut queue), FluxStep::Consumed);
        match decoder.step(&mut queue) {
            FluxStep::Run(run) => assert!(run.at_index),
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn sub_cell_intervals_accumulate() {
        let freq = 40_000_000;
        let mut decoder = FluxDecoder::new(freq);
        // Two ~2µs intervals sum to one 4µs run.
        let half = (2000i64 * freq as i64 / 1_000_000_000) as u8;
        let mut queue: VecDeque<u8> = vec![half, half].into_iter().collect();

        assert_eq!(decoder.step(&mut queue), FluxStep::Consumed);
        match decoder.step(&mut queue) {
            FluxStep::Run(run) => assert_eq!(run.cells, 2),
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn incomplete_events_wait_for_more() {
        let mut decoder = FluxDecoder::new(FREQ);
        let mut queue: VecDeque<u8> = vec![255u8, FluxOp::Space as u8].into_iter().collect();
        assert_eq!(decoder.step(&mut queue), FluxStep::NeedMore);

        let mut queue: VecDeque<u8> = vec![252u8].into_iter().collect();
        assert_eq!(decoder.step(&mut queue), FluxStep::NeedMore);
    }

    #[test]
    fn encoder_emits_terminated_stream() {
        let encoded = encode_track_precomp(&[0xAAu8; 8], false, FREQ);
        assert_eq!(*encoded.last().unwrap(), FLUX_TERMINATOR);
        // No interior terminators.
        assert!(!encoded[..encoded.len() - 1].contains(&FLUX_TERMINATOR));
    }
}
