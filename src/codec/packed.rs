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

    src/codec/packed.rs

    Codec for the packed framed protocol.

    Read stream bytes carry two cell runs each:

        bit 7      index pulse seen
        bits 6-5   first run code (1=01, 2=001, 3 or 0=0001)
        bits 4-3   second run code
        bits 2-0   read-speed code, x16

    Writes are re-encoded into nibble pairs of [precomp:2 | lengthMinus2:2],
    low nibble first, with the precompensation decision made host-side so the
    firmware only has to shift its write timer.
*/

use crate::codec::{precomp_for_window, run_speed_percent, CellRun, GapWalker, PrecompDirection};

/// Precomp field values within an encoded nibble.
pub const PRECOMP_NONE: u8 = 0x00;
pub const PRECOMP_EARLY: u8 = 0x04;
pub const PRECOMP_LATE: u8 = 0x08;

/// Decode one read-stream byte into its two cell runs. Only the first run of
/// a byte can carry the index flag.
pub fn unpack_stream_byte(byte: u8) -> (CellRun, CellRun) {
    let speed_code = (byte & 0x07) as u32 * 16;
    (
        raw_code_to_run((byte >> 5) & 0x03, speed_code, byte & 0x80 != 0),
        raw_code_to_run((byte >> 3) & 0x03, speed_code, false),
    )
}

fn raw_code_to_run(code: u8, speed_code: u32, at_index: bool) -> CellRun {
    // Code 0 is invalid on the wire; the firmware means it as the longest
    // representable run.
    let cells = if code == 0 { 4 } else { code + 1 };

    // Reconstruct the run duration from the device's phase counter. The
    // speed code spans the +/- capture window around the nominal length.
    let ticks_ns = 3000 + (cells as u32 - 2) * 2000 + (64 + speed_code * 2000) / 128;

    CellRun::new(cells, run_speed_percent(ticks_ns, cells), at_index)
}

/// Re-encode an MFM buffer for writing, applying precompensation per the
/// window table when `use_precomp` is set (inner cylinders).
///
/// The firmware consumes nibbles in stream order and expects each run length
/// one run behind its precomp decision, which is why `last_cells` lags the
/// walker. Data should be padded with at least one gap cell each side; the
/// walker's synthetic 1010 tail covers the end.
pub fn encode_track_precomp(mfm: &[u8], use_precomp: bool) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(mfm.len() * 4 + 16);
    let mut walker = GapWalker::new(mfm);
    let mut last_cells: u8 = 2;

    while walker.pos() < mfm.len() + 8 {
        let mut byte = 0u8;
        for i in 0..2 {
            let gap = walker.next_gap();

            let precomp = if use_precomp {
                match precomp_for_window(gap.window) {
                    PrecompDirection::Early => PRECOMP_EARLY,
                    PrecompDirection::Late => PRECOMP_LATE,
                    PrecompDirection::None => PRECOMP_NONE,
                }
            }
            else {
                PRECOMP_NONE
            };

            byte |= ((last_cells - 2) | precomp) << (i * 4);
            last_cells = gap.cells;
        }
        out.push(byte);
    }

    log::trace!(
        "encode_track_precomp(): {} MFM bytes -> {} packed bytes (precomp {})",
        mfm.len(),
        out.len(),
        use_precomp
    );
    out
}

/// Split an encoded track back into (cells, precomp) pairs, in stream order.
/// Used by diagnostics and the test suite; the firmware is the real consumer.
pub fn decode_nibbles(encoded: &[u8]) -> Vec<(u8, u8)> {
    let mut out = Vec::with_capacity(encoded.len() * 2);
    for byte in encoded {
        for i in 0..2 {
            let nibble = (byte >> (i * 4)) & 0x0F;
            out.push(((nibble & 0x03) + 2, nibble & 0x0C));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_byte_unpacks_two_runs() {
        // index set, first code 1 (01), second code 2 (001), speed code 3.
        let byte = 0x80 | (1 << 5) | (2 << 3) | 3;
        let (first, second) = unpack_stream_byte(byte);

        assert!(first.at_index);
        assert!(!second.at_index);
        assert_eq!(first.cells, 2);
        assert_eq!(second.cells, 3);
        // Both runs share the byte's speed code, so both land near nominal.
        assert!((80..=120).contains(&first.speed));
        assert!((80..=120).contains(&second.speed));
    }

    #[test]
    fn stream_byte_code_zero_is_longest_run() {
        let (first, _) = unpack_stream_byte(0x00);
        assert_eq!(first.cells, 4);
    }

    #[test]
    fn mid_window_speed_is_near_nominal() {
        // Speed code 3 or 4 sits near the middle of the capture window, so a
        // 2-cell run should decode close to 100%.
        let (run, _) = unpack_stream_byte((1 << 5) | (1 << 3) | 3);
        assert!((85..=115).contains(&run.speed), "speed {}", run.speed);
    }

    #[test]
    fn encode_without_precomp_has_no_precomp_bits() {
        let mfm = [0xAAu8; 16];
        let encoded = encode_track_precomp(&mfm, false);
        for (_, precomp) in decode_nibbles(&encoded) {
            assert_eq!(precomp, PRECOMP_NONE);
        }
    }

    #[test]
    fn encode_standard_gap_runs_are_two_cells() {
        let mfm = [0xAAu8; 16];
        let encoded = encode_track_precomp(&mfm, true);
        // 10101010... produces only 2-cell runs and symmetric windows, so no
        // precomp applies anywhere either.
        for (cells, precomp) in decode_nibbles(&encoded) {
            assert_eq!(cells, 2);
            assert_eq!(precomp, PRECOMP_NONE);
        }
    }
}
