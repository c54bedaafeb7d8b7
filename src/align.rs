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

    src/align.rs

    Revolution alignment. The drive's index pulse jitters by up to ~3
    bit-cells between revolutions, which is enough to corrupt a bitstream
    that is supposed to wrap seamlessly. To compensate, the first revolution
    after a cache reset records a fingerprint of its first ALIGN_WINDOW
    run-length codes; every later revolution slides that fingerprint around
    the observed index position to find where the previous revolution really
    ends.
*/

use crate::ALIGN_WINDOW;

/// Locate the cut point that completes a revolution.
///
/// `current` holds the run codes buffered just before the index pulse was
/// seen and `future` the codes just after it. Their concatenation is searched
/// for the position best matching `fingerprint`, fanning outward from the
/// midpoint (the hardware index position) so the candidate closest to the
/// index wins any tie. The returned count is how many codes, drawn from
/// `current` then `future`, complete the revolution.
///
/// Returns 0 (no alignment this revolution) if any input is shorter than the
/// fingerprint window.
pub fn find_alignment_cut(fingerprint: &[u8], current: &[u8], future: &[u8]) -> usize {
    if fingerprint.len() < ALIGN_WINDOW || current.len() < ALIGN_WINDOW || future.len() < ALIGN_WINDOW {
        return 0;
    }

    let mut search_area = Vec::with_capacity(current.len() + future.len());
    search_area.extend_from_slice(current);
    search_area.extend_from_slice(future);

    let mut best_index = current.len() - 1;
    let mut best_score = 0usize;
    let midpoint = (search_area.len() - fingerprint.len()) / 2;

    for a in 0..=midpoint {
        for direction in [-1isize, 1] {
            if a == 0 && direction > 0 {
                continue;
            }
            let start = midpoint as isize + direction * a as isize;
            if start < 0 {
                continue;
            }
            let start = start as usize;

            let mut score = 0;
            for (pos, &code) in fingerprint.iter().enumerate() {
                if let Some(&area_code) = search_area.get(start + pos) {
                    if area_code == code {
                        score += 1;
                    }
                }
            }

            if score > best_score {
                best_index = start;
                best_score = score;

                // A perfect match can't be beaten, stop searching.
                if score == fingerprint.len() {
                    log::trace!("find_alignment_cut(): perfect match at offset {}", start);
                    return best_index;
                }
            }
        }
    }

    log::trace!(
        "find_alignment_cut(): best score {}/{} at offset {} (midpoint {})",
        best_score,
        fingerprint.len(),
        best_index,
        midpoint
    );
    best_index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revolution(len: usize) -> Vec<u8> {
        // Deterministic, aperiodic run codes in 2..=5.
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((state >> 16) % 4) as u8 + 2
            })
            .collect()
    }

    #[test]
    fn short_inputs_do_not_align() {
        let fp = vec![2u8; ALIGN_WINDOW];
        assert_eq!(find_alignment_cut(&fp, &[2u8; 4], &fp), 0);
        assert_eq!(find_alignment_cut(&fp, &fp, &[2u8; 4]), 0);
        assert_eq!(find_alignment_cut(&[2u8; 4], &fp, &fp), 0);
    }

    #[test]
    fn exact_index_matches_at_midpoint() {
        // current = last 64 codes of the revolution, future = first 64 of the
        // next; the fingerprint is the start of the revolution, so the true
        // cut is exactly at the boundary: current.len().
        let rev = revolution(200);
        let fingerprint: Vec<u8> = rev[..ALIGN_WINDOW].to_vec();
        let current: Vec<u8> = rev[rev.len() - ALIGN_WINDOW * 2..].to_vec();
        let future: Vec<u8> = rev[..ALIGN_WINDOW * 2].to_vec();

        let cut = find_alignment_cut(&fingerprint, &current, &future);
        assert_eq!(cut, current.len());
    }

    #[test]
    fn jittered_index_is_recovered() {
        // Same data, but the index fired 3 codes early: current is short by
        // 3, so the true boundary sits 3 codes into future.
        let rev = revolution(200);
        let fingerprint: Vec<u8> = rev[..ALIGN_WINDOW].to_vec();
        for jitter in 1..=3usize {
            let current: Vec<u8> = rev[rev.len() - (ALIGN_WINDOW * 2 - jitter)..].to_vec();
            let future: Vec<u8> = rev[..ALIGN_WINDOW * 2].to_vec();

            let cut = find_alignment_cut(&fingerprint, &current, &future);
            assert_eq!(cut, current.len(), "jitter {}", jitter);
        }
    }
}
