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

    src/stream.rs

    Turns a stream of decoded cell runs into whole, index-aligned
    revolutions. Runs are buffered in a short pipeline around the hardware
    index pulse so that when a pulse arrives, the aligner can slide the track
    fingerprint across the runs on both sides of it and cut the revolution at
    the true boundary rather than where the (jittery) pulse happened to fire.

    Samples flow out through the sink callback in fixed-size chunks; the
    chunk buffer is owned here and reused, so a sink must be done with it
    before returning. Returning false from the sink aborts the capture.
*/

use std::collections::VecDeque;

use crate::align::find_alignment_cut;
use crate::codec::CellRun;
use crate::samples::SampleChunk;
use crate::{ALIGN_WINDOW, STREAM_CHUNK_BITS};

/// Receives sample chunks as they are assembled. The second argument is true
/// when the chunk completes an exact revolution. Return false to abort.
pub type StreamSink<'a> = &'a mut dyn FnMut(&SampleChunk, bool) -> bool;

/// Capture pipeline from cell runs to aligned revolutions.
pub struct RevolutionAssembler<'a> {
    fingerprint: &'a mut Vec<u8>,
    sink: StreamSink<'a>,

    /// Runs not yet committed to the revolution; the lookahead side of the
    /// alignment window.
    future: VecDeque<CellRun>,
    /// Runs committed to the in-progress revolution but held back as the
    /// lookbehind side of the alignment window.
    current: VecDeque<CellRun>,
    /// Runs seen before the first index pulse, kept in case the pulse fired
    /// late and the revolution actually started inside them.
    old: VecDeque<CellRun>,

    chunk: SampleChunk,
    start_index_found: bool,
    old_runs_enabled: bool,
    /// Suppresses index handling for this many runs after a revolution is
    /// cut, so the pulse that defined the cut is not seen twice.
    skip_index: usize,
    revolutions_done: u32,
    max_revolutions: u32,
    aborted: bool,
}

impl<'a> RevolutionAssembler<'a> {
    /// `fingerprint` persists across captures of the same track; pass it
    /// back in to re-align follow-up revolutions against the first. A
    /// partial fingerprint is discarded.
    pub fn new(max_revolutions: u32, fingerprint: &'a mut Vec<u8>, sink: StreamSink<'a>) -> Self {
        if fingerprint.len() < ALIGN_WINDOW {
            fingerprint.clear();
        }
        let old_runs_enabled = !fingerprint.is_empty();

        RevolutionAssembler {
            fingerprint,
            sink,
            future: VecDeque::with_capacity(ALIGN_WINDOW * 4),
            current: VecDeque::with_capacity(ALIGN_WINDOW * 4),
            old: VecDeque::with_capacity(ALIGN_WINDOW * 4),
            chunk: SampleChunk::with_capacity(STREAM_CHUNK_BITS + 16),
            start_index_found: false,
            old_runs_enabled,
            skip_index: 0,
            revolutions_done: 0,
            max_revolutions: max_revolutions.max(1),
            aborted: false,
        }
    }

    /// Feed one decoded run. Returns false once the capture has aborted and
    /// no further runs are wanted.
    pub fn push(&mut self, run: CellRun) -> bool {
        if self.aborted {
            return false;
        }
        self.future.push_back(run);
        self.process(ALIGN_WINDOW * 2);
        !self.aborted
    }

    /// Flush the pipeline at end of stream; pending runs pass through
    /// without the usual lookahead held back.
    pub fn drain(&mut self) {
        self.process(0);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn process(&mut self, limit: usize) {
        while self.future.len() > limit && !self.aborted {
            let next = match self.future.pop_front() {
                Some(run) => run,
                None => return,
            };

            if self.start_index_found {
                self.current.push_back(next);
                while self.current.len() > limit && !self.aborted {
                    if let Some(run) = self.current.pop_front() {
                        self.emit(run);
                    }
                }
            }
            else if self.old_runs_enabled && !self.fingerprint.is_empty() {
                // No index yet, but a fingerprint from an earlier capture
                // exists. Keep a window of pre-index runs; the pulse may
                // fire late and the revolution start inside them.
                self.old.push_back(next);
                while self.old.len() > ALIGN_WINDOW * 2 {
                    self.old.pop_front();
                }
            }

            if self.start_index_found && self.fingerprint.len() < ALIGN_WINDOW {
                self.fingerprint.push(next.cells);
            }

            if self.skip_index > 0 {
                self.skip_index -= 1;
            }
            if next.at_index && self.skip_index == 0 {
                self.on_index(next);
            }
        }
    }

    fn on_index(&mut self, next: CellRun) {
        if !self.start_index_found {
            if self.old_runs_enabled && !self.old.is_empty() {
                // Re-aligning against an existing fingerprint: slide it over
                // the runs either side of the pulse and drop everything
                // before the true start.
                let mut cut = find_alignment_cut(self.fingerprint, &codes(&self.old), &codes(&self.future));
                while cut > 0 && !self.old.is_empty() {
                    self.old.pop_front();
                    cut -= 1;
                }
                while cut > 0 && !self.future.is_empty() {
                    self.future.pop_front();
                    cut -= 1;
                }
                self.current = std::mem::take(&mut self.old);
                self.start_index_found = true;
            }
            else {
                // First capture of this track: the pulse defines the start
                // and this run opens the fingerprint.
                if self.fingerprint.len() < ALIGN_WINDOW {
                    self.fingerprint.push(next.cells);
                }
                self.start_index_found = true;
                self.current.push_back(next);
            }
            return;
        }

        // A later pulse: end of this revolution, start of the next. Jitter
        // is no more than about three bit-cells in practice.
        let cut = find_alignment_cut(self.fingerprint, &codes(&self.current), &codes(&self.future));

        let mut remaining = cut;
        let mut tail: Vec<CellRun> = Vec::with_capacity(cut);
        while remaining > 0 {
            match self.current.pop_front() {
                Some(run) => tail.push(run),
                None => break,
            }
            remaining -= 1;
        }
        while remaining > 0 {
            match self.future.pop_front() {
                Some(run) => tail.push(run),
                None => break,
            }
            remaining -= 1;
        }

        for run in tail {
            self.emit(run);
            if self.aborted {
                return;
            }
        }

        self.revolutions_done += 1;
        if self.revolutions_done >= self.max_revolutions {
            self.revolutions_done = 0;

            if !self.flush_revolution() {
                self.aborted = true;

                // The sink is done with us; refresh the fingerprint from the
                // runs already buffered so the next capture aligns against
                // codes the drive produced just now rather than stale ones.
                if self.future.len() + self.current.len() >= ALIGN_WINDOW {
                    self.fingerprint.clear();
                    while let Some(run) = self.future.pop_front() {
                        self.current.push_back(run);
                    }
                    while self.fingerprint.len() < ALIGN_WINDOW {
                        match self.current.pop_front() {
                            Some(run) => self.fingerprint.push(run.cells),
                            None => break,
                        }
                    }
                }
                return;
            }
        }

        self.rollover();
    }

    /// Start the next revolution: everything still buffered becomes
    /// lookahead, and the fingerprint re-records from the new start.
    fn rollover(&mut self) {
        while let Some(run) = self.future.pop_front() {
            self.current.push_back(run);
        }
        std::mem::swap(&mut self.current, &mut self.future);
        self.fingerprint.clear();
        self.skip_index = self.future.len() + 1;
    }

    fn emit(&mut self, run: CellRun) {
        if self.aborted {
            return;
        }
        for _ in 0..run.cells.saturating_sub(1) {
            self.push_sample(false, run.speed);
        }
        self.push_sample(true, run.speed);
    }

    fn push_sample(&mut self, bit: bool, speed: u16) {
        if self.aborted {
            return;
        }
        self.chunk.push(bit, speed);
        if self.chunk.len() >= STREAM_CHUNK_BITS {
            let keep_going = (self.sink)(&self.chunk, false);
            self.chunk.clear();
            if !keep_going {
                self.aborted = true;
            }
        }
    }

    /// Hand the sink whatever closes out the revolution, flagged as such.
    fn flush_revolution(&mut self) -> bool {
        let keep_going = (self.sink)(&self.chunk, true);
        self.chunk.clear();
        keep_going
    }
}

fn codes(queue: &VecDeque<CellRun>) -> Vec<u8> {
    queue.iter().map(|run| run.cells).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One synthetic revolution of run codes, deterministic and aperiodic.
    fn pattern(len: usize) -> Vec<u8> {
        let mut state = 0xdead_beefu32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((state >> 16) % 3) as u8 + 2
            })
            .collect()
    }

    struct Capture {
        revolutions: Vec<(Vec<bool>, usize)>,
        in_progress: Vec<bool>,
    }

    impl Capture {
        fn new() -> Self {
            Capture {
                revolutions: Vec::new(),
                in_progress: Vec::new(),
            }
        }
    }

    fn run_stream(index_positions: &[usize], total_runs: usize, rev_runs: &[u8]) -> Capture {
        let mut capture = Capture::new();
        let mut fingerprint = Vec::new();
        {
            let mut sink = |chunk: &SampleChunk, end_of_rev: bool| {
                for i in 0..chunk.len() {
                    capture.in_progress.push(chunk.bit(i));
                }
                if end_of_rev {
                    let bits = std::mem::take(&mut capture.in_progress);
                    let len = bits.len();
                    capture.revolutions.push((bits, len));
                }
                true
            };
            let mut assembler = RevolutionAssembler::new(1, &mut fingerprint, &mut sink);

            for i in 0..total_runs {
                let cells = rev_runs[i % rev_runs.len()];
                let run = CellRun::new(cells, 100, index_positions.contains(&i));
                if !assembler.push(run) {
                    break;
                }
            }
            assembler.drain();
        }
        capture
    }

    #[test]
    fn aligned_stream_produces_equal_revolutions() {
        let rev = pattern(600);
        let rev_bits: usize = rev.iter().map(|&c| c as usize).sum();

        // Stream starts 100 runs before the first index; pulses at exact
        // revolution boundaries.
        let idx: Vec<usize> = (0..4).map(|r| 100 + r * 600).collect();
        let capture = run_stream(&idx, 100 + 600 * 4, &rev);

        assert!(capture.revolutions.len() >= 2, "got {} revolutions", capture.revolutions.len());
        for (bits, len) in &capture.revolutions {
            assert_eq!(*len, rev_bits);
            assert_eq!(bits, &capture.revolutions[0].0);
        }
    }

    #[test]
    fn jittered_index_still_cuts_exact_revolutions() {
        let rev = pattern(600);
        let rev_bits: usize = rev.iter().map(|&c| c as usize).sum();

        // The second pulse fires two runs late, the third two runs early.
        let idx = vec![100, 100 + 600 + 2, 100 + 1200 - 2, 100 + 1800];
        let capture = run_stream(&idx, 100 + 600 * 4, &rev);

        assert!(capture.revolutions.len() >= 2, "got {} revolutions", capture.revolutions.len());
        for (i, (_, len)) in capture.revolutions.iter().enumerate() {
            assert_eq!(*len, rev_bits, "revolution {}", i);
        }
    }

    #[test]
    fn sink_abort_stops_the_capture() {
        let rev = pattern(600);
        let mut fingerprint = Vec::new();
        let mut chunks = 0usize;
        let mut sink = |_chunk: &SampleChunk, _end: bool| {
            chunks += 1;
            chunks < 3
        };
        let mut assembler = RevolutionAssembler::new(1, &mut fingerprint, &mut sink);

        let mut accepted = 0usize;
        for i in 0..3000usize {
            let run = CellRun::new(rev[i % rev.len()], 100, i == 10);
            if !assembler.push(run) {
                break;
            }
            accepted += 1;
        }
        assert!(assembler.is_aborted());
        // Abort must bite within the pipeline depth of the third chunk, not
        // at the end of the stream.
        assert!(accepted < 1000, "accepted {} runs", accepted);
    }

    #[test]
    fn fingerprint_records_revolution_start() {
        let rev = pattern(600);
        let mut fingerprint = Vec::new();
        let mut sink = |_chunk: &SampleChunk, _end: bool| true;
        {
            let mut assembler = RevolutionAssembler::new(1, &mut fingerprint, &mut sink);
            for i in 0..500usize {
                assembler.push(CellRun::new(rev[i % rev.len()], 100, i == 100));
            }
        }
        // Index fired at run 100: the fingerprint is the following window of
        // codes (the index run itself opens it).
        assert_eq!(fingerprint.len(), ALIGN_WINDOW);
        assert_eq!(fingerprint[0], rev[100]);
        assert_eq!(fingerprint[1], rev[101]);
    }
}
