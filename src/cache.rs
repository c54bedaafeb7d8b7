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

    src/cache.rs

    The per-track cache of captured revolutions. Each (cylinder, side) holds
    a double buffer: `current` is what the emulator is being served, `next`
    is what the worker is filling. Promotion of next to current is the single
    hand-off between the two threads and happens under the cache lock; the
    fingerprint rides along so later captures of the track stay aligned with
    the first.
*/

use crate::samples::RevolutionBuffer;
use crate::{DiskSurface, MAX_CYLINDERS};

/// Double-buffered capture state for one (cylinder, side).
#[derive(Clone, Debug, Default)]
pub struct TrackCacheEntry {
    /// The revolution currently served to the emulator.
    pub current: RevolutionBuffer,
    /// The revolution the worker is filling.
    pub next: RevolutionBuffer,
    /// Run codes from the start of the first captured revolution, used to
    /// re-align every later capture. Either empty or a full window.
    pub fingerprint: Vec<u8>,
}

impl TrackCacheEntry {
    /// Promote a completed `next` into `current`. No-op if `next` is not a
    /// complete revolution. Returns true on promotion.
    pub fn promote(&mut self) -> bool {
        if self.next.is_ready() {
            self.current = self.next.take();
            true
        }
        else {
            false
        }
    }

    /// Drop any captured data; used when a write or media change makes it
    /// stale. The fingerprint survives so the next capture re-aligns.
    pub fn invalidate(&mut self) {
        self.current.clear();
        self.next.clear();
    }
}

/// The whole-disk cache, indexed by cylinder and side.
#[derive(Debug)]
pub struct TrackCache {
    entries: Vec<TrackCacheEntry>,
}

impl Default for TrackCache {
    fn default() -> Self {
        TrackCache::new()
    }
}

impl TrackCache {
    pub fn new() -> Self {
        TrackCache {
            entries: vec![TrackCacheEntry::default(); MAX_CYLINDERS as usize * 2],
        }
    }

    #[inline]
    fn slot(cylinder: u8, side: DiskSurface) -> usize {
        cylinder as usize * 2 + side.index()
    }

    #[inline]
    pub fn entry(&self, cylinder: u8, side: DiskSurface) -> &TrackCacheEntry {
        &self.entries[Self::slot(cylinder, side)]
    }

    #[inline]
    pub fn entry_mut(&mut self, cylinder: u8, side: DiskSurface) -> &mut TrackCacheEntry {
        &mut self.entries[Self::slot(cylinder, side)]
    }

    /// Forget everything, fingerprints included. Used on disk removal and
    /// drive reset, where the next disk may be a different one entirely.
    pub fn reset_all(&mut self) {
        log::debug!("TrackCache::reset_all(): clearing all track entries");
        for entry in &mut self.entries {
            entry.invalidate();
            entry.fingerprint.clear();
        }
    }
}
