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

    src/bridge/worker.rs

    The background worker. It is the only code that touches the device:
    commands arrive through the queue and are executed in order, and
    whenever the queue is idle with the motor up to speed, the worker
    opportunistically streams the track under the head into the cache.
    A background read is abandoned the moment new work is queued, so the
    emulator never waits on one.
*/

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{lock, BridgeShared, QueueAction, MOTOR_SPINUP_MS, WRITE_BACKOFF_MS};
use crate::device::FluxDevice;
use crate::error::DeviceErrorKind;
use crate::samples::SampleChunk;
use crate::{DiskSurface, SeekSpeed, WRITE_PRECOMP_START_CYLINDER};

pub(crate) struct Worker {
    device: Box<dyn FluxDevice>,
    shared: Arc<BridgeShared>,

    /// Where the head actually is, as opposed to where the emulator thinks
    /// it is; the two converge as the queue drains.
    actual_cylinder: u8,
    actual_side: DiskSurface,

    motor_spinning_up: bool,
    spinup_start_ms: u64,
    last_disk_check_ms: u64,
}

impl Worker {
    pub(crate) fn new(device: Box<dyn FluxDevice>, shared: Arc<BridgeShared>) -> Self {
        Worker {
            device,
            shared,
            actual_cylinder: 0,
            actual_side: DiskSurface::Lower,
            motor_spinning_up: false,
            spinup_start_ms: 0,
            last_disk_check_ms: 0,
        }
    }

    pub(crate) fn run(mut self) {
        log::debug!("Worker::run(): starting for {}", self.device.drive_id_name());
        self.last_disk_check_ms = self.shared.now_ms();

        loop {
            // Short waits while the motor is ready so background streaming
            // resumes promptly; long waits otherwise.
            let timeout = if self.shared.motor_ready.load(Ordering::Relaxed) {
                1
            }
            else {
                250
            };

            let action = {
                let mut queue = lock(&self.shared.queue);
                if queue.is_empty() {
                    let (guard, _) = self
                        .shared
                        .queue_posted
                        .wait_timeout(queue, Duration::from_millis(timeout))
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    queue = guard;
                }
                queue.pop_front()
            };

            self.tick_motor_spinup();

            match action {
                Some(QueueAction::Terminate) => break,
                Some(action) => self.process(action),
                None => self.idle(),
            }
        }

        self.device.close();
        log::debug!("Worker::run(): exiting");
    }

    fn tick_motor_spinup(&mut self) {
        if self.motor_spinning_up
            && self.shared.now_ms().saturating_sub(self.spinup_start_ms) >= MOTOR_SPINUP_MS
        {
            self.motor_spinning_up = false;
            self.shared.motor_ready.store(true, Ordering::Relaxed);
            self.shared.note_head_step();
            log::debug!("Worker::tick_motor_spinup(): motor up to speed");
        }
    }

    fn idle(&mut self) {
        if self.shared.motor_ready.load(Ordering::Relaxed) && !self.write_backoff_active() {
            self.background_read();
        }

        // Periodically probe for media changes; the drive can't tell us.
        let now = self.shared.now_ms();
        let intervals = self.device.poll_intervals();
        let present = self.shared.disk_in_drive.load(Ordering::Relaxed);
        let due = if present {
            now.saturating_sub(self.last_disk_check_ms) > intervals.present_ms
        }
        else {
            now.saturating_sub(self.last_disk_check_ms) > intervals.absent_ms
        };

        if due && lock(&self.shared.queue).is_empty() {
            self.last_disk_check_ms = self.shared.now_ms();
            match self.device.check_disk(true) {
                Ok(_) => {
                    if let Ok(wp) = self.device.is_write_protected(false) {
                        self.shared.write_protected.store(wp, Ordering::Relaxed);
                    }
                }
                Err(e) => log::warn!("Worker::idle(): disk probe failed: {}", e),
            }
        }

        self.apply_disk_state(self.device.is_disk_present());
    }

    /// Fold the adapter's disk-present knowledge into the shared flags,
    /// latching the change notification and dumping the cache on removal.
    fn apply_disk_state(&mut self, present: bool) {
        let previous = self.shared.disk_in_drive.swap(present, Ordering::Relaxed);
        if previous != present {
            self.shared.disk_changed.store(true, Ordering::Relaxed);
            log::info!(
                "Worker::apply_disk_state(): disk {}",
                if present { "inserted" } else { "removed" }
            );
            if !present {
                lock(&self.shared.cache).reset_all();
            }
        }
    }

    fn write_backoff_active(&self) -> bool {
        if !self.shared.write_backoff.load(Ordering::Relaxed) {
            return false;
        }
        let since = self
            .shared
            .now_ms()
            .saturating_sub(self.shared.last_write_ms.load(Ordering::Relaxed));
        if since > WRITE_BACKOFF_MS {
            self.shared.write_backoff.store(false, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Stream one revolution of the track under the head into the `next`
    /// buffer of its cache entry, bailing out the instant work is queued.
    fn background_read(&mut self) {
        let cylinder = self.actual_cylinder;
        let side = self.actual_side;

        // Take the fingerprint out for the duration of the capture; the
        // worker is the only writer of it.
        let mut fingerprint = {
            let mut cache = lock(&self.shared.cache);
            let entry = cache.entry_mut(cylinder, side);
            if entry.next.is_ready() {
                // A completed capture is still waiting to be consumed.
                return;
            }
            std::mem::take(&mut entry.fingerprint)
        };

        if let Err(e) = self.device.select_head(side) {
            log::warn!("Worker::background_read(): head select failed: {}", e);
            return;
        }

        let shared = Arc::clone(&self.shared);
        let mut sink = |chunk: &SampleChunk, end_of_revolution: bool| -> bool {
            // Queued work pre-empts streaming; drop the partial capture.
            if !lock(&shared.queue).is_empty() {
                lock(&shared.cache).entry_mut(cylinder, side).next.clear();
                return false;
            }

            let mut cache = lock(&shared.cache);
            let entry = cache.entry_mut(cylinder, side);
            let fitted = entry.next.push_chunk(chunk);

            if end_of_revolution || !fitted {
                if !fitted {
                    log::warn!(
                        "Worker::background_read(): capture overflow on cylinder {} {}",
                        cylinder,
                        side
                    );
                }
                entry.next.mark_ready();
                if !entry.current.is_ready() && entry.promote() {
                    log::trace!(
                        "Worker::background_read(): promoted revolution for cylinder {} {}",
                        cylinder,
                        side
                    );
                    shared.buffer_ready.notify_all();
                }
                // Capture another revolution only if the double buffer has
                // room again.
                let has_room = !cache.entry(cylinder, side).next.is_ready();
                return fitted && has_room;
            }
            true
        };

        let result = self.device.read_stream(1, &mut fingerprint, &mut sink);

        {
            let mut cache = lock(&self.shared.cache);
            let entry = cache.entry_mut(cylinder, side);
            // A fingerprint is only useful whole.
            if fingerprint.len() < crate::ALIGN_WINDOW {
                fingerprint.clear();
            }
            entry.fingerprint = fingerprint;
            // A half-captured revolution is worthless; don't promise data
            // that would never be completed.
            if !entry.next.is_ready() {
                entry.next.clear();
            }
        }

        match result {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), DeviceErrorKind::NoDiskInDrive) => {
                self.apply_disk_state(false);
            }
            Err(e) => log::warn!("Worker::background_read(): stream failed: {}", e),
        }

        // Streaming touched the drive, which counts as a disk probe.
        self.last_disk_check_ms = self.shared.now_ms();
    }

    fn process(&mut self, action: QueueAction) {
        match action {
            QueueAction::Terminate => {}

            QueueAction::MotorOn => {
                if let Err(e) = self.device.motor(true, true) {
                    log::warn!("Worker::process(): motor on failed: {}", e);
                }
                self.motor_spinning_up = true;
                self.spinup_start_ms = self.shared.now_ms();
            }

            QueueAction::MotorOff => {
                if let Err(e) = self.device.motor(false, false) {
                    log::warn!("Worker::process(): motor off failed: {}", e);
                }
                self.motor_spinning_up = false;
                self.shared.motor_ready.store(false, Ordering::Relaxed);
            }

            QueueAction::Seek(cylinder) => {
                self.shared.note_head_step();
                // While spinning up the drive can't report media state.
                let skip_check = self.motor_spinning_up && !self.shared.motor_ready.load(Ordering::Relaxed);

                match self.device.seek(cylinder, SeekSpeed::Normal, skip_check) {
                    Ok(()) => {
                        self.actual_cylinder = cylinder;
                        if !skip_check {
                            self.last_disk_check_ms = self.shared.now_ms();
                            self.apply_disk_state(self.device.is_disk_present());
                        }
                        if let Ok(wp) = self.device.is_write_protected(false) {
                            self.shared.write_protected.store(wp, Ordering::Relaxed);
                        }
                    }
                    Err(e) => log::error!("Worker::process(): seek to {} failed: {}", cylinder, e),
                }
                self.shared.note_head_step();
            }

            QueueAction::SelectSide(side) => {
                self.shared.note_head_step();
                self.actual_side = side;
                if let Err(e) = self.device.select_head(side) {
                    log::warn!("Worker::process(): head select failed: {}", e);
                }
            }

            QueueAction::WriteFlush => self.flush_one_write(),
        }
    }

    fn flush_one_write(&mut self) {
        let track = {
            let mut writes = lock(&self.shared.writes);
            if writes.pending.is_empty() {
                return;
            }
            writes.pending.remove(0)
        };

        if track.bits.is_empty() {
            return;
        }

        // The emulator may have stepped elsewhere since the write was
        // captured; put the head back where the data belongs.
        if self.actual_cylinder != track.cylinder {
            match self.device.seek(track.cylinder, SeekSpeed::Fast, true) {
                Ok(()) => self.actual_cylinder = track.cylinder,
                Err(e) => {
                    log::error!("Worker::flush_one_write(): reseek failed, write dropped: {}", e);
                    return;
                }
            }
        }
        if self.actual_side != track.side {
            self.actual_side = track.side;
            if let Err(e) = self.device.select_head(track.side) {
                log::error!("Worker::flush_one_write(): head select failed, write dropped: {}", e);
                return;
            }
        }

        let precomp = track.cylinder >= WRITE_PRECOMP_START_CYLINDER;
        let bytes = track.bits.to_bytes();

        match self
            .device
            .write_track_precomp(&bytes, track.write_from_index, precomp)
        {
            Ok(()) => {
                log::debug!(
                    "Worker::flush_one_write(): wrote {} bytes to cylinder {} {} (precomp: {})",
                    bytes.len(),
                    track.cylinder,
                    track.side,
                    precomp
                );
            }
            Err(e) if matches!(e.kind(), DeviceErrorKind::WriteProtected) => {
                // Dropped silently; the emulator discovers the truth when
                // it reads the track back.
                self.shared.write_protected.store(true, Ordering::Relaxed);
                log::info!("Worker::flush_one_write(): disk write protected, write dropped");
            }
            Err(e) => log::error!("Worker::flush_one_write(): write failed: {}", e),
        }

        if let Ok(wp) = self.device.is_write_protected(false) {
            self.shared.write_protected.store(wp, Ordering::Relaxed);
        }

        // Whatever was cached for this track no longer reflects the media.
        lock(&self.shared.cache).entry_mut(track.cylinder, track.side).invalidate();

        self.shared.note_head_step();
        self.shared.write_backoff.store(false, Ordering::Relaxed);
    }
}
