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

    src/bridge/mod.rs

    The emulator-facing façade. Every operation here must return promptly;
    the emulator calls into this object from its tick loop and a stall shows
    up as stuttering audio. Anything that needs the hardware is converted
    into a queued command for the worker thread plus an eventually-consistent
    status flag; the only bounded wait is the read path, capped at 600ms
    while the first revolution of a track is still streaming in.
*/

pub(crate) mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bit_vec::BitVec;

use crate::cache::TrackCache;
use crate::device::drawbridge::DrawBridge;
use crate::device::greaseweazle::GreaseWeazle;
use crate::device::{FluxDevice, StreamInterrupt};
use crate::error::BridgeError;
use crate::serial::SerialPortProvider;
use crate::{DiskSurface, DriveType, MAX_CYLINDERS, MFM_BUFFER_MAX_BITS, THEORETICAL_MIN_TRACK_BITS};

/// Grace period after any head movement during which reads return silence,
/// simulating the head settling. In milliseconds.
pub(crate) const DRIVE_STEP_GARBAGE_MS: u64 = 500;

/// How long the motor takes to come up to speed after switch-on.
pub(crate) const MOTOR_SPINUP_MS: u64 = 750;

/// How long after DMA write activity before background reading may resume.
pub(crate) const WRITE_BACKOFF_MS: u64 = 100;

/// Longest a read will block waiting for the first revolution of a track.
const READ_WAIT_TOTAL_MS: u64 = 600;
/// Poll step within that wait.
const READ_WAIT_STEP_MS: u64 = 5;

/// Which hardware family to bridge, and how to find it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverConfig {
    /// Arduino-based controller on a numbered serial port (1..=9).
    DrawBridge { com_port: u8 },
    /// GreaseWeazle controller, auto-detected; `drive_a` picks the unit on
    /// the cable.
    GreaseWeazle { drive_a: bool },
}

/// Work for the worker thread.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum QueueAction {
    Terminate,
    MotorOn,
    MotorOff,
    Seek(u8),
    SelectSide(DiskSurface),
    WriteFlush,
}

/// A complete track image waiting to be written out.
pub(crate) struct TrackToWrite {
    pub cylinder: u8,
    pub side: DiskSurface,
    pub bits: BitVec,
    pub write_from_index: bool,
}

/// The DMA words accumulated since the last commit.
#[derive(Default)]
pub(crate) struct WriteBuffer {
    pub bits: BitVec,
    pub target: Option<(u8, DiskSurface)>,
    pub start_position: usize,
}

impl WriteBuffer {
    pub fn reset(&mut self) {
        self.bits.clear();
        self.target = None;
        self.start_position = 0;
    }
}

#[derive(Default)]
pub(crate) struct WriteState {
    pub pending: Vec<TrackToWrite>,
    pub buffer: WriteBuffer,
}

/// Lock a mutex, shrugging off poisoning; a panicked worker should not take
/// the emulator down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the façade and the worker thread.
pub(crate) struct BridgeShared {
    epoch: Instant,

    /// The command FIFO plus its wake-up signal.
    pub queue: Mutex<VecDeque<QueueAction>>,
    pub queue_posted: Condvar,

    /// The track cache; also guards next -> current promotion.
    pub cache: Mutex<TrackCache>,
    /// Signalled when a buffer becomes servable, waking blocked reads.
    pub buffer_ready: Condvar,

    /// Pending writes and the in-progress DMA buffer.
    pub writes: Mutex<WriteState>,

    pub disk_in_drive: AtomicBool,
    pub disk_changed: AtomicBool,
    pub write_protected: AtomicBool,
    pub motor_ready: AtomicBool,

    pub last_step_ms: AtomicU64,
    pub last_write_ms: AtomicU64,
    pub write_backoff: AtomicBool,
}

impl BridgeShared {
    fn new() -> Self {
        BridgeShared {
            epoch: Instant::now(),
            queue: Mutex::new(VecDeque::new()),
            queue_posted: Condvar::new(),
            cache: Mutex::new(TrackCache::new()),
            buffer_ready: Condvar::new(),
            writes: Mutex::new(WriteState::default()),
            disk_in_drive: AtomicBool::new(false),
            disk_changed: AtomicBool::new(false),
            write_protected: AtomicBool::new(true),
            motor_ready: AtomicBool::new(false),
            last_step_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            write_backoff: AtomicBool::new(false),
        }
    }

    /// Milliseconds since this bridge instance was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record a head step or side change; starts the settle window.
    pub fn note_head_step(&self) {
        self.last_step_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn in_step_garbage_window(&self) -> bool {
        self.now_ms()
            .saturating_sub(self.last_step_ms.load(Ordering::Relaxed))
            < DRIVE_STEP_GARBAGE_MS
    }
}

/// The object an emulator binds its floppy interface to.
pub struct FloppyBridge {
    shared: Arc<BridgeShared>,
    /// Present until the worker takes ownership at initialise.
    device: Option<Box<dyn FluxDevice>>,
    worker: Option<JoinHandle<()>>,
    interrupt: Option<StreamInterrupt>,
    drive_name: &'static str,

    // Façade-thread view of the drive. The worker keeps its own notion of
    // where the head actually is.
    current_cylinder: u8,
    side: DiskSurface,
    motor_running: bool,
    last_error: String,
}

impl FloppyBridge {
    /// Build a bridge over one of the supported hardware families, using
    /// `ports` to reach the host's serial stack.
    pub fn new(config: DriverConfig, ports: Box<dyn SerialPortProvider>) -> Self {
        let device: Box<dyn FluxDevice> = match config {
            DriverConfig::DrawBridge { com_port } => Box::new(DrawBridge::new(com_port, ports)),
            DriverConfig::GreaseWeazle { drive_a } => Box::new(GreaseWeazle::new(drive_a, ports)),
        };
        Self::with_device(device)
    }

    /// Build a bridge over a caller-supplied device implementation.
    pub fn with_device(device: Box<dyn FluxDevice>) -> Self {
        FloppyBridge {
            shared: Arc::new(BridgeShared::new()),
            device: Some(device),
            worker: None,
            interrupt: None,
            drive_name: "FluxBridge (not initialised)",
            current_cylinder: 0,
            side: DiskSurface::Lower,
            motor_running: false,
            last_error: String::new(),
        }
    }

    /// One-time blocking start-up: open the device, rewind to cylinder 0 and
    /// start the worker thread. On failure the reason is available from
    /// [FloppyBridge::last_error].
    pub fn initialise(&mut self) -> bool {
        match self.init_device() {
            Ok(()) => {
                self.last_error.clear();
                true
            }
            Err(e) => {
                log::error!("FloppyBridge::initialise(): {}", e);
                self.last_error = e.to_string();
                false
            }
        }
    }

    fn init_device(&mut self) -> Result<(), BridgeError> {
        if self.worker.is_some() {
            self.terminate();
        }

        let mut device = self.device.take().ok_or(BridgeError::NotInitialised)?;

        if let Err(e) = device.open() {
            device.close();
            self.device = Some(device);
            return Err(e.into());
        }

        if let Err(e) = Self::startup_sequence(device.as_mut()) {
            device.close();
            self.device = Some(device);
            return Err(e.into());
        }

        self.current_cylinder = 0;
        self.side = DiskSurface::Lower;
        self.motor_running = false;
        self.drive_name = device.drive_id_name();

        let shared = &self.shared;
        shared.disk_in_drive.store(device.is_disk_present(), Ordering::Relaxed);
        shared.disk_changed.store(false, Ordering::Relaxed);
        shared
            .write_protected
            .store(device.is_write_protected(false).unwrap_or(true), Ordering::Relaxed);
        shared.motor_ready.store(false, Ordering::Relaxed);
        shared.write_backoff.store(false, Ordering::Relaxed);
        lock(&shared.queue).clear();
        lock(&shared.cache).reset_all();
        lock(&shared.writes).buffer.reset();

        self.interrupt = Some(device.interrupt());
        let shared = Arc::clone(&self.shared);
        self.worker = Some(thread::spawn(move || worker::Worker::new(device, shared).run()));

        log::info!("FloppyBridge::initialise(): running on {}", self.drive_name);
        Ok(())
    }

    fn startup_sequence(device: &mut dyn FluxDevice) -> Result<(), crate::error::DeviceError> {
        device.find_track0()?;
        device.check_disk(true)?;
        device.select_head(DiskSurface::Lower)?;
        Ok(())
    }

    /// Stop the worker and release the device. Must never deadlock even if
    /// the hardware is wedged; the serial layer's timeouts guarantee the
    /// worker gets control back to see the terminate request.
    pub fn terminate(&mut self) {
        if let Some(handle) = self.worker.take() {
            {
                let mut queue = lock(&self.shared.queue);
                queue.push_back(QueueAction::Terminate);
            }
            self.shared.queue_posted.notify_one();
            if let Some(interrupt) = &self.interrupt {
                interrupt.raise();
            }
            let _ = handle.join();
        }
        self.interrupt = None;
        self.shared.motor_ready.store(false, Ordering::Relaxed);
    }

    fn enqueue(&self, action: QueueAction) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.push_back(action);
        }
        self.shared.queue_posted.notify_one();
        // Enqueues pre-empt background streaming.
        if let Some(interrupt) = &self.interrupt {
            interrupt.raise();
        }
    }

    // ------------------------------------------------------------------
    // Identity and status snapshots
    // ------------------------------------------------------------------

    pub fn drive_id_name(&self) -> &'static str {
        self.drive_name
    }

    pub fn drive_type(&self) -> DriveType {
        DriveType::Dd35
    }

    /// Nominal bit-cell time in microseconds.
    pub fn bit_cell_time_us(&self) -> u8 {
        2
    }

    pub fn max_cylinder(&self) -> u8 {
        MAX_CYLINDERS
    }

    pub fn current_cylinder(&self) -> u8 {
        self.current_cylinder
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn is_at_cylinder0(&self) -> bool {
        self.worker.is_some() && self.current_cylinder == 0
    }

    /// True while the emulator has asked for the motor, spun up or not.
    pub fn is_motor_running(&self) -> bool {
        self.motor_running
    }

    /// True once the motor has finished spinning up.
    pub fn is_ready(&self) -> bool {
        self.shared.motor_ready.load(Ordering::Relaxed)
    }

    pub fn is_disk_in_drive(&self) -> bool {
        self.shared.disk_in_drive.load(Ordering::Relaxed)
    }

    /// Latched: reports a media change exactly once per transition.
    pub fn has_disk_changed(&self) -> bool {
        self.shared.disk_changed.swap(false, Ordering::Relaxed)
    }

    pub fn is_write_protected(&self) -> bool {
        self.shared.write_protected.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Motor and head control
    // ------------------------------------------------------------------

    fn switch_side(&mut self, side: DiskSurface) {
        if side != self.side {
            self.reset_write_buffer();
            self.side = side;
            self.shared.note_head_step();
            self.enqueue(QueueAction::SelectSide(side));
        }
    }

    pub fn set_motor_status(&mut self, side: DiskSurface, on: bool) {
        self.switch_side(side);

        if self.motor_running == on {
            return;
        }
        self.motor_running = on;
        self.shared.motor_ready.store(false, Ordering::Relaxed);
        self.enqueue(if on { QueueAction::MotorOn } else { QueueAction::MotorOff });
    }

    /// Step to `cylinder`. Rapid-fire calls coalesce: if the command at the
    /// back of the queue is still an unserviced seek, its target is
    /// rewritten in place rather than queueing another head movement.
    pub fn goto_cylinder(&mut self, cylinder: u8, side: DiskSurface) {
        self.switch_side(side);

        if self.current_cylinder == cylinder {
            return;
        }
        if cylinder >= MAX_CYLINDERS {
            log::error!("FloppyBridge::goto_cylinder(): cylinder {} out of range", cylinder);
            return;
        }

        self.reset_write_buffer();
        self.current_cylinder = cylinder;
        self.shared.note_head_step();

        let coalesced = {
            let mut queue = lock(&self.shared.queue);
            match queue.back_mut() {
                Some(QueueAction::Seek(target)) => {
                    *target = cylinder;
                    true
                }
                _ => false,
            }
        };

        if coalesced {
            // Still pre-empt any in-flight background read.
            if let Some(interrupt) = &self.interrupt {
                interrupt.raise();
            }
        }
        else {
            self.enqueue(QueueAction::Seek(cylinder));
        }
    }

    /// Reset to power-up state: forget pending writes, stop the motor,
    /// forget everything cached.
    pub fn reset_drive(&mut self) {
        {
            let mut writes = lock(&self.shared.writes);
            writes.pending.clear();
            writes.buffer.reset();
        }
        let side = self.side;
        self.set_motor_status(side, false);
        lock(&self.shared.cache).reset_all();
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Upper bound for bit positions on the current track. While the first
    /// capture is still streaming this reports the theoretical minimum
    /// track size, so the emulator's position counter has a sane wrap point
    /// before real data lands.
    pub fn max_mfm_bit_position(&self) -> usize {
        let cache = lock(&self.shared.cache);
        let entry = cache.entry(self.current_cylinder, self.side);
        if entry.current.is_ready() {
            entry.current.bits_filled()
        }
        else {
            THEORETICAL_MIN_TRACK_BITS.max(entry.next.bits_filled())
        }
    }

    /// The start of the served buffer stands in for the index mark.
    pub fn is_mfm_position_at_index(&self, position: usize) -> bool {
        if position == 0 {
            return true;
        }
        let cache = lock(&self.shared.cache);
        let entry = cache.entry(self.current_cylinder, self.side);
        entry.current.is_ready() && position == entry.current.bits_filled()
    }

    /// Called by the emulator when it has consumed a full revolution;
    /// switches in a fresher capture of the track if one is waiting.
    pub fn mfm_switch_buffer(&mut self, side: DiskSurface) {
        self.switch_side(side);
        let mut cache = lock(&self.shared.cache);
        cache.entry_mut(self.current_cylinder, self.side).promote();
    }

    /// Fetch one MFM bit. Bounded: waits up to 600ms for a buffer while a
    /// capture is in flight, else returns 0 as an unformatted drive would.
    pub fn get_mfm_bit(&self, position: usize) -> bool {
        if !self.is_disk_in_drive() || !self.is_ready() {
            return false;
        }
        // The head is still settling from a step; there is no honest data.
        if self.shared.in_step_garbage_window() {
            return false;
        }

        let mut cache = lock(&self.shared.cache);
        for _ in 0..(READ_WAIT_TOTAL_MS / READ_WAIT_STEP_MS) {
            {
                let entry = cache.entry(self.current_cylinder, self.side);
                if entry.current.is_ready() {
                    return entry.current.bit_at(position).unwrap_or(false);
                }
                // A partial capture can serve bits behind its fill point.
                if position < entry.next.bits_filled() {
                    return entry.next.bit_at(position).unwrap_or(false);
                }
            }
            let (guard, _) = self
                .shared
                .buffer_ready
                .wait_timeout(cache, Duration::from_millis(READ_WAIT_STEP_MS))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache = guard;
        }

        // Nothing arrived in time; behave like a blank track.
        false
    }

    /// Per-bit read speed, scaled so 1000 is nominal and clamped to what
    /// the emulator's timing loop tolerates. Neutral when no data applies.
    pub fn get_mfm_speed(&self, position: usize) -> u16 {
        if !self.is_disk_in_drive() || !self.is_ready() {
            return 1000;
        }
        if self.shared.in_step_garbage_window() {
            return 1000;
        }

        let cache = lock(&self.shared.cache);
        let entry = cache.entry(self.current_cylinder, self.side);
        if entry.current.is_ready() {
            if let Some(raw) = entry.current.speed_at(position) {
                return clamp_speed(raw);
            }
        }
        else if position < entry.next.bits_filled() {
            if let Some(raw) = entry.next.speed_at(position) {
                return clamp_speed(raw);
            }
        }
        1000
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    fn reset_write_buffer(&self) {
        lock(&self.shared.writes).buffer.reset();
    }

    /// Accept one word of DMA write data. The first word of a buffer
    /// records the start position and the target track; a change of target
    /// resets the buffer.
    pub fn write_short_to_buffer(&mut self, side: DiskSurface, track: u8, word: u16, position: usize) {
        self.switch_side(side);
        self.goto_cylinder(track, side);

        // Hold off background reads while the DMA burst is in progress.
        self.shared.last_write_ms.store(self.shared.now_ms(), Ordering::Relaxed);
        self.shared.write_backoff.store(true, Ordering::Relaxed);
        if let Some(interrupt) = &self.interrupt {
            interrupt.raise();
        }

        let mut writes = lock(&self.shared.writes);
        let buffer = &mut writes.buffer;

        if buffer.target.is_some() && buffer.target != Some((track, side)) {
            buffer.reset();
        }

        if buffer.bits.len() < MFM_BUFFER_MAX_BITS - 16 {
            if buffer.bits.is_empty() {
                buffer.target = Some((track, side));
                buffer.start_position = position;
            }
            for bit in (0..16).rev() {
                buffer.bits.push(word & (1 << bit) != 0);
            }
        }
    }

    /// Queue the accumulated write buffer for the worker and invalidate the
    /// cached track so stale data cannot be read back meanwhile. Returns
    /// the track length the emulator should continue against.
    pub fn commit_write_buffer(&mut self, side: DiskSurface, track: u8) -> usize {
        self.switch_side(side);
        self.goto_cylinder(track, side);

        self.shared.last_write_ms.store(self.shared.now_ms(), Ordering::Relaxed);
        self.shared.write_backoff.store(true, Ordering::Relaxed);
        if let Some(interrupt) = &self.interrupt {
            interrupt.raise();
        }

        let max_bits = self.max_mfm_bit_position();
        let mut committed = false;
        {
            let mut writes = lock(&self.shared.writes);
            if !writes.buffer.bits.is_empty() && writes.buffer.target == Some((track, side)) {
                let start = writes.buffer.start_position;
                // Roughly accurate: a write that began (or wrapped) at the
                // start of the track should be cued to the index pulse.
                let write_from_index = start <= 10 || start >= max_bits.saturating_sub(10);

                let bits = std::mem::take(&mut writes.buffer.bits);
                log::debug!(
                    "FloppyBridge::commit_write_buffer(): {} bits for cylinder {} {} (from index: {})",
                    bits.len(),
                    track,
                    side,
                    write_from_index
                );
                writes.pending.push(TrackToWrite {
                    cylinder: track,
                    side,
                    bits,
                    write_from_index,
                });
                committed = true;

                // writes lock is held before the cache lock, matching the
                // worker's write flush.
                lock(&self.shared.cache).entry_mut(track, side).invalidate();
            }
            writes.buffer.reset();
        }

        if committed {
            self.enqueue(QueueAction::WriteFlush);
        }
        self.max_mfm_bit_position()
    }
}

impl Drop for FloppyBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[inline]
fn clamp_speed(raw_percent: u16) -> u16 {
    (raw_percent as u32 * 10).clamp(700, 3000) as u16
}
