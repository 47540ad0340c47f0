//! Musical time: tick resolution, tempo mapping, and external MIDI clock.
//!
//! This module handles:
//! - Rounding ticks up to musically meaningful boundaries
//! - Converting elapsed wall-clock seconds to ticks at a fixed tempo
//! - Following an external MIDI clock and counting its pulses
//!
//! # Thread Safety
//! [`MidiClockFollower`] is designed to be shared between a MIDI input thread
//! and whatever drives the scheduler. All state is wrapped in atomic types or
//! mutexes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::lock;
use crate::midi::{
    BEATS_PER_BAR, CLOCKS_PER_BEAT, MIDI_CLOCK, MIDI_CONTINUE, MIDI_START, MIDI_STOP,
};

/// Scheduler ticks per quarter note.
pub const TICKS_PER_QUARTER: u64 = 480;

/// Scheduler ticks covered by one MIDI clock pulse (24 ppqn).
pub const TICKS_PER_CLOCK: u64 = TICKS_PER_QUARTER / CLOCKS_PER_BEAT;

/// Slowest tempo a [`TempoMap`] accepts.
pub const MIN_BPM: f64 = 1.0;

/// Smallest multiple of `resolution` that is >= `tick`.
///
/// A zero resolution leaves the tick unchanged.
pub fn quantize_tick_up(tick: u64, resolution: u64) -> u64 {
    if resolution == 0 {
        return tick;
    }
    tick.div_ceil(resolution) * resolution
}

/// Position of `tick` as a (bar, beat) tuple, both 1-indexed, in 4/4.
pub fn bar_beat(tick: u64) -> (u64, u64) {
    let beats = tick / TICKS_PER_QUARTER;
    (beats / BEATS_PER_BAR + 1, beats % BEATS_PER_BAR + 1)
}

/// Constant-tempo mapping between elapsed seconds and ticks.
///
/// Tempo changes are anchored at the moment they happen, so the tick count
/// never jumps when the BPM moves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoMap {
    bpm: f64,
    anchor_seconds: f64,
    anchor_tick: u64,
}

impl TempoMap {
    pub fn new(bpm: f64) -> Self {
        Self {
            bpm: bpm.max(MIN_BPM),
            anchor_seconds: 0.0,
            anchor_tick: 0,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    fn ticks_per_second(&self) -> f64 {
        self.bpm / 60.0 * TICKS_PER_QUARTER as f64
    }

    /// Tick reached after `seconds` of playback.
    pub fn tick_at(&self, seconds: f64) -> u64 {
        let elapsed = (seconds - self.anchor_seconds).max(0.0);
        self.anchor_tick + (elapsed * self.ticks_per_second()) as u64
    }

    /// Playback time, in seconds, at which `tick` is reached.
    pub fn seconds_at(&self, tick: u64) -> f64 {
        let ticks = tick.saturating_sub(self.anchor_tick) as f64;
        self.anchor_seconds + ticks / self.ticks_per_second()
    }

    /// Change tempo at playback time `now_seconds`.
    pub fn set_bpm(&mut self, bpm: f64, now_seconds: f64) {
        self.anchor_tick = self.tick_at(now_seconds);
        self.anchor_seconds = now_seconds.max(self.anchor_seconds);
        self.bpm = bpm.max(MIN_BPM);
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::new(120.0)
    }
}

/// Size of the rolling window for BPM estimation (one bar at 24 ppqn in 4/4).
const BPM_WINDOW_PULSES: usize = 96;

/// Ring buffer of recent clock pulse arrival times.
struct PulseWindow {
    times: [Option<Instant>; BPM_WINDOW_PULSES],
    index: usize,
    count: usize,
}

impl PulseWindow {
    fn new() -> Self {
        Self {
            times: [None; BPM_WINDOW_PULSES],
            index: 0,
            count: 0,
        }
    }

    fn push(&mut self, time: Instant) {
        self.times[self.index] = Some(time);
        self.index = (self.index + 1) % BPM_WINDOW_PULSES;
        self.count = (self.count + 1).min(BPM_WINDOW_PULSES);
    }

    /// Oldest stored pulse and the number of pulses in the window.
    fn oldest(&self) -> Option<(Instant, usize)> {
        let slot = if self.count < BPM_WINDOW_PULSES {
            0
        } else {
            self.index
        };
        self.times[slot].map(|t| (t, self.count))
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// Follows an external MIDI clock.
///
/// Counts clock pulses while the transport runs and keeps a rolling BPM
/// estimate. Clock pulses received before any explicit START/STOP/CONTINUE
/// auto-start the transport; once a transport message has been seen only
/// transport messages control it.
#[derive(Clone)]
pub struct MidiClockFollower {
    running: Arc<AtomicBool>,
    seen_transport: Arc<AtomicBool>,
    pulses: Arc<AtomicU64>,
    bpm_x100: Arc<AtomicU64>,
    window: Arc<Mutex<PulseWindow>>,
}

impl MidiClockFollower {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            seen_transport: Arc::new(AtomicBool::new(false)),
            pulses: Arc::new(AtomicU64::new(0)),
            bpm_x100: Arc::new(AtomicU64::new(0)),
            window: Arc::new(Mutex::new(PulseWindow::new())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clock pulses counted since the last START.
    pub fn pulse_count(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }

    /// Pulse count expressed in scheduler ticks.
    pub fn current_tick(&self) -> u64 {
        self.pulse_count() * TICKS_PER_CLOCK
    }

    pub fn bpm(&self) -> f64 {
        self.bpm_x100.load(Ordering::SeqCst) as f64 / 100.0
    }

    pub fn handle_midi_message(&self, message: &[u8]) {
        self.handle_midi_message_at(message, Instant::now());
    }

    /// Handle a MIDI message received at `now`.
    pub fn handle_midi_message_at(&self, message: &[u8], now: Instant) {
        let Some(&status) = message.first() else {
            return;
        };

        match status {
            MIDI_START => {
                self.seen_transport.store(true, Ordering::SeqCst);
                self.running.store(true, Ordering::SeqCst);
                self.pulses.store(0, Ordering::SeqCst);
                self.bpm_x100.store(0, Ordering::SeqCst);
                lock(&self.window).clear();
            }
            MIDI_CONTINUE => {
                self.seen_transport.store(true, Ordering::SeqCst);
                self.running.store(true, Ordering::SeqCst);
            }
            MIDI_STOP => {
                self.seen_transport.store(true, Ordering::SeqCst);
                self.running.store(false, Ordering::SeqCst);
            }
            MIDI_CLOCK => {
                if !self.seen_transport.load(Ordering::SeqCst) {
                    self.running.store(true, Ordering::SeqCst);
                }

                // Tempo is tracked even while stopped
                let mut window = lock(&self.window);
                window.push(now);
                if let Some((oldest, samples)) = window.oldest() {
                    let elapsed = now.duration_since(oldest).as_secs_f64();
                    if samples > 1 && elapsed > 0.0 {
                        let beats = (samples - 1) as f64 / CLOCKS_PER_BEAT as f64;
                        let bpm = beats / (elapsed / 60.0);
                        self.bpm_x100.store((bpm * 100.0) as u64, Ordering::SeqCst);
                    }
                }

                if self.running.load(Ordering::SeqCst) {
                    self.pulses.fetch_add(1, Ordering::SeqCst);
                }
            }
            _ => {}
        }
    }
}

impl Default for MidiClockFollower {
    fn default() -> Self {
        Self::new()
    }
}
