//! Jazz arpeggiator: the basic walk with per-beat stochastic embellishments.
//!
//! Each firing rolls independently for:
//! - an accent on beat 0 (velocity x1.5)
//! - a chromatic approach on even beats (half length, one semitone against
//!   the walk, and the cursor held so the target note follows)
//! - a hold on even beats (double length, compounds with the approach)
//! - a back-jump of 1-5 notes on any beat
//!
//! The beat counter cycles 0-3 once per firing whatever was rolled. There is
//! no up-down reflection; `UpDown` walks upward.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::midi::DATA_MAX;
use crate::scheduler::SharedScheduler;
use crate::sequencer::{Cursor, NoteGenerator, Patch, Sequencer, Step};
use crate::sink::SharedSink;

pub const ACCENT_CHANCE: f64 = 0.3;
pub const ACCENT_GAIN: f64 = 1.5;
pub const APPROACH_CHANCE: f64 = 0.3;
pub const HOLD_CHANCE: f64 = 0.4;
pub const BACK_JUMP_CHANCE: f64 = 0.2;
pub const MAX_BACK_JUMP: u8 = 5;

pub const BEATS_PER_CYCLE: u8 = 4;

/// Which embellishments a firing applied. All unset for the basic
/// arpeggiator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Embellishments {
    pub accent: bool,
    pub approach: bool,
    pub hold: bool,
    /// Notes jumped back, 1-5.
    pub back_jump: Option<u8>,
}

impl Embellishments {
    pub fn any(&self) -> bool {
        self.accent || self.approach || self.hold || self.back_jump.is_some()
    }
}

pub struct JazzArpeggio {
    beat: u8,
    rng: StdRng,
}

impl JazzArpeggio {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Reproducible embellishments for a given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self { beat: 0, rng }
    }

    /// Beat the next firing lands on, 0-3.
    pub fn beat(&self) -> u8 {
        self.beat
    }
}

impl Default for JazzArpeggio {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteGenerator for JazzArpeggio {
    fn next_step(
        &mut self,
        notes: &[u8],
        cursor: &mut Cursor,
        note_len: u64,
        velocity: u8,
    ) -> Step {
        let len = notes.len();
        let increment = cursor.increment;
        let mut pitch = notes[cursor.index] as i64;
        let mut velocity = velocity as f64;
        let mut duration = note_len;
        let mut applied = Embellishments::default();

        if self.beat == 0 && self.rng.gen_bool(ACCENT_CHANCE) {
            velocity *= ACCENT_GAIN;
            applied.accent = true;
        }
        if self.beat % 2 == 0 && self.rng.gen_bool(APPROACH_CHANCE) {
            duration /= 2;
            pitch -= increment;
            cursor.offset(-increment, len);
            applied.approach = true;
        }
        if self.beat % 2 == 0 && self.rng.gen_bool(HOLD_CHANCE) {
            duration = duration.saturating_mul(2);
            applied.hold = true;
        }
        if self.rng.gen_bool(BACK_JUMP_CHANCE) {
            let jump = self.rng.gen_range(1..=MAX_BACK_JUMP);
            cursor.offset(-increment * jump as i64, len);
            applied.back_jump = Some(jump);
        }

        cursor.advance(len);
        self.beat = (self.beat + 1) % BEATS_PER_CYCLE;

        Step {
            pitch: pitch.clamp(0, DATA_MAX as i64) as u8,
            velocity: velocity.round().min(DATA_MAX as f64) as u8,
            duration,
            embellishments: applied,
        }
    }

    fn reset(&mut self) {
        self.beat = 0;
    }
}

pub type JazzArpeggiator = Sequencer<JazzArpeggio>;

impl Sequencer<JazzArpeggio> {
    pub fn new(scheduler: SharedScheduler, sink: SharedSink, channel: u8, patch: Patch) -> Self {
        Self::with_generator(scheduler, sink, channel, patch, JazzArpeggio::new())
    }

    pub fn with_seed(
        scheduler: SharedScheduler,
        sink: SharedSink,
        channel: u8,
        patch: Patch,
        seed: u64,
    ) -> Self {
        Self::with_generator(scheduler, sink, channel, patch, JazzArpeggio::with_seed(seed))
    }
}
