//! The basic arpeggiator: walks the note list in the configured direction
//! and plays every note for the full rhythm length.

use crate::scheduler::SharedScheduler;
use crate::sequencer::{Cursor, NoteGenerator, Patch, Sequencer, Step};
use crate::sink::SharedSink;

/// Plain arpeggio pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct Arpeggio;

impl NoteGenerator for Arpeggio {
    fn next_step(
        &mut self,
        notes: &[u8],
        cursor: &mut Cursor,
        note_len: u64,
        velocity: u8,
    ) -> Step {
        let pitch = notes[cursor.index];
        if cursor.reflect {
            cursor.bounce(notes.len());
        }
        cursor.advance(notes.len());
        Step::plain(pitch, velocity, note_len)
    }
}

pub type Arpeggiator = Sequencer<Arpeggio>;

impl Sequencer<Arpeggio> {
    /// Arpeggiator playing on `channel` (0-15) with `patch`.
    pub fn new(scheduler: SharedScheduler, sink: SharedSink, channel: u8, patch: Patch) -> Self {
        Self::with_generator(scheduler, sink, channel, patch, Arpeggio)
    }
}
