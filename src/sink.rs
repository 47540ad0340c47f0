//! Note sinks: where the sequencer sends its program changes and notes.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::midi::note_name;

/// Synthesizer-side interface consumed by the sequencer.
pub trait NoteSink {
    /// Select `program` in `bank` on `channel`.
    fn program(&mut self, channel: u8, bank: u16, program: u8);
    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8);
    fn note_off(&mut self, channel: u8, pitch: u8);
}

/// A sink shared between sequencers and the scheduler's dispatch thread.
pub type SharedSink = Arc<Mutex<dyn NoteSink + Send>>;

/// One call made on a [`NoteSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    Program { channel: u8, bank: u16, program: u8 },
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
}

/// Keeps every event it receives, in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn events(&self) -> &[SinkEvent] {
        &self.events
    }

    /// Pitches of every note-on, in order.
    pub fn note_ons(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::NoteOn { pitch, .. } => Some(*pitch),
                _ => None,
            })
            .collect()
    }

    /// Pitches of every note-off, in order.
    pub fn note_offs(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::NoteOff { pitch, .. } => Some(*pitch),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl NoteSink for RecordingSink {
    fn program(&mut self, channel: u8, bank: u16, program: u8) {
        self.events.push(SinkEvent::Program {
            channel,
            bank,
            program,
        });
    }

    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8) {
        self.events.push(SinkEvent::NoteOn {
            channel,
            pitch,
            velocity,
        });
    }

    fn note_off(&mut self, channel: u8, pitch: u8) {
        self.events.push(SinkEvent::NoteOff { channel, pitch });
    }
}

/// Writes every event to the log at debug level. Used when no MIDI output
/// is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NoteSink for LogSink {
    fn program(&mut self, channel: u8, bank: u16, program: u8) {
        debug!("ch{} program {}:{}", channel + 1, bank, program);
    }

    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8) {
        debug!("ch{} on  {} vel {}", channel + 1, note_name(pitch), velocity);
    }

    fn note_off(&mut self, channel: u8, pitch: u8) {
        debug!("ch{} off {}", channel + 1, note_name(pitch));
    }
}
