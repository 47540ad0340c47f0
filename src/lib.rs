//! Tick-driven arpeggiator engine.
//!
//! An [`Arpeggiator`] turns a note list, a rhythmic grid and a direction into
//! a self-perpetuating stream of note-on/note-off commands posted on a
//! [`Scheduler`](scheduler::Scheduler). [`JazzArpeggiator`] layers per-beat
//! random embellishments on the same engine.
//!
//! The scheduler and the note sink are injected, so the same sequencer runs
//! against a live MIDI port, an offline renderer, or a recording sink in tests.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod arpeggio;
pub mod clock;
pub mod config;
pub mod export;
pub mod jazz;
pub mod midi;
pub mod scheduler;
pub mod sequencer;
pub mod sink;

pub use arpeggio::{Arpeggiator, Arpeggio};
pub use jazz::{Embellishments, JazzArpeggiator, JazzArpeggio};
pub use scheduler::{Scheduler, SharedScheduler, TickScheduler};
pub use sequencer::{Direction, FiredNote, Patch, Rhythm, Sequencer, SequencerError, Voice};
pub use sink::{NoteSink, RecordingSink, SharedSink, SinkEvent};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Sequencer state stays usable after a panicking callback; the worst case is
/// one skipped firing.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
