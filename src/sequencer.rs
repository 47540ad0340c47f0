//! Self-scheduling note sequencer.
//!
//! A [`Sequencer`] holds a note list, a rhythm and a direction. Once started
//! it keeps exactly one note-on posted on the scheduler: each firing asks its
//! [`NoteGenerator`] for the next step, sends the note-on, posts the matching
//! note-off and the following note-on, then notifies the callback. Nothing
//! polls; the loop is driven entirely by the scheduler's dispatch.
//!
//! # Thread Safety
//! Configuration and transport calls may come from another thread while the
//! scheduler dispatches. State is behind one mutex, and callbacks and forced
//! note-offs run with it released, so a callback may reconfigure (or stop)
//! the sequencer that fired it.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{quantize_tick_up, TICKS_PER_QUARTER};
use crate::jazz::Embellishments;
use crate::lock;
use crate::midi::{note_name, DATA_MAX};
use crate::scheduler::{ScheduledCommand, SharedScheduler};
use crate::sink::SharedSink;

/// Velocity of an unaccented note.
pub const DEFAULT_VELOCITY: u8 = 80;

/// Shortest step the sequencer posts. A zero-length step would re-post
/// itself at the tick being dispatched and never let the pass finish.
pub const MIN_STEP_TICKS: u64 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error("must set notes and direction before playing")]
    NotConfigured,
    #[error("unknown direction {0:?} (expected up, down or updown)")]
    InvalidDirection(String),
}

/// Order in which the note list is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    /// Sweep up then back down without repeating the end notes.
    UpDown,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::Up, Direction::Down, Direction::UpDown];

    pub fn increment(self) -> i64 {
        match self {
            Direction::Down => -1,
            Direction::Up | Direction::UpDown => 1,
        }
    }

    pub fn reflects(self) -> bool {
        matches!(self, Direction::UpDown)
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::UpDown => "updown",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Direction {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "updown" => Ok(Direction::UpDown),
            _ => Err(SequencerError::InvalidDirection(s.to_string())),
        }
    }
}

/// Bank and program selected on every start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub bank: u16,
    pub program: u8,
}

impl Patch {
    pub fn new(bank: u16, program: u8) -> Self {
        Self { bank, program }
    }
}

impl Default for Patch {
    fn default() -> Self {
        Self::new(0, 40)
    }
}

/// Note grid and the fraction of it each note sounds for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rhythm {
    /// Ticks per grid step. 240 is an eighth note.
    pub note_grid: u64,
    pub note_len_ratio: f64,
}

impl Rhythm {
    pub fn new(note_grid: u64, note_len_ratio: f64) -> Self {
        Self {
            note_grid,
            note_len_ratio,
        }
    }

    /// Sounding length in ticks. Negative or NaN ratios count as zero.
    pub fn note_len(&self) -> u64 {
        (self.note_grid as f64 * self.note_len_ratio.max(0.0)).round() as u64
    }
}

impl Default for Rhythm {
    fn default() -> Self {
        Self::new(TICKS_PER_QUARTER, 1.0)
    }
}

/// Walk position through the note list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub index: usize,
    /// +1 or -1
    pub increment: i64,
    pub reflect: bool,
}

impl Cursor {
    pub fn new(direction: Direction) -> Self {
        Self {
            index: 0,
            increment: direction.increment(),
            reflect: direction.reflects(),
        }
    }

    /// Pull the index back inside a list of `len` notes. `len` must be > 0.
    pub fn clamp(&mut self, len: usize) {
        self.index = self.index.min(len - 1);
    }

    /// Move by `delta`, wrapping around a list of `len` notes.
    pub fn offset(&mut self, delta: i64, len: usize) {
        self.index = (self.index as i64 + delta).rem_euclid(len as i64) as usize;
    }

    pub fn advance(&mut self, len: usize) {
        self.offset(self.increment, len);
    }

    /// Reverse direction if the next step would leave the list.
    pub fn bounce(&mut self, len: usize) {
        if len < 2 {
            return;
        }
        let next = self.index as i64 + self.increment;
        if next < 0 || next >= len as i64 {
            self.increment = -self.increment;
        }
    }
}

/// One note chosen by a [`NoteGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub pitch: u8,
    pub velocity: u8,
    /// Ticks until both the note-off and the next note-on.
    pub duration: u64,
    pub embellishments: Embellishments,
}

impl Step {
    pub fn plain(pitch: u8, velocity: u8, duration: u64) -> Self {
        Self {
            pitch,
            velocity,
            duration,
            embellishments: Embellishments::default(),
        }
    }
}

/// Chooses the note played at each firing and advances the cursor.
pub trait NoteGenerator: Send + 'static {
    /// `notes` is never empty and `cursor.index` is already in range.
    fn next_step(&mut self, notes: &[u8], cursor: &mut Cursor, note_len: u64, velocity: u8)
        -> Step;

    /// Forget per-run state. Called on every start.
    fn reset(&mut self) {}
}

/// What a firing played, handed to the note callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredNote {
    pub tick: u64,
    pub channel: u8,
    pub pitch: u8,
    pub velocity: u8,
    pub duration: u64,
    pub embellishments: Embellishments,
}

pub type NoteCallback = Arc<dyn Fn(&FiredNote) + Send + Sync>;

struct State<G> {
    notes: Vec<u8>,
    rhythm: Rhythm,
    direction: Option<Direction>,
    velocity: u8,
    cursor: Cursor,
    playing: bool,
    /// Bumped on every start; a note-on from an earlier run is ignored
    generation: u64,
    pending_on: Option<ScheduledCommand>,
    pending_off: Option<ScheduledCommand>,
    generator: G,
    callback: Option<NoteCallback>,
}

struct Engine<G> {
    state: Mutex<State<G>>,
    scheduler: SharedScheduler,
    sink: SharedSink,
    channel: u8,
    patch: Patch,
}

impl<G: NoteGenerator> Engine<G> {
    fn post_note_on(self: &Arc<Self>, tick: u64, generation: u64) -> ScheduledCommand {
        let engine = Arc::downgrade(self);
        ScheduledCommand::post(
            &self.scheduler,
            tick,
            Box::new(move |at| {
                if let Some(engine) = engine.upgrade() {
                    engine.fire(at, generation);
                }
            }),
        )
    }

    fn post_note_off(&self, tick: u64, pitch: u8) -> ScheduledCommand {
        let sink = Arc::clone(&self.sink);
        let channel = self.channel;
        ScheduledCommand::post(
            &self.scheduler,
            tick,
            Box::new(move |_| lock(&sink).note_off(channel, pitch)),
        )
    }

    fn fire(self: &Arc<Self>, tick: u64, generation: u64) {
        let (note, callback) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if !state.playing || state.generation != generation {
                debug!("ch{} stale note-on at {} ignored", self.channel + 1, tick);
                return;
            }

            let len = state.notes.len();
            if len == 0 {
                // Keep the loop alive so refilling the list resumes playback
                warn!("ch{} note list empty at tick {}", self.channel + 1, tick);
                let retry = tick.saturating_add(state.rhythm.note_len().max(MIN_STEP_TICKS));
                state.pending_on = Some(self.post_note_on(retry, generation));
                return;
            }

            state.cursor.clamp(len);
            let step = state.generator.next_step(
                &state.notes,
                &mut state.cursor,
                state.rhythm.note_len(),
                state.velocity,
            );
            let duration = step.duration.max(MIN_STEP_TICKS);

            lock(&self.sink).note_on(self.channel, step.pitch, step.velocity);
            let next = tick.saturating_add(duration);
            state.pending_off = Some(self.post_note_off(next, step.pitch));
            state.pending_on = Some(self.post_note_on(next, generation));

            let note = FiredNote {
                tick,
                channel: self.channel,
                pitch: step.pitch,
                velocity: step.velocity,
                duration,
                embellishments: step.embellishments,
            };
            (note, state.callback.clone())
        };

        debug!(
            "ch{} {} {} vel {} len {}",
            self.channel + 1,
            note.tick,
            note_name(note.pitch),
            note.velocity,
            note.duration
        );
        if let Some(callback) = callback {
            callback(&note);
        }
    }
}

/// A note sequencer driven by a [`NoteGenerator`].
///
/// See [`Arpeggiator`](crate::Arpeggiator) and
/// [`JazzArpeggiator`](crate::JazzArpeggiator) for the two stock variants.
/// Dropping a sequencer stops it.
pub struct Sequencer<G: NoteGenerator> {
    engine: Arc<Engine<G>>,
}

impl<G: NoteGenerator> Sequencer<G> {
    pub fn with_generator(
        scheduler: SharedScheduler,
        sink: SharedSink,
        channel: u8,
        patch: Patch,
        generator: G,
    ) -> Self {
        let state = State {
            notes: Vec::new(),
            rhythm: Rhythm::default(),
            direction: None,
            velocity: DEFAULT_VELOCITY,
            cursor: Cursor::new(Direction::Up),
            playing: false,
            generation: 0,
            pending_on: None,
            pending_off: None,
            generator,
            callback: None,
        };
        Self {
            engine: Arc::new(Engine {
                state: Mutex::new(state),
                scheduler,
                sink,
                channel: channel & 0x0F,
                patch,
            }),
        }
    }

    /// Builder form of [`set_callback`](Self::set_callback).
    pub fn with_callback(self, callback: impl Fn(&FiredNote) + Send + Sync + 'static) -> Self {
        self.set_callback(callback);
        self
    }

    pub fn channel(&self) -> u8 {
        self.engine.channel
    }

    pub fn patch(&self) -> Patch {
        self.engine.patch
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.engine.state).playing
    }

    pub fn notes(&self) -> Vec<u8> {
        lock(&self.engine.state).notes.clone()
    }

    pub fn rhythm(&self) -> Rhythm {
        lock(&self.engine.state).rhythm
    }

    pub fn direction(&self) -> Option<Direction> {
        lock(&self.engine.state).direction
    }

    /// Index of the note the next firing will read (before clamping).
    pub fn note_index(&self) -> usize {
        lock(&self.engine.state).cursor.index
    }

    /// Replace the note list. Takes effect at the next firing, even mid-run.
    pub fn set_notes(&self, notes: impl Into<Vec<u8>>) {
        let mut notes: Vec<u8> = notes.into();
        for pitch in notes.iter_mut() {
            *pitch = (*pitch).min(DATA_MAX);
        }
        lock(&self.engine.state).notes = notes;
    }

    /// Set the grid and note-length ratio. Already-posted commands keep
    /// their ticks; the next firing uses the new length.
    pub fn set_rhythm(&self, note_grid: u64, note_len_ratio: f64) {
        lock(&self.engine.state).rhythm = Rhythm::new(note_grid, note_len_ratio);
    }

    pub fn set_direction(&self, direction: Direction) {
        let mut state = lock(&self.engine.state);
        state.direction = Some(direction);
        state.cursor.increment = direction.increment();
        state.cursor.reflect = direction.reflects();
    }

    pub fn set_velocity(&self, velocity: u8) {
        lock(&self.engine.state).velocity = velocity.min(DATA_MAX);
    }

    pub fn set_callback(&self, callback: impl Fn(&FiredNote) + Send + Sync + 'static) {
        lock(&self.engine.state).callback = Some(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        lock(&self.engine.state).callback = None;
    }

    /// Start playing from the first note at the next quarter-note boundary.
    ///
    /// No-op if already playing. Fails with
    /// [`NotConfigured`](SequencerError::NotConfigured) if the note list is
    /// empty or no direction was set.
    pub fn start(&self) -> Result<(), SequencerError> {
        let engine = &self.engine;
        let mut state = lock(&engine.state);
        if state.playing {
            return Ok(());
        }
        let direction = state.direction.ok_or(SequencerError::NotConfigured)?;
        if state.notes.is_empty() {
            return Err(SequencerError::NotConfigured);
        }

        state.cursor = Cursor::new(direction);
        state.generator.reset();
        state.playing = true;
        state.generation += 1;

        lock(&engine.sink).program(engine.channel, engine.patch.bank, engine.patch.program);
        let now = engine.scheduler.current_tick();
        let first = quantize_tick_up(now, TICKS_PER_QUARTER);
        state.pending_on = Some(engine.post_note_on(first, state.generation));

        info!(
            "ch{} start at tick {} ({} notes, {})",
            engine.channel + 1,
            first,
            state.notes.len(),
            direction
        );
        Ok(())
    }

    /// Stop playing. A sounding note is released immediately and nothing
    /// stays posted on the scheduler. No-op if not playing.
    pub fn stop(&self) {
        let (pending_on, pending_off) = {
            let mut state = lock(&self.engine.state);
            if !state.playing {
                return;
            }
            state.playing = false;
            (state.pending_on.take(), state.pending_off.take())
        };

        if let Some(off) = pending_off {
            off.execute_now();
        }
        if let Some(on) = pending_on {
            on.cancel();
        }
        info!("ch{} stop", self.engine.channel + 1);
    }

    pub fn toggle(&self) -> Result<(), SequencerError> {
        if self.is_playing() {
            self.stop();
            Ok(())
        } else {
            self.start()
        }
    }
}

impl<G: NoteGenerator> Drop for Sequencer<G> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Object-safe transport and configuration surface shared by every
/// sequencer variant, for front ends that hold a mixed set of voices.
pub trait Voice: Send + Sync {
    fn start(&self) -> Result<(), SequencerError>;
    fn stop(&self);
    fn toggle(&self) -> Result<(), SequencerError>;
    fn is_playing(&self) -> bool;
    fn channel(&self) -> u8;
    fn set_notes(&self, notes: Vec<u8>);
    fn set_rhythm(&self, note_grid: u64, note_len_ratio: f64);
    fn set_direction(&self, direction: Direction);
    fn set_velocity(&self, velocity: u8);
    fn set_callback(&self, callback: NoteCallback);
}

impl<G: NoteGenerator> Voice for Sequencer<G> {
    fn start(&self) -> Result<(), SequencerError> {
        Sequencer::start(self)
    }

    fn stop(&self) {
        Sequencer::stop(self)
    }

    fn toggle(&self) -> Result<(), SequencerError> {
        Sequencer::toggle(self)
    }

    fn is_playing(&self) -> bool {
        Sequencer::is_playing(self)
    }

    fn channel(&self) -> u8 {
        Sequencer::channel(self)
    }

    fn set_notes(&self, notes: Vec<u8>) {
        Sequencer::set_notes(self, notes)
    }

    fn set_rhythm(&self, note_grid: u64, note_len_ratio: f64) {
        Sequencer::set_rhythm(self, note_grid, note_len_ratio)
    }

    fn set_direction(&self, direction: Direction) {
        Sequencer::set_direction(self, direction)
    }

    fn set_velocity(&self, velocity: u8) {
        Sequencer::set_velocity(self, velocity)
    }

    fn set_callback(&self, callback: NoteCallback) {
        Sequencer::set_callback(self, move |note: &FiredNote| callback(note))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arpeggio::Arpeggiator;
    use crate::scheduler::TickScheduler;
    use crate::sink::{RecordingSink, SinkEvent};

    struct Rig {
        sched: Arc<TickScheduler>,
        sink: Arc<Mutex<RecordingSink>>,
        arp: Arpeggiator,
        fired: Arc<Mutex<Vec<FiredNote>>>,
    }

    fn rig(notes: &[u8], grid: u64, ratio: f64, direction: Direction) -> Rig {
        let sched = Arc::new(TickScheduler::new());
        let sink = RecordingSink::shared();
        let arp = Arpeggiator::new(sched.clone(), sink.clone(), 1, Patch::new(0, 0));
        arp.set_notes(notes.to_vec());
        arp.set_rhythm(grid, ratio);
        arp.set_direction(direction);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&fired);
        arp.set_callback(move |note| out.lock().unwrap().push(*note));
        Rig {
            sched,
            sink,
            arp,
            fired,
        }
    }

    fn note_event_count(sink: &Mutex<RecordingSink>) -> usize {
        let sink = sink.lock().unwrap();
        sink.note_ons().len() + sink.note_offs().len()
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("up".parse::<Direction>(), Ok(Direction::Up));
        assert_eq!(" Down ".parse::<Direction>(), Ok(Direction::Down));
        assert_eq!("updown".parse::<Direction>(), Ok(Direction::UpDown));
        assert_eq!(
            "sideways".parse::<Direction>(),
            Err(SequencerError::InvalidDirection("sideways".to_string()))
        );
        for direction in Direction::ALL {
            assert_eq!(direction.to_string().parse::<Direction>(), Ok(direction));
        }
    }

    #[test]
    fn test_note_len() {
        assert_eq!(Rhythm::new(240, 1.0).note_len(), 240);
        assert_eq!(Rhythm::new(240, 0.75).note_len(), 180);
        assert_eq!(Rhythm::new(480, 0.25).note_len(), 120);
        assert_eq!(Rhythm::new(480, -1.0).note_len(), 0);
        assert_eq!(Rhythm::new(480, f64::NAN).note_len(), 0);
    }

    #[test]
    fn test_cursor_wraps_both_ways() {
        let mut cursor = Cursor::new(Direction::Down);
        cursor.advance(4);
        assert_eq!(cursor.index, 3);
        cursor.offset(6, 4);
        assert_eq!(cursor.index, 1);
        cursor.index = 9;
        cursor.clamp(4);
        assert_eq!(cursor.index, 3);
    }

    #[test]
    fn test_start_without_notes_is_not_configured() {
        let r = rig(&[], 240, 1.0, Direction::Up);
        assert_eq!(r.arp.start(), Err(SequencerError::NotConfigured));
        assert!(!r.arp.is_playing());
        assert_eq!(r.sched.pending(), 0);
    }

    #[test]
    fn test_start_without_direction_is_not_configured() {
        let sched = Arc::new(TickScheduler::new());
        let arp = Arpeggiator::new(sched.clone(), RecordingSink::shared(), 0, Patch::default());
        arp.set_notes(vec![60, 64]);
        assert_eq!(arp.start(), Err(SequencerError::NotConfigured));
        assert_eq!(arp.direction(), None);
    }

    #[test]
    fn test_first_note_is_quantized_to_quarter() {
        let r = rig(&[60, 64, 67, 72], 240, 1.0, Direction::Up);
        r.sched.advance_to(500);
        r.arp.start().unwrap();

        r.sched.advance_to(1200);
        let fired = r.fired.lock().unwrap();
        assert_eq!(fired.len(), 2);
        assert_eq!((fired[0].tick, fired[0].pitch), (960, 60));
        assert_eq!((fired[1].tick, fired[1].pitch), (1200, 64));
        assert_eq!(fired[0].duration, 240);
        assert_eq!(fired[0].channel, 1);
    }

    #[test]
    fn test_start_sends_program_change() {
        let r = rig(&[60], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        assert_eq!(
            r.sink.lock().unwrap().events()[0],
            SinkEvent::Program {
                channel: 1,
                bank: 0,
                program: 0
            }
        );
    }

    #[test]
    fn test_stop_before_first_firing_sends_no_notes() {
        let r = rig(&[60, 64], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.arp.stop();
        r.sched.advance_to(10_000);

        assert_eq!(note_event_count(&r.sink), 0);
        assert_eq!(r.sched.pending(), 0);
    }

    #[test]
    fn test_stop_after_one_firing_forces_note_off() {
        let r = rig(&[60, 64], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.sched.advance_to(0);
        r.arp.stop();
        r.sched.advance_to(10_000);

        let sink = r.sink.lock().unwrap();
        assert_eq!(sink.note_ons(), vec![60]);
        assert_eq!(sink.note_offs(), vec![60]);
        assert_eq!(r.sched.pending(), 0);
        assert_eq!(r.fired.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_double_start_posts_one_note_on() {
        let r = rig(&[60, 64], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.arp.start().unwrap();
        assert_eq!(r.sched.pending(), 1);

        r.sched.advance_to(0);
        // one note-off and one note-on
        assert_eq!(r.sched.pending(), 2);
        assert_eq!(r.sink.lock().unwrap().note_ons(), vec![60]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let r = rig(&[60], 240, 1.0, Direction::Up);
        r.arp.stop();
        r.arp.start().unwrap();
        r.sched.advance_to(0);
        r.arp.stop();
        r.arp.stop();
        assert_eq!(r.sink.lock().unwrap().note_offs(), vec![60]);
    }

    #[test]
    fn test_toggle() {
        let r = rig(&[60], 240, 1.0, Direction::Up);
        r.arp.toggle().unwrap();
        assert!(r.arp.is_playing());
        r.arp.toggle().unwrap();
        assert!(!r.arp.is_playing());
        assert_eq!(r.sched.pending(), 0);
    }

    #[test]
    fn test_restart_begins_at_first_note() {
        let r = rig(&[60, 64, 67], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.sched.advance_to(240);
        r.arp.stop();
        r.arp.start().unwrap();
        r.sched.advance_to(480);

        assert_eq!(r.sink.lock().unwrap().note_ons(), vec![60, 64, 60]);
    }

    #[test]
    fn test_notes_off_before_next_note_on() {
        let r = rig(&[60, 64], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.sched.advance_to(240);

        let sink = r.sink.lock().unwrap();
        let notes: Vec<SinkEvent> = sink.events()[1..].to_vec();
        assert_eq!(
            notes,
            vec![
                SinkEvent::NoteOn {
                    channel: 1,
                    pitch: 60,
                    velocity: DEFAULT_VELOCITY
                },
                SinkEvent::NoteOff {
                    channel: 1,
                    pitch: 60
                },
                SinkEvent::NoteOn {
                    channel: 1,
                    pitch: 64,
                    velocity: DEFAULT_VELOCITY
                },
            ]
        );
    }

    #[test]
    fn test_rhythm_change_applies_to_next_firing() {
        let r = rig(&[60, 64, 67], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.sched.advance_to(0);
        r.arp.set_rhythm(480, 1.0);
        r.sched.advance_to(960);

        let ticks: Vec<u64> = r.fired.lock().unwrap().iter().map(|n| n.tick).collect();
        // The note-on already posted for 240 keeps its tick
        assert_eq!(ticks, vec![0, 240, 720]);
    }

    #[test]
    fn test_zero_length_notes_still_advance() {
        let r = rig(&[60, 64], 240, 0.0, Direction::Up);
        r.arp.start().unwrap();
        r.sched.advance_to(3);
        let fired = r.fired.lock().unwrap();
        assert_eq!(fired.len(), 4);
        assert!(fired.iter().all(|n| n.duration == MIN_STEP_TICKS));
    }

    #[test]
    fn test_shrinking_notes_clamps_cursor() {
        let r = rig(&[60, 64, 67, 72], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.sched.advance_to(480);
        assert_eq!(r.arp.note_index(), 3);

        r.arp.set_notes(vec![50, 52]);
        r.sched.advance_to(960);
        assert_eq!(
            r.sink.lock().unwrap().note_ons(),
            vec![60, 64, 67, 52, 50]
        );
    }

    #[test]
    fn test_emptied_notes_idle_then_resume() {
        let r = rig(&[60, 64], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.sched.advance_to(0);
        r.arp.set_notes(Vec::new());
        r.sched.advance_to(720);
        assert_eq!(r.sink.lock().unwrap().note_ons(), vec![60]);
        assert!(r.arp.is_playing());

        r.arp.set_notes(vec![70]);
        r.sched.advance_to(960);
        assert_eq!(r.sink.lock().unwrap().note_ons(), vec![60, 70]);
    }

    #[test]
    fn test_callback_can_reconfigure_its_sequencer() {
        let sched = Arc::new(TickScheduler::new());
        let sink = RecordingSink::shared();
        let arp = Arc::new(Arpeggiator::new(sched.clone(), sink.clone(), 0, Patch::default()));
        arp.set_notes(vec![60, 62]);
        arp.set_rhythm(240, 1.0);
        arp.set_direction(Direction::Up);

        let weak = Arc::downgrade(&arp);
        arp.set_callback(move |note| {
            if let Some(arp) = weak.upgrade() {
                if note.pitch == 62 {
                    arp.set_notes(vec![40, 41, 42]);
                }
            }
        });
        arp.start().unwrap();
        sched.advance_to(720);

        // cursor is at 0 after the wrap, so the new list starts from its top
        assert_eq!(sink.lock().unwrap().note_ons(), vec![60, 62, 40, 41]);
    }

    #[test]
    fn test_callback_can_stop_its_sequencer() {
        let sched = Arc::new(TickScheduler::new());
        let sink = RecordingSink::shared();
        let arp = Arc::new(Arpeggiator::new(sched.clone(), sink.clone(), 0, Patch::default()));
        arp.set_notes(vec![60, 62]);
        arp.set_direction(Direction::Up);

        let weak = Arc::downgrade(&arp);
        arp.set_callback(move |_| {
            if let Some(arp) = weak.upgrade() {
                arp.stop();
            }
        });
        arp.start().unwrap();
        sched.advance_to(10_000);

        let sink = sink.lock().unwrap();
        assert_eq!(sink.note_ons(), vec![60]);
        assert_eq!(sink.note_offs(), vec![60]);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_drop_releases_sounding_note() {
        let r = rig(&[60, 64], 240, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.sched.advance_to(0);

        let Rig {
            sched, sink, arp, ..
        } = r;
        drop(arp);
        assert_eq!(sched.pending(), 0);
        assert_eq!(sink.lock().unwrap().note_offs(), vec![60]);
    }

    #[test]
    fn test_velocity_is_clamped() {
        let r = rig(&[60], 240, 1.0, Direction::Up);
        r.arp.set_velocity(200);
        r.arp.start().unwrap();
        r.sched.advance_to(0);
        assert_eq!(r.fired.lock().unwrap()[0].velocity, DATA_MAX);
    }

    #[test]
    fn test_voice_trait_object() {
        let r = rig(&[60, 64], 240, 1.0, Direction::Up);
        let voice: &dyn Voice = &r.arp;
        voice.set_notes(vec![48]);
        voice.start().unwrap();
        assert!(voice.is_playing());
        r.sched.advance_to(0);
        voice.stop();
        assert_eq!(r.sink.lock().unwrap().note_ons(), vec![48]);
    }
    #[test]
    fn test_builder_callback_and_clear() {
        let sched = Arc::new(TickScheduler::new());
        let count = Arc::new(Mutex::new(0));
        let out = Arc::clone(&count);
        let arp = Arpeggiator::new(sched.clone(), RecordingSink::shared(), 0, Patch::default())
            .with_callback(move |_| *out.lock().unwrap() += 1);
        arp.set_notes(vec![60, 64]);
        arp.set_rhythm(240, 1.0);
        arp.set_direction(Direction::Up);
        arp.start().unwrap();

        sched.advance_to(240);
        assert_eq!(*count.lock().unwrap(), 2);

        arp.clear_callback();
        sched.advance_to(960);
        assert_eq!(*count.lock().unwrap(), 2);
        assert!(arp.is_playing());
    }

    #[test]
    fn test_huge_grid_saturates_instead_of_overflowing() {
        let r = rig(&[60, 64], u64::MAX, 1.0, Direction::Up);
        r.sched.advance_to(1);
        r.arp.start().unwrap();
        r.sched.advance_to(480);

        {
            let fired = r.fired.lock().unwrap();
            assert_eq!(fired.len(), 1);
            assert_eq!(fired[0].tick, 480);
        }
        // next note-on and the note-off both sit at the end of time
        assert_eq!(r.sched.pending(), 2);
        assert_eq!(r.sched.next_due(), Some(u64::MAX));
        r.sched.advance_to(1_000_000);
        assert_eq!(r.fired.lock().unwrap().len(), 1);

        r.arp.stop();
        assert_eq!(r.sched.pending(), 0);
        assert_eq!(r.sink.lock().unwrap().note_offs(), vec![60]);
    }

    #[test]
    fn test_huge_grid_with_empty_notes_saturates_retry() {
        let r = rig(&[60], u64::MAX, 1.0, Direction::Up);
        r.arp.start().unwrap();
        r.arp.set_notes(Vec::new());
        r.sched.advance_to(0);

        assert!(r.fired.lock().unwrap().is_empty());
        assert_eq!(r.sched.next_due(), Some(u64::MAX));
        r.arp.stop();
        assert_eq!(r.sched.pending(), 0);
    }

    #[test]
    fn test_reconfigure_from_another_thread_while_dispatching() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        let Rig {
            sched, sink, arp, ..
        } = rig(&[60, 64, 67, 72], 60, 0.5, Direction::UpDown);
        arp.start().unwrap();
        sched.advance_to(600);

        let pool = [60u8, 62, 64, 65, 67];
        let sizes = [5usize, 3, 1, 0, 4, 2];
        let done = AtomicBool::new(false);
        let mut tick = 600;
        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..20_000usize {
                    arp.set_notes(pool[..sizes[i % sizes.len()]].to_vec());
                    arp.set_direction(Direction::ALL[i % Direction::ALL.len()]);
                    match i % 7 {
                        0 => arp.stop(),
                        // fails while the list is empty
                        3 => {
                            let _ = arp.start();
                        }
                        _ => {}
                    }
                }
                done.store(true, Ordering::SeqCst);
            });

            while !done.load(Ordering::SeqCst) {
                tick += 30;
                sched.advance_to(tick);
            }
        });

        arp.stop();
        sched.advance_to(tick + 10_000);
        assert_eq!(sched.pending(), 0);

        let sink = sink.lock().unwrap();
        assert!(!sink.note_ons().is_empty());
        assert_eq!(sink.note_ons().len(), sink.note_offs().len());
    }
}
