//! Arpeggiator - A GUI application for playing two arpeggiator voices.
//!
//! Connects to a MIDI output (preferring IAC Driver on macOS), drives the
//! scheduler from the wall clock and shows transport position and the last
//! note each voice played. Without a MIDI output, notes go to the log.

mod ui;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use iced::time::{self, milliseconds};
use iced::widget::{column, container, text};
use iced::{Center, Element, Fill, Subscription, Theme};
use log::{error, info, warn};

use arpeggiator::clock::{bar_beat, TempoMap};
use arpeggiator::midi::MidiOut;
use arpeggiator::sink::LogSink;
use arpeggiator::{
    Arpeggiator, Direction, FiredNote, JazzArpeggiator, Patch, SequencerError, SharedSink,
    TickScheduler, Voice,
};

use ui::controls::{view_pickers, view_voice_row, NotePreset, RhythmPreset};

/// How often the GUI advances the scheduler.
const TICK_INTERVAL_MS: u64 = 10;

fn main() -> iced::Result {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    iced::application(App::new, App::update, App::view)
        .title("Arpeggiator")
        .subscription(App::subscription)
        .theme(App::theme)
        .run()
}

type LastNote = Arc<Mutex<Option<FiredNote>>>;

struct App {
    scheduler: Arc<TickScheduler>,
    tempo: TempoMap,
    started: Instant,
    arp: Arpeggiator,
    jazz: JazzArpeggiator,
    arp_last: LastNote,
    jazz_last: LastNote,
    notes: NotePreset,
    rhythm: RhythmPreset,
    direction: Direction,
    port_name: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Message {
    Tick,
    ToggleArp,
    ToggleJazz,
    NotesSelected(NotePreset),
    RhythmSelected(RhythmPreset),
    DirectionSelected(Direction),
}

fn record_into(slot: &LastNote) -> impl Fn(&FiredNote) + Send + Sync + 'static {
    let slot = Arc::clone(slot);
    move |note: &FiredNote| {
        if let Ok(mut last) = slot.lock() {
            *last = Some(*note);
        }
    }
}

impl App {
    fn new() -> Self {
        let (sink, port_name): (SharedSink, _) = match MidiOut::new(None) {
            Ok(out) => {
                let name = out.port_name.clone();
                (Arc::new(Mutex::new(out)), Some(name))
            }
            Err(e) => {
                warn!("{}; logging notes instead", e);
                (Arc::new(Mutex::new(LogSink)), None)
            }
        };

        let scheduler = Arc::new(TickScheduler::new());
        let (notes, rhythm, direction) =
            (NotePreset::CMajor, RhythmPreset::Sixteenths, Direction::Up);
        let (grid, ratio) = rhythm.rhythm();

        let arp_last = LastNote::default();
        let arp = Arpeggiator::new(scheduler.clone(), sink.clone(), 0, Patch::new(0, 0));
        arp.set_callback(record_into(&arp_last));

        let jazz_last = LastNote::default();
        let jazz = JazzArpeggiator::new(scheduler.clone(), sink, 1, Patch::new(0, 65));
        jazz.set_callback(record_into(&jazz_last));

        for voice in [&arp as &dyn Voice, &jazz] {
            voice.set_notes(notes.notes());
            voice.set_rhythm(grid, ratio);
            voice.set_direction(direction);
        }

        Self {
            scheduler,
            tempo: TempoMap::default(),
            started: Instant::now(),
            arp,
            jazz,
            arp_last,
            jazz_last,
            notes,
            rhythm,
            direction,
            port_name,
            error: None,
        }
    }

    fn voices(&self) -> [&dyn Voice; 2] {
        [&self.arp, &self.jazz]
    }

    fn update(&mut self, message: Message) {
        match message {
            Message::Tick => {
                let now = self.tempo.tick_at(self.started.elapsed().as_secs_f64());
                self.scheduler.advance_to(now);
            }
            Message::ToggleArp => self.report(self.arp.toggle()),
            Message::ToggleJazz => self.report(self.jazz.toggle()),
            Message::NotesSelected(notes) => {
                self.notes = notes;
                for voice in self.voices() {
                    voice.set_notes(notes.notes());
                }
                info!("notes: {}", notes);
            }
            Message::RhythmSelected(rhythm) => {
                self.rhythm = rhythm;
                let (grid, ratio) = rhythm.rhythm();
                for voice in self.voices() {
                    voice.set_rhythm(grid, ratio);
                }
                info!("rhythm: {}", rhythm);
            }
            Message::DirectionSelected(direction) => {
                self.direction = direction;
                for voice in self.voices() {
                    voice.set_direction(direction);
                }
                info!("direction: {}", direction);
            }
        }
    }

    fn report(&mut self, result: Result<(), SequencerError>) {
        match result {
            Ok(()) => self.error = None,
            Err(e) => {
                error!("{}", e);
                self.error = Some(e.to_string());
            }
        }
    }

    fn view(&self) -> Element<'_, Message> {
        let tick = self.scheduler.now();
        let (bar, beat) = bar_beat(tick);

        let connection_status = match &self.port_name {
            Some(name) => format!("🎵 {}", name),
            None => "❌ No MIDI output (logging notes)".to_string(),
        };

        let last = |slot: &LastNote| slot.lock().ok().and_then(|n| *n);

        let content = column![
            text("Arpeggiator").size(40),
            text(connection_status).size(16),
            text("").size(20),
            text(format!("Bar {} · Beat {}", bar, beat)).size(40),
            text(format!("Tick {} · {:.0} BPM", tick, self.tempo.bpm())).size(16),
            text("").size(10),
            view_voice_row(
                "Arp",
                self.arp.is_playing(),
                last(&self.arp_last),
                Message::ToggleArp
            ),
            view_voice_row(
                "Jazz",
                self.jazz.is_playing(),
                last(&self.jazz_last),
                Message::ToggleJazz
            ),
            text("").size(10),
            view_pickers(
                self.notes,
                self.rhythm,
                self.direction,
                Message::NotesSelected,
                Message::RhythmSelected,
                Message::DirectionSelected,
            ),
            text(self.error.clone().unwrap_or_default())
                .size(14)
                .color(iced::Color::from_rgb(0.9, 0.3, 0.3)),
        ]
        .spacing(6)
        .align_x(Center);

        container(content)
            .width(Fill)
            .height(Fill)
            .center_x(Fill)
            .center_y(Fill)
            .into()
    }

    fn subscription(&self) -> Subscription<Message> {
        time::every(milliseconds(TICK_INTERVAL_MS)).map(|_| Message::Tick)
    }

    fn theme(&self) -> Theme {
        Theme::Dark
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}
