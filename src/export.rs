//! Offline rendering to Standard MIDI Files.
//!
//! [`TimedSink`] records what the sequencers send, stamped with the
//! scheduler tick at which each call was made. Since the scheduler ticks at
//! 480 per quarter note, the recording maps one-to-one onto a metrical SMF.

use std::path::Path;

use anyhow::{Context, Result};
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};

use crate::clock::TICKS_PER_QUARTER;
use crate::midi::{CC_BANK_SELECT_LSB, CC_BANK_SELECT_MSB};
use crate::scheduler::SharedScheduler;
use crate::sink::{NoteSink, SinkEvent};

/// A sink event and the tick it happened at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub tick: u64,
    pub event: SinkEvent,
}

/// Records sink calls against the scheduler clock.
pub struct TimedSink {
    scheduler: SharedScheduler,
    events: Vec<TimedEvent>,
}

impl TimedSink {
    pub fn new(scheduler: SharedScheduler) -> Self {
        Self {
            scheduler,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    fn push(&mut self, event: SinkEvent) {
        let tick = self.scheduler.current_tick();
        self.events.push(TimedEvent { tick, event });
    }

    /// Single-track SMF at 480 PPQ with a tempo meta event up front.
    pub fn to_smf(&self, bpm: f64) -> Smf<'static> {
        let mut track = Vec::with_capacity(self.events.len() * 2 + 2);
        let micros_per_quarter = (60_000_000.0 / bpm.max(1.0)).round() as u32;
        track.push(TrackEvent {
            delta: u28::from_int_lossy(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from_int_lossy(
                micros_per_quarter,
            ))),
        });

        let max_delta = u28::max_value().as_int() as u64;
        let mut last_tick = 0;
        for timed in &self.events {
            let mut delta = timed.tick.saturating_sub(last_tick);
            last_tick = last_tick.max(timed.tick);
            for (channel, message) in midi_messages(timed.event) {
                track.push(TrackEvent {
                    delta: u28::from_int_lossy(delta.min(max_delta) as u32),
                    kind: TrackEventKind::Midi {
                        channel: u4::from_int_lossy(channel),
                        message,
                    },
                });
                delta = 0;
            }
        }

        track.push(TrackEvent {
            delta: u28::from_int_lossy(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });

        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::from_int_lossy(TICKS_PER_QUARTER as u16)),
        ));
        smf.tracks.push(track);
        smf
    }

    pub fn to_bytes(&self, bpm: f64) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.to_smf(bpm)
            .write_std(&mut bytes)
            .context("Failed to encode MIDI file")?;
        Ok(bytes)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, bpm: f64) -> Result<()> {
        let path = path.as_ref();
        self.to_smf(bpm)
            .save(path)
            .with_context(|| format!("Failed to write MIDI file {}", path.display()))
    }
}

fn midi_messages(event: SinkEvent) -> Vec<(u8, MidiMessage)> {
    match event {
        SinkEvent::Program {
            channel,
            bank,
            program,
        } => vec![
            (
                channel,
                MidiMessage::Controller {
                    controller: u7::from_int_lossy(CC_BANK_SELECT_MSB),
                    value: u7::from_int_lossy((bank >> 7) as u8),
                },
            ),
            (
                channel,
                MidiMessage::Controller {
                    controller: u7::from_int_lossy(CC_BANK_SELECT_LSB),
                    value: u7::from_int_lossy(bank as u8),
                },
            ),
            (
                channel,
                MidiMessage::ProgramChange {
                    program: u7::from_int_lossy(program),
                },
            ),
        ],
        SinkEvent::NoteOn {
            channel,
            pitch,
            velocity,
        } => vec![(
            channel,
            MidiMessage::NoteOn {
                key: u7::from_int_lossy(pitch),
                vel: u7::from_int_lossy(velocity),
            },
        )],
        SinkEvent::NoteOff { channel, pitch } => vec![(
            channel,
            MidiMessage::NoteOff {
                key: u7::from_int_lossy(pitch),
                vel: u7::from_int_lossy(0),
            },
        )],
    }
}

impl NoteSink for TimedSink {
    fn program(&mut self, channel: u8, bank: u16, program: u8) {
        self.push(SinkEvent::Program {
            channel,
            bank,
            program,
        });
    }

    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8) {
        self.push(SinkEvent::NoteOn {
            channel,
            pitch,
            velocity,
        });
    }

    fn note_off(&mut self, channel: u8, pitch: u8) {
        self.push(SinkEvent::NoteOff { channel, pitch });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arpeggio::Arpeggiator;
    use crate::scheduler::TickScheduler;
    use crate::sequencer::{Direction, Patch};
    use std::sync::{Arc, Mutex};

    fn render() -> Arc<Mutex<TimedSink>> {
        let sched = Arc::new(TickScheduler::new());
        let sink = Arc::new(Mutex::new(TimedSink::new(sched.clone())));
        let arp = Arpeggiator::new(sched.clone(), sink.clone(), 1, Patch::new(0, 40));
        arp.set_notes(vec![60, 64, 67]);
        arp.set_rhythm(240, 0.5);
        arp.set_direction(Direction::Up);
        arp.start().unwrap();
        sched.advance_to(719);
        arp.stop();
        sink
    }

    #[test]
    fn test_events_are_stamped_with_scheduler_ticks() {
        let sink = render();
        let sink = sink.lock().unwrap();
        let stamps: Vec<(u64, SinkEvent)> =
            sink.events().iter().map(|e| (e.tick, e.event)).collect();
        assert_eq!(
            stamps[1..],
            [
                (0, SinkEvent::NoteOn { channel: 1, pitch: 60, velocity: 80 }),
                (120, SinkEvent::NoteOff { channel: 1, pitch: 60 }),
                (120, SinkEvent::NoteOn { channel: 1, pitch: 64, velocity: 80 }),
                (240, SinkEvent::NoteOff { channel: 1, pitch: 64 }),
                (240, SinkEvent::NoteOn { channel: 1, pitch: 67, velocity: 80 }),
                (360, SinkEvent::NoteOff { channel: 1, pitch: 67 }),
                (360, SinkEvent::NoteOn { channel: 1, pitch: 60, velocity: 80 }),
                (480, SinkEvent::NoteOff { channel: 1, pitch: 60 }),
                (480, SinkEvent::NoteOn { channel: 1, pitch: 64, velocity: 80 }),
                (600, SinkEvent::NoteOff { channel: 1, pitch: 64 }),
                (600, SinkEvent::NoteOn { channel: 1, pitch: 67, velocity: 80 }),
                // forced by stop()
                (719, SinkEvent::NoteOff { channel: 1, pitch: 67 }),
            ]
        );
    }

    #[test]
    fn test_smf_parses_back() {
        let sink = render();
        let bytes = sink.lock().unwrap().to_bytes(100.0).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        assert_eq!(smf.header.format, Format::SingleTrack);
        assert_eq!(smf.header.timing, Timing::Metrical(u15::from_int_lossy(480)));
        assert_eq!(smf.tracks.len(), 1);

        let track = &smf.tracks[0];
        assert_eq!(
            track[0].kind,
            TrackEventKind::Meta(MetaMessage::Tempo(u24::from_int_lossy(600_000)))
        );
        assert_eq!(
            track.last().map(|e| e.kind),
            Some(TrackEventKind::Meta(MetaMessage::EndOfTrack))
        );

        let mut tick = 0;
        let mut ons = Vec::new();
        let mut program = None;
        for event in track.iter() {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Midi { channel, message } = event.kind {
                assert_eq!(channel.as_int(), 1);
                match message {
                    MidiMessage::NoteOn { key, .. } => ons.push((tick, key.as_int())),
                    MidiMessage::ProgramChange { program: p } => program = Some(p.as_int()),
                    _ => {}
                }
            }
        }
        assert_eq!(program, Some(40));
        assert_eq!(
            ons,
            vec![(0, 60), (120, 64), (240, 67), (360, 60), (480, 64), (600, 67)]
        );
        assert_eq!(tick, 719);
    }

    #[test]
    fn test_save_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.mid");
        render().lock().unwrap().save(&path, 120.0).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"MThd");
    }
}
