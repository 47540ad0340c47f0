//! MIDI protocol constants, message builders, and the hardware output sink.
//!
//! The real-time constants drive [`MidiClockFollower`](crate::clock::MidiClockFollower);
//! the channel-message builders are shared by [`MidiOut`] and the SMF export.

use anyhow::{anyhow, Result};
use log::{info, warn};
use midir::{MidiOutput, MidiOutputConnection};

use crate::sink::NoteSink;

/// MIDI Clock tick - sent 24 times per quarter note (24 ppqn)
pub const MIDI_CLOCK: u8 = 0xF8;

/// MIDI Start - resets position to beginning and starts playback
pub const MIDI_START: u8 = 0xFA;

/// MIDI Continue - resumes playback from current position
pub const MIDI_CONTINUE: u8 = 0xFB;

/// MIDI Stop - stops playback, maintains current position
pub const MIDI_STOP: u8 = 0xFC;

/// Number of MIDI clock pulses per quarter note (beat)
pub const CLOCKS_PER_BEAT: u64 = 24;

/// Beats per bar (assuming 4/4 time signature)
pub const BEATS_PER_BAR: u64 = 4;

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;

pub const CC_BANK_SELECT_MSB: u8 = 0;
pub const CC_BANK_SELECT_LSB: u8 = 32;

/// Highest valid 7-bit data value.
pub const DATA_MAX: u8 = 0x7F;

pub fn note_on_message(channel: u8, pitch: u8, velocity: u8) -> [u8; 3] {
    [
        NOTE_ON | (channel & 0x0F),
        pitch & DATA_MAX,
        velocity & DATA_MAX,
    ]
}

pub fn note_off_message(channel: u8, pitch: u8) -> [u8; 3] {
    [NOTE_OFF | (channel & 0x0F), pitch & DATA_MAX, 0]
}

/// Bank select (MSB, LSB) followed by a program change.
///
/// Banks are 14-bit, so a soundfont-style percussion bank 128 becomes
/// MSB 1 / LSB 0.
pub fn program_messages(channel: u8, bank: u16, program: u8) -> [[u8; 3]; 3] {
    let status = CONTROL_CHANGE | (channel & 0x0F);
    [
        [status, CC_BANK_SELECT_MSB, ((bank >> 7) as u8) & DATA_MAX],
        [status, CC_BANK_SELECT_LSB, (bank as u8) & DATA_MAX],
        [PROGRAM_CHANGE | (channel & 0x0F), program & DATA_MAX, 0],
    ]
}

/// Scientific pitch name, e.g. 60 -> "C4".
pub fn note_name(note: u8) -> String {
    let names = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i8 - 1;
    let name = names[(note % 12) as usize];
    format!("{}{}", name, octave)
}

/// Wrapper for a MIDI output connection.
pub struct MidiOut {
    connection: MidiOutputConnection,
    pub port_name: String,
}

impl MidiOut {
    /// Connect to the first port whose name contains `preferred`, falling
    /// back to an IAC Driver port (macOS) and then to the first port.
    pub fn new(preferred: Option<&str>) -> Result<Self> {
        let midi_out = MidiOutput::new("arpeggiator-out")
            .map_err(|e| anyhow!("Failed to create MIDI output: {}", e))?;

        let ports = midi_out.ports();
        if ports.is_empty() {
            return Err(anyhow!("No MIDI output ports found"));
        }

        let names: Vec<String> = ports
            .iter()
            .map(|p| midi_out.port_name(p).unwrap_or_else(|_| "Unknown".to_string()))
            .collect();
        let find = |needle: &str| names.iter().position(|n| n.contains(needle));
        let port_idx = preferred
            .and_then(|wanted| {
                let found = find(wanted);
                if found.is_none() {
                    warn!("MIDI output {:?} not found, falling back", wanted);
                }
                found
            })
            .or_else(|| find("IAC"))
            .unwrap_or(0);

        let port_name = names[port_idx].clone();
        let connection = midi_out
            .connect(&ports[port_idx], "arpeggiator-out")
            .map_err(|e| anyhow!("Failed to connect MIDI output: {}", e))?;

        info!("MIDI Output connected to: {}", port_name);
        Ok(Self {
            connection,
            port_name,
        })
    }

    /// Send a raw MIDI message.
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        self.connection
            .send(message)
            .map_err(|e| anyhow!("Failed to send MIDI: {}", e))
    }

    /// Note sinks have no error channel, so send failures are logged.
    fn send_logged(&mut self, message: &[u8]) {
        if let Err(e) = self.send(message) {
            warn!("{} ({:02X?})", e, message);
        }
    }
}

impl NoteSink for MidiOut {
    fn program(&mut self, channel: u8, bank: u16, program: u8) {
        let [msb, lsb, change] = program_messages(channel, bank, program);
        self.send_logged(&msb);
        self.send_logged(&lsb);
        self.send_logged(&change[..2]);
    }

    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8) {
        self.send_logged(&note_on_message(channel, pitch, velocity));
    }

    fn note_off(&mut self, channel: u8, pitch: u8) {
        self.send_logged(&note_off_message(channel, pitch));
    }
}
