//! Configuration persistence for arpeggiator voices.
//!
//! Saves and loads a tempo, an output device and a list of voices to/from
//! YAML files, and builds ready-to-start sequencers from them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::arpeggio::Arpeggiator;
use crate::jazz::JazzArpeggiator;
use crate::scheduler::SharedScheduler;
use crate::sequencer::{Direction, Patch, SequencerError, Voice, DEFAULT_VELOCITY};
use crate::sink::SharedSink;

/// Which note generator a voice uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Basic,
    Jazz,
}

/// Configuration for a single voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub style: Style,
    /// MIDI channel (1-16, stored as 1-indexed for human readability)
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default)]
    pub bank: u16,
    #[serde(default = "default_program")]
    pub program: u8,
    #[serde(default)]
    pub notes: Vec<u8>,
    /// Ticks per step at 480 ticks per quarter note
    #[serde(default = "default_note_grid")]
    pub note_grid: u64,
    #[serde(default = "default_note_len_ratio")]
    pub note_len_ratio: f64,
    /// "up", "down" or "updown". Kept as text so a typo is reported with
    /// the voice instead of failing the whole file.
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default = "default_velocity")]
    pub velocity: u8,
    /// Seed for jazz embellishments (random when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_channel() -> u8 {
    1 // 1-indexed for YAML readability
}

fn default_program() -> u8 {
    Patch::default().program
}

fn default_note_grid() -> u64 {
    240
}

fn default_note_len_ratio() -> f64 {
    1.0
}

fn default_direction() -> String {
    Direction::Up.name().to_string()
}

fn default_velocity() -> u8 {
    DEFAULT_VELOCITY
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            style: Style::default(),
            channel: default_channel(),
            bank: 0,
            program: default_program(),
            notes: Vec::new(),
            note_grid: default_note_grid(),
            note_len_ratio: default_note_len_ratio(),
            direction: default_direction(),
            velocity: default_velocity(),
            seed: None,
        }
    }
}

impl VoiceConfig {
    /// 0-indexed channel for the wire.
    pub fn midi_channel(&self) -> u8 {
        self.channel.clamp(1, 16) - 1
    }

    pub fn patch(&self) -> Patch {
        Patch::new(self.bank, self.program)
    }

    pub fn direction(&self) -> Result<Direction, SequencerError> {
        self.direction.parse()
    }

    /// Build a configured, stopped voice.
    pub fn build(
        &self,
        scheduler: &SharedScheduler,
        sink: &SharedSink,
    ) -> Result<Box<dyn Voice>, SequencerError> {
        let direction = self.direction()?;
        let (scheduler, sink) = (scheduler.clone(), sink.clone());
        let (channel, patch) = (self.midi_channel(), self.patch());

        let voice: Box<dyn Voice> = match (self.style, self.seed) {
            (Style::Basic, _) => Box::new(Arpeggiator::new(scheduler, sink, channel, patch)),
            (Style::Jazz, Some(seed)) => Box::new(JazzArpeggiator::with_seed(
                scheduler, sink, channel, patch, seed,
            )),
            (Style::Jazz, None) => Box::new(JazzArpeggiator::new(scheduler, sink, channel, patch)),
        };
        voice.set_notes(self.notes.clone());
        voice.set_rhythm(self.note_grid, self.note_len_ratio);
        voice.set_direction(direction);
        voice.set_velocity(self.velocity);
        Ok(voice)
    }
}

/// Complete arpeggiator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpConfig {
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    /// MIDI output device name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
    #[serde(default)]
    pub voices: Vec<VoiceConfig>,
}

fn default_bpm() -> f64 {
    120.0
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            bpm: default_bpm(),
            output_device: None,
            voices: vec![
                VoiceConfig {
                    notes: vec![60, 64, 67, 72],
                    ..VoiceConfig::default()
                },
                VoiceConfig {
                    style: Style::Jazz,
                    channel: 2,
                    program: 65,
                    notes: vec![62, 65, 69, 72],
                    note_grid: 120,
                    ..VoiceConfig::default()
                },
            ],
        }
    }
}

impl ArpConfig {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        let project_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        project_dir.join("arp_config.yaml")
    }

    /// Load configuration from a YAML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML {}", path.display()))
    }

    /// Save configuration to a YAML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Build every voice, failing on the first invalid one.
    pub fn build_voices(
        &self,
        scheduler: &SharedScheduler,
        sink: &SharedSink,
    ) -> Result<Vec<Box<dyn Voice>>> {
        self.voices
            .iter()
            .enumerate()
            .map(|(i, voice)| {
                voice
                    .build(scheduler, sink)
                    .with_context(|| format!("voice {} (channel {})", i + 1, voice.channel))
            })
            .collect()
    }
}
