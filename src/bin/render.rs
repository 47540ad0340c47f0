//! Render - Write configured voices to a Standard MIDI File
//!
//! Usage: cargo run --bin render -- [--config <path>] [--bars <n>] [--out <file.mid>]
//!
//! Runs the scheduler offline for the requested number of 4/4 bars; no MIDI
//! hardware is touched. Jazz voices without a seed render differently on
//! every run.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::info;

use arpeggiator::clock::TICKS_PER_QUARTER;
use arpeggiator::config::ArpConfig;
use arpeggiator::export::TimedSink;
use arpeggiator::midi::BEATS_PER_BAR;
use arpeggiator::{SharedScheduler, SharedSink, TickScheduler};

const DEFAULT_BARS: u64 = 8;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let config_path = value_of("--config")
        .map(PathBuf::from)
        .unwrap_or_else(ArpConfig::default_path);
    let bars = match value_of("--bars") {
        Some(s) => s.parse().with_context(|| format!("invalid --bars {:?}", s))?,
        None => DEFAULT_BARS,
    };
    let out_path = value_of("--out")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("arpeggio.mid"));

    let config = ArpConfig::load(&config_path)?;

    let scheduler = Arc::new(TickScheduler::new());
    let shared: SharedScheduler = scheduler.clone();
    let recorder = Arc::new(Mutex::new(TimedSink::new(shared.clone())));
    let sink: SharedSink = recorder.clone();
    let voices = config.build_voices(&shared, &sink)?;

    for voice in &voices {
        voice.start()?;
    }

    let end = bars * BEATS_PER_BAR * TICKS_PER_QUARTER;
    let ran = scheduler.advance_to(end);
    for voice in &voices {
        voice.stop();
    }

    let recorder = recorder
        .lock()
        .map_err(|_| anyhow::anyhow!("recorder lock poisoned"))?;
    recorder.save(&out_path, config.bpm)?;
    info!(
        "Rendered {} bars ({} commands, {} events) to {}",
        bars,
        ran,
        recorder.events().len(),
        out_path.display()
    );
    Ok(())
}
