//! Arp CLI - Console player for configured arpeggiator voices
//!
//! Usage: cargo run --bin arp_cli -- [--config <path>] [--duration <secs>] [--follow] [--list]
//!
//! Plays every voice in the config file to a MIDI output and prints each
//! note as it fires. With `--follow` the tempo comes from an external MIDI
//! clock instead of the configured BPM.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::info;
use midir::{MidiInput, MidiInputConnection, MidiOutput};

use arpeggiator::clock::{MidiClockFollower, TempoMap};
use arpeggiator::config::ArpConfig;
use arpeggiator::midi::{note_name, MidiOut};
use arpeggiator::sequencer::NoteCallback;
use arpeggiator::{FiredNote, SharedScheduler, SharedSink, TickScheduler, Voice};

/// Scheduler polling interval.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

struct Args {
    config: PathBuf,
    duration: Option<u64>,
    follow: bool,
    list: bool,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let duration = parse_duration(value_of("--duration"))?;

    Ok(Args {
        config: value_of("--config")
            .map(PathBuf::from)
            .unwrap_or_else(ArpConfig::default_path),
        duration,
        follow: args.iter().any(|a| a == "--follow"),
        list: args.iter().any(|a| a == "--list"),
    })
}

/// Seconds to play for. A value that is not a whole number is an error.
fn parse_duration(value: Option<String>) -> Result<Option<u64>> {
    value
        .map(|s| {
            s.parse::<u64>()
                .with_context(|| format!("invalid --duration {:?}", s))
        })
        .transpose()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = parse_args().and_then(run) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if args.list {
        return list_ports();
    }

    let config = ArpConfig::load(&args.config)?;
    info!(
        "Loaded {} voice(s) from {}",
        config.voices.len(),
        args.config.display()
    );

    let out = MidiOut::new(config.output_device.as_deref())?;
    println!("=== Arpeggiator ===");
    println!("Output: {}", out.port_name);

    let scheduler = Arc::new(TickScheduler::new());
    let shared: SharedScheduler = scheduler.clone();
    let sink: SharedSink = Arc::new(Mutex::new(out));
    let voices = config.build_voices(&shared, &sink)?;

    let printer: NoteCallback = Arc::new(print_note);
    for voice in &voices {
        voice.set_callback(printer.clone());
        voice.start().with_context(|| format!("channel {}", voice.channel() + 1))?;
    }

    println!(
        "\n{:<14} {:<5} {:<6} {:<5} {:<6} {}",
        "TIME", "CH", "NOTE", "VEL", "LEN", "EMBELLISHMENTS"
    );
    println!("{}", "-".repeat(60));

    let done = stop_signal(args.duration);
    let result = if args.follow {
        follow_clock(&scheduler, &done)
    } else {
        free_run(&scheduler, config.bpm, &done);
        Ok(())
    };

    stop_all(&voices);
    result
}

fn list_ports() -> Result<()> {
    let midi_out = MidiOutput::new("arpeggiator-list")
        .map_err(|e| anyhow!("Failed to create MIDI output: {}", e))?;
    println!("Available MIDI output ports:");
    for (i, port) in midi_out.ports().iter().enumerate() {
        let name = midi_out.port_name(port).unwrap_or_else(|_| "Unknown".to_string());
        println!("  {}: {}", i, name);
    }
    Ok(())
}

fn print_note(note: &FiredNote) {
    let e = note.embellishments;
    let mut tags = Vec::new();
    if e.accent {
        tags.push("accent".to_string());
    }
    if e.approach {
        tags.push("approach".to_string());
    }
    if e.hold {
        tags.push("hold".to_string());
    }
    if let Some(jump) = e.back_jump {
        tags.push(format!("back {}", jump));
    }

    println!(
        "{:<14} {:<5} {:<6} {:<5} {:<6} {}",
        Local::now().format("%H:%M:%S%.3f"),
        note.channel + 1,
        note_name(note.pitch),
        note.velocity,
        note.duration,
        tags.join(", ")
    );
    // Flush to ensure immediate output
    let _ = io::stdout().flush();
}

/// Flag raised after `duration` seconds, or when Enter is pressed.
fn stop_signal(duration: Option<u64>) -> Arc<AtomicBool> {
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    match duration {
        Some(secs) => {
            println!("\nPlaying for {} seconds...\n", secs);
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(secs));
                flag.store(true, Ordering::SeqCst);
            });
        }
        None => {
            println!("\nPress Enter to quit (or use --duration <secs>)...\n");
            thread::spawn(move || {
                let mut input = String::new();
                let _ = io::stdin().read_line(&mut input);
                flag.store(true, Ordering::SeqCst);
            });
        }
    }
    done
}

/// Drive the scheduler from the wall clock at a fixed tempo.
fn free_run(scheduler: &TickScheduler, bpm: f64, done: &AtomicBool) {
    let tempo = TempoMap::new(bpm);
    let started = Instant::now();
    while !done.load(Ordering::SeqCst) {
        scheduler.advance_to(tempo.tick_at(started.elapsed().as_secs_f64()));
        thread::sleep(POLL_INTERVAL);
    }
}

/// Drive the scheduler from an external MIDI clock.
fn follow_clock(scheduler: &TickScheduler, done: &AtomicBool) -> Result<()> {
    let follower = MidiClockFollower::new();
    let (_connection, port_name) = connect_clock_input(follower.clone())?;
    println!("Following MIDI clock from: {}", port_name);

    // The follower restarts from zero on every START; the scheduler never
    // goes backwards, so pulses are applied as deltas.
    let mut last_seen = 0;
    let mut last_bpm = 0.0;
    while !done.load(Ordering::SeqCst) {
        let tick = follower.current_tick();
        let delta = if tick < last_seen { tick } else { tick - last_seen };
        last_seen = tick;
        if delta > 0 {
            scheduler.advance_by(delta);
        }

        let bpm = follower.bpm();
        if (bpm - last_bpm).abs() >= 1.0 {
            info!("external clock at {:.1} BPM", bpm);
            last_bpm = bpm;
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

fn connect_clock_input(follower: MidiClockFollower) -> Result<(MidiInputConnection<()>, String)> {
    let midi_in = MidiInput::new("arpeggiator-clock")
        .map_err(|e| anyhow!("Failed to create MIDI input: {}", e))?;

    let ports = midi_in.ports();
    if ports.is_empty() {
        return Err(anyhow!("No MIDI input ports found"));
    }

    // Prefer IAC Driver, otherwise use first port
    let port_idx = ports
        .iter()
        .position(|p| {
            midi_in
                .port_name(p)
                .map(|n| n.contains("IAC"))
                .unwrap_or(false)
        })
        .unwrap_or(0);

    let port = &ports[port_idx];
    let port_name = midi_in.port_name(port).unwrap_or_else(|_| "Unknown".to_string());

    let connection = midi_in
        .connect(
            port,
            "arpeggiator-clock-in",
            move |_timestamp, message, _| {
                follower.handle_midi_message(message);
            },
            (),
        )
        .map_err(|e| anyhow!("Failed to connect MIDI input: {}", e))?;

    Ok((connection, port_name))
}

/// Stopping flushes any sounding note before the output is dropped.
fn stop_all(voices: &[Box<dyn Voice>]) {
    for voice in voices {
        voice.stop();
    }
}
