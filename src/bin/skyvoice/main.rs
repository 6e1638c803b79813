//! Terminal entry point: run a live voice call with a status-line UI.

use anyhow::{anyhow, Result};
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use skyvoice::audio::CaptureSource;
use skyvoice::config::AppConfig;
use skyvoice::telemetry::init_tracing;
use skyvoice::terminal::{restore_terminal, TerminalGuard};
use skyvoice::{init_logging, log_debug, start_call, CallEvent, CallSession, SessionState};
use std::io::{self, Write};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const METER_WIDTH: usize = 24;

fn main() {
    let config = match AppConfig::parse_args() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(2);
        }
    };
    init_logging(&config);
    init_tracing(&config);

    if config.list_input_devices {
        list_input_devices();
        return;
    }

    if let Err(err) = run_call_ui(&config) {
        restore_terminal();
        eprintln!("call failed: {err:#}");
        std::process::exit(1);
    }
}

fn list_input_devices() {
    match CaptureSource::list_devices() {
        Ok(names) if names.is_empty() => println!("No audio input devices detected."),
        Ok(names) => {
            println!("Detected audio input devices:");
            for name in names {
                println!("  - {name}");
            }
        }
        Err(err) => println!("Failed to list audio input devices: {err:#}"),
    }
}

fn run_call_ui(config: &AppConfig) -> Result<()> {
    let mut session = start_call(config)?;
    println!(
        "Calling with voice '{}' on model '{}'.",
        config.voice, config.model
    );
    println!("Keys: [m] mute/unmute, [q]/Esc hang up.");

    let guard = TerminalGuard::new();
    guard.enable_raw_mode()?;

    let mut failure: Option<String> = None;
    'call: loop {
        while let Ok(call_event) = session.events().try_recv() {
            match call_event {
                CallEvent::Connected => log_debug("call connected"),
                CallEvent::TurnComplete => log_debug("assistant turn complete"),
                CallEvent::Error(message) => {
                    failure = Some(message);
                    break 'call;
                }
                CallEvent::Ended => break 'call,
            }
        }

        if event::poll(POLL_INTERVAL)? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('m') | KeyCode::Char('M') => {
                        let muted = session.toggle_mute();
                        log_debug(if muted { "muted" } else { "unmuted" });
                    }
                    KeyCode::Char('q') | KeyCode::Esc => break 'call,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        break 'call
                    }
                    _ => {}
                }
            }
        }

        render_status_line(&session)?;
    }

    session.end_call();
    drop(guard);
    println!();

    match failure {
        Some(message) => Err(anyhow!(message)),
        None => {
            println!("Call ended.");
            Ok(())
        }
    }
}

fn render_status_line(session: &CallSession) -> io::Result<()> {
    let percent = session.meter().level_percent();
    let filled = (percent / 100.0 * METER_WIDTH as f32).round() as usize;
    let bar: String = "#".repeat(filled) + &"-".repeat(METER_WIDTH - filled);
    let state = match session.state() {
        SessionState::Connecting => "connecting",
        SessionState::Connected => "on call",
        SessionState::Erroring => "error",
        SessionState::Disconnected => "ended",
    };
    let mute = if session.is_muted() { " [muted]" } else { "" };
    let mut stdout = io::stdout();
    write!(
        stdout,
        "\r mic [{bar}] {:>6.1} dB  {state}{mute}   ",
        session.meter().level_db()
    )?;
    stdout.flush()
}
