// src/main.rs
mod acquisition;
mod config;
mod engine;
mod gui;
mod recorder;
mod types;

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use eframe::egui;
use log::{error, info, warn};

use crate::acquisition::{render_histogram_png, render_probe_png, CancelToken, LoopExit, PlotStyle};
use crate::config::Settings;
use crate::engine::ProgressSink;
use crate::types::Backend;

#[derive(Parser, Debug)]
#[command(name = "scopegate", version, about = "Threshold-gated charge and timing histograms")]
struct Cli {
    /// Key/value configuration file; built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated digitizer instead of a PicoScope
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Live histogram window (default)
    Gui,
    /// Headless acquisition; press q, Esc or Ctrl-C to stop
    Run {
        /// Stop after this many captures
        #[arg(short = 'n', long)]
        captures: Option<u64>,
        /// Write the final histogram to this PNG
        #[arg(long)]
        histogram: Option<PathBuf>,
    },
    /// Take one capture and plot the traces with their gates
    Probe {
        #[arg(short, long, default_value = "probe.png")]
        output: PathBuf,
    },
    /// Print the resolved configuration and any problems with it
    Check,
}

fn init_logging(raw_terminal: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if raw_terminal {
        // raw 模式下需要手动回车
        builder.format(|buf, record| {
            write!(buf, "[{} {}] {}\r\n", record.level(), record.target(), record.args())
        });
    }
    builder.init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => {
            let settings = Settings::load(path)
                .with_context(|| format!("cannot load configuration {}", path.display()))?;
            info!("Configuration loaded from {}", path.display());
            Ok(settings)
        }
        None => Ok(Settings::default()),
    }
}

/// Restores cooked mode however the headless run ends.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        match terminal::enable_raw_mode() {
            Ok(()) => Some(RawModeGuard),
            Err(err) => {
                warn!("keyboard stop unavailable: {err}");
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

fn is_quit_key(code: KeyCode, modifiers: KeyModifiers) -> bool {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

/// Watches the keyboard until a quit key arrives or the run ends by itself.
fn spawn_quit_listener(cancel: CancelToken) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("quit-listener".to_owned())
        .spawn(move || {
            while !cancel.is_cancelled() {
                match event::poll(Duration::from_millis(100)) {
                    Ok(true) => {
                        if let Ok(Event::Key(key)) = event::read() {
                            if key.kind == KeyEventKind::Press && is_quit_key(key.code, key.modifiers) {
                                info!("⏹ Stop requested");
                                cancel.cancel();
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!("keyboard polling failed: {err}");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

/// SIGINT and SIGTERM end the run through the same token as the quit keys.
fn on_termination(cancel: &CancelToken) {
    if !cancel.is_cancelled() {
        info!("⏹ Termination signal received");
        cancel.cancel();
    }
}

fn install_signal_handler(cancel: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || on_termination(&cancel)).context("cannot install the signal handler")
}

fn run_headless(settings: &Settings, backend: Backend, captures: Option<u64>, histogram: Option<PathBuf>) -> Result<()> {
    let device = engine::open_device(backend)?;
    let mut aggregator = engine::start(settings, device, ProgressSink::default(), captures)?;
    install_signal_handler(aggregator.cancel_token().clone())?;

    let interactive = std::io::stdin().is_terminal();
    let guard = if interactive {
        RawModeGuard::enable()
    } else {
        warn!("stdin is not a terminal; the run stops only on its own");
        None
    };
    let listener = if guard.is_some() {
        Some(spawn_quit_listener(aggregator.cancel_token().clone())?)
    } else {
        None
    };

    let summary = aggregator.run();
    if let Some(listener) = listener {
        let _ = listener.join();
    }
    drop(guard);
    let summary = summary?;

    if let Some(path) = histogram {
        let png = render_histogram_png(
            &aggregator.histogram().edges(),
            &aggregator.histogram().counts(),
            aggregator.axis().max(),
            settings.mode.quantity(),
            PlotStyle::default(),
        )?;
        std::fs::write(&path, png).with_context(|| format!("cannot write {}", path.display()))?;
        info!("💾 Histogram saved to {}", path.display());
    }

    info!(
        "■ {} captures, {} timeouts, {} histogrammed",
        summary.captured, summary.timeouts, summary.received
    );
    match summary.exit {
        LoopExit::Failed(err) => Err(err).context("acquisition failed"),
        LoopExit::Cancelled | LoopExit::Completed => Ok(()),
    }
}

fn run_probe(settings: &Settings, backend: Backend, output: PathBuf) -> Result<()> {
    let device = engine::open_device(backend)?;
    let probe = engine::probe(settings, device)?;
    info!("🔍 {}", acquisition::plot::describe(probe.measurement.as_ref()));
    let png = render_probe_png(&probe, PlotStyle::default())?;
    std::fs::write(&output, png).with_context(|| format!("cannot write {}", output.display()))?;
    info!("💾 Probe plot saved to {}", output.display());
    Ok(())
}

fn run_check(settings: &Settings) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    let problems = settings.validate();
    if problems.is_empty() {
        println!("configuration OK");
        return Ok(());
    }
    for problem in &problems {
        println!("  - {problem}");
    }
    bail!("{} configuration problem(s)", problems.len())
}

fn run_gui(settings: Settings, backend: Backend) -> Result<()> {
    let viewport = egui::ViewportBuilder::default()
        .with_inner_size([1280.0, 800.0])
        .with_min_inner_size([900.0, 560.0])
        .with_title("scopegate");
    let options = eframe::NativeOptions {
        viewport,
        ..Default::default()
    };
    eframe::run_native(
        "scopegate",
        options,
        Box::new(move |cc| {
            cc.egui_ctx.set_visuals(egui::Visuals::dark());
            Box::new(gui::ScopegateApp::new(settings, backend))
        }),
    )
    .map_err(|e| anyhow::anyhow!("GUI failed: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let headless = matches!(cli.command, Some(Command::Run { .. }));
    init_logging(headless && std::io::stdin().is_terminal());

    let settings = load_settings(cli.config.as_ref())?;
    let backend = if cli.simulate {
        Backend::Simulated
    } else {
        Backend::PicoScope
    };

    let result = match cli.command.unwrap_or(Command::Gui) {
        Command::Gui => run_gui(settings, backend),
        Command::Run { captures, histogram } => run_headless(&settings, backend, captures, histogram),
        Command::Probe { output } => run_probe(&settings, backend, output),
        Command::Check => run_check(&settings),
    };
    if let Err(err) = &result {
        error!("{err:#}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_keys() {
        assert!(is_quit_key(KeyCode::Char('q'), KeyModifiers::NONE));
        assert!(is_quit_key(KeyCode::Esc, KeyModifiers::NONE));
        assert!(is_quit_key(KeyCode::Char('c'), KeyModifiers::CONTROL));
        assert!(!is_quit_key(KeyCode::Char('c'), KeyModifiers::NONE));
        assert!(!is_quit_key(KeyCode::Enter, KeyModifiers::NONE));
    }

    #[test]
    fn termination_stops_and_closes_the_device() {
        use crate::acquisition::SimulatedScope;

        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.output.data_dir = dir.path().to_path_buf();
        settings.threshold_mv = -50.0;
        let scope = SimulatedScope::new(5);
        let released = scope.release_counter();
        let mut aggregator =
            engine::start(&settings, Box::new(scope), ProgressSink::default(), None).unwrap();

        let token = aggregator.cancel_token().clone();
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            on_termination(&token);
        });
        let summary = aggregator.run().unwrap();
        signaller.join().unwrap();

        assert!(matches!(summary.exit, LoopExit::Cancelled));
        assert_eq!(summary.received, summary.captured);
        assert!(released.stops() >= 1);
        assert_eq!(released.closes(), 1);
        assert!(!aggregator.is_running());
    }

    #[test]
    fn cli_defaults_to_gui() {
        let cli = Cli::parse_from(["scopegate", "--simulate"]);
        assert!(cli.simulate);
        assert!(cli.command.is_none());
    }

    #[test]
    fn run_accepts_capture_limit() {
        let cli = Cli::parse_from(["scopegate", "run", "-n", "25", "--config", "a.cfg"]);
        match cli.command {
            Some(Command::Run { captures, histogram }) => {
                assert_eq!(captures, Some(25));
                assert!(histogram.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config, Some(PathBuf::from("a.cfg")));
    }
}
