//! Command-line entry point.
//!
//! `run` starts the engine with the mock source and forwards stdin key
//! commands to the control surface; `convert` unpacks a saved `images.bin`
//! into TIFFs. Exit code 0 on a normal run, 1 on a fatal initialization
//! error (missing image directory, no valid images).

use anyhow::Result;
use clap::{Parser, Subcommand};
use cyto_daq::config::AppConfig;
use cyto_daq::engine::{keys, Engine};
use cyto_daq::observer::EngineObserver;
use cyto_daq::{convert, logging, FrameView};
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cyto_daq", about = "Soft-real-time imaging pipeline for deformability cytometry")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the acquisition pipeline against a directory of images.
    Run {
        /// Directory of grayscale frames for the mock source. Falls back to
        /// the MIB_IMAGE_DIR environment variable.
        #[arg(long)]
        image_dir: Option<PathBuf>,
        /// Configuration file; created with defaults when missing.
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Convert a saved images.bin into numbered TIFF files.
    Convert {
        images_bin: PathBuf,
        out_dir: PathBuf,
    },
}

/// Forwards engine status and error events to the log.
struct ConsoleObserver;

impl EngineObserver for ConsoleObserver {
    fn on_frame(&self, _frame: &FrameView<'_>) {}
    fn on_status(&self, message: &str) {
        tracing::info!(status = message, "engine");
    }
    fn on_error(&self, code: i32, message: &str) {
        tracing::error!(code, message, "engine");
    }
}

fn main() -> ExitCode {
    if let Err(err) = logging::init("info") {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    match dispatch_command() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn dispatch_command() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { image_dir, config } => run(image_dir, config),
        Command::Convert { images_bin, out_dir } => {
            let count = convert::convert_to_tiff(&images_bin, &out_dir)?;
            tracing::info!(count, "conversion complete");
            Ok(())
        }
    }
}

fn run(image_dir: Option<PathBuf>, config_path: PathBuf) -> Result<()> {
    let config = AppConfig::load_or_init(&config_path)?;
    let mut engine = Engine::new(config, config_path);
    engine.subscribe(Arc::new(ConsoleObserver));

    let image_dir = image_dir.or_else(|| std::env::var_os("MIB_IMAGE_DIR").map(PathBuf::from));
    if let Some(dir) = image_dir {
        engine.set_param("image_dir", dir.to_string_lossy().as_ref())?;
    }
    engine.start()?;

    tracing::info!(
        "keys: esc = stop, space = pause + background, a/d = navigate, q = clear scatter, s = snapshot"
    );
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let Some(code) = key_code(line.trim()) else {
            continue;
        };
        engine.on_key(code);
        if code == keys::ESC {
            break;
        }
        if let Some(state) = engine.state() {
            if state.is_done() {
                break;
            }
        }
    }
    engine.stop();
    Ok(())
}

/// Map a stdin line to a control key code.
fn key_code(input: &str) -> Option<i32> {
    match input {
        "esc" | "quit" | "exit" => Some(keys::ESC),
        "space" | "pause" => Some(keys::SPACE),
        "" => None,
        other => other.chars().next().map(|c| c as i32),
    }
}
