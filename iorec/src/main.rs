/*!
# iorec

Captures one signal bit from the PRU's shared-memory sample ring and
stores it as a packed bitstream.

## Features

- Polls the PRU ring, unwrapping new data and detecting overruns
- Packed one-bit-per-sample output, or raw 32-bit samples
- Self-test mode against the counter-writing PRU program
- Software producer for running off-target
- Capture summary on exit, optionally as JSON

## Usage

### Capture
```bash
sudo iorec capture.bin
```

### Self-test
```bash
sudo iorec --test-mode
```

### Off-target run
```bash
iorec --simulate --max-bytes 16777216 capture.bin
```

### Generate a configuration file
```bash
iorec config --output iorec.toml
```
*/

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{BitPacker, RawSampleWriter};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod coprocessor;
mod sim;

use capture::{Acquisition, SampleSink, SelfTestVerifier};
use config::{AppConfig, OutputFormat};
use coprocessor::{Coprocessor, UioPruss};
use sim::SimulatedCoprocessor;

const DEFAULT_CONFIG_PATH: &str = "iorec.toml";

#[derive(Parser)]
#[command(name = "iorec")]
#[command(about = "PRU single-bit signal capture")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Output file for the captured bitstream
    output: Option<PathBuf>,

    /// Load the counter program and verify every sample instead of recording
    #[arg(long)]
    test_mode: bool,

    /// Throttle value handed to the PRU program
    #[arg(long, value_name = "CHOKE")]
    capture_choke: Option<u32>,

    /// Stop after this many bytes have been read from the ring
    #[arg(long, value_name = "BYTES")]
    max_bytes: Option<u64>,

    /// Store raw 32-bit samples instead of the packed signal bit
    #[arg(long)]
    raw: bool,

    /// Use the software producer instead of the PRU
    #[arg(long)]
    simulate: bool,

    /// Also write the capture summary as JSON
    #[arg(long, value_name = "FILE")]
    summary_json: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Some(Commands::Config { ref output }) => generate_config_file(output),
        None => run_capture(&cli),
    }
}

/// Load the configuration file and apply command-line overrides
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = if cli.config.exists() {
        info!("📄 Loading configuration from {}", cli.config.display());
        AppConfig::load_from_file(&cli.config)?
    } else if cli.config == Path::new(DEFAULT_CONFIG_PATH) {
        AppConfig::new()
    } else {
        anyhow::bail!("Configuration file not found: {}", cli.config.display());
    };

    if let Some(choke) = cli.capture_choke {
        config.capture.capture_choke = choke;
    }
    if let Some(max_bytes) = cli.max_bytes {
        config.capture.max_bytes = Some(max_bytes);
    }
    if cli.raw {
        config.capture.output_format = OutputFormat::Raw;
    }

    Ok(config)
}

/// Choose where samples go for this run
fn open_sink(cli: &Cli, config: &AppConfig) -> Result<SampleSink<File>> {
    if cli.test_mode {
        if let Some(output) = &cli.output {
            warn!("⚠️ Self-test mode records nothing; ignoring {}", output.display());
        }
        return Ok(SampleSink::SelfTest(SelfTestVerifier::new()));
    }

    let Some(output) = &cli.output else {
        warn!("⚠️ No output file given; samples will be discarded");
        return Ok(SampleSink::Discard);
    };

    let file = File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    let batch = config.capture.output_batch_words.max(1);

    println!("💾 Output file: {} ({:?})", output.display(), config.capture.output_format);
    Ok(match config.capture.output_format {
        OutputFormat::Packed => SampleSink::Packed(BitPacker::with_batch_words(file, batch)),
        OutputFormat::Raw => SampleSink::Raw(RawSampleWriter::new(file, batch)),
    })
}

/// Run one capture with the PRU or the simulator
fn run_capture(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let sink = open_sink(cli, &config)?;

    let acquisition = Acquisition::new(config.capture.signal_bit, config.capture.max_bytes);

    // Set up Ctrl+C handler
    let running = acquisition.get_running_flag();
    ctrlc::set_handler(move || {
        println!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    if cli.simulate {
        println!("🚀 Starting capture (simulated producer)");
        let mut coprocessor = SimulatedCoprocessor::from_config(&config.simulation, &config.capture, cli.test_mode)
            .context("Invalid simulation settings")?;
        run_with(cli, &acquisition, &mut coprocessor, sink)
    } else {
        println!("🚀 Starting capture (PRU)");
        let mut coprocessor = UioPruss::open(&config.hardware, &config.capture, cli.test_mode)
            .context("Failed to set up the PRU")?;
        run_with(cli, &acquisition, &mut coprocessor, sink)
    }
}

fn run_with<C: Coprocessor>(
    cli: &Cli,
    acquisition: &Acquisition,
    coprocessor: &mut C,
    sink: SampleSink<File>,
) -> Result<()> {
    let report = acquisition
        .run(coprocessor, sink)
        .context("Failed to start capture")?;

    if let Some(path) = &cli.summary_json {
        let file = File::create(path)
            .with_context(|| format!("Failed to create summary file: {}", path.display()))?;
        report.summary.write_json(BufWriter::new(file))?;
        info!("📝 Summary written to {}", path.display());
    }

    if let Some(e) = report.error {
        return Err(e).context("Capture failed");
    }

    println!("✅ Capture completed");
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: &Path) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("Edit this file to customize your settings, then run:");
    println!("  iorec --config {} <OUTPUT>", output_path.display());

    Ok(())
}
