//! CLI entry point for apdcam-daq
//!
//! - `run`: build a session from a configuration file, drive it with the synthetic
//!   producer until the requested number of shots has been processed, print stats.
//! - `check-config`: load and validate a configuration file.
//!
//! # Usage
//!
//! ```bash
//! apdcam-daq run --config config/apdcam_daq.toml --shots 100000 --output-dir /tmp/dump
//! apdcam-daq check-config --config config/apdcam_daq.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use apdcam_daq::config::DaqConfig;
use apdcam_daq::error::DaqError;
use apdcam_daq::processor::ProcessorFactory;
use apdcam_daq::simulator::{ProducerConfig, SyntheticProducer};
use apdcam_daq::{tracing_init, AcquisitionSession, ChannelBufferSet, Handshake, InProcessBackend};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "apdcam-daq")]
#[command(about = "Multi-channel acquisition core with a synthetic producer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an acquisition session against the synthetic producer
    Run {
        /// Configuration file (defaults are used for missing keys)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of shots to produce
        #[arg(long, default_value = "100000")]
        shots: u64,

        /// Override the output directory of every disk dump processor
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            shots,
            output_dir,
        } => run(config.as_deref(), shots, output_dir),
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<DaqConfig> {
    let config = match path {
        Some(path) => DaqConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => DaqConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    let factory = ProcessorFactory::new();
    for (index, definition) in config.processors.iter().enumerate() {
        if definition.r#type != "native" {
            factory.create(
                &definition.r#type,
                &definition.display_name(index),
                &definition.config,
            )?;
        }
    }

    let acquisition = &config.acquisition;
    println!("✅ {} is valid", path.display());
    println!("   Application:      {}", config.application.name);
    println!("   Enabled channels: {}", acquisition.enabled_channels().len());
    println!("   Buffer size:      {} shots", acquisition.sample_buffer_size);
    println!("   Process period:   {} shots", acquisition.process_period);
    println!(
        "   Processors:       {} ({} enabled)",
        config.processors.len(),
        config.enabled_processors().len()
    );
    Ok(())
}

fn run(config_path: Option<&Path>, shots: u64, output_dir: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config_path)?;
    tracing_init::init_from_config(&config)?;

    if let Some(dir) = output_dir {
        for definition in config.processors.iter_mut().filter(|d| d.r#type == "diskdump") {
            if let Some(table) = definition.config.as_table_mut() {
                table.insert(
                    "output_dir".to_string(),
                    toml::Value::String(dir.display().to_string()),
                );
            }
        }
    }

    let acquisition = &config.acquisition;
    let buffers = ChannelBufferSet::allocate(
        acquisition.max_channels,
        &acquisition.enabled_channels(),
        acquisition.sample_buffer_size,
    )?;
    let backend = InProcessBackend::new(buffers, Arc::new(Handshake::new()));

    let mut session = AcquisitionSession::new(Arc::new(backend.clone()));
    ProcessorFactory::new().register_all(&mut session, &config.processors)?;
    session.init()?;
    let mut diagnostics = session.take_diagnostics();

    let participating = session
        .registry()
        .map_or(0, |registry| registry.participating_count());
    let mut producer_config = ProducerConfig::from_acquisition(acquisition, shots);
    producer_config.respect_floor = participating > 0;

    session.start(false)?;
    info!(shots, participating, "Acquisition started");
    let report = SyntheticProducer::new(backend, producer_config)
        .spawn()?
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;
    session.await_finish()?;

    let stats = session.stats();
    println!("📊 Acquisition finished");
    println!("   Shots written:    {}", report.shots_written);
    println!("   Ranges published: {}", report.ranges_published);
    println!("   Producer stalls:  {}", report.stalls);
    println!("   Iterations:       {}", stats.iterations);
    println!("   Processor calls:  {}", stats.invocations);
    println!("   Failures:         {}", stats.failures);
    println!("   Final floor:      {}", stats.last_floor);

    if let Some(receiver) = diagnostics.as_mut() {
        while let Ok(failure) = receiver.try_recv() {
            let (iteration, range) = (failure.iteration, failure.range);
            let error = DaqError::from(failure);
            warn!(
                iteration,
                range = %range,
                recoverable = error.is_recoverable(),
                "{error}"
            );
        }
    }

    if report.stopped_early {
        anyhow::bail!(
            "producer stopped after {} of {} shots",
            report.shots_written,
            shots
        );
    }
    Ok(())
}
