//! Writes the samples of every enabled channel to disk, one text file per channel.
//!
//! File names come from a pattern in which `%` is replaced by the absolute channel
//! number. Dumping can be sub-sampled and paused at runtime through a
//! [`DiskDumpControl`]; the acquisition itself keeps running while paused so that the
//! shot bookkeeping stays intact. Pausing writes an empty line into every file and
//! resuming writes `# resume: <shot>`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Processor, ShotCursor};
use crate::data::{ChannelBufferSet, ShotRange};

/// Disk dump settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskDumpConfig {
    /// Directory receiving the files. Created on init if missing.
    pub output_dir: PathBuf,
    /// File name pattern; must contain `%`.
    pub filename_pattern: String,
    /// Write shot `i` only if `i % sampling == 0`.
    pub sampling: u32,
}

impl Default for DiskDumpConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            filename_pattern: "channel_data_%.dat".to_string(),
            sampling: 1,
        }
    }
}

impl DiskDumpConfig {
    /// File name for an absolute channel number, `None` if the pattern lacks `%`.
    pub fn file_name(&self, channel: usize) -> Option<PathBuf> {
        let (head, tail) = self.filename_pattern.split_once('%')?;
        Some(self.output_dir.join(format!("{head}{channel}{tail}")))
    }
}

/// Runtime switches of a running [`DiskDump`], usable from any thread.
#[derive(Debug, Clone)]
pub struct DiskDumpControl {
    sampling: Arc<AtomicU32>,
    paused: Arc<AtomicBool>,
}

impl DiskDumpControl {
    /// Stop writing samples (acquisition continues).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume writing samples.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Whether dumping is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Change the sub-sampling factor. Zero is treated as one.
    pub fn set_sampling(&self, sampling: u32) {
        self.sampling.store(sampling.max(1), Ordering::Release);
    }

    /// Current sub-sampling factor.
    pub fn sampling(&self) -> u32 {
        self.sampling.load(Ordering::Acquire)
    }
}

/// Sequential per-channel text dump.
#[derive(Debug)]
pub struct DiskDump {
    name: String,
    config: DiskDumpConfig,
    files: Vec<(usize, BufWriter<File>)>,
    cursor: ShotCursor,
    control: DiskDumpControl,
    previous_pause: bool,
}

impl DiskDump {
    /// Create the processor. Files are opened by `init`.
    pub fn new(name: impl Into<String>, config: DiskDumpConfig) -> Self {
        let control = DiskDumpControl {
            sampling: Arc::new(AtomicU32::new(config.sampling.max(1))),
            paused: Arc::new(AtomicBool::new(false)),
        };
        Self {
            name: name.into(),
            config,
            files: Vec::new(),
            cursor: ShotCursor::new(),
            control,
            previous_pause: false,
        }
    }

    /// Runtime control handle.
    pub fn control(&self) -> DiskDumpControl {
        self.control.clone()
    }

    fn write_marker(&mut self, paused: bool, shot: u64) -> anyhow::Result<()> {
        for (_, file) in &mut self.files {
            if paused {
                writeln!(file)?;
            } else {
                writeln!(file, "# resume: {shot}")?;
            }
        }
        Ok(())
    }
}

impl Processor for DiskDump {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, buffers: &ChannelBufferSet) -> anyhow::Result<()> {
        self.finish()?;

        if !self.config.filename_pattern.contains('%') {
            bail!(
                "filename pattern '{}' does not contain '%'",
                self.config.filename_pattern
            );
        }
        fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {:?}",
                self.config.output_dir
            )
        })?;

        for channel in buffers.enabled() {
            let absolute = channel.info().absolute_channel_number;
            let Some(path) = self.config.file_name(absolute) else {
                bail!("filename pattern lost its '%'");
            };
            let file = File::create(&path)
                .with_context(|| format!("Failed to create dump file {:?}", path))?;
            self.files.push((absolute, BufWriter::new(file)));
        }

        self.cursor.reset();
        self.control.resume();
        self.previous_pause = false;

        info!(
            processor = %self.name,
            files = self.files.len(),
            dir = %self.config.output_dir.display(),
            "Disk dump initialised"
        );
        Ok(())
    }

    fn run(&mut self, buffers: &ChannelBufferSet, range: ShotRange) -> anyhow::Result<u64> {
        for shot in self.cursor.pending(range).shots() {
            let paused = self.control.is_paused();
            if paused != self.previous_pause {
                self.write_marker(paused, shot)?;
                self.previous_pause = paused;
            }
            if paused {
                continue;
            }

            // Re-read every shot: sampling may change while we run.
            let sampling = u64::from(self.control.sampling().max(1));
            if shot % sampling != 0 {
                continue;
            }

            for (channel, file) in &mut self.files {
                if let Some(value) = buffers.read(*channel, shot) {
                    writeln!(file, "{value}")?;
                }
            }
        }
        Ok(self.cursor.advance(range.to))
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        for (channel, mut file) in self.files.drain(..) {
            file.flush()
                .with_context(|| format!("Failed to flush dump of channel {channel}"))?;
        }
        debug!(processor = %self.name, "Disk dump files closed");
        Ok(())
    }

    fn cursor(&self) -> u64 {
        self.cursor.next()
    }
}
