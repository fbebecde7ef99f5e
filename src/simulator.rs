//! Synthetic producer standing in for the camera.
//!
//! Writes a deterministic ramp into every enabled ring, publishes the resident range
//! every `process_period` shots and never overwrites a shot at or above the reported
//! floor. Used by the `run` command and by the integration tests.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::InProcessBackend;
use crate::config::AcquisitionConfig;
use crate::data::{SampleValue, ShotRange};
use crate::error::{AppResult, DaqError};
use crate::handshake::{FloorWait, Handshake};

/// Sample the producer writes for `shot` on `channel`.
pub fn synthetic_sample(shot: u64, channel: usize, bits: u32) -> SampleValue {
    let mask = (1u64 << bits.clamp(1, 16)) - 1;
    (shot.wrapping_add(channel as u64) & mask) as SampleValue
}

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Shots to write before finishing.
    pub total_shots: u64,
    /// Shots per published range.
    pub process_period: u64,
    /// Sample resolution.
    pub sample_bits: u32,
    /// Longest wait for the floor (or for the final drain).
    pub floor_timeout: Duration,
    /// Block on the floor before overwriting. Off when nobody reports floors.
    pub respect_floor: bool,
    /// Wait for the last range to be processed, then request stop.
    pub stop_when_done: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            total_shots: 10_000,
            process_period: 100,
            sample_bits: 14,
            floor_timeout: Duration::from_secs(5),
            respect_floor: true,
            stop_when_done: true,
        }
    }
}

impl ProducerConfig {
    /// Settings from the acquisition section.
    pub fn from_acquisition(acquisition: &AcquisitionConfig, total_shots: u64) -> Self {
        Self {
            total_shots,
            process_period: acquisition.process_period,
            sample_bits: acquisition.sample_bits,
            ..Default::default()
        }
    }
}

/// What a producer run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    /// Shots written into every enabled ring.
    pub shots_written: u64,
    /// Ranges handed to the handshake.
    pub ranges_published: u64,
    /// Times the floor did not arrive within the timeout.
    pub stalls: u64,
    /// Stopped before `total_shots` (stop request or stall).
    pub stopped_early: bool,
    /// Floor when the producer finished.
    pub final_floor: u64,
}

/// Fake camera writing into an [`InProcessBackend`].
#[derive(Debug, Clone)]
pub struct SyntheticProducer {
    backend: InProcessBackend,
    config: ProducerConfig,
}

impl SyntheticProducer {
    /// Producer over the backend's buffers and handshake.
    pub fn new(backend: InProcessBackend, config: ProducerConfig) -> Self {
        Self { backend, config }
    }

    fn handshake(&self) -> &Arc<Handshake> {
        self.backend.handshake()
    }

    /// Run on a named thread.
    pub fn spawn(self) -> AppResult<JoinHandle<ProducerReport>> {
        thread::Builder::new()
            .name("daq-producer".to_string())
            .spawn(move || self.run())
            .map_err(|e| DaqError::ThreadSpawn(e.to_string()))
    }

    /// Run on the current thread until done, stopped or stalled.
    pub fn run(&self) -> ProducerReport {
        let buffers = self.backend.buffers();
        let handshake = self.handshake();
        let mut report = ProducerReport::default();

        let capacity = buffers.min_capacity().unwrap_or(0) as u64;
        if capacity == 0 {
            warn!("No enabled channels, nothing to produce");
            if self.config.stop_when_done {
                handshake.request_stop();
            }
            return report;
        }
        let period = self.config.process_period.clamp(1, capacity);
        info!(
            total_shots = self.config.total_shots,
            period,
            capacity,
            channels = buffers.enabled_count(),
            "Producer started"
        );

        let mut written = 0u64;
        while written < self.config.total_shots {
            if handshake.is_stop_requested() {
                report.stopped_early = true;
                break;
            }
            let batch_end = (written + period).min(self.config.total_shots);

            // Writing shot s evicts shot s - capacity.
            let needed = batch_end.saturating_sub(capacity);
            if self.config.respect_floor && needed > 0 {
                match handshake.wait_for_floor(needed, self.config.floor_timeout) {
                    FloorWait::Reached(_) => {}
                    FloorWait::Stopped => {
                        report.stopped_early = true;
                        break;
                    }
                    FloorWait::TimedOut => {
                        warn!(
                            needed,
                            floor = handshake.floor(),
                            "Floor did not advance in time, producer stalled"
                        );
                        report.stalls += 1;
                        report.stopped_early = true;
                        break;
                    }
                }
            }

            for shot in written..batch_end {
                for channel in buffers.enabled() {
                    let absolute = channel.info().absolute_channel_number;
                    channel.set(shot, synthetic_sample(shot, absolute, self.config.sample_bits));
                }
            }
            written = batch_end;

            let from = handshake.floor().max(written.saturating_sub(capacity));
            handshake.publish(ShotRange::new(from, written));
            report.ranges_published += 1;
        }
        report.shots_written = written;

        if self.config.stop_when_done && !report.stopped_early {
            if self.config.respect_floor {
                match handshake.wait_until_drained(self.config.floor_timeout) {
                    FloorWait::Reached(floor) => debug!(floor, "All ranges processed"),
                    FloorWait::Stopped => {}
                    FloorWait::TimedOut => {
                        warn!("Coordinator did not drain the last range in time");
                        report.stalls += 1;
                    }
                }
            }
            handshake.request_stop();
        }

        report.final_floor = handshake.floor();
        info!(
            shots = report.shots_written,
            ranges = report.ranges_published,
            stalls = report.stalls,
            floor = report.final_floor,
            "Producer finished"
        );
        report
    }
}
