//! # APDCAM DAQ Core Library
//!
//! Shared ring buffers and the producer/processor handshake of a multi-channel data
//! acquisition pipeline. A producer (the camera backend, or the synthetic producer)
//! writes samples into one ring per channel and publishes the range of shots that is
//! resident; a single coordinator thread hands that range to every registered
//! processor and reports back the earliest shot any of them still needs.
//!
//! ## Crate Structure
//!
//! - **`data`**: `RingBuffer`, the per-channel `ChannelBufferSet` and `ShotRange`.
//! - **`processor`**: the `Processor` trait, its registry, the built-in variants and the
//!   configuration factory.
//! - **`handshake`**: the condition-variable rendezvous between producer and coordinator.
//! - **`backend`**: the `AcquisitionBackend` boundary and its in-process implementation.
//! - **`coordinator`**: the loop, floor aggregation and failure isolation.
//! - **`session`**: `AcquisitionSession`, the lifecycle owner (init/start/stop/finish).
//! - **`simulator`**: a synthetic producer for the CLI and tests.
//! - **`config`**, **`tracing_init`**, **`error`**: the ambient stack.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod handshake;
pub mod processor;
pub mod session;
pub mod simulator;
pub mod tracing_init;

pub use backend::{AcquisitionBackend, InProcessBackend};
pub use coordinator::{CoordinatorSnapshot, CoordinatorState, ProcessorFailure};
pub use data::{ChannelBufferSet, RingBuffer, ShotRange};
pub use error::{AppResult, DaqError};
pub use handshake::Handshake;
pub use processor::{Processor, ProcessorRegistry};
pub use session::AcquisitionSession;
