//! Ordered collection of the processors of one session.
//!
//! Registration order is execution order. The registry is moved into the coordinator
//! thread while acquisition runs and handed back when the thread is joined, so it
//! cannot be mutated in between.

use tracing::{debug, error};

use super::Processor;
use crate::data::ChannelBufferSet;
use crate::error::{AppResult, DaqError};

/// Token for a task that the producer runs natively (e.g. its own disk dump).
///
/// Native tasks are listed for bookkeeping only; they never take part in the
/// handshake and do not cause a coordinator thread to be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTask {
    name: String,
}

impl NativeTask {
    /// Create a token.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One registry entry.
pub enum RegisteredProcessor {
    /// In-process (or bridged) processor driven by the coordinator.
    Handshake(Box<dyn Processor>),
    /// Producer-native task.
    Native(NativeTask),
}

impl RegisteredProcessor {
    /// Entry name.
    pub fn name(&self) -> &str {
        match self {
            RegisteredProcessor::Handshake(processor) => processor.name(),
            RegisteredProcessor::Native(task) => task.name(),
        }
    }
}

impl std::fmt::Debug for RegisteredProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisteredProcessor::Handshake(p) => f
                .debug_struct("Handshake")
                .field("name", &p.name())
                .field("cursor", &p.cursor())
                .finish(),
            RegisteredProcessor::Native(task) => f.debug_tuple("Native").field(task).finish(),
        }
    }
}

/// Processors in registration order.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    entries: Vec<RegisteredProcessor>,
}

impl ProcessorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handshake processor.
    pub fn add(&mut self, processor: Box<dyn Processor>) {
        debug!(processor = processor.name(), "Registered processor");
        self.entries.push(RegisteredProcessor::Handshake(processor));
    }

    /// Append a native task token.
    pub fn add_native(&mut self, task: NativeTask) {
        debug!(task = task.name(), "Registered native task");
        self.entries.push(RegisteredProcessor::Native(task));
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries, native tokens included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries that take part in the handshake.
    pub fn participating_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, RegisteredProcessor::Handshake(_)))
            .count()
    }

    /// Entry names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    /// Handshake processors in registration order.
    pub fn participating_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Processor>> {
        self.entries.iter_mut().filter_map(|entry| match entry {
            RegisteredProcessor::Handshake(processor) => Some(processor),
            RegisteredProcessor::Native(_) => None,
        })
    }

    /// Call `init` on every handshake processor; the first failure aborts.
    pub fn init_all(&mut self, buffers: &ChannelBufferSet) -> AppResult<()> {
        for processor in self.participating_mut() {
            processor.init(buffers).map_err(|e| DaqError::Processor {
                name: processor.name().to_string(),
                message: format!("{e:#}"),
            })?;
        }
        Ok(())
    }

    /// Call `finish` on every handshake processor and collect the failures.
    pub fn finish_all(&mut self) -> Vec<DaqError> {
        let mut failures = Vec::new();
        for processor in self.participating_mut() {
            if let Err(e) = processor.finish() {
                error!(processor = processor.name(), error = %e, "Processor finish failed");
                failures.push(DaqError::Processor {
                    name: processor.name().to_string(),
                    message: format!("{e:#}"),
                });
            }
        }
        failures
    }
}
