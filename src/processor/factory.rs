//! Construction of processors from configuration entries.
//!
//! Each processor type is registered under the string used in the `type` key of a
//! `[[processors]]` table. The entry's `config` table is deserialized by the type's
//! constructor. `native` entries are not built here; they become registry tokens.

use std::collections::HashMap;

use serde::Deserialize;
use toml::Value;
use tracing::{debug, info};

use super::{DiskDump, DiskDumpConfig, MovingAverage, NativeTask, Processor, SampleOffset};
use crate::config::ProcessorDefinition;
use crate::error::{AppResult, DaqError};
use crate::session::AcquisitionSession;

type Constructor =
    Box<dyn Fn(&str, &Value) -> Result<Box<dyn Processor>, anyhow::Error> + Send + Sync>;

/// Builds processors from `[[processors]]` configuration entries.
pub struct ProcessorFactory {
    constructors: HashMap<String, Constructor>,
}

impl Default for ProcessorFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WindowConfig {
    window: u64,
}

#[derive(Debug, Deserialize)]
struct OffsetConfig {
    #[serde(default = "default_delta")]
    delta: u16,
}

fn default_delta() -> u16 {
    10
}

impl ProcessorFactory {
    /// Factory with the built-in processor types registered.
    pub fn new() -> Self {
        let mut factory = Self {
            constructors: HashMap::new(),
        };

        factory.register("diskdump", |name, config| {
            let config: DiskDumpConfig = config.clone().try_into()?;
            Ok(Box::new(DiskDump::new(name, config)))
        });

        factory.register("moving_average", |name, config| {
            let config: WindowConfig = config.clone().try_into()?;
            Ok(Box::new(MovingAverage::new(name, config.window)?))
        });

        factory.register("offset", |name, config| {
            let config: OffsetConfig = config.clone().try_into()?;
            Ok(Box::new(SampleOffset::new(name, config.delta)))
        });

        factory
    }

    /// Add (or replace) a constructor for `kind`.
    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&str, &Value) -> Result<Box<dyn Processor>, anyhow::Error> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Box::new(constructor));
    }

    /// Registered type names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build one processor.
    pub fn create(&self, kind: &str, name: &str, config: &Value) -> AppResult<Box<dyn Processor>> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| DaqError::UnknownProcessor(kind.to_string()))?;
        constructor(name, config)
            .map_err(|e| DaqError::Configuration(format!("processor '{name}' ({kind}): {e:#}")))
    }

    /// Register every enabled definition with `session`, in order.
    ///
    /// `native` entries become [`NativeTask`] tokens. Returns the number of entries
    /// registered.
    pub fn register_all(
        &self,
        session: &mut AcquisitionSession,
        definitions: &[ProcessorDefinition],
    ) -> AppResult<usize> {
        let mut registered = 0;
        for (index, definition) in definitions.iter().enumerate() {
            let name = definition.display_name(index);
            if !definition.enabled {
                debug!(processor = %name, "Skipping disabled processor");
                continue;
            }
            if definition.r#type == "native" {
                session.register_native(NativeTask::new(name))?;
            } else {
                let processor = self.create(&definition.r#type, &name, &definition.config)?;
                session.register_processor(processor)?;
            }
            registered += 1;
        }
        info!(registered, "Processors registered from configuration");
        Ok(registered)
    }
}
