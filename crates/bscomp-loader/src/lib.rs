//! Native device loader.
//!
//! Resolves an artifact name to a device. Names registered as builtins are constructed in-process;
//! anything else is treated as a path to a dynamic library exporting the device ABI (see
//! [`bscomp_device::abi`]). The configuration blob is passed through untouched either way.

mod native;

use std::collections::BTreeMap;
use std::path::Path;

use bscomp_device::{ConfigBlob, ConstructionError, Device};
use bscomp_ram::{RamDevice, RAM_ARTIFACT};

pub use native::NativeDevice;

/// Constructs a builtin device from its artifact name and configuration.
pub type Factory = fn(&str, ConfigBlob) -> Result<Box<dyn Device>, ConstructionError>;

pub struct Loader {
    builtins: BTreeMap<String, Factory>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    /// A loader knowing the builtin RAM artifact.
    pub fn new() -> Self {
        let mut loader = Self::without_builtins();
        loader.register(RAM_ARTIFACT, ram);
        loader
    }

    pub fn without_builtins() -> Self {
        Self {
            builtins: BTreeMap::new(),
        }
    }

    /// Registers `factory` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, factory: Factory) {
        self.builtins.insert(name.into(), factory);
    }

    pub fn is_builtin(&self, artifact: &str) -> bool {
        self.builtins.contains_key(artifact)
    }

    /// Constructs the device named by `artifact` with `config`.
    pub fn load(
        &self,
        artifact: &str,
        config: ConfigBlob,
    ) -> Result<Box<dyn Device>, ConstructionError> {
        if let Some(factory) = self.builtins.get(artifact) {
            tracing::debug!(artifact, "constructing builtin device");
            return factory(artifact, config);
        }
        Ok(Box::new(NativeDevice::load(Path::new(artifact), config)?))
    }
}

fn ram(name: &str, config: ConfigBlob) -> Result<Box<dyn Device>, ConstructionError> {
    Ok(Box::new(RamDevice::new(name, config)?))
}
