// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Extension function registry.
//!
//! Plugins register capability objects under `(plugin name, function id)`.
//! The manager only looks them up and calls them; it never owns plugin
//! state beyond the registered handle.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ResourceError, ResourceResult};
use crate::limits::MAX_PLUGIN_FUNC_ID;

/// One callable extension function.
pub trait ExtensionFunction: Send + Sync {
    fn execute(&self, input: &[u8]) -> Result<Vec<u8>, String>;
}

impl<F> ExtensionFunction for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync,
{
    fn execute(&self, input: &[u8]) -> Result<Vec<u8>, String> {
        self(input)
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    functions: DashMap<(String, u32), Arc<dyn ExtensionFunction>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a function.
    pub fn register(
        &self,
        plugin: &str,
        func_id: u32,
        function: Arc<dyn ExtensionFunction>,
    ) -> ResourceResult<()> {
        if plugin.is_empty() {
            return Err(ResourceError::InvalidArgument("plugin name is empty".into()));
        }
        if func_id > MAX_PLUGIN_FUNC_ID {
            return Err(ResourceError::InvalidArgument(format!(
                "function id {} exceeds {}",
                func_id, MAX_PLUGIN_FUNC_ID
            )));
        }
        self.functions.insert((plugin.to_string(), func_id), function);
        Ok(())
    }

    pub fn unregister(&self, plugin: &str) -> usize {
        let before = self.functions.len();
        self.functions.retain(|(name, _), _| name != plugin);
        before - self.functions.len()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Run a function with bounded input and output.
    pub fn execute(
        &self,
        plugin: &str,
        func_id: u32,
        input: &[u8],
        max_param_len: usize,
    ) -> ResourceResult<Vec<u8>> {
        if func_id > MAX_PLUGIN_FUNC_ID {
            return Err(ResourceError::InvalidArgument(format!(
                "function id {} exceeds {}",
                func_id, MAX_PLUGIN_FUNC_ID
            )));
        }
        if input.len() > max_param_len {
            return Err(ResourceError::InvalidArgument(format!(
                "plugin input of {} bytes exceeds {}",
                input.len(),
                max_param_len
            )));
        }
        // Clone the handle so the map shard is not locked while the plugin runs.
        let function = self
            .functions
            .get(&(plugin.to_string(), func_id))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ResourceError::NotFound(format!("plugin {} function {}", plugin, func_id)))?;

        let output = function.execute(input).map_err(ResourceError::Plugin)?;
        if output.len() > max_param_len {
            return Err(ResourceError::Plugin(format!(
                "output of {} bytes exceeds {}",
                output.len(),
                max_param_len
            )));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<dyn ExtensionFunction> {
        Arc::new(|input: &[u8]| -> Result<Vec<u8>, String> { Ok(input.to_vec()) })
    }

    #[test]
    fn executes_registered_function() {
        let registry = PluginRegistry::new();
        registry.register("xrmU30Dec", 0, echo()).unwrap();
        assert_eq!(registry.execute("xrmU30Dec", 0, b"ping", 64).unwrap(), b"ping");
    }

    #[test]
    fn unknown_function_is_not_found() {
        let registry = PluginRegistry::new();
        registry.register("p", 0, echo()).unwrap();
        assert!(matches!(registry.execute("p", 1, b"", 64), Err(ResourceError::NotFound(_))));
        assert!(matches!(registry.execute("q", 0, b"", 64), Err(ResourceError::NotFound(_))));
    }

    #[test]
    fn bounds_are_enforced() {
        let registry = PluginRegistry::new();
        assert!(registry.register("p", MAX_PLUGIN_FUNC_ID + 1, echo()).is_err());
        registry.register("p", 0, echo()).unwrap();
        assert!(matches!(
            registry.execute("p", 0, &[0u8; 16], 8),
            Err(ResourceError::InvalidArgument(_))
        ));

        let grow: Arc<dyn ExtensionFunction> = Arc::new(|_: &[u8]| -> Result<Vec<u8>, String> { Ok(vec![0u8; 32]) });
        registry.register("p", 1, grow).unwrap();
        assert!(matches!(registry.execute("p", 1, b"x", 8), Err(ResourceError::Plugin(_))));
    }

    #[test]
    fn plugin_failure_is_reported() {
        let registry = PluginRegistry::new();
        let fail: Arc<dyn ExtensionFunction> =
            Arc::new(|_: &[u8]| -> Result<Vec<u8>, String> { Err("device offline".to_string()) });
        registry.register("p", 2, fail).unwrap();
        assert_eq!(
            registry.execute("p", 2, b"", 8),
            Err(ResourceError::Plugin("device offline".into()))
        );
        assert_eq!(registry.unregister("p"), 1);
        assert!(registry.is_empty());
    }
}
