//! Plugin registry.
//!
//! Built once at startup and shared read-only afterwards.

use crate::plugin::Plugin;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two plugins claimed the same topic.
    #[error("Topic '{0}' is already registered")]
    DuplicateTopic(String),

    /// Plugin declared an empty topic.
    #[error("Plugin topic cannot be empty")]
    EmptyTopic,
}

/// Mapping from topic name to plugin.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is empty or already taken.
    pub fn register<P: Plugin + 'static>(&mut self, plugin: P) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(plugin))
    }

    /// Register a shared plugin under its topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is empty or already taken.
    pub fn register_arc(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let topic = plugin.topic().to_string();
        if topic.is_empty() {
            return Err(RegistryError::EmptyTopic);
        }
        if self.plugins.contains_key(&topic) {
            return Err(RegistryError::DuplicateTopic(topic));
        }

        debug!(topic = %topic, "Registered plugin");
        self.plugins.insert(topic, plugin);
        Ok(())
    }

    /// Builder-style registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is empty or already taken.
    pub fn with<P: Plugin + 'static>(mut self, plugin: P) -> Result<Self, RegistryError> {
        self.register(plugin)?;
        Ok(self)
    }

    /// Look up the plugin for a topic.
    #[must_use]
    pub fn lookup(&self, topic: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(topic).cloned()
    }

    /// Check whether a topic is registered.
    #[must_use]
    pub fn is_valid_topic(&self, topic: &str) -> bool {
        self.plugins.contains_key(topic)
    }

    /// All registered topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.plugins.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if no plugins are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}
