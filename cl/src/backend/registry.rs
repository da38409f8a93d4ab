//! Adapter registry: maps adapter names to backend constructors

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Backend, BackendError, ExecBackend, ExecConfig, MockBackend, MockConfig};

/// Default adapter when neither config nor CLI picks one
pub const DEFAULT_ADAPTER: &str = "mock";

/// Backend section of the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackendConfig {
    pub adapter: String,
    pub mock: MockConfig,
    pub exec: ExecConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            adapter: DEFAULT_ADAPTER.to_string(),
            mock: MockConfig::default(),
            exec: ExecConfig::default(),
        }
    }
}

type Factory = Box<dyn Fn() -> Result<Arc<dyn Backend>, BackendError> + Send + Sync>;

/// Named backend constructors
///
/// The registry never holds a live backend; each `create` builds a new one.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, Factory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `mock` and `exec` adapters configured from `config`
    pub fn with_builtins(config: &BackendConfig) -> Self {
        debug!(adapter = %config.adapter, "AdapterRegistry::with_builtins: called");
        let mut registry = Self::new();

        let mock = config.mock.clone();
        registry.register("mock", move || Ok(Arc::new(MockBackend::from_config(&mock)) as Arc<dyn Backend>));

        let exec = config.exec.clone();
        registry.register("exec", move || {
            Ok(Arc::new(ExecBackend::from_config(&exec)?) as Arc<dyn Backend>)
        });

        registry
    }

    /// Register a constructor, replacing any existing one with the same name
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Backend>, BackendError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(%name, "AdapterRegistry::register: called");
        self.factories.insert(name, Box::new(factory));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Backend>, BackendError> {
        debug!(%name, "AdapterRegistry::create: called");
        match self.factories.get(name) {
            Some(factory) => factory(),
            None => Err(BackendError::UnknownAdapter {
                name: name.to_string(),
                available: self.names().join(", "),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered adapter names, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").field("adapters", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = AdapterRegistry::with_builtins(&BackendConfig::default());
        assert_eq!(registry.names(), vec!["exec", "mock"]);
        assert_eq!(registry.create("mock").unwrap().name(), "mock");
    }

    #[test]
    fn test_unknown_adapter_lists_available() {
        let registry = AdapterRegistry::with_builtins(&BackendConfig::default());
        let err = registry.create("nope").err().unwrap();
        let message = err.to_string();
        assert!(message.contains("nope"));
        assert!(message.contains("exec, mock"));
    }

    #[test]
    fn test_exec_without_command_fails_on_create() {
        let registry = AdapterRegistry::with_builtins(&BackendConfig::default());
        assert!(registry.create("exec").is_err());

        let mut config = BackendConfig::default();
        config.exec.command = Some("cat".to_string());
        let registry = AdapterRegistry::with_builtins(&config);
        assert_eq!(registry.create("exec").unwrap().name(), "exec");
    }

    #[test]
    fn test_register_custom_adapter() {
        let mut registry = AdapterRegistry::new();
        registry.register("scripted", || Ok(Arc::new(MockBackend::scripted(["hi"])) as Arc<dyn Backend>));
        assert!(registry.contains("scripted"));
        assert!(!registry.contains("mock"));
    }
}
