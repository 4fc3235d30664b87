//! Engine registry: maps declared test file types to engine variants.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Engine, JmeterEngineFactory, JmeterSettings};
use crate::models::{LoadTestFileType, normalize_file_type};

/// Creates a fresh engine instance for each run.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn Engine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Box<dyn Engine> + Send + Sync,
{
    fn create(&self) -> Box<dyn Engine> {
        self()
    }
}

/// Open registration table of engine variants, keyed by file type.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    factories: HashMap<String, Arc<dyn EngineFactory>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variant for a file type. Replaces any previous registration.
    pub fn register(&mut self, file_type: &str, factory: Arc<dyn EngineFactory>) {
        self.factories.insert(normalize_file_type(file_type), factory);
    }

    /// Create an engine for a declared file type, or `None` if the type is unknown.
    pub fn resolve(&self, file_type: &str) -> Option<Box<dyn Engine>> {
        self.factories
            .get(&normalize_file_type(file_type))
            .map(|factory| factory.create())
    }

    pub fn supports(&self, file_type: &str) -> bool {
        self.factories.contains_key(&normalize_file_type(file_type))
    }

    /// All registered file types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Create the registry with every built-in engine variant.
pub fn default_registry(jmeter: JmeterSettings) -> EngineRegistry {
    let mut registry = EngineRegistry::new();

    registry.register(
        LoadTestFileType::Jmx.as_str(),
        Arc::new(JmeterEngineFactory::new(jmeter)),
    );

    registry
}
