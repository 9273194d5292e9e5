use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::StageName;
use crate::error::RegistryError;
use crate::ports::StepHandler;

/// Registry of step handlers (stage -> handler).
///
/// Filled during initialization, read-only once the orchestrator is built,
/// so lookups take no lock.
#[derive(Default)]
pub struct StepRegistry {
    handlers: HashMap<StageName, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        stage: StageName,
        handler: Arc<dyn StepHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&stage) {
            return Err(RegistryError::DuplicateHandler(stage));
        }
        self.handlers.insert(stage, handler);
        Ok(())
    }

    pub fn get(&self, stage: &StageName) -> Option<&Arc<dyn StepHandler>> {
        self.handlers.get(stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageName> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
