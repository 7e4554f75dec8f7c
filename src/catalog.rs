//! Event type catalog.
//!
//! Registered definitions are leaf data consumed by the emitter and the
//! registry. A definition is treated as immutable once live events
//! reference it, so the catalog exposes no update operation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::types::EventTypeDefinition;

/// Registry of known event types, keyed by unique name.
#[derive(Default)]
pub struct EventCatalog {
    definitions: RwLock<HashMap<String, Arc<EventTypeDefinition>>>,
}

impl EventCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event type. Fails if the name is already taken.
    pub async fn register(
        &self,
        definition: EventTypeDefinition,
    ) -> Result<Arc<EventTypeDefinition>, RegistryError> {
        let mut guard = self.definitions.write().await;
        if guard.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateEventType {
                name: definition.name,
            });
        }
        let definition = Arc::new(definition);
        guard.insert(definition.name.clone(), definition.clone());
        Ok(definition)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<EventTypeDefinition>> {
        self.definitions.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.definitions.read().await.contains_key(name)
    }

    /// All registered definitions, sorted by name.
    pub async fn list(&self) -> Vec<Arc<EventTypeDefinition>> {
        let mut all: Vec<Arc<EventTypeDefinition>> =
            self.definitions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
