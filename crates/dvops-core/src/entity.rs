use std::collections::BTreeMap;

use dataverse_client::EntityDescriptor;

use crate::error::{OpsError, Result};
use crate::paths::validate_logical_name;

/// Entity names row files may use, mapped to how each table is addressed.
#[derive(Debug, Clone)]
pub struct EntityCatalog {
    entries: BTreeMap<String, EntityDescriptor>,
    aliases: BTreeMap<String, String>,
}

impl Default for EntityCatalog {
    fn default() -> Self {
        let entries = EntityDescriptor::builtins()
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();
        let mut aliases = BTreeMap::new();
        aliases.insert("case".to_string(), "incident".to_string());
        Self { entries, aliases }
    }
}

impl EntityCatalog {
    /// Built-ins plus tenant entities. A configured entity with the same
    /// name as a built-in replaces it.
    pub fn with_entities(extra: &[EntityDescriptor]) -> Result<Self> {
        let mut catalog = Self::default();
        for entity in extra {
            catalog.add(entity.clone())?;
        }
        Ok(catalog)
    }

    pub fn add(&mut self, mut entity: EntityDescriptor) -> Result<()> {
        entity.name = entity.name.trim().to_ascii_lowercase();
        if entity.name.is_empty() {
            return Err(OpsError::InvalidConfig("entity with empty name".into()));
        }
        validate_logical_name(&entity.logical_name)?;
        validate_logical_name(&entity.entity_set)?;
        validate_logical_name(&entity.id_field)?;
        validate_logical_name(&entity.key_field)?;
        if let Some(secondary) = &entity.secondary_field {
            validate_logical_name(secondary)?;
        }
        self.aliases.remove(&entity.name);
        self.entries.insert(entity.name.clone(), entity);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&EntityDescriptor> {
        let key = name.trim().to_ascii_lowercase();
        let key = self.aliases.get(&key).unwrap_or(&key);
        self.entries
            .get(key)
            .ok_or_else(|| OpsError::UnknownEntity(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
