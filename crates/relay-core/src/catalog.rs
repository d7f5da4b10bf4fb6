use anyhow::{anyhow, Result};
use relay_config::{CompletionConfig, ModelEntry};

/// Models a user may pick from. Fixed once the runtime starts.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
    default_id: String,
}

impl ModelCatalog {
    /// Ids are trimmed, matching how user input is compared against them.
    pub fn new(entries: Vec<ModelEntry>, default_id: &str) -> Result<Self> {
        let entries: Vec<ModelEntry> = entries
            .into_iter()
            .map(|entry| ModelEntry {
                id: entry.id.trim().to_string(),
                ..entry
            })
            .collect();
        let default_id = default_id.trim();
        if !entries.iter().any(|entry| entry.id == default_id) {
            return Err(anyhow!("default model '{}' is not in the catalog", default_id));
        }
        Ok(Self {
            entries,
            default_id: default_id.to_string(),
        })
    }

    pub fn from_config(config: &CompletionConfig) -> Result<Self> {
        let default_id = config
            .default_model_id()
            .ok_or_else(|| anyhow!("model catalog is empty"))?;
        Self::new(config.model_entries(), &default_id)
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Human label for `id`, falling back to the id itself.
    pub fn label<'a>(&'a self, id: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.label.as_str())
            .unwrap_or(id)
    }
}
