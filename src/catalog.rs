//! Message catalog - canned texts used as conversation content
//!
//! The catalog file is a JSON array. Entries are either plain strings or
//! objects carrying the text under `message` (or the legacy `mensagem` key).

use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use rand::Rng;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogEntry {
    Text(String),
    Object {
        #[serde(alias = "mensagem", alias = "text")]
        message: String,
    },
}

impl CatalogEntry {
    fn into_text(self) -> String {
        match self {
            CatalogEntry::Text(t) => t,
            CatalogEntry::Object { message } => message,
        }
    }
}

/// Immutable ordered sequence of message texts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageCatalog {
    messages: Vec<String>,
}

impl MessageCatalog {
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages }
    }

    /// Parse a catalog from its JSON representation
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json)?;
        let messages = entries
            .into_iter()
            .map(CatalogEntry::into_text)
            .filter(|m| !m.trim().is_empty())
            .collect();
        Ok(Self { messages })
    }

    /// Load a catalog file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Catalog(format!("{}: {}", path.display(), e)))?;
        let catalog = Self::from_json(&content)?;
        info!(path = %path.display(), count = catalog.len(), "Loaded message catalog");
        Ok(catalog)
    }

    /// Message at `index`, wrapping modulo the catalog length
    pub fn get(&self, index: usize) -> Option<&str> {
        if self.messages.is_empty() {
            return None;
        }
        self.messages
            .get(index % self.messages.len())
            .map(String::as_str)
    }

    /// Uniformly random message
    pub fn random(&self) -> Option<&str> {
        if self.messages.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.messages.len());
        self.messages.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Catalog loaded once on first use and shared read-only afterwards.
///
/// A failed load is not cached, so the next caller retries.
pub struct SharedCatalog {
    path: Option<PathBuf>,
    cell: OnceCell<Arc<MessageCatalog>>,
}

impl SharedCatalog {
    /// Lazily load from `path`
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            cell: OnceCell::new(),
        }
    }

    /// Already-loaded catalog
    pub fn preloaded(catalog: MessageCatalog) -> Self {
        Self {
            path: None,
            cell: OnceCell::with_value(Arc::new(catalog)),
        }
    }

    /// The catalog, loading it if needed; empty when loading fails
    pub fn get(&self) -> Arc<MessageCatalog> {
        let Some(path) = self.path.as_deref() else {
            return self.cell.get().cloned().unwrap_or_default();
        };

        match self.cell.get_or_try_init(|| {
            let catalog = MessageCatalog::load(path)?;
            if catalog.is_empty() {
                return Err(Error::Catalog(format!("{} has no messages", path.display())));
            }
            Ok::<_, Error>(Arc::new(catalog))
        }) {
            Ok(catalog) => Arc::clone(catalog),
            Err(e) => {
                error!(error = %e, "Failed to load message catalog");
                Arc::new(MessageCatalog::default())
            }
        }
    }
}
