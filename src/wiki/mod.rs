//! Encyclopedia summaries for stored public figures and fictional characters.
pub mod client;
pub mod harvest;
pub mod sections;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// A page as returned by the encyclopedia, with its heading tree intact.
#[derive(Debug, Clone, PartialEq)]
pub struct EncyclopediaPage {
    pub title: String,
    pub url: String,
    /// Lead text before the first heading.
    pub summary: String,
    pub sections: Vec<Section>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Section {
    pub title: String,
    /// 1 for `== H ==`, 2 for `=== H ===`, ...
    pub level: usize,
    pub text: String,
    pub subsections: Vec<Section>,
}

/// Resolve a display label to a page. `Ok(None)` means the page does not exist.
#[async_trait]
pub trait EncyclopediaLookup: Send + Sync {
    async fn lookup(&self, title: &str) -> Result<Option<EncyclopediaPage>, FetchError>;
}

/// Persisted `{id}_wiki.json`: each top-level section flattened to one string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WikiDocument {
    pub title: String,
    pub url: String,
    pub summary: String,
    pub sections: IndexMap<String, String>,
    pub categories: Vec<String>,
}

impl WikiDocument {
    pub fn from_page(page: &EncyclopediaPage, max_depth: usize) -> Self {
        let mut sections = IndexMap::new();
        for section in &page.sections {
            let text = sections::flatten_section(section, max_depth);
            // Repeated top-level titles share one key; keep the texts in order.
            sections
                .entry(section.title.clone())
                .and_modify(|existing: &mut String| {
                    if !text.is_empty() {
                        if !existing.is_empty() {
                            existing.push('\n');
                        }
                        existing.push_str(&text);
                    }
                })
                .or_insert(text);
        }
        Self {
            title: page.title.clone(),
            url: page.url.clone(),
            summary: page.summary.clone(),
            sections,
            categories: page.categories.clone(),
        }
    }
}
