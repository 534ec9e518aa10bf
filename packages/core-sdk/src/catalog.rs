use crate::models::ModelId;

/**
 * \brief One model in the catalog, with the context-window label shown next to it.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: ModelId,
    pub context_window: String,
}

impl CatalogEntry {
    pub fn new(id: &str, context_window: &str) -> Self {
        Self {
            id: ModelId::new(id),
            context_window: context_window.to_string(),
        }
    }
}

/**
 * \brief Fixed, ordered list of models targeted by every run.
 *
 * Catalog order is the canonical display and export order.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /**
     * \brief Models offered by Perplexity's chat-completion endpoint.
     */
    pub fn perplexity_default() -> Self {
        Self::new(vec![
            CatalogEntry::new("sonar-pro", "200k"),
            CatalogEntry::new("sonar", "127k"),
            CatalogEntry::new("llama-3.1-sonar-small-128k-online", "128k"),
            CatalogEntry::new("llama-3.1-sonar-large-128k-online", "128k"),
            CatalogEntry::new("llama-3.1-sonar-huge-128k-online", "128k"),
        ])
    }

    pub fn ids(&self) -> impl Iterator<Item = &ModelId> {
        self.entries.iter().map(|e| &e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, id: &ModelId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    /** \brief Sort key for ordering by catalog position; unknown ids sort last. */
    pub fn sort_key(&self, id: &ModelId) -> usize {
        self.position(id).unwrap_or(usize::MAX)
    }

    pub fn context_window(&self, id: &ModelId) -> &str {
        self.entries
            .iter()
            .find(|e| &e.id == id)
            .map(|e| e.context_window.as_str())
            .unwrap_or("--")
    }
}
