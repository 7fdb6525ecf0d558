//! Query context shared by every node of one query

use parking_lot::Mutex;
use std::sync::Arc;
use tessera_core::{SearchConfig, ServerRole};
use tessera_search::Catalog;

/// Per-query environment: the catalog, process settings and the warnings
/// collected while planning and executing
pub struct QueryContext {
    catalog: Arc<Catalog>,
    config: SearchConfig,
    warnings: Mutex<Vec<String>>,
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("role", &self.catalog.role())
            .field("config", &self.config)
            .field("warnings", &self.warnings.lock().len())
            .finish()
    }
}

impl QueryContext {
    /// Context over `catalog` with `config`
    pub fn new(catalog: Arc<Catalog>, config: SearchConfig) -> Self {
        QueryContext {
            catalog,
            config,
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Catalog the query runs against
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Process settings
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Role of this server
    pub fn role(&self) -> ServerRole {
        self.catalog.role()
    }

    /// Record a non-fatal warning
    pub fn warn(&self, message: impl Into<String>) {
        self.warnings.lock().push(message.into());
    }

    /// Warnings recorded so far
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}
