//! Persistence Adapters
//!
//! Implementations of the [`TradeStore`] port.

pub mod in_memory;
pub mod sqlite;

use std::sync::Arc;

pub use in_memory::InMemoryTradeStore;
pub use sqlite::SqliteTradeStore;

use crate::application::ports::{StoreError, TradeStore};
use crate::{StoreBackend, StoreSettings};

/// Open the store selected by `settings`.
///
/// # Errors
///
/// Returns [`StoreError::Open`] if the SQLite database cannot be opened.
pub fn open_store(settings: &StoreSettings) -> Result<Arc<dyn TradeStore>, StoreError> {
    match settings.backend {
        StoreBackend::Sqlite => Ok(Arc::new(SqliteTradeStore::open(&settings.db_path)?)),
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory trade store; trades are lost on restart");
            Ok(Arc::new(InMemoryTradeStore::new()))
        }
    }
}
