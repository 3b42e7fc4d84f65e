//! Store factory

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::postgres::PostgresPool;

use super::memory::MemoryStore;
use super::postgres::PostgresStore;
use super::Store;

/// Create a notification store based on configuration.
///
/// Returns the appropriate implementation based on the `backend` setting:
/// - `"postgres"`: Returns a `PostgresStore` if a PostgreSQL pool is provided
/// - `"memory"` (default): Returns a `MemoryStore`
///
/// # Example
///
/// ```rust,ignore
/// let store = create_store(&settings.store, Some(pg_pool.clone()));
/// ```
pub fn create_store(
    settings: &StoreConfig,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Arc<dyn Store> {
    match settings.backend.as_str() {
        "postgres" => {
            if let Some(pool) = postgres_pool {
                tracing::info!(
                    backend = "postgres",
                    url = %pool.database_url_masked(),
                    "Creating PostgreSQL notification store"
                );
                Arc::new(PostgresStore::new(pool.pool().clone()))
            } else {
                tracing::warn!(
                    "PostgreSQL store requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryStore::new())
            }
        }
        "memory" => {
            tracing::info!(backend = "memory", "Creating memory notification store");
            Arc::new(MemoryStore::new())
        }
        other => {
            tracing::warn!(
                backend = %other,
                "Unknown store backend, falling back to memory"
            );
            Arc::new(MemoryStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_default() {
        let store = create_store(&StoreConfig::default(), None);
        assert_eq!(store.backend_type(), "memory");
    }

    #[test]
    fn test_postgres_without_pool_falls_back() {
        let settings = StoreConfig {
            backend: "postgres".to_string(),
        };
        let store = create_store(&settings, None);
        assert_eq!(store.backend_type(), "memory");
    }
}
