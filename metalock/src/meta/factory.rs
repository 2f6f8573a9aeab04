//! Build a metadata store from a URL or a [`Config`].

use std::sync::Arc;

use tracing::info;

use crate::meta::config::{Config, DatabaseType};
use crate::meta::store::{MetaError, MetaStore};
use crate::meta::stores::{DatabaseMetaStore, MemoryMetaStore};

pub async fn create_meta_store(config: &Config) -> Result<Arc<dyn MetaStore>, MetaError> {
    info!("Creating meta store: {}", config.database.db_type_str());
    match config.database.db_config {
        DatabaseType::Memory {} => Ok(Arc::new(MemoryMetaStore::new())),
        _ => Ok(Arc::new(DatabaseMetaStore::from_config(config).await?)),
    }
}

pub async fn create_meta_store_from_url(url: &str) -> Result<Arc<dyn MetaStore>, MetaError> {
    create_meta_store(&Config::from_url(url)?).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_from_url() {
        let store = create_meta_store_from_url("memory://").await.unwrap();
        store.create_node(1).await.unwrap();

        let store = create_meta_store_from_url("sqlite::memory:").await.unwrap();
        store.create_node(1).await.unwrap();
        assert!(store.scan_flocks(1).await.unwrap().is_empty());

        assert!(create_meta_store_from_url("tikv://pd:2379").await.is_err());
    }
}
