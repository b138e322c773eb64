use crate::{error::AppError, utils::config::AppConfig};

use super::types::{collection_info::CollectionInfo, StoredObject};
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};
use tracing::info;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// Signs in as root only when credentials are given; embedded engines
    /// (`mem://`, `surrealkv://`) run without them.
    pub async fn new(
        address: &str,
        credentials: Option<(&str, &str)>,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        if let Some((username, password)) = credentials {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Connects with the store settings of `config` and prepares the registry table.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let credentials = config
            .surrealdb_username
            .as_deref()
            .zip(config.surrealdb_password.as_deref());

        let db = Self::new(
            &config.surrealdb_address,
            credentials,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?;
        db.ensure_initialized().await?;

        info!(
            address = %config.surrealdb_address,
            namespace = %config.surrealdb_namespace,
            database = %config.surrealdb_database,
            "Connected to vector store"
        );
        Ok(db)
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.client
            .query(format!(
                "DEFINE TABLE IF NOT EXISTS {} SCHEMALESS;",
                CollectionInfo::table_name()
            ))
            .await?
            .check()?;
        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve all objects from a certain table
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to retrieve a single object by its ID
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use crate::utils::config::test_support::sample_config;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_store_and_fetch() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(dummy.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched.map(|d| d.name), Some("first".to_string()));

        let all = db
            .get_all_stored_items::<Dummy>()
            .await
            .expect("Failed to fetch all");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_from_config_with_memory_address() {
        let mut config = sample_config();
        config.surrealdb_database = Uuid::new_v4().to_string();

        let db = SurrealDbClient::from_config(&config)
            .await
            .expect("Failed to connect");
        let registered = db
            .get_all_stored_items::<CollectionInfo>()
            .await
            .expect("Failed to list registry");
        assert!(registered.is_empty());
    }
}
