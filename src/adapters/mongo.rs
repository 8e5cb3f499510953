//! MongoDB Fallback-Store Adapter
//!
//! Implements the `FallbackStore` port over one database. Each entity
//! name maps to a collection; the joined key parts become `_id`.
//!
//! When a fallback TTL is configured, the adapter lazily creates a TTL
//! index over `_created_at` on the first write to each collection. The
//! installed TTLs are tracked in adapter-owned state so the DDL is not
//! re-attempted per write; a differing TTL drops and recreates the
//! index.
//!
//! Per-field index exclusions are accepted and ignored - MongoDB only
//! indexes what an index names, so the option is meaningful for
//! Datastore-style backends only.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::ports::{FallbackKey, FallbackStore, PutOptions};
use crate::error::{Error, Result};

/// Name of the index field carrying the write timestamp.
const CREATED_AT_FIELD: &str = "_created_at";

/// Default name MongoDB assigns the TTL index.
const TTL_INDEX_NAME: &str = "_created_at_1";

/// MongoDB-backed fallback store.
pub struct MongoFallbackStore {
    db: Database,
    /// Collection -> installed TTL seconds
    ttl_indexes: DashMap<String, u64>,
}

impl MongoFallbackStore {
    /// Connect to a MongoDB URI and select a database.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        debug!(database, "connected mongo fallback store");
        Ok(Self::new(client.database(database)))
    }

    /// Wrap an existing database handle.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            ttl_indexes: DashMap::new(),
        }
    }

    fn collection(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(name)
    }

    /// Install the collection's TTL index if this TTL is not already in
    /// place; a differing TTL drops and recreates the index.
    async fn ensure_ttl_index(&self, collection: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs();
        match self.ttl_indexes.get(collection).map(|installed| *installed) {
            Some(installed) if installed == secs => return Ok(()),
            Some(installed) => {
                debug!(
                    collection,
                    installed, requested = secs, "replacing TTL index"
                );
                self.drop_ttl_index(collection).await;
            }
            None => {}
        }

        let model = IndexModel::builder()
            .keys(doc! { CREATED_AT_FIELD: 1 })
            .options(IndexOptions::builder().expire_after(Some(ttl)).build())
            .build();

        if let Err(err) = self.collection(collection).create_index(model.clone()).await {
            // An index from a previous process may exist with another
            // TTL; drop it and try once more.
            warn!(collection, %err, "TTL index creation failed, recreating");
            self.drop_ttl_index(collection).await;
            self.collection(collection).create_index(model).await?;
        }

        self.ttl_indexes.insert(collection.to_string(), secs);
        Ok(())
    }

    async fn drop_ttl_index(&self, collection: &str) {
        if let Err(err) = self.collection(collection).drop_index(TTL_INDEX_NAME).await {
            debug!(collection, %err, "TTL index drop skipped");
        }
    }
}

fn to_document(doc: &Value) -> Result<Document> {
    mongodb::bson::to_document(doc)
        .map_err(|err| Error::InvalidEntityType(format!("document is not a field map: {err}")))
}

fn from_document(mut document: Document) -> Value {
    document.remove("_id");
    document.remove(CREATED_AT_FIELD);
    Bson::Document(document).into_relaxed_extjson()
}

#[async_trait]
impl FallbackStore for MongoFallbackStore {
    async fn get(&self, key: &FallbackKey) -> Result<Option<Value>> {
        let found = self
            .collection(&key.collection)
            .find_one(doc! { "_id": &key.id })
            .await?;
        Ok(found.map(from_document))
    }

    async fn put(&self, key: &FallbackKey, doc: &Value, options: &PutOptions) -> Result<()> {
        if let Some(ttl) = options.ttl {
            self.ensure_ttl_index(&key.collection, ttl).await?;
        }

        let mut document = to_document(doc)?;
        document.insert("_id", &key.id);
        if options.ttl.is_some() {
            document.insert(CREATED_AT_FIELD, Bson::DateTime(DateTime::now()));
        }

        self.collection(&key.collection)
            .replace_one(doc! { "_id": &key.id }, document)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &FallbackKey) -> Result<()> {
        self.collection(&key.collection)
            .delete_one(doc! { "_id": &key.id })
            .await?;
        Ok(())
    }

    async fn get_many(&self, keys: &[FallbackKey]) -> Result<Vec<Option<Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // Keys usually share one collection (one per entity name), but
        // the port does not require it.
        let mut by_collection: std::collections::HashMap<&str, Vec<&str>> =
            std::collections::HashMap::new();
        for key in keys {
            by_collection
                .entry(key.collection.as_str())
                .or_default()
                .push(key.id.as_str());
        }

        let mut found: std::collections::HashMap<(String, String), Value> =
            std::collections::HashMap::new();
        for (collection, ids) in by_collection {
            let mut cursor = self
                .collection(collection)
                .find(doc! { "_id": { "$in": ids } })
                .await?;
            while let Some(document) = cursor.try_next().await? {
                if let Some(Bson::String(id)) = document.get("_id").cloned() {
                    found.insert((collection.to_string(), id), from_document(document));
                }
            }
        }

        Ok(keys
            .iter()
            .map(|key| found.remove(&(key.collection.clone(), key.id.clone())))
            .collect())
    }

    async fn shutdown(&self) -> Result<()> {
        self.db.client().clone().shutdown().await;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_conversion_round_trip() {
        let value = json!({"id": "p1", "age": 33, "active": true});
        let document = to_document(&value).unwrap();
        assert_eq!(document.get_str("id").unwrap(), "p1");

        let restored = from_document(document);
        assert_eq!(restored, value);
    }

    #[test]
    fn test_document_conversion_strips_bookkeeping_fields() {
        let mut document = Document::new();
        document.insert("_id", "p1");
        document.insert(CREATED_AT_FIELD, Bson::DateTime(DateTime::now()));
        document.insert("name", "A");

        let restored = from_document(document);
        assert_eq!(restored, json!({"name": "A"}));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(to_document(&json!("scalar")).is_err());
    }
}
