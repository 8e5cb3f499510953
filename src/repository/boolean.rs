//! Boolean entity kind.
//!
//! Presence/absence only: the "value" is the key itself. The memory
//! tier holds a one-byte `'1'` under the entity key; the fallback
//! document is `{"value": true}` and any non-null document counts as
//! present.

use serde_json::{json, Value};

use crate::domain::ports::{MemoryBatch, ReadOp, ReadReply};
use crate::error::{Error, Result};
use crate::repository::config::RepositoryConfig;
use crate::repository::kind::EntityKind;
use crate::repository::query::QueryOptions;

/// A present boolean entity; its value is the key's tail component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BooleanEntry {
    key_parts: Vec<String>,
}

impl BooleanEntry {
    pub fn new(key_parts: Vec<String>) -> Self {
        Self { key_parts }
    }

    pub fn key_parts(&self) -> &[String] {
        &self.key_parts
    }

    /// The materialised value: the last key part.
    pub fn value(&self) -> &str {
        self.key_parts.last().map(String::as_str).unwrap_or("")
    }
}

/// Boolean entity kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanKind;

impl BooleanKind {
    pub fn new() -> Self {
        Self
    }
}

impl EntityKind for BooleanKind {
    type Entity = BooleanEntry;

    fn stage_read(&self, memory_key: &str, _options: &QueryOptions) -> Result<ReadOp> {
        Ok(ReadOp::Exists(memory_key.to_string()))
    }

    fn decode_read(
        &self,
        key_parts: &[String],
        reply: ReadReply,
        _options: &QueryOptions,
    ) -> Result<Option<BooleanEntry>> {
        match reply {
            ReadReply::Exists(true) => Ok(Some(BooleanEntry::new(key_parts.to_vec()))),
            ReadReply::Exists(false) => Ok(None),
            other => Err(Error::memory_tier(format!(
                "unexpected boolean reply: {other:?}"
            ))),
        }
    }

    fn stage_write(
        &self,
        batch: &mut MemoryBatch,
        memory_key: &str,
        _entity: &BooleanEntry,
    ) -> Result<()> {
        batch.set(memory_key.to_string(), &b"1"[..]);
        Ok(())
    }

    fn stage_backfill(&self, batch: &mut MemoryBatch, memory_key: &str, _doc: &Value) -> Result<()> {
        batch.set(memory_key.to_string(), &b"1"[..]);
        Ok(())
    }

    fn to_document(&self, _entity: &BooleanEntry) -> Result<Value> {
        Ok(json!({ "value": true }))
    }

    fn materialize_fallback(
        &self,
        key_parts: &[String],
        doc: &Value,
        _options: &QueryOptions,
    ) -> Result<Option<BooleanEntry>> {
        if doc.is_null() {
            return Ok(None);
        }
        Ok(Some(BooleanEntry::new(key_parts.to_vec())))
    }

    fn key_parts(&self, config: &RepositoryConfig, entity: &BooleanEntry) -> Result<Vec<String>> {
        if entity.key_parts.len() != config.key_attrs.len() {
            let attribute = config
                .key_attrs
                .get(entity.key_parts.len())
                .cloned()
                .unwrap_or_else(|| "key_attrs".to_string());
            return Err(Error::InvalidKeyAttribute {
                entity: config.entity_name.clone(),
                attribute,
            });
        }
        Ok(entity.key_parts.clone())
    }

    fn exclude_from_indexes(&self, _config: &RepositoryConfig) -> Vec<String> {
        vec!["value".to_string()]
    }
}

// =============================================================================
// Tests
// =============================================================================
