//! Repository configuration and key composition.
//!
//! The source of truth for an entity's name, its ordered key
//! attributes, and the derived memory/fallback/negative keys. Captured
//! as a value at build time and validated once.

use std::time::Duration;

use crate::domain::ports::FallbackKey;
use crate::error::{Error, Result};

/// Reserved key segment marking negative entries. An entity name must
/// never collide with it.
pub const NOT_FOUND_TAG: &str = "not-found";

/// Value-typed repository configuration.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Entity name; prefixes every derived key and names the fallback
    /// collection.
    pub entity_name: String,
    /// Ordered key attributes, e.g. `["owner_id", "id"]`. The last one
    /// is the logical id.
    pub key_attrs: Vec<String>,
    /// Memory-tier TTL per entry; also the negative-marker TTL.
    pub expire: Duration,
    /// Optional collection-level TTL for the fallback tier.
    pub fallback_ttl: Option<Duration>,
    /// Exclude every hash attribute from fallback indexing.
    pub exclude_all_from_indexes: bool,
}

impl RepositoryConfig {
    pub fn new(
        entity_name: impl Into<String>,
        key_attrs: Vec<String>,
        expire: Duration,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            key_attrs,
            expire,
            fallback_ttl: None,
            exclude_all_from_indexes: false,
        }
    }

    /// Validate once at build time.
    pub fn validate(&self) -> Result<()> {
        if self.entity_name.is_empty() {
            return Err(Error::RequiredConfigAttribute("entity_name"));
        }
        if self.key_attrs.is_empty() {
            return Err(Error::RequiredConfigAttribute("key_attrs"));
        }
        if self.entity_name.contains(':') {
            return Err(Error::InvalidEntityType(format!(
                "entity name '{}' must not contain ':'",
                self.entity_name
            )));
        }
        if self.entity_name.contains(NOT_FOUND_TAG) {
            return Err(Error::InvalidEntityType(format!(
                "entity name '{}' collides with the reserved '{NOT_FOUND_TAG}' tag",
                self.entity_name
            )));
        }
        if self.expire.is_zero() {
            return Err(Error::Config(
                "repository_expire_time must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Positive-entry key in the memory tier.
    pub fn memory_key(&self, parts: &[String]) -> String {
        format!("{}:{}", self.entity_name, parts.join(":"))
    }

    /// Negative-marker key in the memory tier.
    pub fn not_found_key(&self, parts: &[String]) -> String {
        format!("{}:{NOT_FOUND_TAG}:{}", self.entity_name, parts.join(":"))
    }

    /// Equivalent-identity key in the fallback tier.
    pub fn fallback_key(&self, parts: &[String]) -> FallbackKey {
        FallbackKey {
            collection: self.entity_name.clone(),
            id: parts.join(":"),
        }
    }

    /// Joined key for error messages.
    pub fn display_key(&self, parts: &[String]) -> String {
        parts.join(":")
    }

    /// Check that a write carries the declared number of non-empty key
    /// parts.
    pub fn check_key_parts(&self, parts: &[String]) -> Result<()> {
        if parts.len() != self.key_attrs.len() {
            let attribute = self
                .key_attrs
                .get(parts.len())
                .cloned()
                .unwrap_or_else(|| "key_attrs".to_string());
            return Err(Error::InvalidKeyAttribute {
                entity: self.entity_name.clone(),
                attribute,
            });
        }
        for (attr, part) in self.key_attrs.iter().zip(parts) {
            if part.is_empty() {
                return Err(Error::InvalidKeyAttribute {
                    entity: self.entity_name.clone(),
                    attribute: attr.clone(),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
