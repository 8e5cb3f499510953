//! Error types for CoucheCache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Which storage tier an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    /// Remote in-memory key-value tier
    Memory,
    /// Durable document-store tier
    Fallback,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Memory => write!(f, "memory"),
            TierKind::Fallback => write!(f, "fallback"),
        }
    }
}

/// Errors that can occur in the cache repository layer
#[derive(Error, Debug)]
pub enum Error {
    /// Entity absent from both tiers (or a negative marker says so)
    #[error("entity not found: {entity}:{key}")]
    NotFound { entity: String, key: String },

    /// A tier call was rejected because its circuit breaker is open
    #[error("circuit breaker '{name}' is open")]
    BreakerOpen { name: String },

    /// The underlying tier driver failed
    #[error("{tier} tier error: {message}")]
    Tier { tier: TierKind, message: String },

    /// A query's mandatory parameters are absent or inapplicable
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// An entity given to a write does not carry a declared key attribute
    #[error("entity '{entity}' is missing key attribute '{attribute}'")]
    InvalidKeyAttribute { entity: String, attribute: String },

    /// A repository was configured without a mandatory attribute
    #[error("repository configuration is missing required attribute '{0}'")]
    RequiredConfigAttribute(&'static str),

    /// The configured entity shape is not a supported record kind
    #[error("invalid entity type: {0}")]
    InvalidEntityType(String),

    /// Builder misuse
    #[error("configuration error: {0}")]
    Config(String),

    /// Entity (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Memory-tier error from any displayable driver failure.
    pub fn memory_tier(err: impl std::fmt::Display) -> Self {
        Error::Tier {
            tier: TierKind::Memory,
            message: err.to_string(),
        }
    }

    /// Fallback-tier error from any displayable driver failure.
    pub fn fallback_tier(err: impl std::fmt::Display) -> Self {
        Error::Tier {
            tier: TierKind::Fallback,
            message: err.to_string(),
        }
    }

    /// Not-found for a concrete entity key.
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Error::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// True for the `not-found` error kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for the `breaker-open` error kind.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Error::BreakerOpen { .. })
    }

    /// True for the tier-error kind the circuit breaker counts.
    pub fn is_tier_error(&self) -> bool {
        matches!(self, Error::Tier { .. })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::memory_tier(err)
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(err: mongodb::error::Error) -> Self {
        Error::fallback_tier(err)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_kind_display() {
        assert_eq!(TierKind::Memory.to_string(), "memory");
        assert_eq!(TierKind::Fallback.to_string(), "fallback");
    }

    #[test]
    fn test_error_kind_predicates() {
        let nf = Error::not_found("person", "p1");
        assert!(nf.is_not_found());
        assert!(!nf.is_tier_error());

        let tier = Error::memory_tier("connection refused");
        assert!(tier.is_tier_error());
        assert!(!tier.is_breaker_open());

        let open = Error::BreakerOpen {
            name: "person-memory".to_string(),
        };
        assert!(open.is_breaker_open());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::not_found("person", "p1");
        assert_eq!(err.to_string(), "entity not found: person:p1");

        let err = Error::fallback_tier("timeout");
        assert_eq!(err.to_string(), "fallback tier error: timeout");

        let err = Error::RequiredConfigAttribute("entity_name");
        assert!(err.to_string().contains("entity_name"));
    }
}
