//! Query values.
//!
//! A query is an immutable description of a read: key parts, routing
//! hint, and the closed option set. Unsupported combinations are
//! rejected by the entity kind as `invalid-query` when the read is
//! staged; there is no open keyword surface.

use crate::domain::geo::DistanceUnit;

/// The closed option set for reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Hash kinds: project to these fields
    pub fields: Option<Vec<String>>,
    /// Sorted-set kinds: reverse the range
    pub reverse: bool,
    /// Sorted-set kinds: return scores with members
    pub withscores: bool,
    /// Sorted-set kinds: 1-based page
    pub page: Option<usize>,
    /// Sorted-set kinds: page size
    pub page_size: Option<usize>,
    /// Sorted-set kinds: inclusive score lower bound
    pub min_score: Option<f64>,
    /// Sorted-set kinds: inclusive score upper bound
    pub max_score: Option<f64>,
    /// Geo kinds: query point latitude
    pub latitude: Option<f64>,
    /// Geo kinds: query point longitude
    pub longitude: Option<f64>,
    /// Geo kinds: radius in `distance_unit`
    pub max_distance: Option<f64>,
    /// Geo kinds: radius / distance unit
    pub distance_unit: Option<DistanceUnit>,
    /// Geo kinds: include distances in results
    pub with_dist: bool,
    /// Geo kinds: include coordinates in results
    pub with_coord: bool,
    /// Geo kinds: bound the number of results
    pub count: Option<usize>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn withscores(mut self, withscores: bool) -> Self {
        self.withscores = withscores;
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    pub fn score_range(mut self, min: f64, max: f64) -> Self {
        self.min_score = Some(min);
        self.max_score = Some(max);
        self
    }

    pub fn radius(mut self, latitude: f64, longitude: f64, max_distance: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self.max_distance = Some(max_distance);
        self
    }

    pub fn distance_unit(mut self, unit: DistanceUnit) -> Self {
        self.distance_unit = Some(unit);
        self
    }

    pub fn with_dist(mut self, with_dist: bool) -> Self {
        self.with_dist = with_dist;
        self
    }

    pub fn with_coord(mut self, with_coord: bool) -> Self {
        self.with_coord = with_coord;
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// True when a score range is requested.
    pub fn has_score_range(&self) -> bool {
        self.min_score.is_some() || self.max_score.is_some()
    }

    /// Name/value pairs of every set option, for local cache key
    /// derivation: two reads with different options must never share a
    /// cache entry.
    pub fn filter_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut push = |name: &str, value: String| pairs.push((name.to_string(), value));

        if let Some(fields) = &self.fields {
            push("fields", fields.join(","));
        }
        if self.reverse {
            push("reverse", "1".to_string());
        }
        if self.withscores {
            push("withscores", "1".to_string());
        }
        if let Some(page) = self.page {
            push("page", page.to_string());
        }
        if let Some(page_size) = self.page_size {
            push("page_size", page_size.to_string());
        }
        if let Some(min_score) = self.min_score {
            push("min_score", min_score.to_string());
        }
        if let Some(max_score) = self.max_score {
            push("max_score", max_score.to_string());
        }
        if let Some(latitude) = self.latitude {
            push("latitude", latitude.to_string());
        }
        if let Some(longitude) = self.longitude {
            push("longitude", longitude.to_string());
        }
        if let Some(max_distance) = self.max_distance {
            push("max_distance", max_distance.to_string());
        }
        if let Some(unit) = self.distance_unit {
            push("distance_unit", unit.to_string());
        }
        if self.with_dist {
            push("with_dist", "1".to_string());
        }
        if self.with_coord {
            push("with_coord", "1".to_string());
        }
        if let Some(count) = self.count {
            push("count", count.to_string());
        }
        pairs
    }
}

/// A single-key read.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Enter the two-tier path; `false` bypasses the memory tier
    /// (the disaster-recovery path used under an open breaker).
    pub memory: bool,
    /// Ordered key attribute values
    pub key_parts: Vec<String>,
    pub options: QueryOptions,
}

impl Query {
    pub fn new(key_parts: Vec<String>) -> Self {
        Self {
            memory: true,
            key_parts,
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// The same query routed around the memory tier.
    pub fn bypass_memory(&self) -> Self {
        Self {
            memory: false,
            key_parts: self.key_parts.clone(),
            options: self.options.clone(),
        }
    }
}

/// A multi-key read; `many_key_parts` is the per-sub-query
/// materialisation, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMany {
    pub memory: bool,
    pub many_key_parts: Vec<Vec<String>>,
    pub options: QueryOptions,
}

impl QueryMany {
    pub fn new(many_key_parts: Vec<Vec<String>>) -> Self {
        Self {
            memory: true,
            many_key_parts,
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn bypass_memory(&self) -> Self {
        Self {
            memory: false,
            many_key_parts: self.many_key_parts.clone(),
            options: self.options.clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_defaults_to_memory_path() {
        let q = Query::new(vec!["p1".to_string()]);
        assert!(q.memory);
        assert_eq!(q.options, QueryOptions::default());
    }

    #[test]
    fn test_bypass_memory_preserves_everything_else() {
        let q = Query::new(vec!["p1".to_string()])
            .with_options(QueryOptions::new().fields(vec!["name".to_string()]));
        let bypass = q.bypass_memory();

        assert!(!bypass.memory);
        assert_eq!(bypass.key_parts, q.key_parts);
        assert_eq!(bypass.options, q.options);
    }

    #[test]
    fn test_options_builder() {
        let options = QueryOptions::new()
            .reverse(true)
            .withscores(true)
            .page(2, 10);

        assert!(options.reverse);
        assert!(options.withscores);
        assert_eq!(options.page, Some(2));
        assert_eq!(options.page_size, Some(10));
        assert!(!options.has_score_range());
    }

    #[test]
    fn test_score_range_detection() {
        let options = QueryOptions::new().score_range(1.0, 2.0);
        assert!(options.has_score_range());
    }
}
