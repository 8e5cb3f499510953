//! Sorted-set entity kind.
//!
//! An ordered multiset of (member, score) pairs with range and
//! score-range reads, optional reverse, and pagination. The fallback
//! document flattens the pairs into one interleaved array:
//! `{"values": [member0, score0, member1, score1, ...]}`.
//!
//! Backfill rebuilds the full set in the memory tier; range selection
//! for the returned entity is then applied in-process so the fallback
//! path answers exactly like the memory path.

use serde_json::{json, Value};

use crate::domain::ports::{MemoryBatch, ReadOp, ReadReply, ScoredMember};
use crate::error::{Error, Result};
use crate::repository::config::RepositoryConfig;
use crate::repository::kind::EntityKind;
use crate::repository::query::QueryOptions;

/// A sorted-set entity: its key parts and the selected members.
#[derive(Debug, Clone, PartialEq)]
pub struct SortedSetEntry {
    pub key_parts: Vec<String>,
    pub members: Vec<ScoredMember>,
    /// Write-side bound: keep only this many highest-scored members.
    pub max_size: Option<usize>,
}

impl SortedSetEntry {
    pub fn new(key_parts: Vec<String>, members: Vec<ScoredMember>) -> Self {
        Self {
            key_parts,
            members,
            max_size: None,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Members without scores, in selection order.
    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.member.as_str()).collect()
    }
}

/// Sorted-set entity kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortedSetKind;

impl SortedSetKind {
    pub fn new() -> Self {
        Self
    }
}

impl EntityKind for SortedSetKind {
    type Entity = SortedSetEntry;

    fn stage_read(&self, memory_key: &str, options: &QueryOptions) -> Result<ReadOp> {
        if options.page.is_some() && options.page_size.is_none() {
            return Err(Error::InvalidQuery(
                "page requires page_size".to_string(),
            ));
        }

        if options.has_score_range() {
            let (offset, count) = pagination(options);
            return Ok(ReadOp::ZRangeByScore {
                key: memory_key.to_string(),
                min: options.min_score.unwrap_or(f64::NEG_INFINITY),
                max: options.max_score.unwrap_or(f64::INFINITY),
                offset,
                count,
                withscores: options.withscores,
            });
        }

        let (start, stop) = index_range(options);
        Ok(ReadOp::ZRange {
            key: memory_key.to_string(),
            start,
            stop,
            reverse: options.reverse,
            withscores: options.withscores,
        })
    }

    fn decode_read(
        &self,
        key_parts: &[String],
        reply: ReadReply,
        _options: &QueryOptions,
    ) -> Result<Option<SortedSetEntry>> {
        match reply {
            ReadReply::Members(members) => {
                if members.is_empty() {
                    return Ok(None);
                }
                Ok(Some(SortedSetEntry::new(key_parts.to_vec(), members)))
            }
            other => Err(Error::memory_tier(format!(
                "unexpected sorted-set reply: {other:?}"
            ))),
        }
    }

    fn stage_write(
        &self,
        batch: &mut MemoryBatch,
        memory_key: &str,
        entity: &SortedSetEntry,
    ) -> Result<()> {
        let mut pairs = Vec::with_capacity(entity.members.len());
        for member in &entity.members {
            let score = member.score.ok_or_else(|| {
                Error::InvalidEntityType(format!(
                    "sorted-set member '{}' has no score",
                    member.member
                ))
            })?;
            pairs.push((member.member.clone(), score));
        }

        if let Some(max_size) = entity.max_size {
            pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            pairs.truncate(max_size);
        }

        if !pairs.is_empty() {
            batch.zadd(memory_key.to_string(), pairs);
        }
        Ok(())
    }

    fn stage_backfill(&self, batch: &mut MemoryBatch, memory_key: &str, doc: &Value) -> Result<()> {
        let pairs = pairs_from_document(doc)?;
        if !pairs.is_empty() {
            batch.zadd(memory_key.to_string(), pairs);
        }
        Ok(())
    }

    fn to_document(&self, entity: &SortedSetEntry) -> Result<Value> {
        let mut values = Vec::with_capacity(entity.members.len() * 2);
        for member in &entity.members {
            let score = member.score.ok_or_else(|| {
                Error::InvalidEntityType(format!(
                    "sorted-set member '{}' has no score",
                    member.member
                ))
            })?;
            values.push(Value::String(member.member.clone()));
            values.push(json!(score));
        }
        Ok(json!({ "values": values }))
    }

    fn materialize_fallback(
        &self,
        key_parts: &[String],
        doc: &Value,
        options: &QueryOptions,
    ) -> Result<Option<SortedSetEntry>> {
        let mut pairs = pairs_from_document(doc)?;
        pairs.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let selected: Vec<(String, f64)> = if options.has_score_range() {
            let min = options.min_score.unwrap_or(f64::NEG_INFINITY);
            let max = options.max_score.unwrap_or(f64::INFINITY);
            let in_range = pairs
                .into_iter()
                .filter(|(_, score)| (min..=max).contains(score));
            match pagination(options) {
                (Some(offset), Some(count)) => in_range.skip(offset).take(count).collect(),
                _ => in_range.collect(),
            }
        } else {
            if options.reverse {
                pairs.reverse();
            }
            match pagination(options) {
                (Some(offset), Some(count)) => {
                    pairs.into_iter().skip(offset).take(count).collect()
                }
                _ => pairs,
            }
        };

        if selected.is_empty() {
            return Ok(None);
        }

        let members = selected
            .into_iter()
            .map(|(member, score)| ScoredMember {
                member,
                score: options.withscores.then_some(score),
            })
            .collect();
        Ok(Some(SortedSetEntry::new(key_parts.to_vec(), members)))
    }

    fn key_parts(&self, config: &RepositoryConfig, entity: &SortedSetEntry) -> Result<Vec<String>> {
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
        vec!["values".to_string()]
    }
}

/// `(offset, count)` for score-range reads and in-process selection.
fn pagination(options: &QueryOptions) -> (Option<usize>, Option<usize>) {
    match options.page_size {
        Some(size) => {
            let page = options.page.unwrap_or(1).max(1);
            (Some((page - 1) * size), Some(size))
        }
        None => (None, None),
    }
}

/// `(start, stop)` indices for index-range reads.
fn index_range(options: &QueryOptions) -> (isize, isize) {
    match options.page_size {
        Some(size) => {
            let page = options.page.unwrap_or(1).max(1);
            let start = ((page - 1) * size) as isize;
            (start, start + size as isize - 1)
        }
        None => (0, -1),
    }
}

fn pairs_from_document(doc: &Value) -> Result<Vec<(String, f64)>> {
    let values = doc
        .get("values")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::InvalidEntityType("sorted-set document has no 'values' array".to_string())
        })?;

    if values.len() % 2 != 0 {
        return Err(Error::InvalidEntityType(
            "sorted-set 'values' array must interleave members and scores".to_string(),
        ));
    }

    let mut pairs = Vec::with_capacity(values.len() / 2);
    for chunk in values.chunks_exact(2) {
        let member = chunk[0].as_str().ok_or_else(|| {
            Error::InvalidEntityType("sorted-set member is not a string".to_string())
        })?;
        let score = chunk[1].as_f64().ok_or_else(|| {
            Error::InvalidEntityType("sorted-set score is not a number".to_string())
        })?;
        pairs.push((member.to_string(), score));
    }
    Ok(pairs)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry() -> SortedSetEntry {
        SortedSetEntry::new(
            vec!["board".to_string()],
            vec![
                ScoredMember::scored("m1", 0.0),
                ScoredMember::scored("m2", 1.0),
                ScoredMember::scored("m3", 2.0),
                ScoredMember::scored("m4", 3.0),
            ],
        )
    }

    fn doc() -> Value {
        SortedSetKind.to_document(&entry()).unwrap()
    }

    #[test]
    fn test_document_interleaves_members_and_scores() {
        assert_eq!(
            doc(),
            json!({"values": ["m1", 0.0, "m2", 1.0, "m3", 2.0, "m4", 3.0]})
        );
    }

    #[test]
    fn test_stage_read_index_range() {
        let op = SortedSetKind
            .stage_read("board:1", &QueryOptions::new().reverse(true).page(1, 2))
            .unwrap();
        assert_eq!(
            op,
            ReadOp::ZRange {
                key: "board:1".to_string(),
                start: 0,
                stop: 1,
                reverse: true,
                withscores: false,
            }
        );
    }

    #[test]
    fn test_stage_read_score_range() {
        let op = SortedSetKind
            .stage_read("board:1", &QueryOptions::new().score_range(1.0, 2.0))
            .unwrap();
        assert_eq!(
            op,
            ReadOp::ZRangeByScore {
                key: "board:1".to_string(),
                min: 1.0,
                max: 2.0,
                offset: None,
                count: None,
                withscores: false,
            }
        );
    }

    #[test]
    fn test_page_without_page_size_rejected() {
        let mut options = QueryOptions::new();
        options.page = Some(2);
        let err = SortedSetKind.stage_read("board:1", &options).unwrap_err();
        assert_matches!(err, Error::InvalidQuery(_));
    }

    #[test]
    fn test_materialize_reverse_paging() {
        let result = SortedSetKind
            .materialize_fallback(
                &["board".to_string()],
                &doc(),
                &QueryOptions::new().reverse(true).page(1, 2),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.member_names(), vec!["m4", "m3"]);
    }

    #[test]
    fn test_materialize_score_range() {
        let result = SortedSetKind
            .materialize_fallback(
                &["board".to_string()],
                &doc(),
                &QueryOptions::new().score_range(1.0, 2.0),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.member_names(), vec!["m2", "m3"]);
    }

    #[test]
    fn test_materialize_empty_selection_is_not_found() {
        let result = SortedSetKind
            .materialize_fallback(
                &["board".to_string()],
                &doc(),
                &QueryOptions::new().score_range(9.0, 10.0),
            )
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_materialize_withscores() {
        let result = SortedSetKind
            .materialize_fallback(
                &["board".to_string()],
                &doc(),
                &QueryOptions::new().withscores(true).page(1, 1),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.members, vec![ScoredMember::scored("m1", 0.0)]);
    }

    #[test]
    fn test_write_requires_scores() {
        let mut batch = MemoryBatch::new();
        let entry = SortedSetEntry::new(
            vec!["board".to_string()],
            vec![ScoredMember::bare("m1")],
        );
        let err = SortedSetKind
            .stage_write(&mut batch, "board:1", &entry)
            .unwrap_err();
        assert_matches!(err, Error::InvalidEntityType(_));
    }

    #[test]
    fn test_max_size_keeps_highest_scores() {
        let mut batch = MemoryBatch::new();
        let entry = entry().with_max_size(2);
        SortedSetKind
            .stage_write(&mut batch, "board:1", &entry)
            .unwrap();

        let crate::domain::ports::WriteOp::ZAdd(_, pairs) = &batch.ops()[0] else {
            panic!("expected zadd");
        };
        let mut members: Vec<&str> = pairs.iter().map(|(m, _)| m.as_str()).collect();
        members.sort();
        assert_eq!(members, vec!["m3", "m4"]);
    }

    #[test]
    fn test_backfill_restores_all_pairs() {
        let mut batch = MemoryBatch::new();
        SortedSetKind
            .stage_backfill(&mut batch, "board:1", &doc())
            .unwrap();

        let crate::domain::ports::WriteOp::ZAdd(_, pairs) = &batch.ops()[0] else {
            panic!("expected zadd");
        };
        assert_eq!(pairs.len(), 4);
    }

    #[test]
    fn test_malformed_document_rejected() {
        let err = SortedSetKind
            .materialize_fallback(
                &["board".to_string()],
                &json!({"values": ["m1"]}),
                &QueryOptions::new(),
            )
            .unwrap_err();
        assert_matches!(err, Error::InvalidEntityType(_));
    }
}
