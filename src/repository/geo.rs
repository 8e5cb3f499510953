//! Geospatial entity kind.
//!
//! A set of (member, latitude, longitude) points answering radius
//! queries from a point. The fallback document is
//! `{"data": [{"member", "latitude", "longitude"}, ...]}`; backfill
//! re-adds every point, and the returned entity is selected in-process
//! with the same haversine distance the in-memory adapter uses.

use serde_json::{json, Value};

use crate::domain::geo::{haversine_meters, DistanceUnit};
use crate::domain::ports::{GeoMember, GeoRadius, MemoryBatch, ReadOp, ReadReply};
use crate::error::{Error, Result};
use crate::repository::config::RepositoryConfig;
use crate::repository::kind::EntityKind;
use crate::repository::query::QueryOptions;

/// A geospatial entity: its key parts and the selected points.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoEntry {
    pub key_parts: Vec<String>,
    pub points: Vec<GeoMember>,
}

impl GeoEntry {
    pub fn new(key_parts: Vec<String>, points: Vec<GeoMember>) -> Self {
        Self { key_parts, points }
    }

    /// Member names in selection order.
    pub fn member_names(&self) -> Vec<&str> {
        self.points.iter().map(|p| p.member.as_str()).collect()
    }
}

/// Geospatial entity kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoKind;

impl GeoKind {
    pub fn new() -> Self {
        Self
    }
}

impl GeoKind {
    fn radius_query(options: &QueryOptions) -> Result<GeoRadius> {
        let latitude = options
            .latitude
            .ok_or_else(|| Error::InvalidQuery("geo query requires latitude".to_string()))?;
        let longitude = options
            .longitude
            .ok_or_else(|| Error::InvalidQuery("geo query requires longitude".to_string()))?;
        let radius = options
            .max_distance
            .ok_or_else(|| Error::InvalidQuery("geo query requires max_distance".to_string()))?;

        Ok(GeoRadius {
            longitude,
            latitude,
            radius,
            unit: options.distance_unit.unwrap_or_default(),
            with_dist: options.with_dist,
            with_coord: options.with_coord,
            count: options.count,
        })
    }
}

impl EntityKind for GeoKind {
    type Entity = GeoEntry;

    fn stage_read(&self, memory_key: &str, options: &QueryOptions) -> Result<ReadOp> {
        Ok(ReadOp::GeoRadius {
            key: memory_key.to_string(),
            query: Self::radius_query(options)?,
        })
    }

    fn decode_read(
        &self,
        key_parts: &[String],
        reply: ReadReply,
        _options: &QueryOptions,
    ) -> Result<Option<GeoEntry>> {
        match reply {
            ReadReply::GeoMembers(points) => {
                if points.is_empty() {
                    return Ok(None);
                }
                Ok(Some(GeoEntry::new(key_parts.to_vec(), points)))
            }
            other => Err(Error::memory_tier(format!(
                "unexpected geo reply: {other:?}"
            ))),
        }
    }

    fn stage_write(&self, batch: &mut MemoryBatch, memory_key: &str, entity: &GeoEntry) -> Result<()> {
        let mut points = Vec::with_capacity(entity.points.len());
        for point in &entity.points {
            let (latitude, longitude) = match (point.latitude, point.longitude) {
                (Some(lat), Some(lon)) => (lat, lon),
                _ => {
                    return Err(Error::InvalidEntityType(format!(
                        "geo member '{}' has no coordinates",
                        point.member
                    )))
                }
            };
            points.push((point.member.clone(), latitude, longitude));
        }

        if !points.is_empty() {
            batch.geo_add(memory_key.to_string(), points);
        }
        Ok(())
    }

    fn stage_backfill(&self, batch: &mut MemoryBatch, memory_key: &str, doc: &Value) -> Result<()> {
        let points = points_from_document(doc)?;
        if !points.is_empty() {
            batch.geo_add(memory_key.to_string(), points);
        }
        Ok(())
    }

    fn to_document(&self, entity: &GeoEntry) -> Result<Value> {
        let mut data = Vec::with_capacity(entity.points.len());
        for point in &entity.points {
            let (latitude, longitude) = match (point.latitude, point.longitude) {
                (Some(lat), Some(lon)) => (lat, lon),
                _ => {
                    return Err(Error::InvalidEntityType(format!(
                        "geo member '{}' has no coordinates",
                        point.member
                    )))
                }
            };
            data.push(json!({
                "member": point.member,
                "latitude": latitude,
                "longitude": longitude,
            }));
        }
        Ok(json!({ "data": data }))
    }

    fn materialize_fallback(
        &self,
        key_parts: &[String],
        doc: &Value,
        options: &QueryOptions,
    ) -> Result<Option<GeoEntry>> {
        let query = Self::radius_query(options)?;
        let radius_meters = query.unit.to_meters(query.radius);

        let mut selected: Vec<(GeoMember, f64)> = Vec::new();
        for (member, latitude, longitude) in points_from_document(doc)? {
            let distance =
                haversine_meters(query.latitude, query.longitude, latitude, longitude);
            if distance <= radius_meters {
                selected.push((
                    GeoMember {
                        member,
                        latitude: query.with_coord.then_some(latitude),
                        longitude: query.with_coord.then_some(longitude),
                        distance: query.with_dist.then(|| query.unit.from_meters(distance)),
                    },
                    distance,
                ));
            }
        }

        selected.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(count) = query.count {
            selected.truncate(count);
        }

        if selected.is_empty() {
            return Ok(None);
        }

        let points = selected.into_iter().map(|(point, _)| point).collect();
        Ok(Some(GeoEntry::new(key_parts.to_vec(), points)))
    }

    fn key_parts(&self, config: &RepositoryConfig, entity: &GeoEntry) -> Result<Vec<String>> {
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
        vec!["data".to_string()]
    }
}

fn points_from_document(doc: &Value) -> Result<Vec<(String, f64, f64)>> {
    let data = doc.get("data").and_then(Value::as_array).ok_or_else(|| {
        Error::InvalidEntityType("geo document has no 'data' array".to_string())
    })?;

    let mut points = Vec::with_capacity(data.len());
    for item in data {
        let member = item
            .get("member")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidEntityType("geo point has no member".to_string()))?;
        let latitude = item
            .get("latitude")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::InvalidEntityType("geo point has no latitude".to_string()))?;
        let longitude = item
            .get("longitude")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::InvalidEntityType("geo point has no longitude".to_string()))?;
        points.push((member.to_string(), latitude, longitude));
    }
    Ok(points)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry() -> GeoEntry {
        GeoEntry::new(
            vec!["stores".to_string()],
            vec![
                GeoMember::point("downtown", 48.8566, 2.3522),
                GeoMember::point("suburb", 48.95, 2.5),
                GeoMember::point("faraway", 51.5074, -0.1278),
            ],
        )
    }

    fn near_paris() -> QueryOptions {
        QueryOptions::new()
            .radius(48.8566, 2.3522, 30.0)
            .distance_unit(DistanceUnit::Kilometers)
    }

    #[test]
    fn test_stage_read_requires_coordinates() {
        let err = GeoKind.stage_read("stores:1", &QueryOptions::new()).unwrap_err();
        assert_matches!(err, Error::InvalidQuery(_));

        let mut options = QueryOptions::new();
        options.latitude = Some(1.0);
        options.longitude = Some(2.0);
        let err = GeoKind.stage_read("stores:1", &options).unwrap_err();
        assert_matches!(err, Error::InvalidQuery(_));
    }

    #[test]
    fn test_document_shape() {
        let doc = GeoKind.to_document(&entry()).unwrap();
        let data = doc.get("data").unwrap().as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0].get("member").unwrap(), "downtown");
        assert!(data[0].get("latitude").unwrap().is_f64());
    }

    #[test]
    fn test_materialize_radius_selection() {
        let doc = GeoKind.to_document(&entry()).unwrap();
        let result = GeoKind
            .materialize_fallback(&["stores".to_string()], &doc, &near_paris())
            .unwrap()
            .unwrap();
        // faraway (London) is outside 30km; nearest first.
        assert_eq!(result.member_names(), vec!["downtown", "suburb"]);
        // Flags are off, so no coordinates or distances come back.
        assert_eq!(result.points[0].distance, None);
        assert_eq!(result.points[0].latitude, None);
    }

    #[test]
    fn test_materialize_with_dist_and_coord() {
        let doc = GeoKind.to_document(&entry()).unwrap();
        let options = near_paris().with_dist(true).with_coord(true);
        let result = GeoKind
            .materialize_fallback(&["stores".to_string()], &doc, &options)
            .unwrap()
            .unwrap();

        let downtown = &result.points[0];
        assert_eq!(downtown.member, "downtown");
        assert_eq!(downtown.latitude, Some(48.8566));
        assert!(downtown.distance.unwrap() < 0.001); // ~0 km from itself
    }

    #[test]
    fn test_materialize_count_truncates() {
        let doc = GeoKind.to_document(&entry()).unwrap();
        let result = GeoKind
            .materialize_fallback(&["stores".to_string()], &doc, &near_paris().count(1))
            .unwrap()
            .unwrap();
        assert_eq!(result.member_names(), vec!["downtown"]);
    }

    #[test]
    fn test_materialize_empty_selection_is_not_found() {
        let doc = GeoKind.to_document(&entry()).unwrap();
        let options = QueryOptions::new()
            .radius(-33.86, 151.2, 1.0)
            .distance_unit(DistanceUnit::Kilometers);
        let result = GeoKind
            .materialize_fallback(&["stores".to_string()], &doc, &options)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_write_requires_coordinates() {
        let mut batch = MemoryBatch::new();
        let entry = GeoEntry::new(
            vec!["stores".to_string()],
            vec![GeoMember {
                member: "nowhere".to_string(),
                latitude: None,
                longitude: None,
                distance: None,
            }],
        );
        let err = GeoKind.stage_write(&mut batch, "stores:1", &entry).unwrap_err();
        assert_matches!(err, Error::InvalidEntityType(_));
    }

    #[test]
    fn test_backfill_stages_geo_add() {
        let doc = GeoKind.to_document(&entry()).unwrap();
        let mut batch = MemoryBatch::new();
        GeoKind.stage_backfill(&mut batch, "stores:1", &doc).unwrap();

        let crate::domain::ports::WriteOp::GeoAdd(_, points) = &batch.ops()[0] else {
            panic!("expected geoadd");
        };
        assert_eq!(points.len(), 3);
    }
}
