//! Hash entity kind.
//!
//! A hash entity is a user record serialised as a field map. The memory
//! tier stores it as a hash-map of strings: booleans encode as
//! `'1'/'0'`, numbers as decimal strings, nested values as compact
//! JSON, and null fields are omitted. The fallback document keeps the
//! record's native JSON types.
//!
//! Materialising from the memory tier therefore needs a coercing
//! deserializer: the target record's field types drive how each string
//! is parsed back. Projected reads (`fields`) return partial maps, so
//! records read with a projection must tolerate missing fields
//! (`Option` fields or `#[serde(default)]`).

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::de::value::StringDeserializer;
use serde::de::{self, DeserializeOwned, IntoDeserializer};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::ports::{MemoryBatch, ReadOp, ReadReply};
use crate::error::{Error, Result};
use crate::repository::config::RepositoryConfig;
use crate::repository::kind::EntityKind;
use crate::repository::query::QueryOptions;

/// Hash entity kind, generic over the user record.
pub struct HashKind<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> HashKind<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for HashKind<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EntityKind for HashKind<E>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Entity = E;

    fn stage_read(&self, memory_key: &str, options: &QueryOptions) -> Result<ReadOp> {
        match &options.fields {
            Some(fields) if fields.is_empty() => Err(Error::InvalidQuery(
                "field projection must name at least one field".to_string(),
            )),
            Some(fields) => Ok(ReadOp::HGet(memory_key.to_string(), fields.clone())),
            None => Ok(ReadOp::HGetAll(memory_key.to_string())),
        }
    }

    fn decode_read(
        &self,
        _key_parts: &[String],
        reply: ReadReply,
        options: &QueryOptions,
    ) -> Result<Option<E>> {
        match reply {
            ReadReply::Fields(map) => {
                if map.is_empty() {
                    return Ok(None);
                }
                Ok(Some(record_from_strings(map)?))
            }
            ReadReply::FieldValues(values) => {
                let fields = options.fields.as_ref().ok_or_else(|| {
                    Error::memory_tier("projected reply without a field projection")
                })?;
                let present: HashMap<String, String> = fields
                    .iter()
                    .zip(values)
                    .filter_map(|(field, value)| value.map(|v| (field.clone(), v)))
                    .collect();
                if present.is_empty() {
                    return Ok(None);
                }
                Ok(Some(record_from_strings(present)?))
            }
            other => Err(Error::memory_tier(format!(
                "unexpected hash reply: {other:?}"
            ))),
        }
    }

    fn stage_write(&self, batch: &mut MemoryBatch, memory_key: &str, entity: &E) -> Result<()> {
        let doc = self.to_document(entity)?;
        self.stage_backfill(batch, memory_key, &doc)
    }

    fn stage_backfill(&self, batch: &mut MemoryBatch, memory_key: &str, doc: &Value) -> Result<()> {
        let object = doc
            .as_object()
            .ok_or_else(|| Error::InvalidEntityType("hash document is not an object".to_string()))?;

        let fields = object_to_field_strings(object)?;
        if !fields.is_empty() {
            batch.hset(memory_key.to_string(), fields);
        }
        Ok(())
    }

    fn to_document(&self, entity: &E) -> Result<Value> {
        let value = serde_json::to_value(entity)?;
        if !value.is_object() {
            return Err(Error::InvalidEntityType(
                "hash entities must serialize to a field map".to_string(),
            ));
        }
        Ok(value)
    }

    fn materialize_fallback(
        &self,
        _key_parts: &[String],
        doc: &Value,
        options: &QueryOptions,
    ) -> Result<Option<E>> {
        let object = doc
            .as_object()
            .ok_or_else(|| Error::InvalidEntityType("hash document is not an object".to_string()))?;

        let projected: Map<String, Value> = match &options.fields {
            Some(fields) => object
                .iter()
                .filter(|(name, value)| fields.contains(name) && !value.is_null())
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None => object.clone(),
        };

        if projected.is_empty() && options.fields.is_some() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_value(Value::Object(projected))?))
    }

    fn key_parts(&self, config: &RepositoryConfig, entity: &E) -> Result<Vec<String>> {
        let value = serde_json::to_value(entity)?;
        let object = value.as_object().ok_or_else(|| {
            Error::InvalidEntityType("hash entities must serialize to a field map".to_string())
        })?;

        config
            .key_attrs
            .iter()
            .map(|attr| {
                object
                    .get(attr)
                    .and_then(scalar_field_string)
                    .ok_or_else(|| Error::InvalidKeyAttribute {
                        entity: config.entity_name.clone(),
                        attribute: attr.clone(),
                    })
            })
            .collect()
    }
}

// =============================================================================
// Memory field encoding
// =============================================================================

/// Memory-tier string for one field value; `None` drops the field.
fn field_string(value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(true) => Ok(Some("1".to_string())),
        Value::Bool(false) => Ok(Some("0".to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::String(s) => Ok(Some(s.clone())),
        nested => Ok(Some(serde_json::to_string(nested)?)),
    }
}

/// Scalar-only variant used for key attributes.
fn scalar_field_string(value: &Value) -> Option<String> {
    match value {
        Value::Bool(true) => Some("1".to_string()),
        Value::Bool(false) => Some("0".to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn object_to_field_strings(object: &Map<String, Value>) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::with_capacity(object.len());
    for (name, value) in object {
        if let Some(encoded) = field_string(value)? {
            fields.push((name.clone(), encoded));
        }
    }
    Ok(fields)
}

// =============================================================================
// Coercing deserialization from memory field strings
// =============================================================================

/// Rebuild a record from memory-tier field strings, letting the target
/// field types drive the parsing.
pub(crate) fn record_from_strings<E: DeserializeOwned>(fields: HashMap<String, String>) -> Result<E> {
    E::deserialize(FieldMapDeserializer {
        iter: fields.into_iter(),
        pending: None,
    })
    .map_err(Error::from)
}

struct FieldMapDeserializer {
    iter: std::collections::hash_map::IntoIter<String, String>,
    pending: Option<String>,
}

impl<'de> de::Deserializer<'de> for FieldMapDeserializer {
    type Error = serde_json::Error;

    fn deserialize_any<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_map(self)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

impl<'de> de::MapAccess<'de> for FieldMapDeserializer {
    type Error = serde_json::Error;

    fn next_key_seed<S>(&mut self, seed: S) -> std::result::Result<Option<S::Value>, Self::Error>
    where
        S: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                let key: StringDeserializer<serde_json::Error> = key.into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<S>(&mut self, seed: S) -> std::result::Result<S::Value, Self::Error>
    where
        S: de::DeserializeSeed<'de>,
    {
        let value = self
            .pending
            .take()
            .ok_or_else(|| de::Error::custom("field value read before its key"))?;
        seed.deserialize(FieldStringDeserializer { value })
    }
}

/// Deserializer over one field string; typed requests parse the string,
/// structured requests re-enter the JSON parser.
struct FieldStringDeserializer {
    value: String,
}

macro_rules! deserialize_parsed {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
        where
            V: de::Visitor<'de>,
        {
            let parsed: $ty = self.value.trim().parse().map_err(|_| {
                de::Error::custom(format!(
                    concat!("cannot parse '{}' as ", stringify!($ty)),
                    self.value
                ))
            })?;
            visitor.$visit(parsed)
        }
    };
}

impl<'de> de::Deserializer<'de> for FieldStringDeserializer {
    type Error = serde_json::Error;

    fn deserialize_any<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_string(self.value)
    }

    fn deserialize_bool<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self.value.as_str() {
            "1" | "true" => visitor.visit_bool(true),
            "0" | "false" => visitor.visit_bool(false),
            other => Err(de::Error::custom(format!(
                "cannot parse '{other}' as bool"
            ))),
        }
    }

    deserialize_parsed!(deserialize_i8, visit_i8, i8);
    deserialize_parsed!(deserialize_i16, visit_i16, i16);
    deserialize_parsed!(deserialize_i32, visit_i32, i32);
    deserialize_parsed!(deserialize_i64, visit_i64, i64);
    deserialize_parsed!(deserialize_u8, visit_u8, u8);
    deserialize_parsed!(deserialize_u16, visit_u16, u16);
    deserialize_parsed!(deserialize_u32, visit_u32, u32);
    deserialize_parsed!(deserialize_u64, visit_u64, u64);
    deserialize_parsed!(deserialize_f32, visit_f32, f32);
    deserialize_parsed!(deserialize_f64, visit_f64, f64);

    fn deserialize_char<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let mut chars = self.value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => visitor.visit_char(c),
            _ => Err(de::Error::custom(format!(
                "cannot parse '{}' as char",
                self.value
            ))),
        }
    }

    fn deserialize_str<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_string(self.value)
    }

    fn deserialize_string<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_string(self.value)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_byte_buf(self.value.into_bytes())
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_byte_buf(self.value.into_bytes())
    }

    fn deserialize_option<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        // A present field is always `Some`; absent fields never reach
        // the deserializer.
        visitor.visit_some(self)
    }

    fn deserialize_unit<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let mut de = serde_json::Deserializer::from_reader(self.value.as_bytes());
        de::Deserializer::deserialize_seq(&mut de, visitor)
    }

    fn deserialize_tuple<V>(
        self,
        len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let mut de = serde_json::Deserializer::from_reader(self.value.as_bytes());
        de::Deserializer::deserialize_tuple(&mut de, len, visitor)
    }

    fn deserialize_tuple_struct<V>(
        self,
        name: &'static str,
        len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let mut de = serde_json::Deserializer::from_reader(self.value.as_bytes());
        de::Deserializer::deserialize_tuple_struct(&mut de, name, len, visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let mut de = serde_json::Deserializer::from_reader(self.value.as_bytes());
        de::Deserializer::deserialize_map(&mut de, visitor)
    }

    fn deserialize_struct<V>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let mut de = serde_json::Deserializer::from_reader(self.value.as_bytes());
        de::Deserializer::deserialize_struct(&mut de, name, fields, visitor)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let variant: StringDeserializer<serde_json::Error> = self.value.into_deserializer();
        visitor.visit_enum(variant)
    }

    fn deserialize_identifier<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_string(self.value)
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> std::result::Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }
}

// =============================================================================
// Tests
// =============================================================================
