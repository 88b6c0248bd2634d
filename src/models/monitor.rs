//! Raw usage sample model.

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Per-property usage, keyed by the property's stable enum id.
///
/// BSON documents require string keys, so the map round-trips through
/// stringified ids (`{"0": 150, "1": 2048}`). Null values (produced by the
/// billing pipeline's conditional `$min` when every sample was zero) decode
/// to 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumUsedMap(BTreeMap<u8, i64>);

impl EnumUsedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, property: u8) -> i64 {
        self.0.get(&property).copied().unwrap_or(0)
    }

    pub fn insert(&mut self, property: u8, value: i64) {
        self.0.insert(property, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, i64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u8, i64)> for EnumUsedMap {
    fn from_iter<I: IntoIterator<Item = (u8, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for EnumUsedMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(&k.to_string(), v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EnumUsedMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UsedMapVisitor;

        impl<'de> Visitor<'de> for UsedMapVisitor {
            type Value = EnumUsedMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of stringified property ids to integers")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, Option<i64>>()? {
                    let id: u8 = key.parse().map_err(serde::de::Error::custom)?;
                    out.insert(id, value.unwrap_or(0));
                }
                Ok(EnumUsedMap(out))
            }
        }

        deserializer.deserialize_map(UsedMapVisitor)
    }
}

/// A single usage observation for one resource in one category (namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub time: DateTime<Utc>,
    /// Logical owner of the sample; in practice the tenant namespace.
    pub category: String,
    #[serde(rename = "type", default)]
    pub app_type: u8,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub used: EnumUsedMap,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub property: String,
}
