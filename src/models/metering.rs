//! Hourly metering record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One metered hour for a (category, property) stream.
///
/// `time` is the window end: a record at 12:00 covers 11:00 - 12:00.
/// Records are inserted once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metering {
    pub category: String,
    pub property: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub time: DateTime<Utc>,
    /// Aggregated per-unit value for the hour.
    pub value: i64,
    /// `value` priced against the property's unit price.
    pub amount: i64,
    #[serde(default)]
    pub detail: String,
}

/// Aggregated totals for a set of categories at one metering timestamp.
#[derive(Debug, Clone, Deserialize)]
pub struct MeteringOwnerTimeResult {
    pub amount: i64,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub time: DateTime<Utc>,
    /// Per-property amount totals, keyed by property name.
    #[serde(default)]
    pub costs: HashMap<String, i64>,
}
