//! Metered property catalogue.
//!
//! Properties (cpu, memory, storage, network, ...) are identified by a stable
//! small integer and carry the aggregation rule and unit price used by the
//! metering and billing pipelines. The catalogue is loaded once at startup
//! and read lock-free afterwards.

use crate::error::AppError;
use crate::models::monitor::EnumUsedMap;
use crate::utils::crypto;
use crate::utils::quantity::parse_quantity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Decrypted unit-price cache row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub property: String,
    pub price: i64,
    #[serde(default)]
    pub detail: String,
}

/// How samples of a property fold into one hourly value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PriceType {
    /// Average over the hour.
    #[default]
    #[serde(rename = "AVG")]
    Avg,
    /// Accumulated value.
    #[serde(rename = "SUM")]
    Sum,
    /// Difference between the max and the smallest non-zero sample.
    #[serde(rename = "DIF")]
    Dif,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::Avg => "AVG",
            PriceType::Sum => "SUM",
            PriceType::Dif => "DIF",
        }
    }
}

/// A metered property definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyType {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    /// Stable enum id referenced by persisted `used` maps.
    #[serde(rename = "enum")]
    pub enum_id: u8,
    #[serde(default)]
    pub price_type: PriceType,
    /// Price per `unit` of usage, decrypted at registry construction.
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encrypt_unit_price: String,
    /// Canonical quantity the price is quoted against, e.g. "1Mi", "1m".
    #[serde(default, rename = "unit")]
    pub unit: String,
    /// Charging cycle, seconds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit_period: String,
    /// Numeric magnitude of `unit`, filled in by the registry.
    #[serde(skip)]
    pub unit_quantity: f64,
}

/// Compiled-in catalogue used when the store has none or decryption fails.
pub fn default_property_types() -> Vec<PropertyType> {
    vec![
        PropertyType {
            name: "cpu".to_string(),
            alias: String::new(),
            enum_id: 0,
            price_type: PriceType::Avg,
            // raw price: 67
            unit_price: 2.237442922,
            encrypt_unit_price: String::new(),
            unit: "1m".to_string(),
            unit_period: String::new(),
            unit_quantity: 0.0,
        },
        PropertyType {
            name: "memory".to_string(),
            alias: String::new(),
            enum_id: 1,
            price_type: PriceType::Avg,
            // raw price: 33
            unit_price: 1.092501427,
            encrypt_unit_price: String::new(),
            unit: "1Mi".to_string(),
            unit_period: String::new(),
            unit_quantity: 0.0,
        },
        PropertyType {
            name: "storage".to_string(),
            alias: String::new(),
            enum_id: 2,
            price_type: PriceType::Avg,
            unit_price: 0.0,
            encrypt_unit_price: String::new(),
            unit: "1Mi".to_string(),
            unit_period: String::new(),
            unit_quantity: 0.0,
        },
        PropertyType {
            name: "network".to_string(),
            alias: String::new(),
            enum_id: 3,
            price_type: PriceType::Dif,
            unit_price: 0.0,
            encrypt_unit_price: String::new(),
            unit: "1Mi".to_string(),
            unit_period: String::new(),
            unit_quantity: 0.0,
        },
    ]
}

/// Raw default prices (1000000 units = 1 currency unit).
pub fn default_prices() -> HashMap<String, Price> {
    [("cpu", 67i64), ("memory", 33), ("storage", 2)]
        .into_iter()
        .map(|(name, price)| {
            (
                name.to_string(),
                Price {
                    property: name.to_string(),
                    price,
                    detail: String::new(),
                },
            )
        })
        .collect()
}

/// Dual-indexed property catalogue.
#[derive(Debug, Clone)]
pub struct PropertyTypeRegistry {
    types: Vec<PropertyType>,
    string_map: HashMap<String, PropertyType>,
    enum_map: HashMap<u8, PropertyType>,
}

impl PropertyTypeRegistry {
    /// Build a registry from stored rows, decrypting each encrypted unit
    /// price. Any missing or undecryptable price falls the whole catalogue
    /// back to the compiled-in defaults.
    pub fn new(types: Vec<PropertyType>) -> Self {
        let types = match decrypt_prices(types) {
            Ok(types) => types,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decrypt unit prices, using default catalogue");
                default_property_types()
            }
        };
        Self::build(types)
    }

    /// Build a registry from already-decrypted rows.
    pub fn from_types(types: Vec<PropertyType>) -> Self {
        Self::build(types)
    }

    fn build(mut types: Vec<PropertyType>) -> Self {
        for property in &mut types {
            if !property.unit.is_empty() {
                match parse_quantity(&property.unit) {
                    Ok(q) => property.unit_quantity = q,
                    Err(e) => {
                        tracing::warn!(
                            property = %property.name,
                            unit = %property.unit,
                            error = %e,
                            "unparseable unit quantity"
                        );
                    }
                }
            }
        }

        let mut string_map = HashMap::with_capacity(types.len());
        let mut enum_map = HashMap::with_capacity(types.len());
        for property in &types {
            string_map.insert(property.name.clone(), property.clone());
            enum_map.insert(property.enum_id, property.clone());
        }
        Self {
            types,
            string_map,
            enum_map,
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&PropertyType> {
        self.string_map.get(name)
    }

    pub fn by_enum(&self, enum_id: u8) -> Option<&PropertyType> {
        self.enum_map.get(&enum_id)
    }

    pub fn all(&self) -> &[PropertyType] {
        &self.types
    }

    pub fn enum_map(&self) -> &HashMap<u8, PropertyType> {
        &self.enum_map
    }
}

impl Default for PropertyTypeRegistry {
    fn default() -> Self {
        Self::build(default_property_types())
    }
}

fn decrypt_prices(mut types: Vec<PropertyType>) -> Result<Vec<PropertyType>, AppError> {
    for property in &mut types {
        if property.encrypt_unit_price.is_empty() {
            return Err(AppError::CryptoError(anyhow::anyhow!(
                "encrypted {} unit price is empty",
                property.name
            )));
        }
        property.unit_price = crypto::decrypt_float64(&property.encrypt_unit_price)?;
    }
    Ok(types)
}

static GLOBAL_REGISTRY: OnceLock<PropertyTypeRegistry> = OnceLock::new();

/// Publish the process-wide registry. Later calls are ignored; reinitialization
/// (hot reload) is not supported.
pub fn install_registry(registry: PropertyTypeRegistry) {
    if GLOBAL_REGISTRY.set(registry).is_err() {
        tracing::warn!("property registry already installed, keeping existing catalogue");
    }
}

/// Process-wide registry; the default catalogue if none was installed.
pub fn global_registry() -> &'static PropertyTypeRegistry {
    GLOBAL_REGISTRY.get_or_init(PropertyTypeRegistry::default)
}

/// Translate an enum-keyed cost map into property names via the global
/// registry. Unknown enum ids are dropped.
pub fn convert_enum_used_to_string(costs: &EnumUsedMap) -> HashMap<String, i64> {
    let registry = global_registry();
    let mut out = HashMap::with_capacity(costs.len());
    for (enum_id, value) in costs.iter() {
        if let Some(property) = registry.by_enum(enum_id) {
            *out.entry(property.name.clone()).or_insert(0) += value;
        }
    }
    out
}
