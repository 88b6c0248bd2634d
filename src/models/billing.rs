//! Billing order model and query types.

use crate::models::monitor::EnumUsedMap;
use chrono::{DateTime, Utc};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Order kind, persisted as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BillingType {
    #[default]
    Consumption,
    Recharge,
    TransferIn,
    TransferOut,
}

impl BillingType {
    pub fn as_i32(&self) -> i32 {
        match self {
            BillingType::Consumption => 0,
            BillingType::Recharge => 1,
            BillingType::TransferIn => 2,
            BillingType::TransferOut => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(BillingType::Consumption),
            1 => Some(BillingType::Recharge),
            2 => Some(BillingType::TransferIn),
            3 => Some(BillingType::TransferOut),
            _ => None,
        }
    }
}

impl Serialize for BillingType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for BillingType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = deserialize_int(deserializer, "billing type")?;
        BillingType::from_i64(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown billing type {}", value)))
    }
}

/// Settlement state, persisted as an integer. `Unsettled -> Settled` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BillingStatus {
    #[default]
    Unsettled,
    Settled,
}

impl BillingStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            BillingStatus::Unsettled => 0,
            BillingStatus::Settled => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(BillingStatus::Unsettled),
            1 => Some(BillingStatus::Settled),
            _ => None,
        }
    }
}

impl Serialize for BillingStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for BillingStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = deserialize_int(deserializer, "billing status")?;
        BillingStatus::from_i64(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown billing status {}", value)))
    }
}

fn deserialize_int<'de, D: Deserializer<'de>>(
    deserializer: D,
    what: &'static str,
) -> Result<i64, D::Error> {
    struct IntVisitor(&'static str);

    impl<'de> Visitor<'de> for IntVisitor {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "an integer {}", self.0)
        }

        fn visit_i32<E: serde::de::Error>(self, v: i32) -> Result<i64, E> {
            Ok(v as i64)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<i64, E> {
            i64::try_from(v).map_err(serde::de::Error::custom)
        }
    }

    deserializer.deserialize_any(IntVisitor(what))
}

// App types: a coarse tag on what the billed resource is.
pub const DB: &str = "DB";
pub const APP: &str = "APP";
pub const TERMINAL: &str = "TERMINAL";
pub const JOB: &str = "JOB";
pub const OTHER: &str = "OTHER";

const APP_TYPES: [(&str, u8); 5] = [(DB, 1), (APP, 2), (TERMINAL, 3), (JOB, 4), (OTHER, 5)];

/// Case-insensitive app-type name to enum id. Unknown names map to 0.
pub fn app_type_from_str(name: &str) -> u8 {
    let upper = name.to_uppercase();
    APP_TYPES
        .iter()
        .find(|(n, _)| *n == upper)
        .map(|(_, v)| *v)
        .unwrap_or(0)
}

/// App-type enum id to name. Unknown ids map to the empty string.
pub fn app_type_name(value: u8) -> &'static str {
    APP_TYPES
        .iter()
        .find(|(_, v)| *v == value)
        .map(|(n, _)| *n)
        .unwrap_or("")
}

/// Payment details attached to recharge orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default, rename = "tradeNO", skip_serializing_if = "String::is_empty")]
    pub trade_no: String,
}

/// Transfer details attached to transfer orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    pub amount: i64,
}

/// Per-resource cost line embedded in a consumption order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCost {
    #[serde(default)]
    pub used: EnumUsedMap,
    #[serde(default)]
    pub used_amount: EnumUsedMap,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub name: String,
}

/// One billing order, atomically priced for one (namespace, app_type).
///
/// Append-only except for `status`; `(owner, order_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Billing {
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub time: DateTime<Utc>,
    pub order_id: String,
    #[serde(rename = "type")]
    pub billing_type: BillingType,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_costs: Vec<AppCost>,
    #[serde(default)]
    pub app_type: u8,
    pub amount: i64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub status: BillingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<Transfer>,
}

/// Type-driven view over an order's payload.
pub enum BillingPayload<'a> {
    Consumption(&'a [AppCost]),
    Recharge(Option<&'a Payment>),
    Transfer(Option<&'a Transfer>),
}

impl Billing {
    pub fn payload(&self) -> BillingPayload<'_> {
        match self.billing_type {
            BillingType::Consumption => BillingPayload::Consumption(&self.app_costs),
            BillingType::Recharge => BillingPayload::Recharge(self.payment.as_ref()),
            BillingType::TransferIn | BillingType::TransferOut => {
                BillingPayload::Transfer(self.transfer.as_ref())
            }
        }
    }
}

/// Settlement summary row returned by the unsettled-order scan.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingHandler {
    pub order_id: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub status: BillingStatus,
}

/// Billing record query. Either `order_id` is set, or the range fields are.
#[derive(Debug, Clone)]
pub struct BillingRecordQuery {
    /// When non-empty, the query is served by order id and every other
    /// field except the owner is ignored.
    pub order_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Billing type as an integer, -1 for any.
    pub billing_type: i32,
    /// Optional namespace filter; empty means any.
    pub namespace: String,
    /// Optional case-insensitive app-type name; empty means any.
    pub app_type: String,
    pub page: i64,
    pub page_size: i64,
}

impl BillingRecordQuery {
    pub fn by_order_id(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            start_time: DateTime::<Utc>::MIN_UTC,
            end_time: DateTime::<Utc>::MIN_UTC,
            billing_type: -1,
            namespace: String::new(),
            app_type: String::new(),
            page: 1,
            page_size: 1,
        }
    }

    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>, page: i64, page_size: i64) -> Self {
        Self {
            order_id: String::new(),
            start_time: start,
            end_time: end,
            billing_type: -1,
            namespace: String::new(),
            app_type: String::new(),
            page,
            page_size,
        }
    }
}

/// One row of a billing query result.
#[derive(Debug, Clone)]
pub struct BillingRecordItem {
    pub time: DateTime<Utc>,
    pub order_id: String,
    pub billing_type: BillingType,
    pub namespace: String,
    pub app_type: String,
    pub amount: i64,
    pub name: String,
    /// Per-property priced usage, keyed by property name.
    pub costs: HashMap<String, i64>,
    pub payment: Option<PaymentForQuery>,
}

#[derive(Debug, Clone)]
pub struct PaymentForQuery {
    pub amount: i64,
}

/// Billing query result: one page of rows plus window-wide aggregates.
#[derive(Debug, Clone, Default)]
pub struct BillingRecordQueryResult {
    pub items: Vec<BillingRecordItem>,
    /// Total number of pages, minimum 1.
    pub page_length: i64,
    pub total_count: i64,
    pub recharge_amount: i64,
    /// Per-property consumption totals over the window.
    pub deduction_amount: HashMap<String, i64>,
}

impl Default for BillingRecordItem {
    fn default() -> Self {
        Self {
            time: DateTime::<Utc>::MIN_UTC,
            order_id: String::new(),
            billing_type: BillingType::Consumption,
            namespace: String::new(),
            app_type: String::new(),
            amount: 0,
            name: String::new(),
            costs: HashMap::new(),
            payment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson;

    #[test]
    fn billing_type_persists_as_integer() {
        let doc = bson::to_document(&sample_billing()).unwrap();
        assert_eq!(doc.get_i32("type").unwrap(), 0);
        assert_eq!(doc.get_i32("status").unwrap(), 1);
    }

    #[test]
    fn billing_round_trips() {
        let billing = sample_billing();
        let doc = bson::to_document(&billing).unwrap();
        let back: Billing = bson::from_document(doc).unwrap();
        assert_eq!(back.order_id, billing.order_id);
        assert_eq!(back.billing_type, BillingType::Consumption);
        assert_eq!(back.status, BillingStatus::Settled);
        assert_eq!(back.app_costs.len(), 1);
        assert_eq!(back.app_costs[0].used_amount.get(0), 447);
    }

    #[test]
    fn unknown_billing_type_rejected() {
        let doc = bson::doc! {
            "time": bson::DateTime::now(),
            "order_id": "x",
            "type": 9,
            "namespace": "ns",
            "amount": 0i64,
        };
        assert!(bson::from_document::<Billing>(doc).is_err());
    }

    #[test]
    fn app_type_table_round_trips() {
        assert_eq!(app_type_from_str("db"), 1);
        assert_eq!(app_type_from_str("App"), 2);
        assert_eq!(app_type_from_str("TERMINAL"), 3);
        assert_eq!(app_type_from_str("nonsense"), 0);
        assert_eq!(app_type_name(4), JOB);
        assert_eq!(app_type_name(5), OTHER);
        assert_eq!(app_type_name(99), "");
    }

    #[test]
    fn payload_follows_billing_type() {
        let mut billing = sample_billing();
        assert!(matches!(
            billing.payload(),
            BillingPayload::Consumption(costs) if costs.len() == 1
        ));

        billing.billing_type = BillingType::Recharge;
        billing.payment = Some(Payment {
            method: "card".to_string(),
            user_id: "u1".to_string(),
            amount: 500,
            trade_no: String::new(),
        });
        assert!(matches!(
            billing.payload(),
            BillingPayload::Recharge(Some(p)) if p.amount == 500
        ));
    }

    fn sample_billing() -> Billing {
        Billing {
            time: Utc::now(),
            order_id: "abc123def456".to_string(),
            billing_type: BillingType::Consumption,
            namespace: "ns-a".to_string(),
            app_costs: vec![AppCost {
                used: [(0u8, 1000i64)].into_iter().collect(),
                used_amount: [(0u8, 447i64)].into_iter().collect(),
                amount: 447,
                name: "web".to_string(),
            }],
            app_type: 2,
            amount: 447,
            owner: "owner-a".to_string(),
            status: BillingStatus::Settled,
            payment: None,
            transfer: None,
        }
    }
}
