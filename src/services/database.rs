//! Database service for the metering and billing core.
//!
//! Owns every store-side operation: day-partitioned monitor retention, sample
//! ingestion, hourly metering aggregation, billing order synthesis, and the
//! billing query surface.

use crate::error::AppError;
use crate::models::{
    app_type_from_str, app_type_name, AppCost, Billing, BillingHandler, BillingRecordItem,
    BillingRecordQuery, BillingRecordQueryResult, BillingStatus, BillingType, EnumUsedMap,
    Metering, MeteringOwnerTimeResult, Monitor, PaymentForQuery, Price, PriceType, PropertyType,
    PropertyTypeRegistry,
};
use crate::services::metrics::{
    record_billing_order, record_db_error, record_db_operation, record_metering_record,
};
use crate::utils::crypto;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson, DateTime as BsonDateTime, Document},
    options::{FindOneOptions, IndexOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use nanoid::nanoid;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

pub const DEFAULT_DB_NAME: &str = "sealos-resources";
pub const DEFAULT_METERING_CONN: &str = "metering";
pub const DEFAULT_MONITOR_CONN_PREFIX: &str = "monitor";
pub const DEFAULT_BILLING_CONN: &str = "billing";
pub const DEFAULT_PRICES_CONN: &str = "prices";
pub const DEFAULT_PROPERTIES_CONN: &str = "properties";

pub const ORDER_ID_LENGTH: usize = 12;

const LOAD_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Monitor partition name for the day of `time` (UTC): `monitor_20201201`.
///
/// Lexicographic order on these names matches chronological order of days,
/// which the retention sweep relies on.
pub fn monitor_collection_name(prefix: &str, time: DateTime<Utc>) -> String {
    format!("{}_{}", prefix, time.format("%Y%m%d"))
}

fn is_expired_partition(name: &str, prefix: &str, cutoff_name: &str) -> bool {
    name.starts_with(prefix) && name < cutoff_name
}

/// Aggregated per-hour value: `ceil(total / max(count, 60))`.
///
/// The floor of 60 keeps a sparse hour (fewer than one sample per minute)
/// from inflating the per-minute value.
fn metering_unit_value(total: i64, count: i64) -> i64 {
    let count = count.max(60);
    (total as f64 / count as f64).ceil() as i64
}

/// Price one projected usage row into an [`AppCost`].
///
/// Only properties with a positive unit price contribute:
/// `used_amount = ceil(used / unit_price)`.
fn price_app_cost(name: String, used: EnumUsedMap, registry: &PropertyTypeRegistry) -> AppCost {
    let mut used_amount = EnumUsedMap::new();
    let mut amount = 0i64;
    for (enum_id, used_value) in used.iter() {
        if let Some(property) = registry.by_enum(enum_id) {
            if property.unit_price > 0.0 {
                let priced = (used_value as f64 / property.unit_price).ceil() as i64;
                used_amount.insert(enum_id, priced);
                amount += priced;
            }
        }
    }
    AppCost {
        used,
        used_amount,
        amount,
        name,
    }
}

/// Grouped-aggregation pipeline over a monitor partition for billing.
///
/// Groups by (type, name, category). DIF properties take `max - min`, where
/// the `$min` conditionally excludes zero samples; everything else sums and
/// divides by `max(count, minutes)` to cap sample density at one per minute.
fn billing_aggregation_pipeline(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    namespaces: &[String],
    registry: &PropertyTypeRegistry,
    minutes: i64,
) -> Vec<Document> {
    let mut group = doc! {
        "_id": { "type": "$type", "name": "$name", "category": "$category" },
        "count": { "$sum": 1 },
    };
    let mut project = doc! {
        "_id": 0,
        "type": "$_id.type",
        "name": "$_id.name",
        "category": "$_id.category",
    };
    let mut used = Document::new();

    let mut enum_ids: Vec<u8> = registry.enum_map().keys().copied().collect();
    enum_ids.sort_unstable();

    for enum_id in enum_ids {
        let property = &registry.enum_map()[&enum_id];
        let key = enum_id.to_string();
        let used_field = format!("$used.{}", key);

        if property.price_type == PriceType::Dif {
            // max - min, with zero samples excluded from the min so a stream
            // that restarts at zero does not inflate the difference
            group.insert(format!("{}_max", key), doc! { "$max": used_field.clone() });
            group.insert(
                format!("{}_min", key),
                doc! {
                    "$min": {
                        "$cond": [
                            { "$eq": [used_field.clone(), 0] },
                            Bson::Null,
                            used_field.clone(),
                        ]
                    }
                },
            );
            used.insert(
                key.clone(),
                doc! { "$subtract": [format!("${}_max", key), format!("${}_min", key)] },
            );
            continue;
        }

        group.insert(key.clone(), doc! { "$sum": used_field });
        used.insert(
            key.clone(),
            doc! {
                "$toInt": {
                    "$round": {
                        "$divide": [
                            format!("${}", key),
                            { "$cond": [{ "$gt": ["$count", minutes] }, "$count", minutes] },
                        ]
                    }
                }
            },
        );
    }

    project.insert("used", used);

    vec![
        doc! {
            "$match": {
                "time": {
                    "$gte": BsonDateTime::from_chrono(start),
                    "$lt": BsonDateTime::from_chrono(end),
                },
                "category": { "$in": namespaces },
            }
        },
        doc! { "$group": group },
        doc! { "$project": project },
    ]
}

#[derive(Debug, Deserialize)]
struct BillingAggRow {
    #[serde(rename = "type", default)]
    app_type: u8,
    #[serde(rename = "category")]
    namespace: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    used: EnumUsedMap,
}

#[derive(Debug, Deserialize)]
struct TimeOnly {
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AmountOnly {
    #[serde(default)]
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    property: String,
    price: String,
    #[serde(default)]
    detail: String,
}

#[derive(Clone)]
pub struct MeteringDb {
    client: MongoClient,
    db: Database,
    monitor_conn_prefix: String,
    metering_conn: String,
    billing_conn: String,
    prices_conn: String,
    properties_conn: String,
}

impl MeteringDb {
    #[tracing::instrument(skip_all, fields(database = %database))]
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting to MongoDB");
        let start = Instant::now();

        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to MongoDB");
            record_db_error("connect", "admin");
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);

        record_db_operation("connect", "admin", start.elapsed().as_secs_f64());
        tracing::info!(
            duration_ms = start.elapsed().as_millis(),
            "Successfully connected to MongoDB"
        );

        Ok(Self {
            client,
            db,
            monitor_conn_prefix: DEFAULT_MONITOR_CONN_PREFIX.to_string(),
            metering_conn: DEFAULT_METERING_CONN.to_string(),
            billing_conn: DEFAULT_BILLING_CONN.to_string(),
            prices_conn: DEFAULT_PRICES_CONN.to_string(),
            properties_conn: DEFAULT_PROPERTIES_CONN.to_string(),
        })
    }

    /// Connect using the environment-driven [`Config`](crate::config::Config)
    /// and the default database name.
    pub async fn from_config(config: &crate::config::Config) -> Result<Self, AppError> {
        Self::connect(&config.mongo_connection_uri(), DEFAULT_DB_NAME).await
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "MongoDB health check failed");
                record_db_error("ping", "admin");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    // Collection accessors

    fn monitor_collection(&self, time: DateTime<Utc>) -> Collection<Monitor> {
        self.db.collection(&self.monitor_collection_name(time))
    }

    pub fn monitor_collection_name(&self, time: DateTime<Utc>) -> String {
        monitor_collection_name(&self.monitor_conn_prefix, time)
    }

    fn metering_collection(&self) -> Collection<Metering> {
        self.db.collection(&self.metering_conn)
    }

    fn billing_collection(&self) -> Collection<Billing> {
        self.db.collection(&self.billing_conn)
    }

    fn prices_collection(&self) -> Collection<PriceRow> {
        self.db.collection(&self.prices_conn)
    }

    fn properties_collection(&self) -> Collection<PropertyType> {
        self.db.collection(&self.properties_conn)
    }

    // =========================================================================
    // Sample ingestion
    // =========================================================================

    /// Bulk-insert monitor samples into the day partition each sample's
    /// timestamp falls on. Empty batches are a no-op.
    #[tracing::instrument(skip_all, fields(samples = monitors.len()))]
    pub async fn insert_monitor(&self, monitors: &[Monitor]) -> Result<(), AppError> {
        if monitors.is_empty() {
            return Ok(());
        }
        let start = Instant::now();

        // a batch from one collection tick is normally all one day
        let mut by_partition: BTreeMap<String, Vec<&Monitor>> = BTreeMap::new();
        for monitor in monitors {
            by_partition
                .entry(self.monitor_collection_name(monitor.time))
                .or_default()
                .push(monitor);
        }

        for (partition, batch) in by_partition {
            self.db
                .collection::<Monitor>(&partition)
                .insert_many(batch, None)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, partition = %partition, "Failed to insert monitors");
                    record_db_error("insert_many", &partition);
                    AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
                })?;
        }

        record_db_operation("insert_many", "monitor", start.elapsed().as_secs_f64());
        Ok(())
    }

    // =========================================================================
    // Price and property catalogue
    // =========================================================================

    /// Load and decrypt every price row into a property-keyed map.
    #[tracing::instrument(skip(self))]
    pub async fn get_all_prices_map(&self) -> Result<HashMap<String, Price>, AppError> {
        let rows = tokio::time::timeout(LOAD_TIMEOUT, async {
            let cursor = self.prices_collection().find(doc! {}, None).await?;
            cursor.try_collect::<Vec<PriceRow>>().await
        })
        .await
        .map_err(|_| AppError::DatabaseError(anyhow::anyhow!("price load timed out")))?
        .map_err(|e| {
            record_db_error("find", "prices");
            AppError::DatabaseError(anyhow::anyhow!("get all prices error: {}", e))
        })?;

        let mut prices = HashMap::with_capacity(rows.len());
        for row in rows {
            let price = crypto::decrypt_int64(&row.price).map_err(|e| {
                AppError::CryptoError(anyhow::anyhow!("decrypt price error: {}", e))
            })?;
            prices.insert(
                row.property.clone(),
                Price {
                    property: row.property,
                    price,
                    detail: row.detail,
                },
            );
        }
        Ok(prices)
    }

    /// Load stored property types and publish them as the process-wide
    /// registry. An empty collection leaves the compiled-in defaults active.
    #[tracing::instrument(skip(self))]
    pub async fn init_default_property_types(&self) -> Result<(), AppError> {
        let properties = tokio::time::timeout(LOAD_TIMEOUT, async {
            let cursor = self.properties_collection().find(doc! {}, None).await?;
            cursor.try_collect::<Vec<PropertyType>>().await
        })
        .await
        .map_err(|_| AppError::DatabaseError(anyhow::anyhow!("property load timed out")))?
        .map_err(|e| {
            record_db_error("find", "properties");
            AppError::DatabaseError(anyhow::anyhow!("get all properties error: {}", e))
        })?;

        if !properties.is_empty() {
            crate::models::install_registry(PropertyTypeRegistry::new(properties));
        }
        Ok(())
    }

    pub async fn save_property_types(&self, types: &[PropertyType]) -> Result<(), AppError> {
        if types.is_empty() {
            return Ok(());
        }
        self.properties_collection()
            .insert_many(types, None)
            .await
            .map_err(|e| {
                record_db_error("insert_many", "properties");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    // =========================================================================
    // Metering aggregation
    // =========================================================================

    /// Most recent metering `time` for a (category, property) stream; the
    /// epoch minimum when the stream has never been metered.
    #[tracing::instrument(skip(self))]
    pub async fn get_update_time_for_category_and_property(
        &self,
        category: &str,
        property: &str,
    ) -> Result<DateTime<Utc>, AppError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "time": -1 })
            .build();
        let found = self
            .db
            .collection::<TimeOnly>(&self.metering_conn)
            .find_one(doc! { "category": category, "property": property }, options)
            .await
            .map_err(|e| {
                record_db_error("find_one", "metering");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(found.map(|t| t.time).unwrap_or(DateTime::<Utc>::MIN_UTC))
    }

    /// Fold one hour of monitor samples into metering records.
    ///
    /// Scans `[start, end)` on the partition of `start`'s day, accumulates a
    /// sum and count per (category, property), and emits one record per key
    /// with `value = ceil(sum / max(count, 60))` and `amount = value * price`.
    /// A per-stream watermark makes re-runs of an already-metered window a
    /// no-op: samples only contribute while the stream's last metering time
    /// is at or before `start`.
    #[tracing::instrument(skip(self, prices), fields(start = %start, end = %end))]
    pub async fn generate_metering_data(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        prices: &HashMap<String, Price>,
    ) -> Result<(), AppError> {
        let timer = Instant::now();
        let registry = crate::models::global_registry();

        let filter = doc! {
            "time": {
                "$gte": BsonDateTime::from_chrono(start),
                "$lt": BsonDateTime::from_chrono(end),
            }
        };
        let mut cursor = self
            .monitor_collection(start)
            .find(filter, None)
            .await
            .map_err(|e| {
                record_db_error("find", "monitor");
                AppError::DatabaseError(anyhow::anyhow!("find monitors error: {}", e))
            })?;

        let mut sum_map: HashMap<(String, String), i64> = HashMap::new();
        let mut count_map: HashMap<(String, String), i64> = HashMap::new();
        let mut watermarks: HashMap<(String, String), DateTime<Utc>> = HashMap::new();

        while let Some(monitor) = cursor.try_next().await.map_err(|e| {
            record_db_error("cursor", "monitor");
            AppError::DatabaseError(anyhow::anyhow!("cursor error: {}", e))
        })? {
            if monitor.property.is_empty() {
                continue;
            }
            let Some(property) = registry.by_name(&monitor.property) else {
                tracing::debug!(property = %monitor.property, "unknown property, sample skipped");
                continue;
            };

            let key = (monitor.category.clone(), monitor.property.clone());
            let watermark = match watermarks.get(&key) {
                Some(t) => *t,
                None => {
                    let t = self
                        .get_update_time_for_category_and_property(&key.0, &key.1)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::debug!(
                                error = %e,
                                category = %key.0,
                                property = %key.1,
                                "get latest update time failed"
                            );
                            DateTime::<Utc>::MIN_UTC
                        });
                    watermarks.insert(key.clone(), t);
                    t
                }
            };

            if watermark <= start {
                *sum_map.entry(key.clone()).or_insert(0) += monitor.used.get(property.enum_id);
                *count_map.entry(key).or_insert(0) += 1;
            } else {
                tracing::debug!(
                    category = %key.0,
                    property = %key.1,
                    watermark = %watermark,
                    start = %start,
                    "window already metered, sample skipped"
                );
            }
        }

        let mut tasks: JoinSet<Result<String, mongodb::error::Error>> = JoinSet::new();
        for ((category, property), total) in sum_map {
            let count = count_map.get(&(category.clone(), property.clone())).copied().unwrap_or(0);
            let unit_value = metering_unit_value(total, count);
            let price = prices.get(&property).map(|p| p.price).unwrap_or(0);
            let metering = Metering {
                category,
                property,
                time: end,
                value: unit_value,
                amount: unit_value * price,
                detail: String::new(),
            };
            let collection = self.metering_collection();
            tasks.spawn(async move {
                let property = metering.property.clone();
                collection.insert_one(&metering, None).await.map_err(|e| {
                    tracing::error!(
                        error = %e,
                        category = %metering.category,
                        property = %metering.property,
                        "insert metering data failed"
                    );
                    record_db_error("insert", "metering");
                    e
                })?;
                Ok(property)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(property)) => record_metering_record(&property),
                Ok(Err(e)) => {
                    first_error.get_or_insert(AppError::from(e));
                }
                Err(e) => {
                    first_error
                        .get_or_insert(AppError::InternalError(anyhow::anyhow!("join error: {}", e)));
                }
            }
        }

        record_db_operation("aggregate", "metering", timer.elapsed().as_secs_f64());
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Per-property amount totals across `categories` at one metering
    /// timestamp, plus the grand total.
    #[tracing::instrument(skip(self, categories, properties))]
    pub async fn get_metering_owner_time_result(
        &self,
        query_time: DateTime<Utc>,
        categories: &[String],
        properties: &[String],
    ) -> Result<Option<MeteringOwnerTimeResult>, AppError> {
        let mut match_value = doc! {
            "time": BsonDateTime::from_chrono(query_time),
            "category": { "$in": categories },
        };
        if !properties.is_empty() {
            match_value.insert("property", doc! { "$in": properties });
        }
        let pipeline = vec![
            doc! { "$match": match_value },
            doc! { "$group": {
                "_id": { "property": "$property" },
                "propertyTotal": { "$sum": "$amount" },
            }},
            doc! { "$project": {
                "_id": 0,
                "property": "$_id.property",
                "propertyTotal": 1,
            }},
            doc! { "$group": {
                "_id": Bson::Null,
                "amountTotal": { "$sum": "$propertyTotal" },
                "costs": { "$push": { "k": "$property", "v": "$propertyTotal" } },
            }},
            doc! { "$addFields": {
                "time": BsonDateTime::from_chrono(query_time),
                "amount": "$amountTotal",
                "costs": { "$arrayToObject": "$costs" },
            }},
        ];

        let mut cursor = self
            .metering_collection()
            .aggregate(pipeline, None)
            .await
            .map_err(|e| {
                record_db_error("aggregate", "metering");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        match cursor.try_next().await? {
            Some(document) => Ok(Some(bson::from_document(document)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Billing synthesis
    // =========================================================================

    /// Group, price, and persist one billing order per (namespace, app_type)
    /// over `[start, end)`. Returns the minted order ids and the total amount.
    ///
    /// Zero-amount rows and buckets are never persisted. An insert failure
    /// aborts; already-inserted orders are not rolled back, so callers gate
    /// re-runs by watermark.
    #[tracing::instrument(skip(self, registry, namespaces), fields(owner = %owner, start = %start, end = %end))]
    pub async fn generate_billing_data(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        registry: &PropertyTypeRegistry,
        namespaces: &[String],
        owner: &str,
    ) -> Result<(Vec<String>, i64), AppError> {
        let timer = Instant::now();
        let minutes = (end - start).num_minutes();

        let pipeline = billing_aggregation_pipeline(start, end, namespaces, registry, minutes);
        let mut cursor = self
            .monitor_collection(start)
            .aggregate(pipeline, None)
            .await
            .map_err(|e| {
                record_db_error("aggregate", "monitor");
                AppError::DatabaseError(anyhow::anyhow!("aggregate error: {}", e))
            })?;

        let mut app_costs_map: BTreeMap<String, BTreeMap<u8, Vec<AppCost>>> = BTreeMap::new();
        let mut ns_type_amount: HashMap<(String, u8), i64> = HashMap::new();

        while let Some(document) = cursor.try_next().await.map_err(|e| {
            record_db_error("cursor", "monitor");
            AppError::DatabaseError(anyhow::anyhow!("cursor error: {}", e))
        })? {
            let row: BillingAggRow = bson::from_document(document)
                .map_err(|e| AppError::DecodeError(anyhow::anyhow!("decode error: {}", e)))?;

            let app_cost = price_app_cost(row.name, row.used, registry);
            if app_cost.amount == 0 {
                continue;
            }
            *ns_type_amount
                .entry((row.namespace.clone(), row.app_type))
                .or_insert(0) += app_cost.amount;
            app_costs_map
                .entry(row.namespace)
                .or_default()
                .entry(row.app_type)
                .or_default()
                .push(app_cost);
        }

        let mut order_ids = Vec::new();
        let mut total_amount = 0i64;

        for (namespace, by_type) in app_costs_map {
            for (app_type, app_costs) in by_type {
                let amount = ns_type_amount
                    .get(&(namespace.clone(), app_type))
                    .copied()
                    .unwrap_or(0);
                if amount == 0 {
                    continue;
                }
                let order_id = nanoid!(ORDER_ID_LENGTH);
                let billing = Billing {
                    time: end,
                    order_id: order_id.clone(),
                    billing_type: BillingType::Consumption,
                    namespace: namespace.clone(),
                    app_costs,
                    app_type,
                    amount,
                    owner: owner.to_string(),
                    status: BillingStatus::Settled,
                    payment: None,
                    transfer: None,
                };
                self.billing_collection()
                    .insert_one(&billing, None)
                    .await
                    .map_err(|e| {
                        record_db_error("insert", "billing");
                        AppError::DatabaseError(anyhow::anyhow!("insert error: {}", e))
                    })?;
                record_billing_order(app_type_name(app_type), amount);
                total_amount += amount;
                order_ids.push(order_id);
            }
        }

        record_db_operation("aggregate", "billing", timer.elapsed().as_secs_f64());
        tracing::info!(
            orders = order_ids.len(),
            amount = total_amount,
            "billing orders generated"
        );
        Ok((order_ids, total_amount))
    }

    /// Bulk insert pre-built orders (recharge and transfer flows).
    pub async fn save_billings(&self, billings: &[Billing]) -> Result<(), AppError> {
        if billings.is_empty() {
            return Ok(());
        }
        self.billing_collection()
            .insert_many(billings, None)
            .await
            .map_err(|e| {
                record_db_error("insert_many", "billing");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    // =========================================================================
    // Billing queries
    // =========================================================================

    /// Serve a billing record query, either by order id or by range.
    pub async fn query_billing_records(
        &self,
        query: &BillingRecordQuery,
        owner: &str,
    ) -> Result<BillingRecordQueryResult, AppError> {
        if !query.order_id.is_empty() {
            return self.query_billing_records_by_order_id(query, owner).await;
        }
        if owner.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("owner is empty")));
        }

        tokio::time::timeout(QUERY_TIMEOUT, self.query_billing_records_range(query, owner))
            .await
            .map_err(|_| AppError::DatabaseError(anyhow::anyhow!("billing query timed out")))?
    }

    async fn query_billing_records_by_order_id(
        &self,
        query: &BillingRecordQuery,
        owner: &str,
    ) -> Result<BillingRecordQueryResult, AppError> {
        let registry = crate::models::global_registry();
        let mut cursor = self
            .billing_collection()
            .find(doc! { "order_id": query.order_id.as_str(), "owner": owner }, None)
            .await
            .map_err(|e| {
                record_db_error("find", "billing");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        let mut items = Vec::new();
        while let Some(record) = cursor.try_next().await.map_err(|e| {
            AppError::DecodeError(anyhow::anyhow!("failed to decode billing record: {}", e))
        })? {
            match record.billing_type {
                BillingType::Recharge => {
                    let amount = record
                        .payment
                        .as_ref()
                        .map(|p| p.amount)
                        .unwrap_or(record.amount);
                    items.push(BillingRecordItem {
                        time: record.time,
                        order_id: record.order_id.clone(),
                        billing_type: record.billing_type,
                        namespace: record.namespace.clone(),
                        amount: record.amount,
                        payment: Some(PaymentForQuery { amount }),
                        ..Default::default()
                    });
                }
                BillingType::TransferIn | BillingType::TransferOut => {
                    items.push(BillingRecordItem {
                        time: record.time,
                        order_id: record.order_id.clone(),
                        billing_type: record.billing_type,
                        namespace: record.namespace.clone(),
                        amount: record.amount,
                        ..Default::default()
                    });
                }
                BillingType::Consumption => {
                    for cost in &record.app_costs {
                        let mut costs = HashMap::new();
                        for (enum_id, value) in cost.used_amount.iter() {
                            if let Some(property) = registry.by_enum(enum_id) {
                                *costs.entry(property.name.clone()).or_insert(0) += value;
                            }
                        }
                        items.push(BillingRecordItem {
                            time: record.time,
                            order_id: record.order_id.clone(),
                            billing_type: record.billing_type,
                            namespace: record.namespace.clone(),
                            app_type: app_type_name(record.app_type).to_string(),
                            amount: cost.amount,
                            name: cost.name.clone(),
                            costs,
                            payment: None,
                        });
                    }
                }
            }
        }

        let total_count = items.len() as i64;
        Ok(BillingRecordQueryResult {
            items,
            page_length: 1,
            total_count,
            recharge_amount: 0,
            deduction_amount: HashMap::new(),
        })
    }

    async fn query_billing_records_range(
        &self,
        query: &BillingRecordQuery,
        owner: &str,
    ) -> Result<BillingRecordQueryResult, AppError> {
        let registry = crate::models::global_registry();
        let collection = self.billing_collection();

        let time_match = doc! {
            "$gte": BsonDateTime::from_chrono(query.start_time),
            "$lte": BsonDateTime::from_chrono(query.end_time),
        };
        let mut match_value = doc! {
            "time": time_match.clone(),
            "owner": owner,
        };
        if query.billing_type != -1 {
            match_value.insert("type", query.billing_type);
        }
        if !query.namespace.is_empty() {
            match_value.insert("namespace", query.namespace.as_str());
        }
        if !query.app_type.is_empty() {
            match_value.insert("app_type", app_type_from_str(&query.app_type) as i32);
        }

        // page of rows, newest first
        let page_pipeline = vec![
            doc! { "$match": match_value.clone() },
            doc! { "$sort": { "time": -1 } },
            doc! { "$skip": (query.page - 1) * query.page_size },
            doc! { "$limit": query.page_size },
        ];

        let count_pipeline = vec![
            doc! { "$match": match_value },
            doc! { "$group": { "_id": Bson::Null, "result": { "$sum": 1 } } },
        ];

        let deduction_pipeline = vec![
            doc! { "$match": {
                "time": time_match.clone(),
                "owner": owner,
                "type": BillingType::Consumption.as_i32(),
            }},
            doc! { "$addFields": { "costsArray": { "$objectToArray": "$costs" } } },
            doc! { "$unwind": "$costsArray" },
            doc! { "$group": {
                "_id": { "type": "$type", "key": "$costsArray.k" },
                "total": { "$sum": "$costsArray.v" },
                "count": { "$sum": 1 },
            }},
        ];

        let recharge_pipeline = vec![
            doc! { "$match": {
                "time": time_match,
                "owner": owner,
                "type": BillingType::Recharge.as_i32(),
            }},
            doc! { "$group": {
                "_id": Bson::Null,
                "totalRechargeAmount": { "$sum": "$amount" },
                "count": { "$sum": 1 },
            }},
        ];

        let mut items = Vec::new();
        let mut cursor = collection.aggregate(page_pipeline, None).await.map_err(|e| {
            record_db_error("aggregate", "billing");
            AppError::DatabaseError(anyhow::anyhow!("failed to execute aggregate query: {}", e))
        })?;
        while let Some(document) = cursor.try_next().await? {
            let record: Billing = bson::from_document(document).map_err(|e| {
                AppError::DecodeError(anyhow::anyhow!("failed to decode billing record: {}", e))
            })?;

            let mut costs = HashMap::new();
            for cost in &record.app_costs {
                for (enum_id, value) in cost.used_amount.iter() {
                    if let Some(property) = registry.by_enum(enum_id) {
                        *costs.entry(property.name.clone()).or_insert(0) += value;
                    }
                }
            }
            let payment = if record.billing_type == BillingType::Recharge {
                let amount = record
                    .payment
                    .as_ref()
                    .map(|p| p.amount)
                    .unwrap_or(record.amount);
                Some(PaymentForQuery { amount })
            } else {
                None
            };
            items.push(BillingRecordItem {
                time: record.time,
                order_id: record.order_id,
                billing_type: record.billing_type,
                namespace: record.namespace,
                app_type: app_type_name(record.app_type).to_string(),
                amount: record.amount,
                name: String::new(),
                costs,
                payment,
            });
        }

        let mut total_count = 0i64;
        let mut count_cursor = collection.aggregate(count_pipeline, None).await.map_err(|e| {
            record_db_error("aggregate", "billing");
            AppError::DatabaseError(anyhow::anyhow!("failed to execute aggregate all query: {}", e))
        })?;
        while let Some(document) = count_cursor.try_next().await? {
            #[derive(Deserialize)]
            struct CountRow {
                result: i64,
            }
            let row: CountRow = bson::from_document(document).map_err(|e| {
                AppError::DecodeError(anyhow::anyhow!("failed to decode query count record: {}", e))
            })?;
            total_count = row.result;
        }

        let mut deduction_amount: HashMap<String, i64> = HashMap::new();
        let mut deduction_cursor =
            collection.aggregate(deduction_pipeline, None).await.map_err(|e| {
                record_db_error("aggregate", "billing");
                AppError::DatabaseError(anyhow::anyhow!(
                    "failed to execute aggregate query for count and amount: {}",
                    e
                ))
            })?;
        while let Some(document) = deduction_cursor.try_next().await? {
            #[derive(Deserialize)]
            struct DeductionId {
                #[serde(rename = "type")]
                billing_type: i64,
                key: String,
            }
            #[derive(Deserialize)]
            struct DeductionRow {
                #[serde(rename = "_id")]
                id: DeductionId,
                total: i64,
            }
            let row: DeductionRow = bson::from_document(document).map_err(|e| {
                AppError::DecodeError(anyhow::anyhow!("failed to decode billing record: {}", e))
            })?;
            if row.id.billing_type == BillingType::Consumption.as_i32() as i64 {
                deduction_amount.insert(row.id.key, row.total);
            }
        }

        let mut recharge_amount = 0i64;
        let mut recharge_cursor =
            collection.aggregate(recharge_pipeline, None).await.map_err(|e| {
                record_db_error("aggregate", "billing");
                AppError::DatabaseError(anyhow::anyhow!(
                    "failed to execute aggregate query for recharge amount: {}",
                    e
                ))
            })?;
        while let Some(document) = recharge_cursor.try_next().await? {
            #[derive(Deserialize)]
            struct RechargeRow {
                #[serde(rename = "totalRechargeAmount")]
                total_recharge_amount: i64,
            }
            let row: RechargeRow = bson::from_document(document).map_err(|e| {
                AppError::DecodeError(anyhow::anyhow!(
                    "failed to decode recharge amount record: {}",
                    e
                ))
            })?;
            recharge_amount = row.total_recharge_amount;
        }

        let mut total_pages = (total_count + query.page_size - 1) / query.page_size;
        if total_count == 0 {
            // a degenerate count pipeline returns zero even when rows exist
            total_pages = 1;
            total_count = items.len() as i64;
        }

        Ok(BillingRecordQueryResult {
            items,
            page_length: total_pages,
            total_count,
            recharge_amount,
            deduction_amount,
        })
    }

    /// Count of orders of one type in `[start, end]`, plus their summed amount.
    #[tracing::instrument(skip(self))]
    pub async fn get_billing_count(
        &self,
        billing_type: BillingType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(i64, i64), AppError> {
        let filter = doc! {
            "type": billing_type.as_i32(),
            "time": {
                "$gte": BsonDateTime::from_chrono(start),
                "$lte": BsonDateTime::from_chrono(end),
            },
        };
        let cursor = self
            .db
            .collection::<AmountOnly>(&self.billing_conn)
            .find(filter, None)
            .await
            .map_err(|e| {
                record_db_error("find", "billing");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        let rows: Vec<AmountOnly> = cursor.try_collect().await.map_err(|e| {
            AppError::DecodeError(anyhow::anyhow!("failed to decode all billing record: {}", e))
        })?;

        let count = rows.len() as i64;
        let amount = rows.iter().map(|r| r.amount).sum();
        Ok((count, amount))
    }

    /// Most recent order time for an owner and order type.
    pub async fn get_billing_last_update_time(
        &self,
        owner: &str,
        billing_type: BillingType,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "time": -1 })
            .build();
        let found = self
            .db
            .collection::<TimeOnly>(&self.billing_conn)
            .find_one(
                doc! { "owner": owner, "type": billing_type.as_i32() },
                options,
            )
            .await
            .map_err(|e| {
                record_db_error("find_one", "billing");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(found.map(|t| t.time))
    }

    /// Distinct namespaces an owner was billed in over a window.
    #[tracing::instrument(skip(self))]
    pub async fn get_billing_history_namespace_list(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        billing_type: i32,
        owner: &str,
    ) -> Result<Vec<String>, AppError> {
        let mut filter = doc! { "owner": owner };
        if let (Some(start), Some(end)) = (start, end) {
            filter.insert(
                "time",
                doc! {
                    "$gte": BsonDateTime::from_chrono(start),
                    "$lte": BsonDateTime::from_chrono(end),
                },
            );
        }
        if billing_type != -1 {
            filter.insert("type", billing_type);
        }

        let pipeline = vec![
            doc! { "$match": filter },
            doc! { "$group": { "_id": Bson::Null, "namespaces": { "$addToSet": "$namespace" } } },
        ];
        let mut cursor = self
            .billing_collection()
            .aggregate(pipeline, None)
            .await
            .map_err(|e| {
                record_db_error("aggregate", "billing");
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        match cursor.try_next().await? {
            Some(document) => {
                #[derive(Deserialize)]
                struct NamespacesRow {
                    namespaces: Vec<String>,
                }
                let row: NamespacesRow = bson::from_document(document)?;
                Ok(row.namespaces)
            }
            None => Ok(Vec::new()),
        }
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Orders still awaiting settlement for an owner.
    #[tracing::instrument(skip(self))]
    pub async fn get_unsettled_billing_handlers(
        &self,
        owner: &str,
    ) -> Result<Vec<BillingHandler>, AppError> {
        let filter = doc! {
            "owner": owner,
            "status": { "$in": [BillingStatus::Unsettled.as_i32()] },
        };
        let cursor = self
            .db
            .collection::<BillingHandler>(&self.billing_conn)
            .find(filter, None)
            .await
            .map_err(|e| {
                record_db_error("find", "billing");
                AppError::DatabaseError(anyhow::anyhow!("find error: {}", e))
            })?;
        cursor
            .try_collect()
            .await
            .map_err(|e| AppError::DecodeError(anyhow::anyhow!("decode error: {}", e)))
    }

    /// Set an order's settlement status by unique order id.
    #[tracing::instrument(skip(self))]
    pub async fn update_billing_status(
        &self,
        order_id: &str,
        status: BillingStatus,
    ) -> Result<(), AppError> {
        if order_id.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("order id is empty")));
        }
        self.billing_collection()
            .update_one(
                doc! { "order_id": order_id },
                doc! { "$set": { "status": status.as_i32() } },
                None,
            )
            .await
            .map_err(|e| {
                record_db_error("update_one", "billing");
                AppError::DatabaseError(anyhow::anyhow!("update error: {}", e))
            })?;
        Ok(())
    }

    // =========================================================================
    // Lifecycle and retention
    // =========================================================================

    async fn collection_exist(&self, collection_name: &str) -> Result<bool, AppError> {
        let names = self
            .db
            .list_collection_names(doc! { "name": collection_name })
            .await
            .map_err(|e| {
                record_db_error("list_collections", collection_name);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(!names.is_empty())
    }

    /// Create the billing collection with its unique `(owner, order_id)` and
    /// composite `(owner, time, type)` indexes. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn create_billing_if_not_exist(&self) -> Result<(), AppError> {
        if self.collection_exist(&self.billing_conn).await? {
            return Ok(());
        }
        self.db
            .create_collection(&self.billing_conn, None)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "failed to create collection for billing: {}",
                    e
                ))
            })?;

        let unique_order_index = IndexModel::builder()
            .keys(doc! { "owner": 1, "order_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let range_query_index = IndexModel::builder()
            .keys(doc! { "owner": 1, "time": 1, "type": 1 })
            .build();

        self.billing_collection()
            .create_indexes([unique_order_index, range_query_index], None)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "failed to create index for billing: {}",
                    e
                ))
            })?;
        Ok(())
    }

    /// Create the monitor partition for `time`'s day as a time-series
    /// collection. Idempotent.
    pub async fn create_monitor_time_series_if_not_exist(
        &self,
        time: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.create_time_series_if_not_exist(&self.monitor_collection_name(time))
            .await
    }

    /// Create the metering collection as a time-series collection. Idempotent.
    pub async fn create_metering_time_series_if_not_exist(&self) -> Result<(), AppError> {
        let name = self.metering_conn.clone();
        self.create_time_series_if_not_exist(&name).await
    }

    async fn create_time_series_if_not_exist(&self, collection_name: &str) -> Result<(), AppError> {
        if self.collection_exist(collection_name).await? {
            return Ok(());
        }
        let cmd = doc! {
            "create": collection_name,
            "timeseries": { "timeField": "time" },
        };
        self.db.run_command(cmd, None).await.map_err(|e| {
            record_db_error("create", collection_name);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        Ok(())
    }

    /// Drop every monitor partition whose day is older than `days` days ago.
    #[tracing::instrument(skip(self))]
    pub async fn drop_monitor_collections_older_than(&self, days: i64) -> Result<(), AppError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let cutoff_name = self.monitor_collection_name(cutoff);

        let collections = self.db.list_collection_names(None).await.map_err(|e| {
            record_db_error("list_collections", "monitor");
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        for name in collections {
            if is_expired_partition(&name, &self.monitor_conn_prefix, &cutoff_name) {
                self.db
                    .collection::<Document>(&name)
                    .drop(None)
                    .await
                    .map_err(|e| {
                        record_db_error("drop", &name);
                        AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
                    })?;
                tracing::info!(collection = %name, "dropped expired monitor partition");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn partition_name_uses_utc_day() {
        assert_eq!(
            monitor_collection_name("monitor", ts(2020, 12, 1, 13)),
            "monitor_20201201"
        );
        assert_eq!(
            monitor_collection_name("monitor", ts(2023, 1, 9, 0)),
            "monitor_20230109"
        );
    }

    #[test]
    fn partition_names_sort_chronologically() {
        let days = [
            ts(2022, 12, 31, 0),
            ts(2023, 1, 1, 0),
            ts(2023, 1, 2, 0),
            ts(2023, 2, 1, 0),
            ts(2023, 11, 30, 0),
            ts(2024, 1, 1, 0),
        ];
        let names: Vec<String> = days
            .iter()
            .map(|d| monitor_collection_name("monitor", *d))
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn expired_partition_selection_is_lexicographic() {
        let cutoff = monitor_collection_name("monitor", ts(2023, 6, 1, 0));
        assert!(is_expired_partition("monitor_20230531", "monitor", &cutoff));
        assert!(is_expired_partition("monitor_20230101", "monitor", &cutoff));
        assert!(!is_expired_partition("monitor_20230601", "monitor", &cutoff));
        assert!(!is_expired_partition("monitor_20230602", "monitor", &cutoff));
        assert!(!is_expired_partition("metering", "monitor", &cutoff));
        assert!(!is_expired_partition("billing", "monitor", &cutoff));
    }

    #[test]
    fn unit_value_divides_by_count_when_dense() {
        // 120 samples of 100 over an hour average to 100
        assert_eq!(metering_unit_value(12_000, 120), 100);
        assert_eq!(metering_unit_value(12_001, 120), 101);
    }

    #[test]
    fn unit_value_floors_sparse_hours_at_sixty() {
        // 30 samples summing 3000 divide by 60, not 30
        assert_eq!(metering_unit_value(3_000, 30), 50);
        assert_eq!(metering_unit_value(100, 1), 2);
        assert_eq!(metering_unit_value(0, 10), 0);
    }

    #[test]
    fn app_cost_pricing_rounds_up() {
        let registry = PropertyTypeRegistry::default();
        let used: EnumUsedMap = [(0u8, 1000i64)].into_iter().collect();
        let cost = price_app_cost("web".to_string(), used, &registry);
        // ceil(1000 / 2.237442922) = 447
        assert_eq!(cost.used_amount.get(0), 447);
        assert_eq!(cost.amount, 447);
        assert_eq!(cost.name, "web");
    }

    #[test]
    fn app_cost_amount_is_sum_of_property_amounts() {
        let registry = PropertyTypeRegistry::default();
        let used: EnumUsedMap = [(0u8, 1000i64), (1u8, 1024i64)].into_iter().collect();
        let cost = price_app_cost("web".to_string(), used, &registry);
        // cpu: ceil(1000 / 2.237442922) = 447, memory: ceil(1024 / 1.092501427) = 938
        assert_eq!(cost.used_amount.get(0), 447);
        assert_eq!(cost.used_amount.get(1), 938);
        assert_eq!(cost.amount, 447 + 938);
    }

    #[test]
    fn zero_priced_properties_do_not_contribute() {
        let registry = PropertyTypeRegistry::default();
        // storage and network both have unit price 0 in the default catalogue
        let used: EnumUsedMap = [(2u8, 5000i64), (3u8, 150i64)].into_iter().collect();
        let cost = price_app_cost("db".to_string(), used, &registry);
        assert_eq!(cost.amount, 0);
        assert!(cost.used_amount.is_empty());
    }

    #[test]
    fn billing_pipeline_has_dif_and_avg_branches() {
        let registry = PropertyTypeRegistry::default();
        let namespaces = vec!["ns-a".to_string()];
        let pipeline = billing_aggregation_pipeline(
            ts(2023, 1, 1, 12),
            ts(2023, 1, 1, 13),
            &namespaces,
            &registry,
            60,
        );
        assert_eq!(pipeline.len(), 3);

        let group = pipeline[1].get_document("$group").unwrap();
        // cpu (enum 0, AVG) sums the raw usage
        assert_eq!(
            group.get_document("0").unwrap(),
            &doc! { "$sum": "$used.0" }
        );
        // network (enum 3, DIF) tracks max and zero-excluded min
        assert_eq!(
            group.get_document("3_max").unwrap(),
            &doc! { "$max": "$used.3" }
        );
        assert!(group.get_document("3_min").unwrap().contains_key("$min"));
        assert!(!group.contains_key("3"));

        let project = pipeline[2].get_document("$project").unwrap();
        let used = project.get_document("used").unwrap();
        assert!(used.get_document("0").unwrap().contains_key("$toInt"));
        assert_eq!(
            used.get_document("3").unwrap(),
            &doc! { "$subtract": ["$3_max", "$3_min"] }
        );
    }

    #[test]
    fn billing_pipeline_match_constrains_window_and_namespaces() {
        let registry = PropertyTypeRegistry::default();
        let namespaces = vec!["ns-a".to_string(), "ns-b".to_string()];
        let pipeline = billing_aggregation_pipeline(
            ts(2023, 1, 1, 12),
            ts(2023, 1, 1, 13),
            &namespaces,
            &registry,
            60,
        );
        let match_stage = pipeline[0].get_document("$match").unwrap();
        let time = match_stage.get_document("time").unwrap();
        assert!(time.contains_key("$gte"));
        assert!(time.contains_key("$lt"));
        let category = match_stage.get_document("category").unwrap();
        assert_eq!(category.get_array("$in").unwrap().len(), 2);
    }
}
