//! Test helpers for metering-service integration tests.
//!
//! Each test gets its own database for isolation; tests skip cleanly when no
//! MongoDB is reachable (set `TEST_MONGO_URI` to point at one).

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use metering_service::models::{
    Billing, BillingStatus, BillingType, EnumUsedMap, Monitor, Payment,
};
use metering_service::services::database::MeteringDb;
use metering_service::services::init_metrics;
use mongodb::bson::doc;
use mongodb::{options::ClientOptions, Client, Database};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

static INIT: Once = Once::new();
static DB_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Initialize tracing and metrics for tests (only once).
pub fn init_test_env() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("warn,metering_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
        init_metrics();
    });
}

pub fn test_mongo_uri() -> String {
    std::env::var("TEST_MONGO_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string())
}

fn unique_database_name() -> String {
    let counter = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("metering_test_{}_{}", std::process::id(), counter)
}

/// Isolated database wrapper for one test.
pub struct TestDb {
    pub db: MeteringDb,
    /// Direct handle for assertions on raw documents.
    pub raw: Database,
    name: String,
}

impl TestDb {
    /// Connect to the test MongoDB. Returns `None` (and the test skips) when
    /// no server is reachable.
    pub async fn spawn() -> Option<TestDb> {
        init_test_env();

        let uri = test_mongo_uri();
        let mut options = match ClientOptions::parse(&uri).await {
            Ok(options) => options,
            Err(e) => {
                eprintln!("skipping: cannot parse TEST_MONGO_URI {}: {}", uri, e);
                return None;
            }
        };
        options.server_selection_timeout = Some(std::time::Duration::from_secs(2));
        options.connect_timeout = Some(std::time::Duration::from_secs(2));

        let client = match Client::with_options(options) {
            Ok(client) => client,
            Err(e) => {
                eprintln!("skipping: cannot build MongoDB client: {}", e);
                return None;
            }
        };
        if client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .is_err()
        {
            eprintln!("skipping: MongoDB not reachable at {}", uri);
            return None;
        }

        let name = unique_database_name();
        let db = MeteringDb::connect(&uri, &name)
            .await
            .expect("Failed to connect metering database");
        let raw = client.database(&name);

        Some(TestDb { db, raw, name })
    }

    pub async fn cleanup(&self) {
        self.raw.drop(None).await.ok();
    }
}

pub fn hour(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

/// A monitor sample with an enum-keyed `used` map.
pub fn sample(
    time: DateTime<Utc>,
    category: &str,
    app_type: u8,
    name: &str,
    used: &[(u8, i64)],
    property: &str,
) -> Monitor {
    Monitor {
        time,
        category: category.to_string(),
        app_type,
        name: name.to_string(),
        used: used.iter().copied().collect::<EnumUsedMap>(),
        property: property.to_string(),
    }
}

/// `count` identical samples spread over `[start, start + 1h)`.
pub fn samples_over_hour(
    start: DateTime<Utc>,
    count: i64,
    category: &str,
    app_type: u8,
    name: &str,
    used: &[(u8, i64)],
    property: &str,
) -> Vec<Monitor> {
    let step = Duration::seconds(3600 / count.max(1));
    (0..count)
        .map(|i| {
            sample(
                start + step * i as i32,
                category,
                app_type,
                name,
                used,
                property,
            )
        })
        .collect()
}

pub fn consumption_order(
    owner: &str,
    order_id: &str,
    time: DateTime<Utc>,
    amount: i64,
) -> Billing {
    Billing {
        time,
        order_id: order_id.to_string(),
        billing_type: BillingType::Consumption,
        namespace: "ns-a".to_string(),
        app_costs: Vec::new(),
        app_type: 2,
        amount,
        owner: owner.to_string(),
        status: BillingStatus::Settled,
        payment: None,
        transfer: None,
    }
}

pub fn recharge_order(owner: &str, order_id: &str, time: DateTime<Utc>, amount: i64) -> Billing {
    Billing {
        time,
        order_id: order_id.to_string(),
        billing_type: BillingType::Recharge,
        namespace: String::new(),
        app_costs: Vec::new(),
        app_type: 0,
        amount,
        owner: owner.to_string(),
        status: BillingStatus::Settled,
        payment: Some(Payment {
            method: "card".to_string(),
            user_id: owner.to_string(),
            amount,
            trade_no: String::new(),
        }),
        transfer: None,
    }
}
