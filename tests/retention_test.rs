//! Partition lifecycle and retention integration tests.

mod common;

use chrono::{Duration, Utc};
use common::TestDb;

#[tokio::test]
async fn partitions_older_than_the_cutoff_are_dropped() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let now = Utc::now();
    let days = [0i64, 10, 40, 60];
    for age in days {
        test_db
            .db
            .create_monitor_time_series_if_not_exist(now - Duration::days(age))
            .await
            .unwrap();
    }
    test_db.db.create_metering_time_series_if_not_exist().await.unwrap();

    test_db.db.drop_monitor_collections_older_than(30).await.unwrap();

    let collections = test_db.raw.list_collection_names(None).await.unwrap();
    let partition = |age: i64| test_db.db.monitor_collection_name(now - Duration::days(age));

    assert!(collections.contains(&partition(0)));
    assert!(collections.contains(&partition(10)));
    assert!(!collections.contains(&partition(40)));
    assert!(!collections.contains(&partition(60)));
    // retention only touches monitor partitions
    assert!(collections.contains(&"metering".to_string()));

    test_db.cleanup().await;
}

#[tokio::test]
async fn partition_creation_is_idempotent() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let now = Utc::now();
    test_db
        .db
        .create_monitor_time_series_if_not_exist(now)
        .await
        .unwrap();
    test_db
        .db
        .create_monitor_time_series_if_not_exist(now)
        .await
        .unwrap();

    let name = test_db.db.monitor_collection_name(now);
    let collections = test_db.raw.list_collection_names(None).await.unwrap();
    assert_eq!(collections.iter().filter(|c| **c == name).count(), 1);

    test_db.cleanup().await;
}

#[tokio::test]
async fn partition_names_follow_the_day_format() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let time = chrono::TimeZone::with_ymd_and_hms(&Utc, 2020, 12, 1, 23, 59, 59).unwrap();
    assert_eq!(test_db.db.monitor_collection_name(time), "monitor_20201201");

    test_db.cleanup().await;
}

#[tokio::test]
async fn billing_bootstrap_creates_the_indexes() {
    let Some(test_db) = TestDb::spawn().await else { return };

    test_db.db.create_billing_if_not_exist().await.unwrap();

    let indexes = test_db
        .raw
        .collection::<mongodb::bson::Document>("billing")
        .list_index_names()
        .await
        .unwrap();
    assert!(
        indexes.iter().any(|i| i.contains("owner") && i.contains("order_id")),
        "unique (owner, order_id) index missing: {:?}",
        indexes
    );
    assert!(
        indexes
            .iter()
            .any(|i| i.contains("owner") && i.contains("time") && i.contains("type")),
        "composite (owner, time, type) index missing: {:?}",
        indexes
    );

    test_db.cleanup().await;
}
