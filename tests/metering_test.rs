//! Metering aggregation integration tests.

mod common;

use common::{hour, sample, samples_over_hour, TestDb};
use metering_service::models::{default_prices, Price};
use mongodb::bson::doc;
use std::collections::HashMap;

fn cpu_prices(price: i64) -> HashMap<String, Price> {
    HashMap::from([(
        "cpu".to_string(),
        Price {
            property: "cpu".to_string(),
            price,
            detail: String::new(),
        },
    )])
}

#[tokio::test]
async fn full_hour_of_samples_averages_by_count() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let start = hour(2023, 5, 10, 12);
    let end = hour(2023, 5, 10, 13);
    let monitors = samples_over_hour(start, 120, "ns-a", 2, "web", &[(0, 100)], "cpu");
    test_db.db.insert_monitor(&monitors).await.unwrap();

    test_db
        .db
        .generate_metering_data(start, end, &cpu_prices(67))
        .await
        .unwrap();

    let metering = test_db.raw.collection::<mongodb::bson::Document>("metering");
    let docs: Vec<_> = futures::TryStreamExt::try_collect(
        metering
            .find(doc! { "category": "ns-a", "property": "cpu" }, None)
            .await
            .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(docs.len(), 1);
    // ceil(120 * 100 / 120) = 100, priced at 67
    assert_eq!(docs[0].get_i64("value").unwrap(), 100);
    assert_eq!(docs[0].get_i64("amount").unwrap(), 6700);
    assert_eq!(
        docs[0].get_datetime("time").unwrap().timestamp_millis(),
        end.timestamp_millis()
    );

    test_db.cleanup().await;
}

#[tokio::test]
async fn sparse_hour_divides_by_sixty() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let start = hour(2023, 5, 11, 12);
    let end = hour(2023, 5, 11, 13);
    let monitors = samples_over_hour(start, 30, "ns-a", 2, "web", &[(0, 100)], "cpu");
    test_db.db.insert_monitor(&monitors).await.unwrap();

    test_db
        .db
        .generate_metering_data(start, end, &cpu_prices(67))
        .await
        .unwrap();

    let metering = test_db.raw.collection::<mongodb::bson::Document>("metering");
    let doc = metering
        .find_one(doc! { "category": "ns-a", "property": "cpu" }, None)
        .await
        .unwrap()
        .expect("metering record missing");

    // 30 samples summing 3000 divide by the floor of 60
    assert_eq!(doc.get_i64("value").unwrap(), 50);
    assert_eq!(doc.get_i64("amount").unwrap(), 3350);

    test_db.cleanup().await;
}

#[tokio::test]
async fn rerunning_a_metered_window_inserts_nothing() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let start = hour(2023, 5, 12, 12);
    let end = hour(2023, 5, 12, 13);
    let monitors = samples_over_hour(start, 60, "ns-a", 2, "web", &[(0, 100)], "cpu");
    test_db.db.insert_monitor(&monitors).await.unwrap();

    let prices = default_prices();
    test_db
        .db
        .generate_metering_data(start, end, &prices)
        .await
        .unwrap();
    test_db
        .db
        .generate_metering_data(start, end, &prices)
        .await
        .unwrap();

    let metering = test_db.raw.collection::<mongodb::bson::Document>("metering");
    let count = metering
        .count_documents(doc! { "category": "ns-a", "property": "cpu" }, None)
        .await
        .unwrap();
    assert_eq!(count, 1, "watermark must make the second run a no-op");

    test_db.cleanup().await;
}

#[tokio::test]
async fn streams_are_metered_independently() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let start = hour(2023, 5, 13, 12);
    let end = hour(2023, 5, 13, 13);
    let mut monitors = samples_over_hour(start, 60, "ns-a", 2, "web", &[(0, 100)], "cpu");
    monitors.extend(samples_over_hour(
        start,
        60,
        "ns-b",
        2,
        "api",
        &[(1, 2048)],
        "memory",
    ));
    test_db.db.insert_monitor(&monitors).await.unwrap();

    test_db
        .db
        .generate_metering_data(start, end, &default_prices())
        .await
        .unwrap();

    let metering = test_db.raw.collection::<mongodb::bson::Document>("metering");
    assert_eq!(metering.count_documents(doc! {}, None).await.unwrap(), 2);

    let memory = metering
        .find_one(doc! { "category": "ns-b", "property": "memory" }, None)
        .await
        .unwrap()
        .expect("memory record missing");
    assert_eq!(memory.get_i64("value").unwrap(), 2048);
    // default raw memory price is 33
    assert_eq!(memory.get_i64("amount").unwrap(), 2048 * 33);

    test_db.cleanup().await;
}

#[tokio::test]
async fn watermark_starts_at_zero_for_new_streams() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let watermark = test_db
        .db
        .get_update_time_for_category_and_property("ns-new", "cpu")
        .await
        .unwrap();
    assert!(watermark < hour(1971, 1, 1, 0));

    test_db.cleanup().await;
}

#[tokio::test]
async fn samples_outside_the_window_are_ignored() {
    let Some(test_db) = TestDb::spawn().await else { return };

    let start = hour(2023, 5, 14, 12);
    let end = hour(2023, 5, 14, 13);
    let mut monitors = samples_over_hour(start, 60, "ns-a", 2, "web", &[(0, 60)], "cpu");
    // same day, next hour: lands in the same partition but not the window
    monitors.push(sample(end, "ns-a", 2, "web", &[(0, 1_000_000)], "cpu"));
    test_db.db.insert_monitor(&monitors).await.unwrap();

    test_db
        .db
        .generate_metering_data(start, end, &cpu_prices(1))
        .await
        .unwrap();

    let metering = test_db.raw.collection::<mongodb::bson::Document>("metering");
    let doc = metering
        .find_one(doc! { "category": "ns-a", "property": "cpu" }, None)
        .await
        .unwrap()
        .expect("metering record missing");
    assert_eq!(doc.get_i64("value").unwrap(), 60);

    test_db.cleanup().await;
}
