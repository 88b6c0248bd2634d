//! Prometheus metrics for the metering core.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Database metrics
pub static DB_OPERATION_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static DB_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Domain metrics
pub static METERING_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static BILLING_ORDERS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static BILLED_AMOUNT_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Must be called once at startup.
pub fn init_metrics() {
    let registry = Registry::new();

    let db_duration = HistogramVec::new(
        HistogramOpts::new(
            "metering_db_operation_duration_seconds",
            "Database operation duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["operation", "collection"],
    )
    .expect("Failed to create metering_db_operation_duration_seconds metric");

    let db_errors = IntCounterVec::new(
        Opts::new("metering_db_errors_total", "Total database errors"),
        &["operation", "collection"],
    )
    .expect("Failed to create metering_db_errors_total metric");

    let metering_records = IntCounterVec::new(
        Opts::new(
            "metering_records_total",
            "Metering records written, by property",
        ),
        &["property"],
    )
    .expect("Failed to create metering_records_total metric");

    let billing_orders = IntCounterVec::new(
        Opts::new(
            "billing_orders_total",
            "Billing orders written, by app type",
        ),
        &["app_type"],
    )
    .expect("Failed to create billing_orders_total metric");

    let billed_amount = IntCounterVec::new(
        Opts::new("billed_amount_total", "Total billed amount, by order type"),
        &["type"],
    )
    .expect("Failed to create billed_amount_total metric");

    registry
        .register(Box::new(db_duration.clone()))
        .expect("Failed to register metering_db_operation_duration_seconds");
    registry
        .register(Box::new(db_errors.clone()))
        .expect("Failed to register metering_db_errors_total");
    registry
        .register(Box::new(metering_records.clone()))
        .expect("Failed to register metering_records_total");
    registry
        .register(Box::new(billing_orders.clone()))
        .expect("Failed to register billing_orders_total");
    registry
        .register(Box::new(billed_amount.clone()))
        .expect("Failed to register billed_amount_total");

    let _ = REGISTRY.set(registry);
    let _ = DB_OPERATION_DURATION_SECONDS.set(db_duration);
    let _ = DB_ERRORS_TOTAL.set(db_errors);
    let _ = METERING_RECORDS_TOTAL.set(metering_records);
    let _ = BILLING_ORDERS_TOTAL.set(billing_orders);
    let _ = BILLED_AMOUNT_TOTAL.set(billed_amount);

    tracing::info!("Prometheus metrics initialized");
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

// Helper functions for recording metrics

/// Record database operation duration.
pub fn record_db_operation(operation: &str, collection: &str, duration_secs: f64) {
    if let Some(histogram) = DB_OPERATION_DURATION_SECONDS.get() {
        histogram
            .with_label_values(&[operation, collection])
            .observe(duration_secs);
    }
}

/// Record a database error.
pub fn record_db_error(operation: &str, collection: &str) {
    if let Some(counter) = DB_ERRORS_TOTAL.get() {
        counter.with_label_values(&[operation, collection]).inc();
    }
}

/// Record a written metering record.
pub fn record_metering_record(property: &str) {
    if let Some(counter) = METERING_RECORDS_TOTAL.get() {
        counter.with_label_values(&[property]).inc();
    }
}

/// Record a written billing order and its amount.
pub fn record_billing_order(app_type: &str, amount: i64) {
    if let Some(counter) = BILLING_ORDERS_TOTAL.get() {
        counter.with_label_values(&[app_type]).inc();
    }
    if let Some(counter) = BILLED_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&["consumption"])
            .inc_by(amount.unsigned_abs());
    }
}
