//! Metering and billing core of a multi-tenant cloud platform.
//!
//! Raw usage samples land in day-partitioned monitor collections, get folded
//! into hourly metering records per (category, property), and are priced into
//! per-(namespace, app type) billing orders that can be queried with
//! pagination and window-wide aggregates.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::AppError;
pub use services::database::MeteringDb;
