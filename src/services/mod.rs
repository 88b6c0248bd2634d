pub mod database;
pub mod metrics;

pub use database::MeteringDb;
pub use metrics::{get_metrics, init_metrics};
