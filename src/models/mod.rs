//! Domain models for the metering and billing core.

mod billing;
mod metering;
mod monitor;
mod property;

pub use billing::{
    app_type_from_str, app_type_name, AppCost, Billing, BillingHandler, BillingPayload,
    BillingRecordItem, BillingRecordQuery, BillingRecordQueryResult, BillingStatus, BillingType,
    Payment, PaymentForQuery, Transfer, APP, DB, JOB, OTHER, TERMINAL,
};
pub use metering::{Metering, MeteringOwnerTimeResult};
pub use monitor::{EnumUsedMap, Monitor};
pub use property::{
    convert_enum_used_to_string, default_prices, default_property_types, global_registry,
    install_registry, Price, PriceType, PropertyType, PropertyTypeRegistry,
};
