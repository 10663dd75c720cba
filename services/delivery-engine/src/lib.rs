pub mod access;
pub mod assignment;
pub mod config;
pub mod errors;
pub mod feed;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod services;
pub mod status_machine;
pub mod store;

pub use config::Config;
pub use errors::{DeliveryError, Result};
pub use handlers::{router, AppState};
pub use services::{DeliveryService, ServiceSettings};
