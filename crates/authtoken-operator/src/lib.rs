//! AuthTokenRequest operator: configuration and controller wiring

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;

pub use config::{ConfigError, OperatorConfig};
