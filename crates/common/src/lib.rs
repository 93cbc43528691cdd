//! Common utilities for the device availability broker bundle
//!
//! This crate provides the pieces shared between the broker daemon and the
//! readiness client: environment-driven configuration, logging setup, the
//! base error type, and a few test helpers.

pub mod config;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use config::{broker_socket_path, BrokerConfig};
pub use error::{Error, Result};
pub use logging::setup_logging;
