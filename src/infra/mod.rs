//! Infrastructure - configuration, errors, TLS, and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - TOML loading into validated gateway/broker/device settings
//! - `validation` - Bounds applied while loading configuration
//! - `tls` - CA and client certificate loading
//! - `error` - Error types shared across the crate
//! - `metrics` - Lock-free counters and status summaries

pub mod config;
pub mod error;
pub mod metrics;
pub mod tls;
pub mod validation;

// Re-export commonly used types
pub use config::{BrokerConfig, Config, DeviceConfig, DeviceKind, GatewayConfig};
pub use error::{ConfigError, ConnectionError, PublishError, TlsError, TopicError};
pub use metrics::GatewayMetrics;
pub use validation::ValidationRules;
