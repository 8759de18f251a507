//! Services - connection management and message dispatch
//!
//! This module contains the core services:
//! - `broker` - One broker connection and its lifecycle state
//! - `broker_set` - Priority-ordered brokers and failover selection
//! - `device` - Device contract and construction from config
//! - `gateway` - Dispatch loop tying devices to brokers

pub mod broker;
pub mod broker_set;
pub mod device;
pub mod gateway;

// Re-export commonly used types
pub use broker::{Broker, ConnectionState};
pub use broker_set::BrokerSet;
pub use device::{Device, DeviceContext};
pub use gateway::{Gateway, GatewayHandle};
