//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `transport` - Transport contract between brokers and MQTT clients
//! - `mqtt` - rumqttc-backed transport with publish acknowledgement tracking
//! - `dummy` - Device emitting a fixed payload on an interval
//! - `serial` - Device framing bytes read from a serial port

pub mod dummy;
pub mod mqtt;
pub mod serial;
pub mod transport;

#[cfg(test)]
pub mod mock;

// Re-export commonly used types
pub use dummy::DummyDevice;
pub use mqtt::RumqttTransport;
pub use serial::{SerialDevice, SerialSettings};
pub use transport::{BrokerEvent, ConnectOptions, EventSink, MqttTransport, TransportEvent, Will};
