//! Message envelope shared by devices, brokers and the gateway loop

use bytes::Bytes;
use rumqttc::QoS;
use std::fmt;

/// Sender name reserved for gateway status reports.
///
/// Messages from this sender carry their own topic suffix instead of the
/// generated `<gateway>/<sender>/<type>/publish` layout.
pub const STATUS_SENDER: &str = "status";

/// Which way a message travelled through the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Produced locally by a device, headed for a broker
    Published,
    /// Delivered by a broker subscription, headed for local consumers
    Subscribed,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Published => "published",
            Direction::Subscribed => "subscribed",
        }
    }
}

/// Common data unit flowing on every gateway channel.
///
/// Constructed once and never mutated; ownership moves with the channel that
/// currently carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub direction: Direction,
    /// Topic segment between sender and `publish` (devices use their type)
    pub data_type: String,
    pub body: Bytes,
    pub topic: String,
    pub qos: QoS,
    pub retained: bool,
}

impl Message {
    /// Device-produced message
    pub fn published(
        sender: impl Into<String>,
        data_type: impl Into<String>,
        body: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Self {
        Self {
            sender: sender.into(),
            direction: Direction::Published,
            data_type: data_type.into(),
            body: body.into(),
            topic: String::new(),
            qos,
            retained,
        }
    }

    /// Status report whose topic is appended directly to the broker prefix
    pub fn status(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            sender: STATUS_SENDER.to_string(),
            direction: Direction::Published,
            data_type: String::new(),
            body: body.into(),
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            retained: false,
        }
    }

    /// Message delivered by a broker subscription
    pub fn subscribed(
        broker: impl Into<String>,
        topic: impl Into<String>,
        body: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Self {
        Self {
            sender: broker.into(),
            direction: Direction::Subscribed,
            data_type: String::new(),
            body: body.into(),
            topic: topic.into(),
            qos,
            retained,
        }
    }

    pub fn is_status(&self) -> bool {
        self.sender == STATUS_SENDER
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) {} bytes qos={} retained={}",
            self.sender,
            self.direction.as_str(),
            self.body.len(),
            qos_level(self.qos),
            self.retained
        )
    }
}

/// Numeric MQTT QoS level
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// QoS from its numeric level, `None` outside 0..=2
pub fn qos_from_level(level: i64) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
