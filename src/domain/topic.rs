//! Topic generation and validation
//!
//! Publish topics are `/`-joined segments. Generated topics must not contain
//! NUL or the MQTT wildcards `+` and `#`.

use crate::domain::message::Message;
use crate::infra::error::TopicError;

/// Topic suffix for the default will topic
const DEFAULT_WILL_SEGMENT: &str = "will";

/// Last segment of every generated device topic
const PUBLISH_SEGMENT: &str = "publish";

/// Last segment of a device's routed-back topic
const SUBSCRIBE_SEGMENT: &str = "subscribe";

/// MQTT limit on encoded topic length
const MAX_TOPIC_BYTES: usize = 65535;

/// Validated publish topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic(String);

impl Topic {
    pub fn parse(topic: impl Into<String>) -> Result<Self, TopicError> {
        let topic = topic.into();
        validate_publish_topic(&topic)?;
        Ok(Self(topic))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check a publish topic against the MQTT grammar.
///
/// UTF-8 validity is carried by the `str` type itself.
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.len() > MAX_TOPIC_BYTES {
        return Err(TopicError::TooLong { len: topic.len(), max: MAX_TOPIC_BYTES });
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter(topic.escape_default().to_string()));
    }
    if let Some(c) = topic.chars().find(|c| matches!(c, '+' | '#')) {
        return Err(TopicError::Wildcard { topic: topic.to_string(), wildcard: c });
    }
    Ok(())
}

/// Wire topic for a message.
///
/// - status sender: `prefix/<msg.topic>`
/// - anything else: `prefix/gateway/sender/data_type/publish`
pub fn generate_topic(
    topic_prefix: &str,
    gateway_name: &str,
    msg: &Message,
) -> Result<Topic, TopicError> {
    let joined = if msg.is_status() {
        [topic_prefix, msg.topic.as_str()].join("/")
    } else {
        [topic_prefix, gateway_name, &msg.sender, &msg.data_type, PUBLISH_SEGMENT].join("/")
    };
    Topic::parse(joined)
}

/// Will topic for a broker.
///
/// The gateway name is only part of the default; an explicit topic is placed
/// directly under the prefix.
pub fn will_topic(topic_prefix: &str, gateway_name: &str, explicit: Option<&str>) -> String {
    match explicit {
        Some(topic) if !topic.is_empty() => [topic_prefix, topic].join("/"),
        _ => [topic_prefix, gateway_name, DEFAULT_WILL_SEGMENT].join("/"),
    }
}

/// Topic a device listens on for routed-back messages
pub fn device_subscribe_topic(topic_prefix: &str, gateway_name: &str, device: &str) -> String {
    [topic_prefix, gateway_name, device, SUBSCRIBE_SEGMENT].join("/")
}
