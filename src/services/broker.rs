//! One broker connection and its lifecycle state
//!
//! `Broker` is owned by the gateway's dispatch loop and is only mutated
//! there. The transport reports handshake results and connection loss as
//! events, and the loop calls `on_connected` / `on_connection_lost` in
//! response.

use crate::domain::message::qos_level;
use crate::domain::topic::generate_topic;
use crate::domain::{Message, Topic};
use crate::infra::config::BrokerConfig;
use crate::infra::error::{ConnectionError, PublishError, TopicError};
use crate::io::transport::{ConnectOptions, EventSink, MqttTransport};
use rumqttc::QoS;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Wait for a graceful disconnect
pub const CLOSE_WAIT: Duration = Duration::from_millis(250);
/// Wait for a forced disconnect
pub const FORCE_CLOSE_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; never reconnected during this run
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Result of handing a message to a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// Broker was not connected; the message was dropped
    NotConnected,
}

pub struct Broker {
    config: BrokerConfig,
    gateway_name: String,
    transport: Box<dyn MqttTransport>,
    state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect
    attempts: u32,
    /// Topics to restore after every reconnect, in subscription order
    subscribed: Vec<(String, QoS)>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        gateway_name: impl Into<String>,
        transport: Box<dyn MqttTransport>,
    ) -> Self {
        Self {
            config,
            gateway_name: gateway_name.into(),
            transport,
            state: ConnectionState::Disconnected,
            attempts: 0,
            subscribed: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn priority(&self) -> u8 {
        self.config.priority
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn subscriptions(&self) -> &[(String, QoS)] {
        &self.subscribed
    }

    /// Connected as far as both the loop and the transport know
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_connected()
    }

    /// Start a connection attempt; the outcome arrives on `sink`
    pub async fn connect(&mut self, sink: EventSink) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Failed {
            return Err(ConnectionError::Failed {
                broker: self.config.name.clone(),
                reason: "retry budget exhausted".to_string(),
            });
        }
        let options = ConnectOptions::for_broker(&self.config, &self.gateway_name);
        info!(
            broker = %self.config.name,
            priority = self.config.priority,
            url = %self.config.url(),
            will = self.config.will_message.is_some(),
            "broker_connect"
        );
        self.state = ConnectionState::Connecting;
        if let Err(e) = self.transport.connect(options, sink).await {
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }
        Ok(())
    }

    /// Handshake completed: reset the retry budget and restore subscriptions
    pub async fn on_connected(&mut self) {
        if self.state == ConnectionState::Failed {
            return;
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        info!(broker = %self.config.name, url = %self.config.url(), "broker_connected");

        if self.subscribed.is_empty() {
            return;
        }
        match self.transport.subscribe_multiple(&self.subscribed).await {
            Ok(()) => {
                debug!(broker = %self.config.name, topics = self.subscribed.len(), "broker_resubscribed")
            }
            Err(e) => {
                error!(broker = %self.config.name, error = %e, "broker_resubscribe_failed")
            }
        }
    }

    /// Attempt failed or an established connection dropped
    pub fn on_connection_lost(&mut self, reason: &str) {
        if self.state == ConnectionState::Failed {
            return;
        }
        warn!(
            broker = %self.config.name,
            was = self.state.as_str(),
            reason = %reason,
            "broker_connection_lost"
        );
        self.state = ConnectionState::Disconnected;
    }

    /// Count a failed attempt, returning the new total
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn mark_failed(&mut self) {
        self.state = ConnectionState::Failed;
    }

    pub fn generate_topic(&self, msg: &Message) -> Result<Topic, TopicError> {
        generate_topic(&self.config.topic_prefix, &self.gateway_name, msg)
    }

    /// Publish through this broker.
    ///
    /// A disconnected broker drops the message and reports `NotConnected`;
    /// there is no queueing.
    pub async fn publish(&self, msg: &Message) -> Result<PublishOutcome, PublishError> {
        if !self.is_connected() {
            warn!(broker = %self.config.name, msg = %msg, "publish_not_connected");
            return Ok(PublishOutcome::NotConnected);
        }

        let topic = self.generate_topic(msg)?;
        debug!(
            broker = %self.config.name,
            topic = %topic,
            qos = qos_level(msg.qos),
            retain = msg.retained,
            "broker_publish"
        );
        self.transport
            .publish(topic.as_str(), msg.qos, msg.retained, msg.body.clone())
            .await?;
        Ok(PublishOutcome::Delivered)
    }

    /// Subscribe now if connected; always remembered for replay
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ConnectionError> {
        match self.subscribed.iter_mut().find(|(t, _)| t == topic) {
            Some(entry) => entry.1 = qos,
            None => self.subscribed.push((topic.to_string(), qos)),
        }
        if !self.is_connected() {
            debug!(broker = %self.config.name, topic = %topic, "broker_subscribe_deferred");
            return Ok(());
        }
        self.transport.subscribe_multiple(&[(topic.to_string(), qos)]).await
    }

    /// Graceful disconnect (waits up to `CLOSE_WAIT`)
    pub async fn close(&mut self) {
        self.shutdown(CLOSE_WAIT).await;
    }

    /// Disconnect without waiting for in-flight traffic
    pub async fn force_close(&mut self) {
        self.shutdown(FORCE_CLOSE_WAIT).await;
    }

    async fn shutdown(&mut self, wait: Duration) {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.transport.disconnect(wait).await;
                info!(broker = %self.config.name, wait_ms = wait.as_millis() as u64, "broker_closed");
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }
}
