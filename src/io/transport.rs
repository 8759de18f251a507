//! Transport seam between broker state and the MQTT client library
//!
//! A transport owns one network connection at a time. Connection outcomes
//! and inbound messages are not returned from calls; they are pushed as
//! `BrokerEvent`s into the gateway's event channel so that the dispatch loop
//! is the only place broker state changes.

use crate::infra::config::BrokerConfig;
use crate::infra::error::{ConnectionError, PublishError};
use crate::infra::metrics::GatewayMetrics;
use crate::infra::tls::TlsMaterial;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Last-will registration sent with CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything needed to open one connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub will: Option<Will>,
    pub tls: Option<TlsMaterial>,
    pub keep_alive: Duration,
}

impl ConnectOptions {
    /// Options for a configured broker; the client id is the gateway name
    pub fn for_broker(config: &BrokerConfig, gateway_name: &str) -> Self {
        let credentials = config
            .username
            .as_ref()
            .map(|user| (user.clone(), config.password.clone().unwrap_or_default()));

        // Wills always go out at QoS 0, retained
        let will = config.will_message.as_ref().map(|payload| Will {
            topic: config.will_topic.clone(),
            payload: payload.clone(),
            qos: QoS::AtMostOnce,
            retain: true,
        });

        Self {
            client_id: gateway_name.to_string(),
            host: config.host.clone(),
            port: config.port,
            credentials,
            will,
            tls: config.tls.clone(),
            keep_alive: KEEP_ALIVE,
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "ssl" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Something that happened on a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed
    Connected,
    /// Connection attempt failed or an established connection dropped
    ConnectionLost(String),
    /// PUBLISH received on a subscription
    Message { topic: String, payload: Bytes, qos: QoS, retain: bool },
}

/// Transport event tagged with the broker's index in the `BrokerSet`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEvent {
    pub broker: usize,
    pub event: TransportEvent,
}

/// Handle a transport uses to report events for its broker
#[derive(Clone)]
pub struct EventSink {
    broker: usize,
    tx: mpsc::Sender<BrokerEvent>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").field("broker", &self.broker).finish()
    }
}

impl EventSink {
    pub fn new(broker: usize, tx: mpsc::Sender<BrokerEvent>) -> Self {
        Self { broker, tx, metrics: None }
    }

    /// Count events dropped by `offer` as dropped inbound messages
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn broker(&self) -> usize {
        self.broker
    }

    /// Deliver an event; a closed receiver means the gateway is gone
    pub async fn emit(&self, event: TransportEvent) {
        if self.tx.send(BrokerEvent { broker: self.broker, event }).await.is_err() {
            debug!(broker = self.broker, "broker_event_receiver_closed");
        }
    }

    /// Deliver an event without waiting. A full channel drops it.
    ///
    /// Used for inbound PUBLISHes: the caller must keep reading the socket
    /// so that acknowledgements for the gateway's own publishes get through.
    pub fn offer(&self, event: TransportEvent) -> bool {
        match self.tx.try_send(BrokerEvent { broker: self.broker, event }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_inbound_dropped();
                }
                warn!(broker = self.broker, "broker_event_dropped_full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(broker = self.broker, "broker_event_receiver_closed");
                false
            }
        }
    }
}

/// MQTT client operations used by `Broker`
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Start connecting. Returns once the attempt is underway; the outcome
    /// arrives on `sink` as `Connected` or `ConnectionLost`.
    async fn connect(
        &mut self,
        options: ConnectOptions,
        sink: EventSink,
    ) -> Result<(), ConnectionError>;

    /// Publish and wait for the broker acknowledgement (QoS 1 and 2) or for
    /// the packet to be written (QoS 0)
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), PublishError>;

    /// One SUBSCRIBE carrying every filter
    async fn subscribe_multiple(&self, filters: &[(String, QoS)]) -> Result<(), ConnectionError>;

    /// Disconnect, waiting at most `wait` for the DISCONNECT to flush
    async fn disconnect(&mut self, wait: Duration);

    fn is_connected(&self) -> bool;
}
