//! The dispatch loop
//!
//! Single owner of broker state. Every input (commands, device messages,
//! transport events, retry timers, the status tick) is a `select!` branch,
//! so no broker is ever touched from two places at once.

use super::supervisor::{RetryDecision, RetryPolicy, RetryTimers};
use super::Command;
use crate::domain::message::STATUS_SENDER;
use crate::domain::topic::device_subscribe_topic;
use crate::domain::Message;
use crate::infra::config::GatewayConfig;
use crate::infra::error::PublishError;
use crate::infra::metrics::GatewayMetrics;
use crate::io::transport::{BrokerEvent, EventSink, TransportEvent};
use crate::services::broker::{ConnectionState, PublishOutcome, CLOSE_WAIT};
use crate::services::broker_set::BrokerSet;
use crate::services::device::{Device, DeviceContext};
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEVICE_INBOUND_CAPACITY: usize = 32;
/// Period used when status reports are disabled (the branch never runs)
const STATUS_DISABLED_PERIOD: Duration = Duration::from_secs(3600);

pub(super) struct Dispatcher {
    config: GatewayConfig,
    brokers: BrokerSet,
    metrics: Arc<GatewayMetrics>,
    messages: broadcast::Sender<Message>,
    device_tx: mpsc::Sender<Message>,
    /// Broker name restricting failover, per device name
    device_brokers: HashMap<String, Option<String>>,
    /// Literal subscribe topic to the device that wants it
    routes: HashMap<String, mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<BrokerEvent>,
    event_rx: mpsc::Receiver<BrokerEvent>,
    timers: RetryTimers,
    shutdown_tx: watch::Sender<bool>,
    device_tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub(super) fn new(
        config: GatewayConfig,
        brokers: BrokerSet,
        metrics: Arc<GatewayMetrics>,
        messages: broadcast::Sender<Message>,
        device_tx: mpsc::Sender<Message>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            brokers,
            metrics,
            messages,
            device_tx,
            device_brokers: HashMap::new(),
            routes: HashMap::new(),
            event_tx,
            event_rx,
            timers: RetryTimers::new(),
            shutdown_tx,
            device_tasks: Vec::new(),
        }
    }

    pub(super) async fn run(
        mut self,
        devices: Vec<Box<dyn Device>>,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut device_rx: mpsc::Receiver<Message>,
    ) {
        for device in devices {
            self.start_device(device).await;
        }
        for index in 0..self.brokers.len() {
            self.connect(index).await;
        }

        let status_enabled = self.config.status_interval.is_some();
        let period = self.config.status_interval.unwrap_or(STATUS_DISABLED_PERIOD);
        let mut status_tick = interval_at(tokio::time::Instant::now() + period, period);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let command = loop {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => {
                    // Closed command channel means stop
                    break cmd.unwrap_or(Command::Stop);
                }
                Some(event) = self.event_rx.recv() => self.handle_broker_event(event).await,
                Some(index) = self.timers.recv() => self.reconnect(index).await,
                Some(msg) = device_rx.recv() => self.route_outbound(msg).await,
                _ = status_tick.tick(), if status_enabled => self.publish_status().await,
            }
        };

        self.shutdown(command).await;
    }

    /// Register routes and subscriptions for a device, then spawn it
    async fn start_device(&mut self, device: Box<dyn Device>) {
        let name = device.name().to_string();
        let broker_filter = device.broker().map(str::to_string);

        let inbound = match device.subscribe_qos() {
            Some(qos) => Some(self.subscribe_device(&name, broker_filter.as_deref(), qos).await),
            None => None,
        };

        info!(
            device = %name,
            device_type = %device.device_type(),
            broker = broker_filter.as_deref().unwrap_or("*"),
            subscribe = inbound.is_some(),
            "device_registered"
        );
        self.device_brokers.insert(name, broker_filter);

        let ctx = DeviceContext {
            outbound: self.device_tx.clone(),
            inbound,
            shutdown: self.shutdown_tx.subscribe(),
        };
        self.device_tasks.push(tokio::spawn(device.start(ctx)));
    }

    async fn subscribe_device(
        &mut self,
        device: &str,
        broker_filter: Option<&str>,
        qos: QoS,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(DEVICE_INBOUND_CAPACITY);
        let gateway_name = self.config.name.clone();

        for broker in self.brokers.iter_mut() {
            if broker_filter.is_some_and(|name| broker.name() != name) {
                continue;
            }
            let topic = device_subscribe_topic(&broker.config().topic_prefix, &gateway_name, device);
            if let Err(e) = broker.subscribe(&topic, qos).await {
                warn!(broker = %broker.name(), topic = %topic, error = %e, "device_subscribe_failed");
            }
            self.routes.insert(topic, tx.clone());
        }
        rx
    }

    async fn connect(&mut self, index: usize) {
        let sink = EventSink::new(index, self.event_tx.clone())
            .with_metrics(Arc::clone(&self.metrics));
        let Some(broker) = self.brokers.get_mut(index) else {
            return;
        };
        if let Err(e) = broker.connect(sink).await {
            warn!(broker = %broker.name(), error = %e, "broker_connect_failed");
            self.retry_or_fail(index);
        }
    }

    /// Retry timer fired
    async fn reconnect(&mut self, index: usize) {
        match self.brokers.get(index).map(|b| b.state()) {
            Some(ConnectionState::Disconnected) => self.connect(index).await,
            Some(state) => debug!(index, state = state.as_str(), "broker_retry_skipped"),
            None => {}
        }
    }

    async fn handle_broker_event(&mut self, event: BrokerEvent) {
        let BrokerEvent { broker: index, event } = event;
        let Some(broker) = self.brokers.get_mut(index) else {
            return;
        };

        match event {
            TransportEvent::Connected => {
                broker.on_connected().await;
                self.metrics.set_brokers_connected(self.brokers.connected_count());
            }
            TransportEvent::ConnectionLost(reason) => {
                // Only a live attempt or connection can fail
                if !matches!(broker.state(), ConnectionState::Connecting | ConnectionState::Connected) {
                    debug!(broker = %broker.name(), reason = %reason, "connection_lost_ignored");
                    return;
                }
                broker.on_connection_lost(&reason);
                self.metrics.set_brokers_connected(self.brokers.connected_count());
                self.retry_or_fail(index);
            }
            TransportEvent::Message { topic, payload, qos, retain } => {
                let msg = Message::subscribed(broker.name(), topic, payload, qos, retain);
                self.route_inbound(msg);
            }
        }
    }

    /// Count a failure for the broker and either schedule a retry or give up
    fn retry_or_fail(&mut self, index: usize) {
        let Some(broker) = self.brokers.get_mut(index) else {
            return;
        };
        let attempts = broker.record_failure();
        let policy = RetryPolicy::for_broker(&self.config, broker.config());

        match policy.next(attempts) {
            RetryDecision::Retry(delay) => {
                info!(
                    broker = %broker.name(),
                    attempt = attempts,
                    max_retry_count = policy.max_retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "broker_retry_scheduled"
                );
                self.metrics.record_reconnect_attempt();
                self.timers.schedule(index, delay);
            }
            RetryDecision::GiveUp => {
                broker.mark_failed();
                error!(broker = %broker.name(), attempts = attempts, "broker_retry_exhausted");
                self.metrics.record_broker_failed();
            }
        }
    }

    /// Broadcast a received message and hand it to the device subscribed to its topic
    fn route_inbound(&mut self, msg: Message) {
        self.metrics.record_inbound();
        debug!(broker = %msg.sender, topic = %msg.topic, bytes = msg.body.len(), "message_received");

        if let Some(route) = self.routes.get(&msg.topic) {
            match route.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.metrics.record_inbound_dropped();
                    warn!(topic = %msg.topic, "device_inbound_full");
                }
                Err(TrySendError::Closed(_)) => {
                    self.metrics.record_inbound_dropped();
                    debug!(topic = %msg.topic, "device_inbound_closed");
                }
            }
        }

        // No receivers is normal
        let _ = self.messages.send(msg);
    }

    /// Publish to the first connected broker in priority order
    async fn route_outbound(&mut self, msg: Message) {
        let filter = if msg.is_status() {
            None
        } else {
            self.device_brokers.get(&msg.sender).cloned().flatten()
        };

        let Some(index) = self.brokers.select_connected(filter.as_deref()) else {
            self.metrics.record_dropped_no_broker();
            warn!(
                sender = %msg.sender,
                broker = filter.as_deref().unwrap_or("*"),
                "publish_dropped_no_broker"
            );
            return;
        };
        let Some(broker) = self.brokers.get(index) else {
            return;
        };

        let started = Instant::now();
        match broker.publish(&msg).await {
            Ok(PublishOutcome::Delivered) => {
                self.metrics.record_published(started.elapsed().as_millis() as u64);
            }
            Ok(PublishOutcome::NotConnected) => self.metrics.record_dropped_no_broker(),
            Err(PublishError::Topic(e)) => {
                self.metrics.record_topic_rejected();
                warn!(broker = %broker.name(), sender = %msg.sender, error = %e, "publish_topic_rejected");
            }
            Err(e) => {
                self.metrics.record_publish_failed();
                warn!(broker = %broker.name(), sender = %msg.sender, error = %e, "publish_failed");
            }
        }
    }

    async fn publish_status(&mut self) {
        let topic = format!("$SYS/{}/gateway/stats", self.config.name);
        let body = Bytes::from(self.metrics.snapshot().to_json());
        debug!(topic = %topic, sender = STATUS_SENDER, "status_report");
        self.route_outbound(Message::status(topic, body)).await;
    }

    async fn shutdown(mut self, command: Command) {
        info!(gateway = %self.config.name, command = ?command, "gateway_stopping");

        let _ = self.shutdown_tx.send(true);
        self.timers.abort_all();

        for broker in self.brokers.iter_mut() {
            match command {
                Command::Stop => broker.close().await,
                Command::ForceStop => broker.force_close().await,
            }
        }
        self.metrics.set_brokers_connected(0);

        let deadline = tokio::time::Instant::now() + CLOSE_WAIT;
        for mut task in self.device_tasks.drain(..) {
            if command == Command::ForceStop
                || tokio::time::timeout_at(deadline, &mut task).await.is_err()
            {
                task.abort();
            }
        }

        info!(gateway = %self.config.name, "gateway_stopped");
    }
}
