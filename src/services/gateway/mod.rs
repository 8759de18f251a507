//! Gateway: devices in, brokers out
//!
//! The Gateway owns every broker connection and device task for one run:
//! - Device messages are published to the highest-priority connected broker
//! - Broker connection loss is retried at a fixed interval, up to a budget
//! - Messages received on subscriptions are broadcast and routed to devices
//! - `stop()` / `force_stop()` close every broker before returning

mod dispatch;
pub mod supervisor;

use crate::domain::Message;
use crate::infra::config::{Config, GatewayConfig};
use crate::infra::metrics::GatewayMetrics;
use crate::io::mqtt::RumqttTransport;
use crate::services::broker::Broker;
use crate::services::broker_set::BrokerSet;
use crate::services::device::{self, Device};
use dispatch::Dispatcher;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Capacity of the shared device channel
const DEVICE_CHANNEL_CAPACITY: usize = 256;
/// Capacity of the broadcast channel for received messages
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    ForceStop,
}

pub struct Gateway {
    config: GatewayConfig,
    brokers: BrokerSet,
    devices: Vec<Box<dyn Device>>,
    metrics: Arc<GatewayMetrics>,
    messages: broadcast::Sender<Message>,
    device_tx: mpsc::Sender<Message>,
    device_rx: mpsc::Receiver<Message>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, brokers: BrokerSet) -> Self {
        let (device_tx, device_rx) = mpsc::channel(DEVICE_CHANNEL_CAPACITY);
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self {
            config,
            brokers,
            devices: Vec::new(),
            metrics: Arc::new(GatewayMetrics::new()),
            messages,
            device_tx,
            device_rx,
        }
    }

    /// Gateway with rumqttc transports and the configured devices
    pub fn from_config(config: &Config) -> Self {
        let gateway = config.gateway();
        let brokers = config
            .brokers()
            .iter()
            .map(|b| {
                let transport = RumqttTransport::new(gateway.publish_timeout);
                Broker::new(b.clone(), &gateway.name, Box::new(transport))
            })
            .collect();

        let mut gw = Self::new(gateway.clone(), BrokerSet::new(brokers));
        for device_config in config.devices() {
            gw.register_device(device::from_config(device_config));
        }
        gw
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn brokers(&self) -> &BrokerSet {
        &self.brokers
    }

    pub fn register_device(&mut self, device: Box<dyn Device>) {
        if self.devices.iter().any(|d| d.name() == device.name()) {
            warn!(device = %device.name(), "device_name_duplicate");
        }
        self.devices.push(device);
    }

    /// Sender feeding the dispatch loop, as used by devices
    pub fn outbound(&self) -> mpsc::Sender<Message> {
        self.device_tx.clone()
    }

    /// Every message received from any broker
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Start devices, connect brokers and run the dispatch loop
    pub fn spawn(self) -> GatewayHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let metrics = Arc::clone(&self.metrics);

        info!(
            gateway = %self.config.name,
            brokers = self.brokers.len(),
            devices = self.devices.len(),
            max_retry_count = self.config.max_retry_count,
            retry_interval_s = self.config.retry_interval.as_secs(),
            "gateway_starting"
        );

        let dispatcher = Dispatcher::new(
            self.config,
            self.brokers,
            Arc::clone(&self.metrics),
            self.messages,
            self.device_tx,
        );
        let task = tokio::spawn(dispatcher.run(self.devices, cmd_rx, self.device_rx));

        GatewayHandle { cmd_tx, task, metrics }
    }
}

/// Control side of a running gateway
pub struct GatewayHandle {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    metrics: Arc<GatewayMetrics>,
}

impl GatewayHandle {
    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Graceful shutdown: brokers get `CLOSE_WAIT` to flush
    pub async fn stop(self) {
        self.shutdown(Command::Stop).await;
    }

    /// Shutdown with `FORCE_CLOSE_WAIT` per broker
    pub async fn force_stop(self) {
        self.shutdown(Command::ForceStop).await;
    }

    async fn shutdown(self, command: Command) {
        // A closed channel also stops the loop, so a failed send is fine
        let _ = self.cmd_tx.send(command).await;
        drop(self.cmd_tx);
        if let Err(e) = self.task.await {
            warn!(error = %e, "gateway_task_join_failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
