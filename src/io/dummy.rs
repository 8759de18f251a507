//! Synthetic device publishing a fixed payload on an interval

use crate::domain::Message;
use crate::infra::config::DeviceConfig;
use crate::services::device::{next_inbound, shutdown_signalled, Device, DeviceContext};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const DEVICE_TYPE: &str = "dummy";

pub struct DummyDevice {
    name: String,
    broker: Option<String>,
    qos: QoS,
    retain: bool,
    subscribe: bool,
    interval: Duration,
    payload: Bytes,
}

impl DummyDevice {
    pub fn new(config: &DeviceConfig, interval: Duration, payload: Bytes) -> Self {
        Self {
            name: config.name.clone(),
            broker: config.broker.clone(),
            qos: config.qos,
            retain: config.retain,
            subscribe: config.subscribe,
            interval,
            payload,
        }
    }

    fn message(&self) -> Message {
        Message::published(&self.name, DEVICE_TYPE, self.payload.clone(), self.qos, self.retain)
    }
}

#[async_trait]
impl Device for DummyDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_type(&self) -> &str {
        DEVICE_TYPE
    }

    fn broker(&self) -> Option<&str> {
        self.broker.as_deref()
    }

    fn subscribe_qos(&self) -> Option<QoS> {
        self.subscribe.then_some(self.qos)
    }

    async fn start(self: Box<Self>, ctx: DeviceContext) {
        let DeviceContext { outbound, mut inbound, mut shutdown } = ctx;
        info!(device = %self.name, interval_s = self.interval.as_secs(), "dummy_device_started");

        // First payload after one full interval
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => {
                    info!(device = %self.name, "dummy_device_shutdown");
                    return;
                }
                _ = ticker.tick() => {
                    if outbound.send(self.message()).await.is_err() {
                        debug!(device = %self.name, "dummy_device_gateway_closed");
                        return;
                    }
                }
                msg = next_inbound(&mut inbound) => {
                    info!(device = %self.name, topic = %msg.topic, bytes = msg.body.len(), "dummy_device_received");
                }
            }
        }
    }
}
