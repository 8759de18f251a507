//! Device capability seen by the gateway
//!
//! The gateway only talks to devices through this trait: it hands each one a
//! `DeviceContext` and receives `Message`s on the shared outbound channel.

use crate::domain::Message;
use crate::infra::config::{DeviceConfig, DeviceKind};
use crate::io::dummy::DummyDevice;
use crate::io::serial::{SerialDevice, SerialSettings};
use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::{mpsc, watch};

/// Channels a running device works with
pub struct DeviceContext {
    /// Shared channel into the dispatch loop
    pub outbound: mpsc::Sender<Message>,
    /// Messages routed back from `<prefix>/<gateway>/<device>/subscribe`
    pub inbound: Option<mpsc::Receiver<Message>>,
    pub shutdown: watch::Receiver<bool>,
}

#[async_trait]
pub trait Device: Send {
    fn name(&self) -> &str;

    /// Used as the data type segment of generated topics
    fn device_type(&self) -> &str;

    /// Broker name restricting failover, `None` for any broker
    fn broker(&self) -> Option<&str>;

    /// QoS of the device's subscribe topic, `None` if it takes no inbound traffic
    fn subscribe_qos(&self) -> Option<QoS>;

    /// Run until shutdown is signalled or the gateway drops its receiver
    async fn start(self: Box<Self>, ctx: DeviceContext);
}

/// Build the device described by a config entry
pub fn from_config(config: &DeviceConfig) -> Box<dyn Device> {
    match &config.kind {
        DeviceKind::Dummy { interval, payload } => {
            Box::new(DummyDevice::new(config, *interval, payload.clone()))
        }
        DeviceKind::Serial { port, baud, size, reopen_interval } => Box::new(SerialDevice::new(
            config,
            SerialSettings {
                port: port.clone(),
                baud: *baud,
                size: *size,
                reopen_interval: *reopen_interval,
            },
        )),
    }
}

/// Next routed message; pends forever once there is no inbound channel
pub async fn next_inbound(inbound: &mut Option<mpsc::Receiver<Message>>) -> Message {
    loop {
        let Some(rx) = inbound.as_mut() else {
            return std::future::pending().await;
        };
        if let Some(msg) = rx.recv().await {
            return msg;
        }
        *inbound = None;
    }
}

/// Wait for the shutdown flag; also returns if the sender is gone
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which ends the device as well
    let _ = shutdown.wait_for(|stop| *stop).await;
}
