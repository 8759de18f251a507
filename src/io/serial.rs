//! Serial line device
//!
//! Bytes read from the port are published, either as read or cut into
//! fixed-size frames. Messages routed back to the device are written to the
//! port. A port that cannot be opened (or fails later) is reopened after a
//! fixed delay until shutdown.

use crate::domain::Message;
use crate::infra::config::DeviceConfig;
use crate::services::device::{next_inbound, shutdown_signalled, Device, DeviceContext};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

pub const DEVICE_TYPE: &str = "serial";

const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    /// Frame size; 0 publishes every read as it arrives
    pub size: usize,
    pub reopen_interval: Duration,
}

pub struct SerialDevice {
    name: String,
    broker: Option<String>,
    qos: QoS,
    retain: bool,
    subscribe: bool,
    settings: SerialSettings,
    /// Partial frame carried across reads
    read_buffer: Vec<u8>,
}

/// Why a port session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    GatewayClosed,
    PortFailed,
}

/// Cut complete frames off the front of `buffer`, keeping the remainder
fn take_frames(buffer: &mut Vec<u8>, size: usize) -> Vec<Bytes> {
    if size == 0 {
        if buffer.is_empty() {
            return Vec::new();
        }
        return vec![Bytes::from(std::mem::take(buffer))];
    }

    let complete = buffer.len() / size;
    let mut frames = Vec::with_capacity(complete);
    for chunk in buffer.chunks_exact(size) {
        frames.push(Bytes::copy_from_slice(chunk));
    }
    buffer.drain(..complete * size);
    frames
}

impl SerialDevice {
    pub fn new(config: &DeviceConfig, settings: SerialSettings) -> Self {
        Self {
            name: config.name.clone(),
            broker: config.broker.clone(),
            qos: config.qos,
            retain: config.retain,
            subscribe: config.subscribe,
            read_buffer: Vec::with_capacity(settings.size.max(READ_CHUNK)),
            settings,
        }
    }

    /// Drive one open port until it fails or the device stops
    async fn serve<S>(
        &mut self,
        port: S,
        outbound: &mpsc::Sender<Message>,
        inbound: &mut Option<mpsc::Receiver<Message>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite,
    {
        let (mut reader, mut writer) = tokio::io::split(port);
        let mut buf = [0u8; READ_CHUNK];

        loop {
            tokio::select! {
                _ = shutdown_signalled(shutdown) => return SessionEnd::Shutdown,
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            warn!(device = %self.name, "serial_port_closed");
                            return SessionEnd::PortFailed;
                        }
                        Ok(n) => n,
                        Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                        Err(e) => {
                            warn!(device = %self.name, error = %e, "serial_read_error");
                            return SessionEnd::PortFailed;
                        }
                    };
                    self.read_buffer.extend_from_slice(&buf[..n]);
                    for frame in take_frames(&mut self.read_buffer, self.settings.size) {
                        let msg = Message::published(&self.name, DEVICE_TYPE, frame, self.qos, self.retain);
                        if outbound.send(msg).await.is_err() {
                            return SessionEnd::GatewayClosed;
                        }
                    }
                    if !self.read_buffer.is_empty() {
                        tracing::trace!(device = %self.name, pending = self.read_buffer.len(), "serial_partial_frame");
                    }
                }
                msg = next_inbound(inbound) => {
                    if let Err(e) = writer.write_all(&msg.body).await {
                        warn!(device = %self.name, error = %e, "serial_write_error");
                        return SessionEnd::PortFailed;
                    }
                    debug!(device = %self.name, bytes = msg.body.len(), "serial_written");
                }
            }
        }
    }
}

#[async_trait]
impl Device for SerialDevice {
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

    async fn start(mut self: Box<Self>, ctx: DeviceContext) {
        let DeviceContext { outbound, mut inbound, mut shutdown } = ctx;
        info!(
            device = %self.name,
            port = %self.settings.port,
            baud = %self.settings.baud,
            size = self.settings.size,
            "serial_device_started"
        );

        loop {
            let port_result = tokio_serial::new(&self.settings.port, self.settings.baud)
                .timeout(Duration::from_millis(100))
                .open_native_async();

            match port_result {
                Ok(port) => {
                    info!(device = %self.name, port = %self.settings.port, "serial_port_opened");
                    match self.serve(port, &outbound, &mut inbound, &mut shutdown).await {
                        SessionEnd::Shutdown => {
                            info!(device = %self.name, "serial_device_shutdown");
                            return;
                        }
                        SessionEnd::GatewayClosed => {
                            debug!(device = %self.name, "serial_device_gateway_closed");
                            return;
                        }
                        SessionEnd::PortFailed => self.read_buffer.clear(),
                    }
                }
                Err(e) => {
                    error!(device = %self.name, port = %self.settings.port, error = %e, "serial_port_open_failed");
                }
            }

            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => {
                    info!(device = %self.name, "serial_device_shutdown");
                    return;
                }
                _ = tokio::time::sleep(self.settings.reopen_interval) => {}
            }
        }
    }
}
