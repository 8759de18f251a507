//! In-memory transport for exercising broker and gateway logic

use crate::infra::error::{ConnectionError, PublishError};
use crate::io::transport::{ConnectOptions, EventSink, MqttTransport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;

/// How the fake broker answers a connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    Refuse,
    /// No answer until `MockHandle::accept` is called
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

struct MockState {
    mode: ConnectMode,
    connected: bool,
    fail_publish: bool,
    connects: usize,
    last_options: Option<ConnectOptions>,
    sink: Option<EventSink>,
    published: Vec<Published>,
    subscriptions: Vec<Vec<(String, QoS)>>,
    disconnects: Vec<Duration>,
}

/// Test-side view of a `MockTransport`
#[derive(Clone)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn set_mode(&self, mode: ConnectMode) {
        self.0.lock().mode = mode;
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.0.lock().fail_publish = fail;
    }

    pub fn connects(&self) -> usize {
        self.0.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.0.lock().connected
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.0.lock().last_options.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.0.lock().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<Vec<(String, QoS)>> {
        self.0.lock().subscriptions.clone()
    }

    pub fn disconnects(&self) -> Vec<Duration> {
        self.0.lock().disconnects.clone()
    }

    /// Complete a pending handshake
    pub async fn accept(&self) {
        let sink = {
            let mut state = self.0.lock();
            state.connected = true;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.emit(TransportEvent::Connected).await;
        }
    }

    /// Simulate the network dropping an established connection
    pub async fn drop_connection(&self, reason: &str) {
        let sink = {
            let mut state = self.0.lock();
            state.connected = false;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.emit(TransportEvent::ConnectionLost(reason.to_string())).await;
        }
    }

    /// Deliver an inbound PUBLISH as if received on a subscription
    pub async fn deliver(&self, topic: &str, payload: &'static [u8]) {
        let sink = self.0.lock().sink.clone();
        if let Some(sink) = sink {
            sink.emit(TransportEvent::Message {
                topic: topic.to_string(),
                payload: Bytes::from_static(payload),
                qos: QoS::AtMostOnce,
                retain: false,
            })
            .await;
        }
    }
}

pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(mode: ConnectMode) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState {
            mode,
            connected: false,
            fail_publish: false,
            connects: 0,
            last_options: None,
            sink: None,
            published: Vec::new(),
            subscriptions: Vec::new(),
            disconnects: Vec::new(),
        }));
        (Self { state: Arc::clone(&state) }, MockHandle(state))
    }
}

#[async_trait]
impl MqttTransport for MockTransport {
    async fn connect(
        &mut self,
        options: ConnectOptions,
        sink: EventSink,
    ) -> Result<(), ConnectionError> {
        let event = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.last_options = Some(options);
            state.sink = Some(sink.clone());
            match state.mode {
                ConnectMode::Accept => {
                    state.connected = true;
                    Some(TransportEvent::Connected)
                }
                ConnectMode::Refuse => {
                    state.connected = false;
                    Some(TransportEvent::ConnectionLost("connection refused".to_string()))
                }
                ConnectMode::Silent => None,
            }
        };
        // The caller may be the receiving end of the sink
        if let Some(event) = event {
            tokio::spawn(async move { sink.emit(event).await });
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), PublishError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(PublishError::ConnectionClosed);
        }
        if state.fail_publish {
            return Err(PublishError::Timeout(Duration::from_millis(1)));
        }
        state.published.push(Published { topic: topic.to_string(), qos, retain, payload });
        Ok(())
    }

    async fn subscribe_multiple(&self, filters: &[(String, QoS)]) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(ConnectionError::NotConnected("mock".to_string()));
        }
        state.subscriptions.push(filters.to_vec());
        Ok(())
    }

    async fn disconnect(&mut self, wait: Duration) {
        let mut state = self.state.lock();
        state.connected = false;
        state.sink = None;
        state.disconnects.push(wait);
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}
