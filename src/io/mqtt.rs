//! rumqttc-backed transport
//!
//! Every `connect` builds a fresh client and event loop and spawns a task
//! that polls it. The poll task reports the handshake, inbound PUBLISHes and
//! connection loss through the `EventSink`, and stops at the first
//! connection error: reconnecting is the gateway's decision, not the
//! client library's.
//!
//! Neither side waits on the other. The poll task never blocks on inbound
//! delivery (a full event channel drops the message), and `publish` never
//! waits for room in the request queue, so a PUBACK can always be read while
//! the gateway is waiting for it.

use crate::infra::error::{ConnectionError, PublishError};
use crate::io::transport::{ConnectOptions, EventSink, MqttTransport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Capacity of the client's request queue
const REQUEST_CAPACITY: usize = 100;

type AckResult = Result<(), PublishError>;

/// Matches publish requests to their acknowledgements.
///
/// Requests are registered and enqueued under the same lock; the event
/// loop reports `Outgoing::Publish(pkid)` in queue order, which is when a
/// waiter learns its packet id.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<(QoS, oneshot::Sender<AckResult>)>,
    inflight: HashMap<u16, oneshot::Sender<AckResult>>,
}

impl AckTracker {
    fn push(&mut self, qos: QoS, waiter: oneshot::Sender<AckResult>) {
        self.queued.push_back((qos, waiter));
    }

    /// Drop the most recent registration (its request never reached the queue)
    fn pop_back(&mut self) {
        self.queued.pop_back();
    }

    /// Packet written to the network
    fn sent(&mut self, pkid: u16) {
        let Some((qos, waiter)) = self.queued.pop_front() else {
            return;
        };
        match qos {
            QoS::AtMostOnce => {
                let _ = waiter.send(Ok(()));
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                self.inflight.insert(pkid, waiter);
            }
        }
    }

    /// PUBACK or PUBCOMP received
    fn acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_all(&mut self) {
        for (_, waiter) in self.queued.drain(..) {
            let _ = waiter.send(Err(PublishError::ConnectionClosed));
        }
        for (_, waiter) in self.inflight.drain() {
            let _ = waiter.send(Err(PublishError::ConnectionClosed));
        }
    }

    fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

/// State shared between the transport and one poll task
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    closing: AtomicBool,
    acks: Mutex<AckTracker>,
}

struct Session {
    client: AsyncClient,
    shared: Arc<Shared>,
    poll_task: JoinHandle<()>,
}

pub struct RumqttTransport {
    publish_timeout: Duration,
    session: Option<Session>,
}

impl RumqttTransport {
    pub fn new(publish_timeout: Duration) -> Self {
        Self { publish_timeout, session: None }
    }

    fn mqtt_options(options: ConnectOptions) -> Result<MqttOptions, ConnectionError> {
        if options.client_id.is_empty() || options.client_id.starts_with(' ') {
            return Err(ConnectionError::Failed {
                broker: options.url(),
                reason: format!("invalid client id {:?}", options.client_id),
            });
        }

        let mut mqtt = MqttOptions::new(options.client_id, options.host, options.port);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);

        if let Some((username, password)) = options.credentials {
            mqtt.set_credentials(username, password);
        }
        if let Some(will) = options.will {
            mqtt.set_last_will(LastWill::new(will.topic, will.payload.to_vec(), will.qos, will.retain));
        }
        if let Some(tls) = &options.tls {
            mqtt.set_transport(Transport::tls_with_config(tls.to_configuration()));
        }
        Ok(mqtt)
    }
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

async fn poll_loop(mut eventloop: EventLoop, shared: Arc<Shared>, sink: EventSink) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                shared.connected.store(true, Ordering::Relaxed);
                sink.emit(TransportEvent::Connected).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                sink.offer(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                });
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => shared.acks.lock().acked(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => shared.acks.lock().acked(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.acks.lock().sent(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.connected.store(false, Ordering::Relaxed);
                shared.acks.lock().fail_all();
                debug!(broker = sink.broker(), "mqtt_disconnect_sent");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::Relaxed);
                shared.acks.lock().fail_all();
                if shared.closing.load(Ordering::Relaxed) {
                    debug!(broker = sink.broker(), error = %e, "mqtt_poll_stopped");
                    return;
                }
                sink.emit(TransportEvent::ConnectionLost(e.to_string())).await;
                return;
            }
        }
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn connect(
        &mut self,
        options: ConnectOptions,
        sink: EventSink,
    ) -> Result<(), ConnectionError> {
        if let Some(old) = self.session.take() {
            old.shared.closing.store(true, Ordering::Relaxed);
            old.poll_task.abort();
            old.shared.acks.lock().fail_all();
        }

        let url = options.url();
        let mqtt = Self::mqtt_options(options)?;
        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        let shared = Arc::new(Shared::default());
        let poll_task = tokio::spawn(poll_loop(eventloop, Arc::clone(&shared), sink));

        info!(url = %url, "broker_connecting");
        self.session = Some(Session { client, shared, poll_task });
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), PublishError> {
        let session = self.session.as_ref().ok_or(PublishError::ConnectionClosed)?;
        if !session.shared.connected.load(Ordering::Relaxed) {
            return Err(PublishError::ConnectionClosed);
        }

        let ack = {
            let mut acks = session.shared.acks.lock();
            let (tx, rx) = oneshot::channel();
            acks.push(qos, tx);
            // Full request queue fails now rather than stalling the caller
            if let Err(e) = session.client.try_publish(topic, qos, retain, payload.to_vec()) {
                acks.pop_back();
                return Err(PublishError::Rejected(e.to_string()));
            }
            rx
        };

        match timeout(self.publish_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::ConnectionClosed),
            Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
        }
    }

    async fn subscribe_multiple(&self, filters: &[(String, QoS)]) -> Result<(), ConnectionError> {
        if filters.is_empty() {
            return Ok(());
        }
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ConnectionError::NotConnected("transport".to_string()))?;
        let filters = filters.iter().map(|(topic, qos)| SubscribeFilter::new(topic.clone(), *qos));
        session.client.subscribe_many(filters).await.map_err(|e| ConnectionError::Failed {
            broker: "subscribe".to_string(),
            reason: e.to_string(),
        })
    }

    async fn disconnect(&mut self, wait: Duration) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.shared.closing.store(true, Ordering::Relaxed);

        if session.shared.connected.load(Ordering::Relaxed) {
            match timeout(wait, session.client.disconnect()).await {
                Ok(Ok(())) => {
                    if timeout(wait, &mut session.poll_task).await.is_err() {
                        debug!("mqtt_disconnect_flush_timeout");
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "mqtt_disconnect_failed"),
                Err(_) => debug!("mqtt_disconnect_request_timeout"),
            }
        }

        session.poll_task.abort();
        session.shared.connected.store(false, Ordering::Relaxed);
        let mut acks = session.shared.acks.lock();
        if acks.pending() > 0 {
            debug!(pending = acks.pending(), "mqtt_pending_publishes_failed");
        }
        acks.fail_all();
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.shared.connected.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::Will;

    #[test]
    fn test_qos0_resolves_when_sent() {
        let mut tracker = AckTracker::default();
        let (tx, mut rx) = oneshot::channel();
        tracker.push(QoS::AtMostOnce, tx);
        tracker.sent(0);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_qos1_waits_for_puback() {
        let mut tracker = AckTracker::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        tracker.push(QoS::AtLeastOnce, tx1);
        tracker.push(QoS::ExactlyOnce, tx2);
        tracker.sent(7);
        tracker.sent(8);
        assert!(rx1.try_recv().is_err());

        tracker.acked(8);
        assert_eq!(rx2.try_recv().unwrap(), Ok(()));
        assert!(rx1.try_recv().is_err());

        tracker.acked(7);
        assert_eq!(rx1.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_fail_all_on_connection_loss() {
        let mut tracker = AckTracker::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        tracker.push(QoS::AtLeastOnce, tx1);
        tracker.sent(1);
        tracker.push(QoS::AtLeastOnce, tx2);
        tracker.fail_all();
        assert_eq!(rx1.try_recv().unwrap(), Err(PublishError::ConnectionClosed));
        assert_eq!(rx2.try_recv().unwrap(), Err(PublishError::ConnectionClosed));
    }

    #[test]
    fn test_unknown_ack_ignored() {
        let mut tracker = AckTracker::default();
        tracker.acked(42);
        tracker.sent(1);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_mqtt_options_reject_bad_client_id() {
        let options = ConnectOptions {
            client_id: String::new(),
            host: "localhost".to_string(),
            port: 1883,
            credentials: None,
            will: None,
            tls: None,
            keep_alive: Duration::from_secs(30),
        };
        assert!(RumqttTransport::mqtt_options(options).is_err());
    }

    #[test]
    fn test_mqtt_options_will() {
        let options = ConnectOptions {
            client_id: "ham".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            credentials: Some(("usr".to_string(), "pass".to_string())),
            will: Some(Will {
                topic: "/ham/will".to_string(),
                payload: Bytes::from_static(b"bye"),
                qos: QoS::AtMostOnce,
                retain: true,
            }),
            tls: None,
            keep_alive: Duration::from_secs(30),
        };
        let mqtt = RumqttTransport::mqtt_options(options).unwrap();
        assert_eq!(mqtt.client_id(), "ham");
        let will = mqtt.last_will().unwrap();
        assert_eq!(will.topic, "/ham/will");
        assert_eq!(&will.message[..], b"bye");
        assert!(will.retain);
        assert_eq!(mqtt.credentials(), Some(("usr".to_string(), "pass".to_string())));
    }

    /// Transport whose client queue holds one request and is never drained
    fn stalled_transport() -> (RumqttTransport, EventLoop) {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("ham", "localhost", 1883), 1);
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::Relaxed);
        let session = Session { client, shared, poll_task: tokio::spawn(async {}) };
        let transport =
            RumqttTransport { publish_timeout: Duration::from_millis(50), session: Some(session) };
        (transport, eventloop)
    }

    #[tokio::test]
    async fn test_full_request_queue_rejects_without_blocking() {
        let (transport, _eventloop) = stalled_transport();
        let payload = Bytes::from_static(b"1");

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            transport.publish("a/b", QoS::AtLeastOnce, false, payload.clone()),
        )
        .await
        .unwrap();
        assert_eq!(result, Err(PublishError::Timeout(Duration::from_millis(50))));

        // Queue is now full; the second request must not wait for room
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            transport.publish("a/b", QoS::AtLeastOnce, false, payload),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(PublishError::Rejected(_))));

        let session = transport.session.as_ref().unwrap();
        assert_eq!(session.shared.acks.lock().pending(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_session() {
        let transport = RumqttTransport::default();
        let result = transport.publish("a/b", QoS::AtMostOnce, false, Bytes::new()).await;
        assert_eq!(result, Err(PublishError::ConnectionClosed));
        assert!(!transport.is_connected());
    }
}
