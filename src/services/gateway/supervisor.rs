//! Reconnect policy and retry timers
//!
//! Fixed-interval retries bounded by `max_retry_count`. Timers are short-lived
//! tasks that post the broker index back to the dispatch loop; they never
//! touch broker state themselves.

use crate::infra::config::{BrokerConfig, GatewayConfig};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry_count: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retry_count: u32, interval: Duration) -> Self {
        Self { max_retry_count, interval }
    }

    /// Gateway policy, with the broker's own interval when it sets one
    pub fn for_broker(gateway: &GatewayConfig, broker: &BrokerConfig) -> Self {
        Self::new(gateway.max_retry_count, broker.retry_interval.unwrap_or(gateway.retry_interval))
    }

    /// Decision after `attempts` consecutive failures
    pub fn next(&self, attempts: u32) -> RetryDecision {
        if attempts <= self.max_retry_count {
            RetryDecision::Retry(self.interval)
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// One pending timer per broker index
pub struct RetryTimers {
    tx: mpsc::Sender<usize>,
    rx: mpsc::Receiver<usize>,
    pending: HashMap<usize, JoinHandle<()>>,
}

impl RetryTimers {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self { tx, rx, pending: HashMap::new() }
    }

    /// Fire `index` after `delay`, replacing any timer already pending for it
    pub fn schedule(&mut self, index: usize, delay: Duration) {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(index).await;
        });
        if let Some(previous) = self.pending.insert(index, task) {
            previous.abort();
        }
    }

    /// Next expired timer
    pub async fn recv(&mut self) -> Option<usize> {
        let index = self.rx.recv().await?;
        self.pending.remove(&index);
        Some(index)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn abort_all(&mut self) {
        for (_, task) in self.pending.drain() {
            task.abort();
        }
    }
}

impl Default for RetryTimers {
    fn default() -> Self {
        Self::new()
    }
}
