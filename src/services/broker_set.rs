//! Priority-ordered broker collection

use crate::services::broker::Broker;

/// Brokers sorted by ascending priority (1 first).
///
/// The order is fixed at construction; brokers with equal priority keep the
/// order they were configured in. Indices handed out by this set are stable
/// for its lifetime.
pub struct BrokerSet {
    brokers: Vec<Broker>,
}

impl BrokerSet {
    pub fn new(mut brokers: Vec<Broker>) -> Self {
        // Stable sort: ties stay in configuration order
        brokers.sort_by_key(|b| b.priority());
        Self { brokers }
    }

    /// First connected broker in priority order, optionally restricted to
    /// brokers with the given name
    pub fn select_connected(&self, name: Option<&str>) -> Option<usize> {
        self.brokers
            .iter()
            .position(|b| name.map_or(true, |n| b.name() == n) && b.is_connected())
    }

    pub fn connected_count(&self) -> usize {
        self.brokers.iter().filter(|b| b.is_connected()).count()
    }

    pub fn get(&self, index: usize) -> Option<&Broker> {
        self.brokers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Broker> {
        self.brokers.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Broker> {
        self.brokers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Broker> {
        self.brokers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
