use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use super::CollectedMetric;
use crate::collector::CollectorCore;
use crate::error::MetricsError;

/// A family of metrics sharing one name and varying over a tag value.
///
/// `add` registers a new member for an unseen key and hands back the existing
/// member otherwise, so callers can resolve members on the hot path without
/// touching the registry.
pub struct MetricGroup<K, M> {
    core: Arc<CollectorCore>,
    name: String,
    unit: String,
    description: String,
    factory: Box<dyn Fn(&K) -> M + Send + Sync>,
    members: Mutex<HashMap<K, M>>,
}

impl<K, M> MetricGroup<K, M>
where
    K: Eq + Hash + Clone,
    M: CollectedMetric + Clone,
{
    pub(crate) fn new(
        core: Arc<CollectorCore>,
        name: String,
        unit: String,
        description: String,
        factory: Box<dyn Fn(&K) -> M + Send + Sync>,
    ) -> MetricGroup<K, M> {
        MetricGroup { core, name, unit, description, factory, members: Mutex::new(HashMap::new()) }
    }

    /// Returns the member for `key`, constructing and registering it first if
    /// this is the key's first appearance.
    pub fn add(&self, key: K) -> Result<M, MetricsError> {
        let mut members = self.members.lock();
        if let Some(existing) = members.get(&key) {
            return Ok(existing.clone());
        }

        let prototype = (self.factory)(&key);
        let registered =
            self.core.register_metric(&self.name, &self.unit, &self.description, prototype)?;
        members.insert(key, registered.clone());
        Ok(registered)
    }

    /// Returns the member for `key` if one was already added.
    pub fn get(&self, key: &K) -> Option<M> {
        self.members.lock().get(key).cloned()
    }

    /// Number of members added so far.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// Returns `true` if no members have been added.
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}
