use std::collections::HashMap;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::MetricsError;
use crate::metrics::{Attachment, CollectedMetric};
use crate::reading::MetricDefinition;
use crate::tags::{NameTransformer, TagSet};

/// Uniquely identifies a registered metric: full prefixed name plus the
/// canonical encoding of its merged tag set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MetricKey {
    name: Arc<str>,
    tags: String,
}

/// The collector's central metric listing.
///
/// Registration is rare and goes through the write lock; idempotent re-lookups
/// take the read lock. Recording never touches the registry at all -- handles
/// returned from registration carry their own accumulators.
///
/// Iteration order is registration order, which is the order the snapshot
/// loop walks metrics in.
pub(crate) struct Registry {
    inner: RwLock<Inner>,
}

struct Inner {
    metrics: IndexMap<MetricKey, Arc<dyn CollectedMetric>>,
    definitions: HashMap<Arc<str>, MetricDefinition>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            inner: RwLock::new(Inner {
                metrics: IndexMap::new(),
                definitions: HashMap::new(),
            }),
        }
    }

    /// Registers `metric` under `full_name` and its resolved tags, attaching
    /// it to the collector's lifecycle.
    ///
    /// Idempotent: an identical registration returns the already-registered
    /// handle. Divergent metadata, conflicting tags, or a different concrete
    /// type fail without modifying the registry.
    pub(crate) fn register<M>(
        &self,
        full_name: Arc<str>,
        unit: &str,
        description: &str,
        metric: M,
        default_tags: &TagSet,
        transform: &NameTransformer,
        lifecycle: &Arc<AtomicU8>,
    ) -> Result<M, MetricsError>
    where
        M: CollectedMetric + Clone,
    {
        let resolved = crate::tags::resolve_tags(metric.declared_tags(), default_tags, transform)?;
        let key = MetricKey { name: full_name.clone(), tags: resolved.canonical().to_string() };

        let definition = MetricDefinition {
            name: full_name.clone(),
            unit: unit.to_string(),
            description: description.to_string(),
            rate_kind: metric.rate_kind(),
        };

        // Fast path: an identical registration already exists.
        {
            let inner = self.inner.read();
            if let Some(existing) = inner.metrics.get(&key) {
                check_definition(inner.definitions.get(&full_name), &definition)?;
                return downcast_existing::<M>(existing, &full_name);
            }
        }

        let mut inner = self.inner.write();
        check_definition(inner.definitions.get(&full_name), &definition)?;

        // Re-check under the write lock; another thread may have won the race.
        if let Some(existing) = inner.metrics.get(&key) {
            return downcast_existing::<M>(existing, &full_name);
        }

        metric.attach(Attachment {
            name: full_name.clone(),
            tags: resolved,
            lifecycle: Arc::clone(lifecycle),
        })?;

        inner.definitions.entry(full_name).or_insert(definition);
        inner.metrics.insert(key, Arc::new(metric.clone()));
        Ok(metric)
    }

    /// Clones the metric list in registration order for one snapshot pass.
    pub(crate) fn metrics_snapshot(&self) -> Vec<Arc<dyn CollectedMetric>> {
        self.inner.read().metrics.values().cloned().collect()
    }

    /// Clones the metadata definitions, in first-registration order by name.
    pub(crate) fn definitions_snapshot(&self) -> Vec<MetricDefinition> {
        let inner = self.inner.read();
        let mut seen: Vec<MetricDefinition> = Vec::with_capacity(inner.definitions.len());
        for key in inner.metrics.keys() {
            if seen.iter().any(|d| d.name == key.name) {
                continue;
            }
            if let Some(definition) = inner.definitions.get(&key.name) {
                seen.push(definition.clone());
            }
        }
        seen
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().metrics.len()
    }
}

fn check_definition(
    existing: Option<&MetricDefinition>,
    candidate: &MetricDefinition,
) -> Result<(), MetricsError> {
    let Some(existing) = existing else { return Ok(()) };

    let conflict = if existing.unit != candidate.unit {
        "unit"
    } else if existing.description != candidate.description {
        "description"
    } else if existing.rate_kind != candidate.rate_kind {
        "rate kind"
    } else {
        return Ok(());
    };

    Err(MetricsError::InconsistentMetadata { name: candidate.name.to_string(), conflict })
}

fn downcast_existing<M>(
    existing: &Arc<dyn CollectedMetric>,
    full_name: &Arc<str>,
) -> Result<M, MetricsError>
where
    M: CollectedMetric + Clone,
{
    existing
        .as_any()
        .downcast_ref::<M>()
        .cloned()
        .ok_or_else(|| MetricsError::TypeMismatch { name: full_name.to_string() })
}
