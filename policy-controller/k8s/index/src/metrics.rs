use crate::{SelectorIndex, SharedSelectorIndex, SubjectIndex};
use dynamic_principals_k8s_api::{policy::DynamicAuthorizationPolicy, Pod, ResourceExt};
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, gauge::Gauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps an index to count the watch events it processes and track its per-namespace size.
pub struct IndexMetrics<T> {
    inner: T,

    index_size: Family<NamespacedIndexLabels, Gauge>,
    index_applies: Family<NamespacedIndexLabels, Counter>,
    index_deletes: Family<NamespacedIndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespacedIndexLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

pub trait SizedIndex<R> {
    fn size(&self, namespace: &str) -> usize;
}

#[derive(Debug)]
struct SelectorIndexCollector(SharedSelectorIndex);

/// Registers gauges describing the selector index's contents.
pub fn register_selector_index(reg: &mut Registry, index: SharedSelectorIndex) {
    reg.register_collector(Box::new(SelectorIndexCollector(index)));
}

// === impl IndexMetrics ===

impl<T, R> SizedIndex<R> for Arc<RwLock<T>>
where
    T: SizedIndex<R>,
{
    fn size(&self, namespace: &str) -> usize {
        self.read().size(namespace)
    }
}

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn observe_size<R>(&self, namespace: String)
    where
        T: SizedIndex<R>,
        R: ResourceExt<DynamicType = ()>,
    {
        let size = self.inner.size(&namespace);
        self.index_size
            .get_or_create(&NamespacedIndexLabels {
                namespace,
                kind: R::kind(&()).to_string(),
            })
            .set(size as i64);
    }
}

impl<R, T> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let namespace = resource.namespace().unwrap_or_default();
        self.index_applies
            .get_or_create(&NamespacedIndexLabels {
                namespace: namespace.clone(),
                kind: R::kind(&()).to_string(),
            })
            .inc();
        self.inner.write().apply(resource);
        self.observe_size::<R>(namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.index_deletes
            .get_or_create(&NamespacedIndexLabels {
                namespace: namespace.clone(),
                kind: R::kind(&()).to_string(),
            })
            .inc();
        self.inner.write().delete(namespace.clone(), name);
        self.observe_size::<R>(namespace);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let namespaces = resources
            .iter()
            .flat_map(|r| r.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        self.index_resets
            .get_or_create(&IndexLabels {
                kind: R::kind(&()).to_string(),
            })
            .inc();
        self.inner.write().reset(resources, removed);
        for ns in namespaces {
            self.observe_size::<R>(ns);
        }
    }
}

impl SizedIndex<Pod> for SubjectIndex {
    fn size(&self, namespace: &str) -> usize {
        self.len(namespace)
    }
}

impl SizedIndex<DynamicAuthorizationPolicy> for SelectorIndex {
    fn size(&self, namespace: &str) -> usize {
        self.len_resources_in(namespace)
    }
}

// === impl SelectorIndexCollector ===

impl Collector for SelectorIndexCollector {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let (pairs, resources) = {
            let index = self.0.read();
            (index.len_pairs(), index.len_resources())
        };

        let pairs_encoder = encoder.encode_descriptor(
            "selector_index_label_pairs",
            "The number of distinct label pairs referenced by policy selectors",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(pairs as i64).encode(pairs_encoder)?;

        let resources_encoder = encoder.encode_descriptor(
            "selector_index_resources",
            "The number of policies with at least one indexed label pair",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(resources as i64).encode(resources_encoder)?;

        Ok(())
    }
}
