use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use dynamic_principals_core::{PolicyRule, ResourceId};
use dynamic_principals_k8s_api::{policy::DynamicAuthorizationPolicy, ResourceExt};
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info_span, warn};

pub type SharedSelectorIndex = Arc<RwLock<SelectorIndex>>;

/// Indexes policy resources by the label pairs their rule selectors reference.
///
/// Selectors are conjunctive, but a resource is indexed under *every* pair any of its rules
/// mention. A lookup may therefore return resources that do not match a given workload once
/// all of a selector's pairs are considered; it never omits one that might.
///
/// The policy watch is the only writer. When requeues are configured, a resource is requeued
/// each time its indexed pairs change, so a pod change observed before the resource was indexed
/// is still reflected in its status.
#[derive(Debug, Default)]
pub struct SelectorIndex {
    /// Label key -> label value -> resources with a rule selecting that pair.
    by_label: HashMap<String, HashMap<String, HashSet<ResourceId>>>,

    /// The pairs each resource contributed when it was last indexed.
    by_resource: HashMap<ResourceId, HashSet<(String, String)>>,

    requeue: Option<UnboundedSender<ResourceId>>,
}

// === impl SelectorIndex ===

impl SelectorIndex {
    pub fn shared() -> SharedSelectorIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Builds an index that requeues resources whose indexed pairs change.
    pub fn shared_with_requeues(requeue: UnboundedSender<ResourceId>) -> SharedSelectorIndex {
        Arc::new(RwLock::new(Self {
            requeue: Some(requeue),
            ..Self::default()
        }))
    }

    /// Replaces all entries contributed by `id` with those referenced by `rules`.
    pub fn index(&mut self, id: ResourceId, rules: &[PolicyRule]) {
        let pairs = rules
            .iter()
            .flat_map(|rule| rule.selector.iter())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashSet<_>>();

        if self.by_resource.get(&id) == Some(&pairs) {
            return;
        }

        self.remove(&id);
        if pairs.is_empty() {
            return;
        }

        for (k, v) in pairs.iter() {
            self.by_label
                .entry(k.clone())
                .or_default()
                .entry(v.clone())
                .or_default()
                .insert(id.clone());
        }
        debug!(%id, pairs = pairs.len(), "Indexed selectors");
        self.by_resource.insert(id.clone(), pairs);

        if let Some(requeue) = self.requeue.as_ref() {
            if requeue.send(id).is_err() {
                warn!("Requeue channel closed");
            }
        }
    }

    /// Removes all entries contributed by `id`. Returns `false` if nothing was indexed for it.
    pub fn remove(&mut self, id: &ResourceId) -> bool {
        let pairs = match self.by_resource.remove(id) {
            Some(pairs) => pairs,
            None => return false,
        };

        for (k, v) in pairs.into_iter() {
            if let Entry::Occupied(mut values) = self.by_label.entry(k) {
                if let Entry::Occupied(mut ids) = values.get_mut().entry(v) {
                    ids.get_mut().remove(id);
                    if ids.get().is_empty() {
                        ids.remove();
                    }
                }
                if values.get().is_empty() {
                    values.remove();
                }
            }
        }
        debug!(%id, "Removed selectors");
        true
    }

    /// Returns the resources with a rule selector that contains `key=value`.
    pub fn lookup(&self, key: &str, value: &str) -> HashSet<ResourceId> {
        self.by_label
            .get(key)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    /// The number of distinct label pairs in the index.
    pub fn len_pairs(&self) -> usize {
        self.by_label.values().map(|values| values.len()).sum()
    }

    /// The number of resources with at least one indexed pair.
    pub fn len_resources(&self) -> usize {
        self.by_resource.len()
    }

    pub fn len_resources_in(&self, namespace: &str) -> usize {
        self.by_resource
            .keys()
            .filter(|id| id.namespace == namespace)
            .count()
    }
}

impl kubert::index::IndexNamespacedResource<DynamicAuthorizationPolicy> for SelectorIndex {
    fn apply(&mut self, policy: DynamicAuthorizationPolicy) {
        let namespace = policy
            .namespace()
            .expect("DynamicAuthorizationPolicy must have a namespace");
        let name = policy.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let rules = policy
            .spec
            .dynamic_policies
            .into_iter()
            .map(PolicyRule::from)
            .collect::<Vec<_>>();
        self.index(ResourceId::new(namespace, name), &rules);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let _span = info_span!("delete", ns = %namespace, %name).entered();
        self.remove(&ResourceId::new(namespace, name));
    }

    // Each policy is indexed independently, so the default reset (apply all, then delete the
    // removed) is sufficient.
}
