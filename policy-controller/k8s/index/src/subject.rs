use crate::{SharedSelectorIndex, TriggerPropagator};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Result};
use dynamic_principals_core::{ListSubjects, ResourceId, Subject};
use dynamic_principals_k8s_api::{Labels, Pod, ResourceExt, Selector};
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info_span, trace, warn};

/// The service account Kubernetes assigns to pods that do not name one.
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

pub type SharedSubjectIndex = Arc<RwLock<SubjectIndex>>;

/// Caches the cluster's pods as subjects and requeues the policy resources that may select a
/// pod whenever its labels or service account change.
#[derive(Debug)]
pub struct SubjectIndex {
    by_ns: HashMap<String, HashMap<String, Subject>>,
    triggers: TriggerPropagator,
    requeue: UnboundedSender<ResourceId>,

    /// Set once the initial pod listing has been indexed.
    synced: bool,
}

/// Lists subjects from a shared [`SubjectIndex`].
///
/// Listing fails until the index has observed the initial pod listing, so that a policy is never
/// computed against a partially-populated cache.
#[derive(Clone, Debug)]
pub struct SubjectLister(SharedSubjectIndex);

// === impl SubjectIndex ===

impl SubjectIndex {
    pub fn new(selectors: SharedSelectorIndex, requeue: UnboundedSender<ResourceId>) -> Self {
        Self {
            by_ns: HashMap::default(),
            triggers: TriggerPropagator::new(selectors),
            requeue,
            synced: false,
        }
    }

    pub fn shared(
        selectors: SharedSelectorIndex,
        requeue: UnboundedSender<ResourceId>,
    ) -> SharedSubjectIndex {
        Arc::new(RwLock::new(Self::new(selectors, requeue)))
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Returns all subjects whose labels satisfy `selector`, ordered by namespace and name.
    pub fn list(&self, selector: &Selector) -> Vec<Subject> {
        let mut subjects = self
            .by_ns
            .values()
            .flat_map(|pods| pods.values())
            .filter(|subject| selector.matches(&subject.labels))
            .cloned()
            .collect::<Vec<_>>();
        subjects.sort_by(|a, b| a.id.cmp(&b.id));
        subjects
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&Subject> {
        self.by_ns.get(namespace)?.get(name)
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.by_ns.get(namespace).map(|pods| pods.len()).unwrap_or(0)
    }

    fn upsert(&mut self, subject: Subject) {
        let pods = self.by_ns.entry(subject.id.namespace.clone()).or_default();
        let previous = match pods.entry(subject.id.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(subject.clone());
                None
            }
            Entry::Occupied(mut entry) => {
                let prior = entry.get();
                if prior.labels == subject.labels && prior.service_account == subject.service_account
                {
                    trace!("Pod unchanged");
                    return;
                }
                Some(entry.insert(subject.clone()).labels)
            }
        };

        let impacted = self
            .triggers
            .on_subject_transition(previous.as_ref(), Some(&subject.labels));
        self.requeue_all(impacted);
    }

    fn remove(&mut self, namespace: &str, name: &str) {
        let removed = match self.by_ns.entry(namespace.to_string()) {
            Entry::Occupied(mut pods) => {
                let removed = pods.get_mut().remove(name);
                if pods.get().is_empty() {
                    pods.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        };

        match removed {
            Some(subject) => {
                let impacted = self.triggers.on_subject_transition(Some(&subject.labels), None);
                self.requeue_all(impacted);
            }
            None => debug!("Pod already removed"),
        }
    }

    fn requeue_all(&self, ids: impl IntoIterator<Item = ResourceId>) {
        for id in ids {
            debug!(%id, "Requeueing policy");
            if self.requeue.send(id).is_err() {
                warn!("Requeue channel closed");
                return;
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for SubjectIndex {
    fn apply(&mut self, pod: Pod) {
        let namespace = pod.namespace().expect("Pod must have a namespace");
        let name = pod.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let service_account = pod
            .spec
            .and_then(|spec| spec.service_account_name)
            .filter(|sa| !sa.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string());
        self.upsert(Subject {
            id: ResourceId::new(namespace, name),
            labels: Labels::from(pod.metadata.labels),
            service_account,
        });
    }

    fn delete(&mut self, namespace: String, name: String) {
        let _span = info_span!("delete", ns = %namespace, %name).entered();
        self.remove(&namespace, &name);
    }

    fn reset(&mut self, pods: Vec<Pod>, removed: NamespacedRemoved) {
        for pod in pods.into_iter() {
            self.apply(pod);
        }
        for (namespace, names) in removed.into_iter() {
            for name in names.into_iter() {
                self.delete(namespace.clone(), name);
            }
        }

        if !self.synced {
            debug!("Pod index synced");
            self.synced = true;
        }
    }
}

// === impl SubjectLister ===

impl SubjectLister {
    pub fn new(index: SharedSubjectIndex) -> Self {
        Self(index)
    }
}

impl ListSubjects for SubjectLister {
    fn list_subjects(&self, selector: &Selector) -> Result<Vec<Subject>> {
        let index = self.0.read();
        if !index.is_synced() {
            bail!("pod index has not synced");
        }
        Ok(index.list(selector))
    }
}
