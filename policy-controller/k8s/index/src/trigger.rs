use crate::SharedSelectorIndex;
use ahash::AHashSet as HashSet;
use dynamic_principals_core::{ResourceId, Subject};
use dynamic_principals_k8s_api::Labels;

/// Determines which policy resources may need to be recomputed when a subject changes.
#[derive(Clone, Debug)]
pub struct TriggerPropagator {
    selectors: SharedSelectorIndex,
}

impl TriggerPropagator {
    pub fn new(selectors: SharedSelectorIndex) -> Self {
        Self { selectors }
    }

    /// Returns every resource with a rule that references one of the subject's current labels.
    pub fn on_subject_change(&self, subject: &Subject) -> HashSet<ResourceId> {
        self.impacted(Some(&subject.labels))
    }

    /// Returns the resources impacted by a subject moving from `previous` to `current` labels.
    ///
    /// Resources that selected the subject's old labels are included so they can drop it.
    pub fn on_subject_transition(
        &self,
        previous: Option<&Labels>,
        current: Option<&Labels>,
    ) -> HashSet<ResourceId> {
        self.impacted(previous.into_iter().chain(current))
    }

    fn impacted<'l>(&self, labels: impl IntoIterator<Item = &'l Labels>) -> HashSet<ResourceId> {
        let selectors = self.selectors.read();
        let mut impacted = HashSet::new();
        for labels in labels {
            for (k, v) in labels.iter() {
                impacted.extend(selectors.lookup(k, v));
            }
        }
        impacted
    }
}
