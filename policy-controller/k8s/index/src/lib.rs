//! Dynamic principals indexes
//!
//! The controller keeps two in-memory indexes, both fed by cluster watches:
//!
//! - The [`SelectorIndex`] maps each label key/value pair to the `DynamicAuthorizationPolicy`
//!   resources with a rule selector that references it. It is rebuilt for a resource whenever the
//!   resource is applied and purged when it is deleted.
//! - The [`SubjectIndex`] caches every `Pod` as a [`Subject`](dynamic_principals_core::Subject).
//!   When a pod is created, deleted, or changes its labels or service account, the
//!   [`TriggerPropagator`] consults the selector index with the pod's old and new labels and each
//!   impacted policy is sent on the requeue channel.
//!
//! ```text
//! [ Pod ] -> [ SubjectIndex ] -> [ TriggerPropagator ] -> requeue(policy)
//!                                        ^
//! [ DynamicAuthorizationPolicy ] -> [ SelectorIndex ]
//! ```
//!
//! The selector index over-approximates: a policy is indexed under every pair any of its rules
//! mention, so a requeue may be redundant but is never missed.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod selector_index;
mod subject;
mod trigger;


pub use self::{
    metrics::IndexMetrics,
    selector_index::{SelectorIndex, SharedSelectorIndex},
    subject::{SharedSubjectIndex, SubjectIndex, SubjectLister},
    trigger::TriggerPropagator,
};
