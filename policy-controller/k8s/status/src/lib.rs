//! Writes each `DynamicAuthorizationPolicy`'s computed principal mapping back to its status.
//!
//! The [`reconcile`] function is driven by a `kube::runtime::Controller`, which serializes
//! reconciles per resource and requeues failures through [`error_policy`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
mod leadership;
mod metrics;
mod reconcile;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    error::Error,
    leadership::Leadership,
    metrics::ControllerMetrics,
    reconcile::{error_policy, reconcile, Context},
    store::{KubeStore, PolicyStore, FIELD_MANAGER},
};
