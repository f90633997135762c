use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    pub(crate) reconcile: Counter,
    pub(crate) reconcile_errors: Family<ErrorLabels, Counter>,
    pub(crate) status_updates: Counter,
    pub(crate) status_unchanged: Counter,
    pub(crate) not_leader: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct ErrorLabels {
    reason: &'static str,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconcile = Counter::default();
        prom.register(
            "reconcile",
            "Count of policy reconciles started",
            reconcile.clone(),
        );

        let reconcile_errors = Family::default();
        prom.register(
            "reconcile_errors",
            "Count of policy reconciles that failed, by reason",
            reconcile_errors.clone(),
        );

        let status_updates = Counter::default();
        prom.register(
            "status_updates",
            "Count of policy statuses written",
            status_updates.clone(),
        );

        let status_unchanged = Counter::default();
        prom.register(
            "status_unchanged",
            "Count of reconciles that computed the status already present",
            status_unchanged.clone(),
        );

        let not_leader = Counter::default();
        prom.register(
            "not_leader",
            "Count of reconciles skipped because this replica does not hold the write lease",
            not_leader.clone(),
        );

        Self {
            reconcile,
            reconcile_errors,
            status_updates,
            status_unchanged,
            not_leader,
        }
    }

    pub(crate) fn error(&self, reason: &'static str) {
        self.reconcile_errors
            .get_or_create(&ErrorLabels { reason })
            .inc();
    }
}
