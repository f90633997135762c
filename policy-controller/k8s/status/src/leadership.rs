use kubert::lease::Claim;
use std::sync::Arc;
use tokio::{sync::watch, time::Duration};

/// Determines whether this replica may write status.
#[derive(Clone, Debug)]
pub struct Leadership {
    claims: Option<watch::Receiver<Arc<Claim>>>,
    claimant: String,
    recheck: Duration,
}

impl Leadership {
    /// A replica that always writes, for single-replica deployments.
    pub fn always() -> Self {
        Self {
            claims: None,
            claimant: String::new(),
            recheck: Duration::ZERO,
        }
    }

    /// A replica that writes only while `claimant` holds the lease. Other replicas recheck after
    /// `recheck`, typically the lease duration.
    pub fn lease(
        claims: watch::Receiver<Arc<Claim>>,
        claimant: impl Into<String>,
        recheck: Duration,
    ) -> Self {
        Self {
            claims: Some(claims),
            claimant: claimant.into(),
            recheck,
        }
    }

    pub fn is_leader(&self) -> bool {
        match self.claims {
            Some(ref claims) => claims.borrow().is_current_for(&self.claimant),
            None => true,
        }
    }

    pub fn recheck(&self) -> Duration {
        self.recheck
    }
}
