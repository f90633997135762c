use thiserror::Error;

/// Failures that abort a reconcile without writing status.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list subjects: {0:#}")]
    List(anyhow::Error),

    #[error("status update conflicted with a concurrent change")]
    Conflict,

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("failed to encode status: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// A short, stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Conflict => "conflict",
            Self::Kube(_) => "kube",
            Self::Serialize(_) => "serialize",
        }
    }
}
