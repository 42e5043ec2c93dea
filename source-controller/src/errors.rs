/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    /// The reconciliation key cannot be split into `namespace/name`.
    #[error("invalid resource key: {0}")]
    InvalidKey(String),
    /// The Application is misconfigured, e.g. it does not name a Deployment.
    /// Retrying will not help until the Application is edited.
    #[error("{0}")]
    InvalidSpec(String),
    /// The Deployment exists but is not controlled by the Application.
    #[error("{0}")]
    NotControlled(String),
    /// The informer caches did not complete their initial list in time.
    #[error("timed out after {0:?} waiting for caches to sync")]
    CacheSyncTimeout(std::time::Duration),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::InvalidKey(_)
            | ControllerError::InvalidSpec(_)
            | ControllerError::NotControlled(_) => false,
            _ => true,
        }
    }
}
