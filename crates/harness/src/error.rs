use thiserror::Error;

use crate::correlator::CorrelationError;
use crate::cp::{ApiError, AuthError};
use crate::helm::HelmError;
use crate::px::PxError;
use crate::wait::{Retry, WaitError};

/// Coarse classification used by waits, cleanup and negative tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 5xx, dropped connections, update conflicts. Retried by waits.
    TransientRemote,
    /// 404 from the control plane or `NotFound` from Kubernetes.
    NotFound,
    /// 409 from the control plane.
    Conflict,
    /// 422 from the control plane.
    Unprocessable,
    /// A wait ran out of time.
    Timeout,
    /// The scenario context was cancelled.
    Cancelled,
    /// Invalid configuration or a missing prerequisite. Stops the suite.
    Fatal,
    Other,
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("control plane error: {0}")]
    Api(#[from] ApiError),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("helm error: {0}")]
    Helm(#[from] HelmError),

    #[error("portworx error: {0}")]
    Px(#[from] PxError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("correlation failed: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} not found")]
    Missing(String),

    #[error("no pods found for job {0}")]
    NoPodsForJob(String),

    #[error("expected {expected:?}, got: {actual}")]
    UnexpectedOutcome {
        expected: ErrorKind,
        actual: String,
    },

    /// A remote operation reached a terminal failure state.
    #[error("{0}")]
    Failed(String),

    #[error("scenario panicked: {0}")]
    Panicked(String),

    #[error("{failed} cleanup step(s) failed: {details}")]
    CleanupFailed { failed: usize, details: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::KubeError(e) => kube_error_kind(e),
            HarnessError::Api(e) => e.kind(),
            HarnessError::Auth(e) => e.kind(),
            HarnessError::Helm(e) => e.kind(),
            HarnessError::Px(e) => e.kind(),
            HarnessError::Wait(WaitError::Timeout { .. }) => ErrorKind::Timeout,
            HarnessError::Wait(WaitError::Cancelled { .. }) => ErrorKind::Cancelled,
            HarnessError::Wait(WaitError::Aborted { kind, .. }) => *kind,
            HarnessError::Missing(_) | HarnessError::NoPodsForJob(_) => ErrorKind::NotFound,
            HarnessError::Config(_) | HarnessError::Kubeconfig(_) => ErrorKind::Fatal,
            HarnessError::Correlation(_)
            | HarnessError::ObjectStore(_)
            | HarnessError::UnexpectedOutcome { .. }
            | HarnessError::Failed(_)
            | HarnessError::Panicked(_)
            | HarnessError::CleanupFailed { .. }
            | HarnessError::Io(_)
            | HarnessError::InternalError(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Turns a `NotFound` outcome into `Ok(None)`.
    pub fn into_option<T>(result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Inside a wait only transient failures and pending correlations are
/// polled again.
impl Retry for HarnessError {
    fn permanent(&self) -> Option<ErrorKind> {
        match self {
            HarnessError::Failed(_) | HarnessError::Wait(_) => Some(self.kind()),
            _ => match self.kind() {
                ErrorKind::TransientRemote | ErrorKind::Other => None,
                kind => Some(kind),
            },
        }
    }
}

/// HTTP status carried by a Kubernetes API error, if any.
pub fn kube_status(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub fn kube_error_kind(e: &kube::Error) -> ErrorKind {
    match kube_status(e) {
        Some(404) => ErrorKind::NotFound,
        Some(409) => ErrorKind::Conflict,
        Some(422) => ErrorKind::Unprocessable,
        Some(code) if code >= 500 || code == 429 => ErrorKind::TransientRemote,
        Some(_) => ErrorKind::Other,
        None => ErrorKind::TransientRemote,
    }
}

pub fn is_kube_not_found(e: &kube::Error) -> bool {
    kube_status(e) == Some(404)
}

/// Maps a status code from any REST API onto the taxonomy.
pub fn status_kind(status: u16) -> ErrorKind {
    match status {
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        422 => ErrorKind::Unprocessable,
        401 | 403 => ErrorKind::Fatal,
        429 => ErrorKind::TransientRemote,
        s if s >= 500 => ErrorKind::TransientRemote,
        _ => ErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(status_kind(404), ErrorKind::NotFound);
        assert_eq!(status_kind(409), ErrorKind::Conflict);
        assert_eq!(status_kind(422), ErrorKind::Unprocessable);
        assert_eq!(status_kind(503), ErrorKind::TransientRemote);
        assert_eq!(status_kind(401), ErrorKind::Fatal);
        assert_eq!(status_kind(400), ErrorKind::Other);
    }

    #[test]
    fn into_option_swallows_only_not_found() {
        let missing: Result<()> = Err(HarnessError::Missing("tenant".into()));
        assert!(matches!(HarnessError::into_option(missing), Ok(None)));

        let fatal: Result<()> = Err(HarnessError::Config("no api url".into()));
        assert!(HarnessError::into_option(fatal).is_err());
    }

    #[test]
    fn only_transient_errors_are_retried() {
        assert_eq!(HarnessError::ObjectStore("slow down".into()).permanent(), None);
        assert_eq!(
            HarnessError::Missing("deployment d1".into()).permanent(),
            Some(ErrorKind::NotFound)
        );
        assert_eq!(
            HarnessError::Config("no api url".into()).permanent(),
            Some(ErrorKind::Fatal)
        );
        assert_eq!(
            HarnessError::Failed("restore r1 failed".into()).permanent(),
            Some(ErrorKind::Other)
        );
    }
}
