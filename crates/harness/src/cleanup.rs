//! LIFO stack of deferred deletions owned by a scenario.

use std::fmt;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::HarnessError;

/// A resource release registered while a scenario runs.
///
/// Deferrals are plain data so the stack can be logged and inspected; the
/// [`DeferralExecutor`] gives them meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferral {
    RemoveDeployment { id: String },
    DeleteBackupTarget { id: String },
    DeleteBackupCredentials { id: String },
    DeleteBackupPolicy { id: String },
    DeleteBackup { id: String, local_only: bool },
    DeletePdsBackup { namespace: String, name: String },
    DeleteNamespace { name: String },
    DeleteClusterIssuer { name: String },
    RestoreReplicas {
        namespace: String,
        deployment: String,
        replicas: i32,
    },
    ResetTargetTls {
        target_id: String,
        issuer: Option<String>,
        required: bool,
    },
}

impl fmt::Display for Deferral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferral::RemoveDeployment { id } => write!(f, "remove deployment {}", id),
            Deferral::DeleteBackupTarget { id } => write!(f, "delete backup target {}", id),
            Deferral::DeleteBackupCredentials { id } => {
                write!(f, "delete backup credentials {}", id)
            }
            Deferral::DeleteBackupPolicy { id } => write!(f, "delete backup policy {}", id),
            Deferral::DeleteBackup { id, local_only } => {
                if *local_only {
                    write!(f, "delete backup {} (local only)", id)
                } else {
                    write!(f, "delete backup {}", id)
                }
            }
            Deferral::DeletePdsBackup { namespace, name } => {
                write!(f, "delete backup CR {}/{}", namespace, name)
            }
            Deferral::DeleteNamespace { name } => write!(f, "delete namespace {}", name),
            Deferral::DeleteClusterIssuer { name } => write!(f, "delete cluster issuer {}", name),
            Deferral::RestoreReplicas {
                namespace,
                deployment,
                replicas,
            } => write!(
                f,
                "scale deployment {}/{} back to {}",
                namespace, deployment, replicas
            ),
            Deferral::ResetTargetTls {
                target_id,
                issuer,
                required,
            } => write!(
                f,
                "reset TLS policy of target {} (issuer={}, required={})",
                target_id,
                issuer.as_deref().unwrap_or("<none>"),
                required
            ),
        }
    }
}

#[async_trait]
pub trait DeferralExecutor: Send + Sync {
    async fn execute(&self, deferral: &Deferral) -> Result<(), HarnessError>;
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub completed: usize,
    pub already_gone: usize,
    pub failed: Vec<(Deferral, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self) -> Result<(), HarnessError> {
        if self.failed.is_empty() {
            return Ok(());
        }
        let details = self
            .failed
            .iter()
            .map(|(d, e)| format!("{}: {}", d, e))
            .collect::<Vec<_>>()
            .join("; ");
        Err(HarnessError::CleanupFailed {
            failed: self.failed.len(),
            details,
        })
    }
}

#[derive(Debug, Default)]
pub struct CleanupStack {
    entries: Vec<Deferral>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, deferral: Deferral) {
        info!(cleanup = %deferral, "registered cleanup");
        self.entries.push(deferral);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered deferrals, oldest first.
    pub fn entries(&self) -> &[Deferral] {
        &self.entries
    }

    /// Runs every deferral newest-first. `NotFound` counts as done; other
    /// failures are recorded and the drain carries on.
    pub async fn drain(&mut self, executor: &dyn DeferralExecutor) -> CleanupReport {
        let mut report = CleanupReport::default();

        while let Some(deferral) = self.entries.pop() {
            info!(cleanup = %deferral, "running cleanup");
            match executor.execute(&deferral).await {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_not_found() => {
                    info!(cleanup = %deferral, "already gone");
                    report.already_gone += 1;
                }
                Err(e) => {
                    warn!(cleanup = %deferral, error = %e, "cleanup step failed");
                    report.failed.push((deferral, e.to_string()));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        executed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeferralExecutor for Recorder {
        async fn execute(&self, deferral: &Deferral) -> Result<(), HarnessError> {
            self.executed.lock().unwrap().push(deferral.to_string());
            match deferral {
                Deferral::DeleteBackupPolicy { id } if id == "gone" => {
                    Err(HarnessError::Missing(format!("backup policy {}", id)))
                }
                Deferral::DeleteBackupTarget { id } if id == "stuck" => {
                    Err(HarnessError::InternalError("target still in use".into()))
                }
                _ => Ok(()),
            }
        }
    }

    fn deployment(id: &str) -> Deferral {
        Deferral::RemoveDeployment { id: id.into() }
    }

    #[tokio::test]
    async fn drains_in_reverse_order() {
        let mut stack = CleanupStack::new();
        stack.push(Deferral::DeleteBackupCredentials { id: "c1".into() });
        stack.push(Deferral::DeleteBackupTarget { id: "t1".into() });
        stack.push(deployment("d1"));

        let recorder = Recorder::default();
        let report = stack.drain(&recorder).await;

        assert!(report.is_clean());
        assert_eq!(report.completed, 3);
        assert!(stack.is_empty());
        assert_eq!(
            *recorder.executed.lock().unwrap(),
            vec![
                "remove deployment d1",
                "delete backup target t1",
                "delete backup credentials c1"
            ]
        );
    }

    #[tokio::test]
    async fn not_found_counts_as_done_and_failures_do_not_stop_drain() {
        let mut stack = CleanupStack::new();
        stack.push(deployment("first"));
        stack.push(Deferral::DeleteBackupTarget { id: "stuck".into() });
        stack.push(Deferral::DeleteBackupPolicy { id: "gone".into() });

        let recorder = Recorder::default();
        let report = stack.drain(&recorder).await;

        assert_eq!(report.completed, 1);
        assert_eq!(report.already_gone, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(recorder.executed.lock().unwrap().len(), 3);

        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("delete backup target stuck"));
    }

    #[tokio::test]
    async fn draining_twice_is_a_no_op() {
        let mut stack = CleanupStack::new();
        stack.push(deployment("d1"));
        let recorder = Recorder::default();

        stack.drain(&recorder).await;
        let second = stack.drain(&recorder).await;

        assert_eq!(second.completed, 0);
        assert_eq!(recorder.executed.lock().unwrap().len(), 1);
    }

    #[tracing_test::traced_test]
    #[test]
    fn push_logs_deferral() {
        let mut stack = CleanupStack::new();
        stack.push(Deferral::DeleteBackup {
            id: "b1".into(),
            local_only: true,
        });
        assert!(logs_contain("delete backup b1 (local only)"));
        assert_eq!(stack.len(), 1);
    }
}
