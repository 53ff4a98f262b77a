//! End-to-end scenarios and the registry the runner selects them from.
//!
//! Scenario names are stable: they show up in `--list`, in `--scenario`
//! filters, in the summary file and in the logs of every run.

pub mod backup;
pub mod deployment;
pub mod restore;
pub mod tls;

use futures::FutureExt;
use pds_harness::{ScenarioOutcome, Suite};
use tracing::warn;

pub const CASSANDRA: &str = "Cassandra";
pub const POSTGRESQL: &str = "PostgreSQL";

const CASSANDRA_VERSION: &str = "4.1.2";
const POSTGRESQL_VERSION: &str = "14.6";

/// What a scenario needs from the environment beyond a registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    None,
    /// S3 settings, for backup targets and snapshot checks.
    ObjectStore,
    /// The target cluster runs with dataservice TLS enabled.
    DataServiceTls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioDef {
    pub name: &'static str,
    pub description: &'static str,
    pub requires: Requirement,
}

pub const ALL: &[ScenarioDef] = &[
    ScenarioDef {
        name: deployment::LIFECYCLE,
        description: "deploy PostgreSQL, check both sides, delete it",
        requires: Requirement::None,
    },
    ScenarioDef {
        name: deployment::DISCONNECT,
        description: "scale the agent tunnel down and back up; the target and deployment recover",
        requires: Requirement::None,
    },
    ScenarioDef {
        name: backup::SCHEDULE,
        description: "scheduled Cassandra backups follow a policy switch from */1 to */2",
        requires: Requirement::ObjectStore,
    },
    ScenarioDef {
        name: backup::DUPLICATE_CREDENTIALS,
        description: "creating backup credentials twice under one name is a conflict",
        requires: Requirement::None,
    },
    ScenarioDef {
        name: backup::INVALID_CRON,
        description: "a backup policy with an invalid cron schedule is rejected",
        requires: Requirement::None,
    },
    ScenarioDef {
        name: backup::DELETE_FROM_TC,
        description: "deleting the backup CR removes the backup job on both sides",
        requires: Requirement::ObjectStore,
    },
    ScenarioDef {
        name: restore::RETRY_MISSING_PX_CREDENTIALS,
        description: "a restore failing on missing Portworx credentials succeeds on retry",
        requires: Requirement::ObjectStore,
    },
    ScenarioDef {
        name: tls::TLS_REQUIRED,
        description: "a target requiring TLS rejects plain deployments and accepts TLS ones",
        requires: Requirement::DataServiceTls,
    },
];

/// Resolves `--scenario` filters; no filter selects everything.
pub fn select(names: &[String]) -> anyhow::Result<Vec<ScenarioDef>> {
    if names.is_empty() {
        return Ok(ALL.to_vec());
    }
    names
        .iter()
        .map(|name| {
            ALL.iter()
                .find(|def| def.name == name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown scenario {:?}, see --list", name))
        })
        .collect()
}

/// Why a scenario cannot run in this environment, if it cannot.
pub fn skip_reason(suite: &Suite, def: &ScenarioDef) -> Option<&'static str> {
    match def.requires {
        Requirement::None => None,
        Requirement::ObjectStore if suite.env().s3.is_none() => Some("no S3 bucket configured"),
        Requirement::DataServiceTls if !suite.config().target.data_service_tls_enabled => {
            Some("dataservice TLS is not enabled on the target")
        }
        _ => None,
    }
}

fn version(suite: &Suite, data_service: &str, fallback: &str) -> String {
    let versions = suite.image_versions(data_service, fallback);
    if versions.len() > 1 {
        warn!(data_service, ?versions, "several versions configured, using the first");
    }
    versions
        .into_iter()
        .next()
        .unwrap_or_else(|| fallback.to_string())
}

/// Runs one scenario on the suite.
pub async fn run(suite: &Suite, def: &ScenarioDef) -> ScenarioOutcome {
    let name = def.name;
    match name {
        deployment::LIFECYCLE => {
            let version = version(suite, POSTGRESQL, POSTGRESQL_VERSION);
            suite
                .scenario(name, move |s| deployment::lifecycle(s, version).boxed())
                .await
        }
        deployment::DISCONNECT => {
            let version = version(suite, POSTGRESQL, POSTGRESQL_VERSION);
            suite
                .scenario(name, move |s| deployment::disconnect(s, version).boxed())
                .await
        }
        backup::SCHEDULE => {
            let version = version(suite, CASSANDRA, CASSANDRA_VERSION);
            suite
                .scenario(name, move |s| backup::backup_with_schedule(s, version).boxed())
                .await
        }
        backup::DUPLICATE_CREDENTIALS => {
            suite
                .scenario(name, |s| backup::duplicate_credentials(s).boxed())
                .await
        }
        backup::INVALID_CRON => {
            suite
                .scenario(name, |s| backup::invalid_cron(s).boxed())
                .await
        }
        backup::DELETE_FROM_TC => {
            let version = version(suite, POSTGRESQL, POSTGRESQL_VERSION);
            suite
                .scenario(name, move |s| backup::delete_backup_job_from_tc(s, version).boxed())
                .await
        }
        restore::RETRY_MISSING_PX_CREDENTIALS => {
            let version = version(suite, CASSANDRA, CASSANDRA_VERSION);
            suite
                .scenario(name, move |s| restore::retry_missing_px_credentials(s, version).boxed())
                .await
        }
        tls::TLS_REQUIRED => {
            let version = version(suite, POSTGRESQL, POSTGRESQL_VERSION);
            suite
                .scenario(name, move |s| tls::tls_required(s, version).boxed())
                .await
        }
        other => {
            suite
                .scenario(other, |_| {
                    async move {
                        Err::<(), _>(pds_harness::HarnessError::InternalError(
                            "scenario has no body".into(),
                        ))
                    }
                    .boxed()
                })
                .await
        }
    }
}
