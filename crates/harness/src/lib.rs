//! Cross-cluster integration harness for the PDS control plane.
//!
//! The harness drives the control plane REST API, the target Kubernetes
//! cluster, Helm and the Portworx API side by side, and checks that the
//! resources each of them reports line up.

pub mod cleanup;
pub mod config;
pub mod correlator;
pub mod cp;
pub mod error;
pub mod helm;
pub mod k8s;
pub mod orchestrator;
pub mod px;
pub mod s3;
pub mod suite;
pub mod tls;
pub mod wait;

pub use cleanup::{CleanupReport, CleanupStack, Deferral};
pub use config::HarnessConfig;
pub use error::{ErrorKind, HarnessError, Result};
pub use orchestrator::{expect_error, Environment, Scenario, TargetContext};
pub use suite::{random_name, ScenarioOutcome, Suite};
pub use tls::install_crypto_provider;
pub use wait::WaitPolicy;

#[cfg(test)]
mod tests;
