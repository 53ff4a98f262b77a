//! Machine-readable record of a run.

use std::path::Path;

use chrono::{DateTime, Utc};
use pds_harness::ScenarioOutcome;
use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Serialize, Debug, Clone)]
pub struct ScenarioSummary {
    pub name: String,
    pub status: ScenarioStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_failures: Vec<String>,
    pub elapsed_seconds: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scenarios: Vec<ScenarioSummary>,
}

impl RunSummary {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            scenarios: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: &ScenarioOutcome) {
        let status = if outcome.passed() {
            ScenarioStatus::Passed
        } else {
            ScenarioStatus::Failed
        };
        self.scenarios.push(ScenarioSummary {
            name: outcome.name.clone(),
            status,
            error: outcome.error.as_ref().map(ToString::to_string),
            cleanup_failures: outcome
                .cleanup
                .failed
                .iter()
                .map(|(deferral, e)| format!("{}: {}", deferral, e))
                .collect(),
            elapsed_seconds: outcome.elapsed.as_secs_f64(),
        });
    }

    pub fn record_skipped(&mut self, name: &str, reason: &str) {
        self.scenarios.push(ScenarioSummary {
            name: name.to_string(),
            status: ScenarioStatus::Skipped,
            error: Some(reason.to_string()),
            cleanup_failures: Vec::new(),
            elapsed_seconds: 0.0,
        });
    }

    /// Records a failure outside any scenario (deregistration, teardown).
    pub fn record_failure(&mut self, name: &str, error: &str) {
        self.scenarios.push(ScenarioSummary {
            name: name.to_string(),
            status: ScenarioStatus::Failed,
            error: Some(error.to_string()),
            cleanup_failures: Vec::new(),
            elapsed_seconds: 0.0,
        });
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn failed(&self) -> Vec<&ScenarioSummary> {
        self.scenarios
            .iter()
            .filter(|s| s.status == ScenarioStatus::Failed)
            .collect()
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
