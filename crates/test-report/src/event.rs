//! Events of the `go test -json` stream.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Run,
    Pause,
    Cont,
    Pass,
    Bench,
    Fail,
    Output,
    Skip,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TestEvent {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    pub action: Action,
    #[serde(default)]
    pub package: String,
    /// Unset for package-level events.
    #[serde(default)]
    pub test: Option<String>,
    /// Seconds, on pass/fail/skip.
    #[serde(default)]
    pub elapsed: Option<f64>,
    #[serde(default)]
    pub output: Option<String>,
}

/// Decodes one event per line. Lines that are not events (build output,
/// blank lines, banners) are skipped.
pub fn parse_events(input: &str) -> Vec<TestEvent> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
