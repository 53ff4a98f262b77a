//! Aggregation of test events into packages and test cases, and the JSON
//! and JUnit renderings of the result.

use std::collections::BTreeMap;
use std::time::Duration;

use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use serde::Serialize;

use crate::error::{ReportError, Result};
use crate::event::{Action, TestEvent};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    /// Started but never reported a result, e.g. the binary crashed or
    /// timed out.
    Unknown,
}

impl TestStatus {
    fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Pass => Some(TestStatus::Pass),
            Action::Fail => Some(TestStatus::Fail),
            Action::Skip => Some(TestStatus::Skip),
            _ => None,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TestCaseReport {
    pub name: String,
    pub status: TestStatus,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PackageReport {
    pub name: String,
    pub status: TestStatus,
    pub elapsed_seconds: f64,
    pub tests: Vec<TestCaseReport>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Totals {
    pub tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unknown: usize,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Summary {
    pub totals: Totals,
    pub packages: Vec<PackageReport>,
}

impl Summary {
    pub fn has_failures(&self) -> bool {
        self.totals.failed > 0
            || self.totals.unknown > 0
            || self.packages.iter().any(|p| p.status == TestStatus::Fail)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JUnit XML with one suite per package.
    pub fn to_junit(&self, name: &str) -> Result<String> {
        let mut report = Report::new(name.to_owned());
        for package in &self.packages {
            let mut suite = TestSuite::new(package.name.clone());
            suite.set_time(seconds(package.elapsed_seconds));
            for test in &package.tests {
                let status = match test.status {
                    TestStatus::Pass => TestCaseStatus::success(),
                    TestStatus::Skip => TestCaseStatus::skipped(),
                    TestStatus::Fail => {
                        let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
                        status.set_message("test failed");
                        status.set_description(test.output.clone());
                        status
                    }
                    TestStatus::Unknown => {
                        let mut status = TestCaseStatus::non_success(NonSuccessKind::Error);
                        status.set_message("test did not report a result");
                        status.set_description(test.output.clone());
                        status
                    }
                };
                let mut case = TestCase::new(test.name.clone(), status);
                case.set_classname(package.name.clone());
                case.set_time(seconds(test.elapsed_seconds));
                suite.add_test_case(case);
            }
            report.add_test_suite(suite);
        }
        report
            .to_string()
            .map_err(|e| ReportError::Junit(e.to_string()))
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

#[derive(Default)]
struct PackageState {
    status: Option<TestStatus>,
    elapsed: f64,
    output: String,
    order: Vec<String>,
    tests: BTreeMap<String, TestState>,
}

#[derive(Default)]
struct TestState {
    status: Option<TestStatus>,
    elapsed: f64,
    output: String,
}

/// Folds events into per-package results. Packages are sorted by name;
/// tests keep the order in which they first appeared.
pub fn aggregate(events: impl IntoIterator<Item = TestEvent>) -> Summary {
    let mut packages: BTreeMap<String, PackageState> = BTreeMap::new();

    for event in events {
        let package = packages.entry(event.package.clone()).or_default();
        let status = TestStatus::from_action(event.action);
        match &event.test {
            Some(test) => {
                if !package.tests.contains_key(test) {
                    package.order.push(test.clone());
                }
                let state = package.tests.entry(test.clone()).or_default();
                if let Some(output) = &event.output {
                    state.output.push_str(output);
                }
                if status.is_some() {
                    state.status = status;
                    state.elapsed = event.elapsed.unwrap_or_default();
                }
            }
            None => {
                if let Some(output) = &event.output {
                    package.output.push_str(output);
                }
                if status.is_some() {
                    package.status = status;
                    package.elapsed = event.elapsed.unwrap_or_default();
                }
            }
        }
    }

    let mut totals = Totals::default();
    let packages = packages
        .into_iter()
        .map(|(name, mut state)| {
            let tests: Vec<TestCaseReport> = state
                .order
                .iter()
                .filter_map(|test| {
                    let t = state.tests.remove(test)?;
                    Some(TestCaseReport {
                        name: test.clone(),
                        status: t.status.unwrap_or(TestStatus::Unknown),
                        elapsed_seconds: t.elapsed,
                        output: t.output,
                    })
                })
                .collect();

            for test in &tests {
                totals.tests += 1;
                match test.status {
                    TestStatus::Pass => totals.passed += 1,
                    TestStatus::Fail => totals.failed += 1,
                    TestStatus::Skip => totals.skipped += 1,
                    TestStatus::Unknown => totals.unknown += 1,
                }
            }

            let status = state.status.unwrap_or_else(|| {
                if tests.iter().any(|t| t.status == TestStatus::Fail) {
                    TestStatus::Fail
                } else {
                    TestStatus::Unknown
                }
            });
            PackageReport {
                name,
                status,
                elapsed_seconds: state.elapsed,
                tests,
                output: state.output,
            }
        })
        .collect();

    Summary { totals, packages }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::parse_events;

    const STREAM: &str = r#"
{"Action":"start","Package":"suites/backup"}
{"Action":"run","Package":"suites/backup","Test":"TestBackupSuite"}
{"Action":"run","Package":"suites/backup","Test":"TestBackupSuite/TestBackupPolicy_Create_Invalid_Cron"}
{"Action":"output","Package":"suites/backup","Test":"TestBackupSuite/TestBackupPolicy_Create_Invalid_Cron","Output":"=== RUN   TestBackupSuite/TestBackupPolicy_Create_Invalid_Cron\n"}
{"Action":"pass","Package":"suites/backup","Test":"TestBackupSuite/TestBackupPolicy_Create_Invalid_Cron","Elapsed":0.4}
{"Action":"run","Package":"suites/backup","Test":"TestBackupSuite/TestBackupCredentials_Duplicate"}
{"Action":"output","Package":"suites/backup","Test":"TestBackupSuite/TestBackupCredentials_Duplicate","Output":"expected 409, got 201\n"}
{"Action":"fail","Package":"suites/backup","Test":"TestBackupSuite/TestBackupCredentials_Duplicate","Elapsed":1.2}
{"Action":"run","Package":"suites/backup","Test":"TestBackupSuite/TestRestore_Retry"}
{"Action":"skip","Package":"suites/backup","Test":"TestBackupSuite/TestRestore_Retry","Elapsed":0}
{"Action":"fail","Package":"suites/backup","Test":"TestBackupSuite","Elapsed":1.7}
{"Action":"output","Package":"suites/backup","Output":"FAIL\n"}
{"Action":"fail","Package":"suites/backup","Elapsed":1.9}
{"Action":"run","Package":"suites/tls","Test":"TestTLSSuite"}
{"Action":"output","Package":"suites/tls","Test":"TestTLSSuite","Output":"panic: test timed out after 2h0m0s\n"}
"#;

    #[test]
    fn aggregates_statuses_per_package() {
        let summary = aggregate(parse_events(STREAM));

        assert_eq!(
            summary.totals,
            Totals {
                tests: 5,
                passed: 1,
                failed: 2,
                skipped: 1,
                unknown: 1,
            }
        );
        let names: Vec<_> = summary.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["suites/backup", "suites/tls"]);

        let backup = &summary.packages[0];
        assert_eq!(backup.status, TestStatus::Fail);
        assert_eq!(backup.elapsed_seconds, 1.9);
        assert_eq!(backup.output, "FAIL\n");
        assert_eq!(backup.tests[0].name, "TestBackupSuite");
        assert_eq!(backup.tests[2].output, "expected 409, got 201\n");

        let tls = &summary.packages[1];
        assert_eq!(tls.status, TestStatus::Unknown);
        assert_eq!(tls.tests[0].status, TestStatus::Unknown);
        assert!(summary.has_failures());
    }

    #[test]
    fn passing_stream_has_no_failures() {
        let summary = aggregate(parse_events(
            r#"{"Action":"pass","Package":"p","Test":"TestA","Elapsed":0.1}
{"Action":"pass","Package":"p","Elapsed":0.2}"#,
        ));
        assert!(!summary.has_failures());
        assert_eq!(summary.packages[0].status, TestStatus::Pass);
    }

    #[test]
    fn junit_marks_failures_and_skips() {
        let xml = aggregate(parse_events(STREAM)).to_junit("PDS integration tests").unwrap();

        assert!(xml.contains(r#"<testsuites name="PDS integration tests""#));
        assert!(xml.contains(r#"<testsuite name="suites/backup""#));
        assert!(xml.contains(r#"name="TestBackupSuite/TestBackupCredentials_Duplicate""#));
        assert!(xml.contains(r#"<failure message="test failed""#));
        assert!(xml.contains("expected 409, got 201"));
        assert!(xml.contains("<skipped"));
        assert!(xml.contains(r#"<error message="test did not report a result""#));
    }

    #[test]
    fn json_summary_uses_lowercase_statuses() {
        let json = aggregate(parse_events(STREAM)).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["totals"]["failed"], 2);
        assert_eq!(value["packages"][0]["tests"][1]["status"], "pass");
        assert_eq!(value["packages"][1]["status"], "unknown");
    }
}
