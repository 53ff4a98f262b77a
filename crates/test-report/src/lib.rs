//! JSON and JUnit reports from `go test -json` event streams.

pub mod error;
pub mod event;
pub mod input;
pub mod report;

pub use error::{ReportError, Result};
pub use event::{parse_events, Action, TestEvent};
pub use input::{read_source, Source, Stream};
pub use report::{aggregate, Summary, TestStatus};

/// Reads every source and aggregates all events found.
pub async fn summarize(client: &reqwest::Client, sources: &[Source]) -> Result<Summary> {
    let mut events = Vec::new();
    for source in sources {
        for stream in read_source(client, source).await? {
            let parsed = parse_events(&stream.content);
            tracing::debug!(stream = %stream.name, events = parsed.len(), "parsed stream");
            events.extend(parsed);
        }
    }
    if events.is_empty() {
        let names = sources
            .iter()
            .map(|s| format!("{:?}", s))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(ReportError::NoEvents(names));
    }
    Ok(aggregate(events))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sources_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("backup.json");
        let second = dir.path().join("tls.json");
        std::fs::write(&first, "{\"Action\":\"pass\",\"Package\":\"suites/backup\",\"Test\":\"TestA\"}\n").unwrap();
        std::fs::write(&second, "{\"Action\":\"fail\",\"Package\":\"suites/tls\",\"Test\":\"TestB\"}\n").unwrap();

        let summary = summarize(
            &reqwest::Client::new(),
            &[Source::File(first), Source::File(second)],
        )
        .await
        .unwrap();
        assert_eq!(summary.packages.len(), 2);
        assert_eq!(summary.totals.failed, 1);
    }

    #[tokio::test]
    async fn output_without_events_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log");
        std::fs::write(&path, "go: downloading k8s.io/client-go v0.27.1\n").unwrap();

        let err = summarize(&reqwest::Client::new(), &[Source::File(path)])
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::NoEvents(_)));
    }
}
