use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("invalid zip archive {name}: {source}")]
    Zip {
        name: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("no test events found in {0}")]
    NoEvents(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JUnit serialization failed: {0}")]
    Junit(String),
}

impl ReportError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ReportError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = ReportError> = std::result::Result<T, E>;
