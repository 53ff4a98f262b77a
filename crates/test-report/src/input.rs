//! Where event streams come from: files, directories, URLs and zip
//! archives of any of those.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ReportError, Result};

const STREAM_EXTENSIONS: &[&str] = &["json", "jsonl", "log"];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Dir(PathBuf),
    Url(String),
}

impl Source {
    pub fn parse(input: &str) -> Self {
        if input.starts_with("http://") || input.starts_with("https://") {
            Source::Url(input.to_string())
        } else if Path::new(input).is_dir() {
            Source::Dir(PathBuf::from(input))
        } else {
            Source::File(PathBuf::from(input))
        }
    }
}

/// One event stream and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub name: String,
    pub content: String,
}

fn has_extension(name: &str, extensions: &[&str]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

fn is_zip(name: &str, bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC) || has_extension(name, &["zip"])
}

/// Streams inside a zip archive, in archive order.
pub fn unzip(name: &str, bytes: &[u8]) -> Result<Vec<Stream>> {
    let zip_err = |source| ReportError::Zip {
        name: name.to_string(),
        source,
    };
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(zip_err)?;
    let mut streams = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        if entry.is_dir() || !has_extension(entry.name(), STREAM_EXTENSIONS) {
            continue;
        }
        let entry_name = format!("{}!{}", name, entry.name());
        let mut raw = Vec::new();
        entry
            .read_to_end(&mut raw)
            .map_err(|e| ReportError::io(entry_name.clone(), e))?;
        debug!(stream = %entry_name, bytes = raw.len(), "read archive entry");
        streams.push(Stream {
            name: entry_name,
            content: String::from_utf8_lossy(&raw).into_owned(),
        });
    }
    Ok(streams)
}

fn from_bytes(name: String, bytes: Vec<u8>) -> Result<Vec<Stream>> {
    if is_zip(&name, &bytes) {
        return unzip(&name, &bytes);
    }
    Ok(vec![Stream {
        content: String::from_utf8_lossy(&bytes).into_owned(),
        name,
    }])
}

fn read_file(path: &Path) -> Result<Vec<Stream>> {
    let name = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|e| ReportError::io(name.clone(), e))?;
    from_bytes(name, bytes)
}

/// Stream files below `dir`, sorted by path.
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| ReportError::io(dir.display().to_string(), e))?;
    for entry in entries {
        let path = entry
            .map_err(|e| ReportError::io(dir.display().to_string(), e))?
            .path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| has_extension(n, STREAM_EXTENSIONS) || has_extension(n, &["zip"]))
        {
            files.push(path);
        }
    }
    Ok(())
}

fn read_dir(dir: &Path) -> Result<Vec<Stream>> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();
    let mut streams = Vec::new();
    for file in files {
        streams.extend(read_file(&file)?);
    }
    Ok(streams)
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Vec<Stream>> {
    let http_err = |source| ReportError::Http {
        url: url.to_string(),
        source,
    };
    let response = client.get(url).send().await.map_err(http_err)?;
    let status = response.status();
    if !status.is_success() {
        return Err(ReportError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let bytes = response.bytes().await.map_err(http_err)?;
    info!(url, bytes = bytes.len(), "downloaded test output");
    from_bytes(url.to_string(), bytes.to_vec())
}

pub async fn read_source(client: &reqwest::Client, source: &Source) -> Result<Vec<Stream>> {
    match source {
        Source::File(path) => read_file(path),
        Source::Dir(dir) => read_dir(dir),
        Source::Url(url) => fetch(client, url).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::routing::get;
    use axum::Router;
    use std::io::Write;

    const PASS: &str = "{\"Action\":\"pass\",\"Package\":\"p\",\"Test\":\"TestA\",\"Elapsed\":0.1}\n";

    fn zipped(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn classifies_inputs() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            Source::parse("https://ci.example.com/artifacts/report.zip"),
            Source::Url("https://ci.example.com/artifacts/report.zip".into())
        );
        assert_eq!(
            Source::parse(dir.path().to_str().unwrap()),
            Source::Dir(dir.path().to_path_buf())
        );
        assert_eq!(Source::parse("out.json"), Source::File("out.json".into()));
    }

    #[tokio::test]
    async fn directories_are_walked_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.json"), PASS).unwrap();
        std::fs::write(dir.path().join("nested/a.log"), PASS).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(
            dir.path().join("nested/more.zip"),
            zipped(&[("c.jsonl", PASS), ("readme.md", "ignored")]),
        )
        .unwrap();

        let streams = read_source(&reqwest::Client::new(), &Source::Dir(dir.path().to_path_buf()))
            .await
            .unwrap();
        let names: Vec<_> = streams
            .iter()
            .map(|s| s.name.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b.json", "a.log", "more.zip!c.jsonl"]);
        assert!(streams.iter().all(|s| s.content == PASS));
    }

    #[tokio::test]
    async fn urls_may_serve_archives() {
        let archive = zipped(&[("results/backup.json", PASS)]);
        let router = Router::new()
            .route(
                "/artifacts.zip",
                get(move || {
                    let archive = archive.clone();
                    async move { ([(header::CONTENT_TYPE, "application/zip")], archive) }
                }),
            )
            .route("/plain", get(|| async { PASS }));
        let base = serve(router).await;
        let client = reqwest::Client::new();

        let streams = read_source(&client, &Source::Url(format!("{}/artifacts.zip", base)))
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
        assert!(streams[0].name.ends_with("!results/backup.json"));

        let streams = read_source(&client, &Source::Url(format!("{}/plain", base)))
            .await
            .unwrap();
        assert_eq!(streams[0].content, PASS);

        let err = read_source(&client, &Source::Url(format!("{}/missing", base)))
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn corrupt_archive_is_reported() {
        let err = unzip("broken.zip", b"PK\x03\x04 not really").unwrap_err();
        assert!(err.to_string().contains("broken.zip"));
    }
}
