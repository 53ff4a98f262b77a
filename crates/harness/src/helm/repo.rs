//! Helm repository files, cached index files and chart version selection.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use super::HelmError;

/// One entry of the helm `repositories.yaml` file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepositoryEntry {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RepositoryFile {
    #[serde(default, rename = "apiVersion")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map(PathBuf::from).unwrap_or_default()
}

/// `$HELM_REPOSITORY_CONFIG`, else `$XDG_CONFIG_HOME/helm/repositories.yaml`,
/// else `~/.config/helm/repositories.yaml`.
pub fn default_repository_config() -> PathBuf {
    if let Some(path) = env::var_os("HELM_REPOSITORY_CONFIG") {
        return PathBuf::from(path);
    }
    let base = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".config"));
    base.join("helm").join("repositories.yaml")
}

/// `$HELM_REPOSITORY_CACHE`, else `$XDG_CACHE_HOME/helm/repository`,
/// else `~/.cache/helm/repository`.
pub fn default_repository_cache() -> PathBuf {
    if let Some(path) = env::var_os("HELM_REPOSITORY_CACHE") {
        return PathBuf::from(path);
    }
    let base = env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".cache"));
    base.join("helm").join("repository")
}

/// Name helm itself gives the cached index of repository `name`.
pub fn index_file_name(name: &str) -> String {
    format!("{}-index.yaml", name)
}

impl RepositoryFile {
    pub fn parse(raw: &str) -> Result<Self, HelmError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub async fn load(path: &Path) -> Result<Self, HelmError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            HelmError::RepoConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    pub fn find(&self, name: &str) -> Result<&RepositoryEntry, HelmError> {
        self.repositories
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| HelmError::RepoNotFound(name.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChartVersion {
    pub name: String,
    pub version: String,
    #[serde(default, rename = "appVersion", skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<serde_json::Value>,
}

/// A repository `index.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IndexFile {
    #[serde(default, rename = "apiVersion")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
}

impl IndexFile {
    pub fn parse(raw: &str) -> Result<Self, HelmError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub async fn load(path: &Path) -> Result<Self, HelmError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::parse(&raw)
    }

    /// All published versions of `chart`, in index order.
    pub fn chart_versions(&self, chart: &str) -> Option<Vec<&str>> {
        self.entries
            .get(chart)
            .map(|versions| versions.iter().map(|v| v.version.as_str()).collect())
    }
}

fn is_operator(token: &str) -> bool {
    matches!(token, "=" | "==" | "!=" | ">" | ">=" | "<" | "<=" | "~" | "^" | "~>")
}

fn normalize_comparator(token: &str) -> String {
    let split = token
        .find(|c: char| !matches!(c, '=' | '>' | '<' | '~' | '^' | '!'))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(split);
    let version = version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version);
    let op = match op {
        "==" => "=",
        "~>" => "~",
        op => op,
    };
    let parts: Vec<&str> = version
        .split('.')
        .map(|part| match part {
            "x" | "X" => "*",
            part => part,
        })
        .collect();
    let wildcard = parts.contains(&"*");
    let version = parts.join(".");
    if op.is_empty() && !wildcard {
        // A bare version is an exact match, not a caret range.
        format!("={}", version)
    } else {
        format!("{}{}", op, version)
    }
}

fn normalize_alternative(alternative: &str) -> String {
    let alternative = alternative.trim();
    if alternative.is_empty() {
        return "*".to_string();
    }

    // Hyphen ranges: "1.2 - 1.4.5".
    if let Some((low, high)) = alternative.split_once(" - ") {
        return format!(
            ">={}, <={}",
            normalize_comparator(low.trim()).trim_start_matches('='),
            normalize_comparator(high.trim()).trim_start_matches('=')
        );
    }

    let mut comparators = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in alternative
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        if is_operator(token) {
            pending_op = Some(token);
            continue;
        }
        let joined = match pending_op.take() {
            Some(op) => format!("{}{}", op, token),
            None => token.to_string(),
        };
        comparators.push(normalize_comparator(&joined));
    }
    if comparators.is_empty() {
        return "*".to_string();
    }
    comparators.join(", ")
}

/// Parses a helm-style constraint: `||` separated alternatives, each a list
/// of comparators separated by spaces or commas, with hyphen ranges and an
/// optional `v` prefix on versions.
pub fn parse_constraint(constraint: &str) -> Result<Vec<VersionReq>, HelmError> {
    constraint
        .split("||")
        .map(|alternative| {
            let normalized = normalize_alternative(alternative);
            VersionReq::parse(&normalized).map_err(|e| HelmError::InvalidConstraint {
                constraint: constraint.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    Version::parse(raw).ok()
}

/// The ascending, de-duplicated subset of `versions` satisfying
/// `constraint`. Versions that are not semver are skipped.
pub fn select_version<S: AsRef<str>>(
    constraint: &str,
    versions: &[S],
) -> Result<Vec<Version>, HelmError> {
    let requirements = parse_constraint(constraint)?;
    let mut selected: Vec<Version> = versions
        .iter()
        .filter_map(|v| parse_version(v.as_ref()))
        .filter(|v| requirements.iter().any(|req| req.matches(v)))
        .collect();
    selected.sort();
    selected.dedup();
    if selected.is_empty() {
        return Err(HelmError::NoMatchingVersion {
            constraint: constraint.to_string(),
            candidates: versions.len(),
        });
    }
    Ok(selected)
}
