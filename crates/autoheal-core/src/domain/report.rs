//! Normalized error reports produced by the detection layer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// Characters of `message` folded into a signature.
pub const SIGNATURE_MESSAGE_PREFIX: usize = 100;

/// Maximum characters of raw log kept on a report.
pub const RAW_LOG_LIMIT: usize = 5000;

const SIGNATURE_MAX_LEN: usize = 128;

/// Where a failure was reported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    CiActions,
    DeployPlatform,
    #[default]
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::CiActions => "ci-actions",
            Platform::DeployPlatform => "deploy-platform",
            Platform::Other => "other",
        }
    }

    /// Lenient parse; anything unrecognised is `Other`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ci-actions" => Platform::CiActions,
            "deploy-platform" => Platform::DeployPlatform,
            _ => Platform::Other,
        }
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Platform::parse(&s))
    }
}

impl std::str::FromStr for Platform {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Platform::parse(s))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable hash identifying a recurring failure.
///
/// SHA-256 over `platform|repo_key|error_type|<first 100 chars of message>`.
pub fn compute_signature(
    platform: Platform,
    repo_key: &str,
    error_type: &str,
    message: &str,
) -> String {
    let prefix: String = message.chars().take(SIGNATURE_MESSAGE_PREFIX).collect();
    let mut hasher = Sha256::new();
    hasher.update(platform.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(repo_key.as_bytes());
    hasher.update(b"|");
    hasher.update(error_type.as_bytes());
    hasher.update(b"|");
    hasher.update(prefix.as_bytes());
    hex::encode(hasher.finalize())
}

/// A signature is usable for throttling only if it is non-empty, bounded,
/// and restricted to `[A-Za-z0-9_.:-]`.
pub fn is_well_formed_signature(signature: &str) -> bool {
    !signature.is_empty()
        && signature.len() <= SIGNATURE_MAX_LEN
        && signature
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
}

fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// One detected failure.
///
/// Deserializes from detector output that names the repository either
/// `repoKey`, `repo` or `project`. A report with none of them has
/// `repo_key == None` and is unkeyable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawErrorReport")]
pub struct ErrorReport {
    pub repo_key: Option<String>,
    pub branch: Option<String>,
    pub platform: Platform,
    pub error_type: String,
    pub message: String,
    pub raw_log: String,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
}

impl ErrorReport {
    pub fn new(
        platform: Platform,
        repo_key: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let repo_key = repo_key.into();
        let error_type = error_type.into();
        let message = message.into();
        let signature = compute_signature(platform, &repo_key, &error_type, &message);
        Self {
            repo_key: Some(repo_key),
            branch: None,
            platform,
            error_type,
            message,
            raw_log: String::new(),
            timestamp: Utc::now(),
            signature,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_raw_log(mut self, raw_log: &str) -> Self {
        self.raw_log = truncate_chars(raw_log, RAW_LOG_LIMIT);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Override the computed signature (e.g. one supplied by the detector).
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Repository key, if present and non-blank.
    pub fn key(&self) -> Option<&str> {
        self.repo_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn has_valid_signature(&self) -> bool {
        is_well_formed_signature(&self.signature)
    }
}

/// Wire shape accepted from detectors.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawErrorReport {
    #[serde(default)]
    repo_key: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    platform: Platform,
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    raw_log: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    signature: Option<String>,
}

impl From<RawErrorReport> for ErrorReport {
    fn from(raw: RawErrorReport) -> Self {
        let repo_key = [raw.repo_key, raw.repo, raw.project]
            .into_iter()
            .flatten()
            .map(|k| k.trim().to_string())
            .find(|k| !k.is_empty());

        let signature = match (raw.signature, &repo_key) {
            (Some(sig), _) => sig,
            (None, Some(key)) => compute_signature(raw.platform, key, &raw.error_type, &raw.message),
            (None, None) => String::new(),
        };

        Self {
            repo_key,
            branch: raw.branch.filter(|b| !b.trim().is_empty()),
            platform: raw.platform,
            error_type: raw.error_type,
            message: raw.message,
            raw_log: truncate_chars(&raw.raw_log, RAW_LOG_LIMIT),
            timestamp: raw.timestamp.unwrap_or(DateTime::<Utc>::MIN_UTC),
            signature,
        }
    }
}
