//! Serde data structures for the Gatehouse configuration file.
//!
//! Contains [`Config`] (the root), [`UploadSettings`], [`Route`] and
//! [`UploadKind`]. All types derive `Serialize` and `Deserialize` with
//! `deny_unknown_fields` for strict parsing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::upload::UploadLimits;

const MIB: u64 = 1024 * 1024;

const fn default_true() -> bool {
    true
}

const fn default_max_files() -> usize {
    10
}

const fn default_max_file_size() -> u64 {
    100 * MIB
}

const fn default_max_request_size() -> u64 {
    100 * MIB
}

const fn default_upload_timeout() -> u64 {
    60_000
}

const fn default_claim_ttl() -> u64 {
    60
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_methods() -> Vec<String> {
    vec!["*".to_string()]
}

fn is_true(v: &bool) -> bool {
    *v
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_default_methods(v: &[String]) -> bool {
    v.len() == 1 && v[0] == "*"
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URI every request is forwarded to. `http://localhost` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,

    /// Value of the `Gatehouse` request header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub force_target_host_header: bool,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub allow_response_buffering: bool,

    /// Extra request headers, applied in name order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_file: Option<PathBuf>,

    #[serde(default)]
    pub uploads: UploadSettings,

    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Config {
    /// The configured version, or `v<crate version>-<git short hash>`.
    #[must_use]
    pub fn version_string(&self) -> String {
        self.version.clone().unwrap_or_else(|| {
            format!(
                "v{}-{}",
                env!("CARGO_PKG_VERSION"),
                env!("GATEHOUSE_GIT_SHORT")
            )
        })
    }

    #[must_use]
    pub fn upload_routes(&self) -> usize {
        self.routes.iter().filter(|r| r.upload.is_some()).count()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UploadSettings {
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Largest accepted file in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Largest accepted multipart body in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,

    /// Deadline for one upload request, in milliseconds.
    #[serde(default = "default_upload_timeout")]
    pub timeout: u64,

    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Lifetime of the signed rewritten-fields claim, in seconds.
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_size: default_max_file_size(),
            max_request_size: default_max_request_size(),
            timeout: default_upload_timeout(),
            storage_dir: default_storage_dir(),
            claim_ttl: default_claim_ttl(),
        }
    }
}

impl UploadSettings {
    #[must_use]
    pub const fn limits(&self) -> UploadLimits {
        UploadLimits {
            max_files: self.max_files,
            max_request_size: self.max_request_size,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    #[must_use]
    pub const fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Route {
    pub path: String,

    #[serde(
        default = "default_methods",
        skip_serializing_if = "is_default_methods"
    )]
    pub methods: Vec<String>,

    /// How multipart bodies on this route are rewritten. Routes without
    /// an upload kind are forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    Attachments,
    Artifacts,
}

impl std::fmt::Display for UploadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attachments => f.write_str("attachments"),
            Self::Artifacts => f.write_str("artifacts"),
        }
    }
}
