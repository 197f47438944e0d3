//! Configuration loading and validation.
//!
//! A config file is read once at startup, parsed according to its
//! extension ([`parse_config_str`]), validated ([`validation::validate`])
//! and fingerprinted with a SHA-256 [`ConfigVersion`] that the health
//! endpoint reports. The signing secret used for upload claims is read
//! from its own file by [`load_secret`].

pub mod model;
pub mod validation;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::GatehouseError;
use crate::upload::TrustClaimEncoder;
use model::Config;

/// File names probed in the working directory when no config is given.
pub const CONFIG_CANDIDATES: &[&str] = &[
    "gatehouse.yaml",
    "gatehouse.yml",
    "gatehouse.json",
    "gatehouse.toml",
];

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigVersion {
    Hash(String),
}

impl ConfigVersion {
    /// First eight hex digits of the digest.
    #[must_use]
    pub fn short(&self) -> &str {
        match self {
            Self::Hash(h) => h.get(..8).unwrap_or(h),
        }
    }
}

/// Parse a config string based on file extension.
pub fn parse_config_str(
    ext: &str,
    content: &str,
    path_display: &str,
) -> Result<Config, GatehouseError> {
    match ext {
        #[cfg(feature = "yaml")]
        "yaml" | "yml" => serde_yml::from_str(content).map_err(|e| GatehouseError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        #[cfg(feature = "json")]
        "json" => serde_json::from_str(content).map_err(|e| GatehouseError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        #[cfg(feature = "toml")]
        "toml" => toml::from_str(content).map_err(|e| GatehouseError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        other => Err(GatehouseError::UnsupportedFormat(other.to_string())),
    }
}

/// Compute a lowercase hex-encoded SHA-256 digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Read, parse and validate a config file.
pub async fn load_file(path: &Path) -> Result<(Config, ConfigVersion), GatehouseError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            GatehouseError::ConfigFileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            GatehouseError::Io(e)
        }
    })?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let config = parse_config_str(ext, &content, &path.display().to_string())?;

    if let Err(errors) = validation::validate(&config) {
        return Err(GatehouseError::ConfigValidation { errors });
    }

    Ok((config, ConfigVersion::Hash(sha256_hex(content.as_bytes()))))
}

/// The explicit path if given, otherwise the first candidate that exists.
pub async fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, GatehouseError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    for name in CONFIG_CANDIDATES {
        let path = PathBuf::from(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::info!(path = %path.display(), "auto-detected config file");
            return Ok(path);
        }
    }

    Err(GatehouseError::NoConfigSource {
        hint: "Provide --config <file> or create ./gatehouse.yaml.".into(),
    })
}

/// Read the claim signing secret. Surrounding whitespace is ignored.
pub async fn load_secret(path: Option<&Path>) -> Result<Vec<u8>, GatehouseError> {
    let Some(path) = path else {
        return Err(GatehouseError::MissingSecret {
            hint: "Set secret_file in the config, pass --secret-file or GATEHOUSE_SECRET_FILE."
                .into(),
        });
    };

    let raw = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            GatehouseError::MissingSecret {
                hint: format!("{} does not exist.", path.display()),
            }
        } else {
            GatehouseError::Io(e)
        }
    })?;

    let secret = raw.trim_ascii().to_vec();
    if secret.len() < TrustClaimEncoder::MIN_SECRET_LEN {
        return Err(GatehouseError::WeakSecret {
            path: path.to_path_buf(),
            len: secret.len(),
            min: TrustClaimEncoder::MIN_SECRET_LEN,
        });
    }
    Ok(secret)
}
