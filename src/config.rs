//! Settings file: defaults, lookup and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::UploadError;
use crate::upload::{validate_part_size, MIB};

pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("glacier-backup");
    }
    PathBuf::from(".glacier-backup")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn default_glacier_region() -> String {
    "eu-central-1".to_string()
}

fn default_simpledb_region() -> String {
    "eu-west-1".to_string()
}

fn default_container() -> String {
    "mybackups".to_string()
}

/// Where archives and the ledger live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSettings {
    Aws {
        #[serde(default = "default_glacier_region")]
        glacier_region: String,
        #[serde(default = "default_container")]
        vault: String,
        #[serde(default = "default_simpledb_region")]
        simpledb_region: String,
        #[serde(default = "default_container")]
        domain: String,
        #[serde(default)]
        profile: Option<String>,
    },
    Local {
        root: PathBuf,
        #[serde(default = "default_container")]
        vault: String,
        #[serde(default = "default_container")]
        domain: String,
    },
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings::Aws {
            glacier_region: default_glacier_region(),
            vault: default_container(),
            simpledb_region: default_simpledb_region(),
            domain: default_container(),
            profile: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Concurrent part uploads (0 = one per CPU)
    pub parallelism: usize,
    pub part_size_mib: u32,
    /// Archives kept after an upload
    pub max_retention: usize,
    pub retry_delay_secs: u64,
    pub backend: BackendSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: 5,
            part_size_mib: 128,
            max_retention: 3,
            retry_delay_secs: 10,
            backend: BackendSettings::default(),
        }
    }
}

impl Settings {
    /// Read `path` if given (it must exist), else the default file if present, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let p = default_config_path();
                if p.exists() {
                    Self::from_file(&p)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            return self.parallelism;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn part_size(&self) -> Result<u32, UploadError> {
        self.part_size_mib
            .checked_mul(MIB)
            .ok_or_else(|| {
                UploadError::InvalidConfig(format!("part size {} MiB is too large", self.part_size_mib))
            })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        validate_part_size(self.part_size()?)?;
        if self.max_retention == 0 {
            return Err(UploadError::InvalidConfig(
                "max_retention must be at least 1".into(),
            ));
        }
        let (vault, domain) = match &self.backend {
            BackendSettings::Aws { vault, domain, .. } => (vault, domain),
            BackendSettings::Local { vault, domain, .. } => (vault, domain),
        };
        if vault.is_empty() || domain.is_empty() {
            return Err(UploadError::InvalidConfig(
                "vault and domain names must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.parallelism, 5);
        assert_eq!(s.part_size().unwrap(), 128 * MIB);
        assert_eq!(s.max_retention, 3);
        assert_eq!(s.retry_delay(), Duration::from_secs(10));
        assert!(s.validate().is_ok());
        match s.backend {
            BackendSettings::Aws {
                glacier_region,
                simpledb_region,
                vault,
                domain,
                profile,
            } => {
                assert_eq!(glacier_region, "eu-central-1");
                assert_eq!(simpledb_region, "eu-west-1");
                assert_eq!(vault, "mybackups");
                assert_eq!(domain, "mybackups");
                assert!(profile.is_none());
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let s: Settings = toml::from_str(
            r#"
            parallelism = 8

            [backend]
            kind = "local"
            root = "/srv/backups"
            "#,
        )
        .unwrap();
        assert_eq!(s.parallelism, 8);
        assert_eq!(s.part_size_mib, 128);
        assert_eq!(
            s.backend,
            BackendSettings::Local {
                root: PathBuf::from("/srv/backups"),
                vault: "mybackups".into(),
                domain: "mybackups".into(),
            }
        );
    }

    #[test]
    fn aws_backend_fields_are_optional() {
        let s: Settings = toml::from_str(
            r#"
            [backend]
            kind = "aws"
            vault = "photos"
            profile = "work"
            "#,
        )
        .unwrap();
        match s.backend {
            BackendSettings::Aws {
                vault,
                glacier_region,
                profile,
                ..
            } => {
                assert_eq!(vault, "photos");
                assert_eq!(glacier_region, "eu-central-1");
                assert_eq!(profile.as_deref(), Some("work"));
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad_part = Settings {
            part_size_mib: 3,
            ..Settings::default()
        };
        assert!(bad_part.validate().is_err());
        let huge_part = Settings {
            part_size_mib: 8192,
            ..Settings::default()
        };
        assert!(huge_part.validate().is_err());
        let no_retention = Settings {
            max_retention: 0,
            ..Settings::default()
        };
        assert!(no_retention.validate().is_err());
    }

    #[test]
    fn zero_parallelism_means_available_cpus() {
        let s = Settings {
            parallelism: 0,
            ..Settings::default()
        };
        assert!(s.effective_parallelism() >= 1);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("nope.toml"))).is_err());
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_retention = 7\n").unwrap();
        assert_eq!(Settings::load(Some(&path)).unwrap().max_retention, 7);
    }
}
