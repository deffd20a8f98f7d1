use crate::error::{Error, IoContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How archived files are named. Every variant appends a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNaming {
    Timestamp,
    Numbered,
    Custom,
}

impl FromStr for FileNaming {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timestamp" => Ok(FileNaming::Timestamp),
            "numbered" => Ok(FileNaming::Numbered),
            "custom" => Ok(FileNaming::Custom),
            other => Err(Error::config(format!("unknown file_naming '{}'", other))),
        }
    }
}

impl fmt::Display for FileNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileNaming::Timestamp => "timestamp",
            FileNaming::Numbered => "numbered",
            FileNaming::Custom => "custom",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Bzip2,
    None,
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "bzip2" => Ok(Compression::Bzip2),
            "none" => Ok(Compression::None),
            other => Err(Error::config(format!("unknown compression '{}'", other))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::None => "none",
        })
    }
}

/// Rotation settings for one service. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub log_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub max_size_mb: f64,
    pub retain_count: usize,
    pub file_naming: FileNaming,
    pub compression: Compression,
    pub custom_name: Option<String>,
    pub cron_schedule: String,
}

/// Service entry as written in the environment file, before validation.
#[derive(Debug, Deserialize)]
struct RawServiceConfig {
    name: Option<String>,
    log_dir: Option<PathBuf>,
    archive_dir: Option<PathBuf>,
    max_size_mb: Option<f64>,
    retain_count: Option<u64>,
    file_naming: Option<String>,
    compression: Option<String>,
    custom_name: Option<String>,
    cron_schedule: Option<String>,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::config(format!("missing required field '{}'", field)))
}

impl TryFrom<RawServiceConfig> for ServiceConfig {
    type Error = Error;

    fn try_from(raw: RawServiceConfig) -> Result<Self> {
        let name = required(raw.name, "name")?;
        if name.trim().is_empty() {
            return Err(Error::config("service name must not be empty"));
        }

        let max_size_mb = required(raw.max_size_mb, "max_size_mb")?;
        if !max_size_mb.is_finite() || max_size_mb <= 0.0 {
            return Err(Error::config(format!(
                "max_size_mb must be a positive number, got {}",
                max_size_mb
            )));
        }

        let retain_count = required(raw.retain_count, "retain_count")?;
        let retain_count = usize::try_from(retain_count)
            .map_err(|_| Error::config(format!("retain_count {} is too large", retain_count)))?;

        let config = ServiceConfig {
            name,
            log_dir: required(raw.log_dir, "log_dir")?,
            archive_dir: required(raw.archive_dir, "archive_dir")?,
            max_size_mb,
            retain_count,
            file_naming: required(raw.file_naming, "file_naming")?.parse()?,
            compression: required(raw.compression, "compression")?.parse()?,
            custom_name: raw.custom_name,
            cron_schedule: required(raw.cron_schedule, "cron_schedule")?,
        };
        config.check_naming()?;
        Ok(config)
    }
}

impl ServiceConfig {
    /// Custom naming needs a non-empty `custom_name`.
    pub fn check_naming(&self) -> Result<()> {
        if self.file_naming == FileNaming::Custom
            && self.custom_name.as_deref().map_or(true, |n| n.trim().is_empty())
        {
            return Err(Error::config(format!(
                "service '{}' uses custom naming but has no custom_name",
                self.name
            )));
        }
        Ok(())
    }
}

/// A service entry that failed validation.
#[derive(Debug)]
pub struct RejectedService {
    /// Name from the entry if it had one, otherwise its position.
    pub label: String,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct ValidatedServices {
    pub services: Vec<ServiceConfig>,
    pub rejected: Vec<RejectedService>,
}

/// The service list for one environment (`config/{env}.json`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(skip)]
    pub env: String,
    #[serde(skip)]
    pub source: PathBuf,
    #[serde(default)]
    services: Vec<serde_json::Value>,
}

const ENV_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "toml"];

impl EnvironmentConfig {
    /// Locate and parse `{config_dir}/{env}.{json,yaml,yml,toml}`.
    pub fn load(config_dir: &Path, env: &str) -> Result<Self> {
        let path = ENV_EXTENSIONS
            .iter()
            .map(|ext| config_dir.join(format!("{}.{}", env, ext)))
            .find(|p| p.is_file())
            .ok_or_else(|| Error::ConfigNotFound {
                env: env.to_string(),
                dir: config_dir.to_path_buf(),
            })?;

        let mut config = Self::from_file(&path)?;
        config.env = env.to_string();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .io_context(|| format!("failed to read config file {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let mut config = Self::parse(&content, ext)?;
        config.source = path.to_path_buf();
        Ok(config)
    }

    pub fn parse(content: &str, format: &str) -> Result<Self> {
        match format {
            "json" => Ok(serde_json::from_str(content)?),
            "yaml" | "yml" => Ok(serde_yaml::from_str(content)?),
            "toml" => Ok(toml::from_str(content)?),
            other => Err(Error::config(format!(
                "unsupported config format '{}'; use json, yaml or toml",
                other
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Validate every entry on its own; a bad entry never hides a good one.
    pub fn validate(&self) -> ValidatedServices {
        let mut result = ValidatedServices::default();
        let mut seen = HashSet::new();

        for (index, value) in self.services.iter().enumerate() {
            let label = value
                .get("name")
                .and_then(|n| n.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("services[{}]", index));

            let parsed = serde_json::from_value::<RawServiceConfig>(value.clone())
                .map_err(|e| Error::config(e.to_string()))
                .and_then(ServiceConfig::try_from)
                .and_then(|service| {
                    if seen.insert(service.name.clone()) {
                        Ok(service)
                    } else {
                        Err(Error::config(format!("duplicate service name '{}'", service.name)))
                    }
                });

            match parsed {
                Ok(service) => result.services.push(service),
                Err(error) => result.rejected.push(RejectedService { label, error }),
            }
        }
        result
    }
}
