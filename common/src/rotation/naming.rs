use crate::config::{FileNaming, ServiceConfig};
use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use std::fs;
use std::io;
use std::path::Path;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Suffixes an archive may carry once compressed.
const ARCHIVE_SUFFIXES: &[&str] = &[".log", ".log.gz", ".log.tar.bz2"];

/// Builds archive file names for one service.
///
/// - timestamp: `{base}-{YYYYMMDD-HHMMSS}.log`
/// - numbered:  `{base}-{seq}-{YYYYMMDD-HHMMSS}.log`, `seq` one past the
///   highest sequence already in the archive directory
/// - custom:    `{custom_name}-{YYYYMMDD-HHMMSS}.log`
///
/// If the stem is already taken (two rotations inside one second) a `-{n}`
/// disambiguator is appended so an existing archive is never replaced.
#[derive(Debug, Clone)]
pub struct ArchiveNamer {
    naming: FileNaming,
    custom_name: Option<String>,
}

impl ArchiveNamer {
    pub fn for_service(config: &ServiceConfig) -> Result<Self> {
        config.check_naming()?;
        Ok(Self {
            naming: config.file_naming,
            custom_name: config.custom_name.clone(),
        })
    }

    pub fn archive_name(&self, base_name: &str, at: NaiveDateTime, archive_dir: &Path) -> Result<String> {
        let timestamp = at.format(TIMESTAMP_FORMAT).to_string();
        let stem = match self.naming {
            FileNaming::Timestamp => format!("{}-{}", base_name, timestamp),
            FileNaming::Numbered => {
                let seq = next_sequence(archive_dir, base_name)?;
                format!("{}-{}-{}", base_name, seq, timestamp)
            }
            FileNaming::Custom => {
                let custom = self
                    .custom_name
                    .as_deref()
                    .ok_or_else(|| Error::config("custom naming requires custom_name"))?;
                format!("{}-{}", custom, timestamp)
            }
        };

        let mut candidate = stem.clone();
        let mut n = 1;
        while is_taken(archive_dir, &candidate) {
            candidate = format!("{}-{}", stem, n);
            n += 1;
        }
        Ok(format!("{}.{}", candidate, crate::LOG_EXTENSION))
    }
}

fn is_taken(archive_dir: &Path, stem: &str) -> bool {
    ARCHIVE_SUFFIXES
        .iter()
        .any(|suffix| archive_dir.join(format!("{}{}", stem, suffix)).exists())
}

fn next_sequence(archive_dir: &Path, base_name: &str) -> Result<u64> {
    let entries = match fs::read_dir(archive_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(1),
        Err(source) => {
            return Err(Error::Io {
                context: format!("failed to list {}", archive_dir.display()),
                source,
            });
        }
    };

    let highest = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            parse_sequence(name.to_str()?, base_name)
        })
        .max()
        .unwrap_or(0);
    Ok(highest + 1)
}

fn parse_sequence(file_name: &str, base_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(base_name)?.strip_prefix('-')?;
    let (digits, tail) = rest.split_once('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(tail.get(..15)?, TIMESTAMP_FORMAT).ok()?;
    digits.parse().ok()
}
