use super::compress::compress_in_place;
use super::naming::ArchiveNamer;
use crate::config::{Compression, ServiceConfig};
use crate::error::{Error, IoContext, Result};
use chrono::{Local, NaiveDateTime};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Performs single-file rotations for one service.
#[derive(Debug, Clone)]
pub struct Archiver {
    archive_dir: PathBuf,
    compression: Compression,
    namer: ArchiveNamer,
}

impl Archiver {
    /// Fails with a config error when the naming policy cannot be satisfied.
    pub fn for_service(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            archive_dir: config.archive_dir.clone(),
            compression: config.compression,
            namer: ArchiveNamer::for_service(config)?,
        })
    }

    pub fn archive(&self, log_file: &Path) -> Result<PathBuf> {
        self.archive_at(log_file, Local::now().naive_local())
    }

    /// Move `log_file` into the archive directory under its new name, hand
    /// the writer an empty file at the old path, then compress the archive.
    pub fn archive_at(&self, log_file: &Path, at: NaiveDateTime) -> Result<PathBuf> {
        let base_name = log_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Io {
                context: format!("cannot rotate {}", log_file.display()),
                source: io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
            })?;

        let name = self.namer.archive_name(&base_name, at, &self.archive_dir)?;
        let moved = self.archive_dir.join(name);

        move_file(log_file, &moved)?;
        recreate_empty(log_file)?;
        compress_in_place(&moved, self.compression)
    }
}

/// Rename, falling back to copy + verify + delete across filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            log::debug!("{} and {} are on different filesystems, copying", from.display(), to.display());
            copy_across(from, to)
        }
        Err(source) => Err(Error::Io {
            context: format!("failed to move {} to {}", from.display(), to.display()),
            source,
        }),
    }
}

fn copy_across(from: &Path, to: &Path) -> Result<()> {
    let mut input = File::open(from).io_context(|| format!("failed to open {}", from.display()))?;
    let expected = input
        .metadata()
        .io_context(|| format!("failed to stat {}", from.display()))?
        .len();
    // never replace an archive that is already there
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
        .io_context(|| format!("failed to create {}", to.display()))?;

    let copied = io::copy(&mut input, &mut output).and_then(|_| output.sync_all());
    drop(output);
    if let Err(source) = copied {
        discard(to);
        return Err(Error::Io {
            context: format!("failed to copy {} to {}", from.display(), to.display()),
            source,
        });
    }

    verify_copy(to, expected)?;
    fs::remove_file(from).io_context(|| format!("failed to remove {}", from.display()))
}

/// Check that `to` holds `expected` bytes, removing it otherwise.
fn verify_copy(to: &Path, expected: u64) -> Result<()> {
    let written = fs::metadata(to)
        .io_context(|| format!("failed to stat {}", to.display()))?
        .len();
    if written == expected {
        return Ok(());
    }

    discard(to);
    Err(Error::Io {
        context: format!("copy to {} is incomplete", to.display()),
        source: io::Error::new(
            io::ErrorKind::Other,
            format!("expected {} bytes, wrote {}", expected, written),
        ),
    })
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        log::warn!("Failed to remove incomplete copy {}: {}", path.display(), e);
    }
}

/// Truncate-create; succeeds if someone already recreated the file.
pub fn recreate_empty(path: &Path) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map(drop)
        .io_context(|| format!("failed to recreate {}", path.display()))
}
