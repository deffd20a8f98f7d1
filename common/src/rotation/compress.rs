use crate::config::Compression;
use crate::error::{Error, IoContext, Result};
use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Compress an archived file next to itself and remove the uncompressed copy.
/// Returns the path of the file that now holds the archive.
pub fn compress_in_place(path: &Path, compression: Compression) -> Result<PathBuf> {
    let target = match compression {
        Compression::None => return Ok(path.to_path_buf()),
        Compression::Gzip => gzip(path)?,
        Compression::Bzip2 => bzip2_tar(path)?,
    };
    fs::remove_file(path).io_context(|| format!("failed to remove {}", path.display()))?;
    Ok(target)
}

fn gzip(path: &Path) -> Result<PathBuf> {
    let target = with_suffix(path, ".gz");
    write_or_discard(&target, |out| {
        let mut input =
            File::open(path).io_context(|| format!("failed to open {}", path.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(out), flate2::Compression::default());
        io::copy(&mut input, &mut encoder)
            .and_then(|_| encoder.finish())
            .and_then(|mut writer| writer.flush())
            .io_context(|| format!("gzip compression of {} failed", path.display()))
    })?;
    Ok(target)
}

/// Single-entry `.tar.bz2`, the entry named after the archived file.
fn bzip2_tar(path: &Path) -> Result<PathBuf> {
    let target = with_suffix(path, ".tar.bz2");
    let entry_name = path.file_name().ok_or_else(|| Error::Io {
        context: format!("cannot archive {}", path.display()),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
    })?;

    write_or_discard(&target, |out| {
        let encoder = BzEncoder::new(BufWriter::new(out), bzip2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_path_with_name(path, entry_name)
            .and_then(|_| builder.into_inner())
            .and_then(|encoder| encoder.finish())
            .and_then(|mut writer| writer.flush())
            .io_context(|| format!("bzip2 archive of {} failed", path.display()))
    })?;
    Ok(target)
}

/// Create `target` exclusively and fill it; on failure the partial output is removed.
fn write_or_discard<F>(target: &Path, write: F) -> Result<()>
where
    F: FnOnce(File) -> Result<()>,
{
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .io_context(|| format!("failed to create {}", target.display()))?;

    if let Err(e) = write(file) {
        if let Err(cleanup) = fs::remove_file(target) {
            log::warn!("Failed to remove partial archive {}: {}", target.display(), cleanup);
        }
        return Err(e);
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
