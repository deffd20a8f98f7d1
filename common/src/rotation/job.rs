use super::archive::Archiver;
use super::retention::{self, RetentionReport};
use super::size::should_rotate;
use crate::config::ServiceConfig;
use crate::error::{Error, IoContext, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RotatedFile {
    pub source: PathBuf,
    pub archive: PathBuf,
}

#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: Error,
}

/// Outcome of one rotation pass for one service.
#[derive(Debug)]
pub struct RotationReport {
    pub pass_id: Uuid,
    pub service: String,
    pub rotated: Vec<RotatedFile>,
    pub failures: Vec<FileFailure>,
    pub retention: RetentionReport,
    pub retain_count: usize,
}

/// One schedulable unit of work: a rotation pass for a single service.
#[derive(Debug, Clone)]
pub struct RotationJob {
    config: ServiceConfig,
}

impl RotationJob {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Rotate every oversized `.log` file in the log directory, then apply
    /// retention to the archive directory.
    ///
    /// Per-file failures are collected in the report, and retention runs
    /// even when the log directory is missing or cannot be listed. An `Err`
    /// means the whole pass failed (bad naming config, or the archive
    /// directory cannot be created or listed).
    pub fn run(&self) -> Result<RotationReport> {
        let config = &self.config;
        let pass_id = Uuid::new_v4();

        // naming problems surface before anything on disk changes
        let archiver = Archiver::for_service(config)?;

        fs::create_dir_all(&config.archive_dir)
            .io_context(|| format!("failed to create archive dir {}", config.archive_dir.display()))?;

        let mut failures = Vec::new();
        let files = match list_log_files(&config.log_dir) {
            Ok(files) => files,
            Err(Error::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "[{}] Log directory {} for {} does not exist, nothing to rotate",
                    pass_id,
                    config.log_dir.display(),
                    config.name
                );
                Vec::new()
            }
            Err(error) => {
                log::error!("[{}] Cannot list logs for {}: {}", pass_id, config.name, error);
                failures.push(FileFailure {
                    path: config.log_dir.clone(),
                    error,
                });
                Vec::new()
            }
        };

        self.rotate_files(&archiver, pass_id, files, failures)
    }

    /// Rotate `files` one by one, then enforce retention once. A file that
    /// fails is recorded next to `failures` and does not stop its siblings.
    fn rotate_files(
        &self,
        archiver: &Archiver,
        pass_id: Uuid,
        files: Vec<PathBuf>,
        mut failures: Vec<FileFailure>,
    ) -> Result<RotationReport> {
        let config = &self.config;
        let mut rotated = Vec::new();

        for path in files {
            match rotate_file(archiver, &path, config.max_size_mb) {
                Ok(Some(archive)) => {
                    log::info!(
                        "Rotated log for {}: {} -> {}",
                        config.name,
                        path.display(),
                        archive.display()
                    );
                    rotated.push(RotatedFile { source: path, archive });
                }
                Ok(None) => {}
                Err(error) => {
                    log::error!(
                        "[{}] Failed to rotate {} for {}: {}",
                        pass_id,
                        path.display(),
                        config.name,
                        error
                    );
                    failures.push(FileFailure { path, error });
                }
            }
        }

        let retention = retention::enforce(&config.archive_dir, config.retain_count)?;
        log::info!(
            "Cleanup completed for {}, retaining {} files.",
            config.name,
            config.retain_count
        );

        Ok(RotationReport {
            pass_id,
            service: config.name.clone(),
            rotated,
            failures,
            retention,
            retain_count: config.retain_count,
        })
    }
}

fn rotate_file(archiver: &Archiver, path: &Path, max_size_mb: f64) -> Result<Option<PathBuf>> {
    if !should_rotate(path, max_size_mb)? {
        return Ok(None);
    }
    archiver.archive(path).map(Some)
}

/// Regular files directly inside `log_dir` with the `.log` extension, by name.
pub fn list_log_files(log_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(log_dir).io_context(|| format!("failed to list {}", log_dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .io_context(|| format!("failed to list {}", log_dir.display()))?
            .path();
        let is_log = path
            .extension()
            .map_or(false, |ext| ext == crate::LOG_EXTENSION);
        if is_log && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, FileNaming};
    use crate::BYTES_PER_MB;
    use flate2::read::GzDecoder;
    use std::fs::File;
    use std::io::Read;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn service(root: &Path, name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            log_dir: root.join(name).join("logs"),
            archive_dir: root.join(name).join("archive"),
            max_size_mb: 10.0,
            retain_count: 2,
            file_naming: FileNaming::Timestamp,
            compression: Compression::Gzip,
            custom_name: None,
            cron_schedule: "0 * * * *".to_string(),
        }
    }

    fn write_sized(path: &Path, len: u64) {
        File::create(path).unwrap().set_len(len).unwrap();
    }

    fn archive_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn is_timestamped_gz(name: &str, base: &str) -> bool {
        let Some(rest) = name.strip_prefix(&format!("{}-", base)) else {
            return false;
        };
        let Some(stem) = rest.strip_suffix(".log.gz") else {
            return false;
        };
        chrono::NaiveDateTime::parse_from_str(&stem[..15], "%Y%m%d-%H%M%S").is_ok()
    }

    /// Age an archive so later passes see it as older.
    fn backdate(path: &Path, secs: u64) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_twelve_megabyte_scenario() {
        let root = TempDir::new().unwrap();
        let config = service(root.path(), "app");
        fs::create_dir_all(&config.log_dir).unwrap();
        let log = config.log_dir.join("app.log");
        let job = RotationJob::new(config.clone());

        write_sized(&log, 12 * BYTES_PER_MB);
        let first = job.run().unwrap();

        assert_eq!(first.rotated.len(), 1);
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        let names = archive_names(&config.archive_dir);
        assert_eq!(names.len(), 1);
        assert!(is_timestamped_gz(&names[0], "app"), "{}", names[0]);

        let mut archives = vec![first.rotated[0].archive.clone()];
        for age in [200, 100] {
            backdate(archives.last().unwrap(), age + 100);
            write_sized(&log, 12 * BYTES_PER_MB);
            let report = job.run().unwrap();
            archives.push(report.rotated[0].archive.clone());
        }

        assert_eq!(archive_names(&config.archive_dir).len(), 2);
        assert!(!archives[0].exists());
        assert!(archives[1].exists());
        assert!(archives[2].exists());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
    }

    #[test]
    fn test_small_files_untouched() {
        let root = TempDir::new().unwrap();
        let mut config = service(root.path(), "api");
        config.max_size_mb = 0.01;
        fs::create_dir_all(&config.log_dir).unwrap();

        let small = config.log_dir.join("small.log");
        let big = config.log_dir.join("big.log");
        let other = config.log_dir.join("big.txt");
        fs::write(&small, "tiny\n").unwrap();
        let big_content = "x".repeat(20 * 1024);
        fs::write(&big, &big_content).unwrap();
        fs::write(&other, &big_content).unwrap();

        let report = RotationJob::new(config.clone()).run().unwrap();

        assert_eq!(report.rotated.len(), 1);
        assert_eq!(report.rotated[0].source, big);
        assert_eq!(fs::read_to_string(&small).unwrap(), "tiny\n");
        assert_eq!(fs::read_to_string(&other).unwrap(), big_content);
        assert_eq!(fs::metadata(&big).unwrap().len(), 0);

        let mut decoded = String::new();
        GzDecoder::new(File::open(&report.rotated[0].archive).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, big_content);
    }

    #[test]
    fn test_custom_without_name_fails_before_touching_disk() {
        let root = TempDir::new().unwrap();
        let mut config = service(root.path(), "billing");
        config.file_naming = FileNaming::Custom;
        config.custom_name = None;
        config.max_size_mb = 0.001;
        fs::create_dir_all(&config.log_dir).unwrap();
        let log = config.log_dir.join("billing.log");
        fs::write(&log, "y".repeat(4096)).unwrap();

        let err = RotationJob::new(config.clone()).run().unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert!(!config.archive_dir.exists());
        assert_eq!(fs::metadata(&log).unwrap().len(), 4096);
    }

    #[test]
    fn test_retention_runs_without_rotation() {
        let root = TempDir::new().unwrap();
        let mut config = service(root.path(), "cron");
        config.retain_count = 1;
        fs::create_dir_all(&config.log_dir).unwrap();
        fs::create_dir_all(&config.archive_dir).unwrap();
        for (i, name) in ["a.log.gz", "b.log.gz", "c.log.gz"].iter().enumerate() {
            let path = config.archive_dir.join(name);
            fs::write(&path, b"old").unwrap();
            backdate(&path, 1000 - 100 * i as u64);
        }

        let report = RotationJob::new(config.clone()).run().unwrap();

        assert!(report.rotated.is_empty());
        assert_eq!(report.retention.deleted.len(), 2);
        assert_eq!(archive_names(&config.archive_dir), vec!["c.log.gz".to_string()]);
    }

    #[test]
    fn test_services_do_not_interfere() {
        let root = TempDir::new().unwrap();
        let mut a = service(root.path(), "alpha");
        let mut b = service(root.path(), "beta");
        a.max_size_mb = 0.001;
        b.max_size_mb = 0.001;
        a.retain_count = 0;
        b.compression = Compression::None;
        for config in [&a, &b] {
            fs::create_dir_all(&config.log_dir).unwrap();
            fs::create_dir_all(&config.archive_dir).unwrap();
        }
        fs::write(b.archive_dir.join("beta-20240101-000000.log"), b"kept").unwrap();
        fs::write(a.log_dir.join("alpha.log"), "a".repeat(2048)).unwrap();
        fs::write(b.log_dir.join("beta.log"), "b".repeat(2048)).unwrap();

        let report = RotationJob::new(a.clone()).run().unwrap();
        assert_eq!(report.rotated.len(), 1);
        assert!(archive_names(&a.archive_dir).is_empty());

        assert_eq!(fs::metadata(b.log_dir.join("beta.log")).unwrap().len(), 2048);
        assert_eq!(
            archive_names(&b.archive_dir),
            vec!["beta-20240101-000000.log".to_string()]
        );
    }

    #[test]
    fn test_missing_log_dir_still_enforces_retention() {
        let root = TempDir::new().unwrap();
        let mut config = service(root.path(), "ghost");
        config.retain_count = 1;
        fs::create_dir_all(&config.archive_dir).unwrap();
        for (i, name) in ["a.log", "b.log", "c.log"].iter().enumerate() {
            let path = config.archive_dir.join(name);
            fs::write(&path, b"old").unwrap();
            backdate(&path, 1000 - 100 * i as u64);
        }

        let report = RotationJob::new(config.clone()).run().unwrap();

        assert!(report.rotated.is_empty());
        assert!(report.failures.is_empty());
        assert_eq!(report.retention.deleted.len(), 2);
        assert_eq!(archive_names(&config.archive_dir), vec!["c.log".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unlistable_log_dir_is_a_failure_but_retention_runs() {
        let root = TempDir::new().unwrap();
        let mut config = service(root.path(), "locked");
        config.retain_count = 0;
        fs::create_dir_all(&config.archive_dir).unwrap();
        fs::write(config.archive_dir.join("old.log.gz"), b"old").unwrap();
        // a regular file where the directory should be
        fs::create_dir_all(config.log_dir.parent().unwrap()).unwrap();
        fs::write(&config.log_dir, b"not a directory").unwrap();

        let report = RotationJob::new(config.clone()).run().unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, config.log_dir);
        assert_eq!(report.retention.deleted.len(), 1);
        assert!(archive_names(&config.archive_dir).is_empty());
    }

    #[test]
    fn test_failing_file_does_not_stop_siblings() {
        let root = TempDir::new().unwrap();
        let mut config = service(root.path(), "mixed");
        config.max_size_mb = 0.001;
        config.compression = Compression::None;
        config.retain_count = 1;
        fs::create_dir_all(&config.log_dir).unwrap();
        fs::create_dir_all(&config.archive_dir).unwrap();
        let stale = config.archive_dir.join("mixed-20200101-000000.log");
        fs::write(&stale, b"stale").unwrap();
        backdate(&stale, 10_000);

        // listed, then removed before the pass reached it
        let vanished = config.log_dir.join("gone.log");
        let big = config.log_dir.join("big.log");
        fs::write(&big, "b".repeat(4096)).unwrap();

        let job = RotationJob::new(config.clone());
        let archiver = Archiver::for_service(&config).unwrap();
        let report = job
            .rotate_files(&archiver, Uuid::new_v4(), vec![vanished.clone(), big.clone()], Vec::new())
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, vanished);
        assert!(matches!(report.failures[0].error, Error::Io { .. }));
        assert_eq!(report.rotated.len(), 1);
        assert_eq!(report.rotated[0].source, big);
        assert_eq!(fs::metadata(&big).unwrap().len(), 0);
        assert_eq!(report.retention.deleted, vec![stale.clone()]);
        assert!(!stale.exists());
    }

    #[test]
    fn test_list_log_files_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        for name in ["b.log", "a.log", "c.log.1", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("dir.log")).unwrap();

        let files = list_log_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("a.log"), dir.path().join("b.log")]);
    }
}
