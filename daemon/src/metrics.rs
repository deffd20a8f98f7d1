use common::RotationReport;
use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-service counters for one service, as read back by `snapshot`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceCounters {
    pub passes: u64,
    pub failed_passes: u64,
    pub files_rotated: u64,
    pub file_failures: u64,
    pub archives_deleted: u64,
    pub skipped_fires: u64,
}

/// Rotation metrics collector with Prometheus-compatible output
pub struct MetricsCollector {
    passes: DashMap<String, AtomicU64>,
    failed_passes: DashMap<String, AtomicU64>,
    files_rotated: DashMap<String, AtomicU64>,
    file_failures: DashMap<String, AtomicU64>,
    archives_deleted: DashMap<String, AtomicU64>,
    skipped_fires: DashMap<String, AtomicU64>,
    pass_durations: DashMap<String, Vec<u64>>, // last 100 pass durations for percentiles
    textfile_lock: Mutex<()>,
}

fn bump(map: &DashMap<String, AtomicU64>, service: &str, by: u64) {
    map.entry(service.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(by, Ordering::Relaxed);
}

fn read(map: &DashMap<String, AtomicU64>, service: &str) -> u64 {
    map.get(service)
        .map(|v| v.load(Ordering::Relaxed))
        .unwrap_or(0)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            passes: DashMap::new(),
            failed_passes: DashMap::new(),
            files_rotated: DashMap::new(),
            file_failures: DashMap::new(),
            archives_deleted: DashMap::new(),
            skipped_fires: DashMap::new(),
            pass_durations: DashMap::new(),
            textfile_lock: Mutex::new(()),
        }
    }

    pub fn record_pass(&self, report: &RotationReport, duration_ms: u64) {
        let service = report.service.as_str();
        bump(&self.passes, service, 1);
        bump(&self.files_rotated, service, report.rotated.len() as u64);
        bump(&self.file_failures, service, report.failures.len() as u64);
        bump(&self.archives_deleted, service, report.retention.deleted.len() as u64);

        let mut durations = self.pass_durations
            .entry(service.to_string())
            .or_insert_with(Vec::new);
        durations.push(duration_ms);
        let len = durations.len();
        if len > 100 {
            durations.drain(0..len - 100);
        }
    }

    pub fn record_failed_pass(&self, service: &str) {
        bump(&self.passes, service, 1);
        bump(&self.failed_passes, service, 1);
    }

    pub fn record_skipped(&self, service: &str) {
        bump(&self.skipped_fires, service, 1);
    }

    pub fn snapshot(&self, service: &str) -> ServiceCounters {
        ServiceCounters {
            passes: read(&self.passes, service),
            failed_passes: read(&self.failed_passes, service),
            files_rotated: read(&self.files_rotated, service),
            file_failures: read(&self.file_failures, service),
            archives_deleted: read(&self.archives_deleted, service),
            skipped_fires: read(&self.skipped_fires, service),
        }
    }

    /// Generate Prometheus-compatible metrics output
    pub fn export(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("logwheel_rotation_passes_total", "Total number of rotation passes", &self.passes),
            ("logwheel_rotation_pass_failures_total", "Rotation passes that failed as a whole", &self.failed_passes),
            ("logwheel_files_rotated_total", "Log files moved into the archive", &self.files_rotated),
            ("logwheel_file_failures_total", "Log files whose rotation failed", &self.file_failures),
            ("logwheel_archives_deleted_total", "Archives removed by retention", &self.archives_deleted),
            ("logwheel_skipped_fires_total", "Fires skipped because the previous pass was still running", &self.skipped_fires),
        ];

        for (name, help, map) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            let mut rows: Vec<(String, u64)> = map
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect();
            rows.sort();
            for (service, value) in rows {
                output.push_str(&format!("{}{{service=\"{}\"}} {}\n", name, service, value));
            }
            output.push('\n');
        }

        output.push_str("# HELP logwheel_pass_duration_ms Rotation pass duration percentiles\n");
        output.push_str("# TYPE logwheel_pass_duration_ms gauge\n");
        let mut services: Vec<String> = self.pass_durations.iter().map(|e| e.key().clone()).collect();
        services.sort();
        for service in services {
            let Some(entry) = self.pass_durations.get(&service) else { continue };
            let mut durations = entry.value().clone();
            drop(entry);
            if durations.is_empty() {
                continue;
            }
            durations.sort_unstable();
            for (quantile, p) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
                output.push_str(&format!(
                    "logwheel_pass_duration_ms{{service=\"{}\",quantile=\"{}\"}} {}\n",
                    service, quantile, percentile(&durations, p)
                ));
            }
        }

        output
    }

    /// Rewrite the textfile atomically (write temp, then rename).
    pub fn write_textfile(&self, path: &Path) -> io::Result<()> {
        let _guard = self.textfile_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, self.export())?;
        fs::rename(&tmp, path)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let index = ((p / 100.0) * (sorted_data.len() as f64 - 1.0)).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}
