pub mod config;
pub mod error;
pub mod rotation;
pub mod schedule;

pub use config::{Compression, EnvironmentConfig, FileNaming, RejectedService, ServiceConfig, ValidatedServices};
pub use error::{Error, IoContext, Result};
pub use rotation::{RotationJob, RotationReport};
pub use schedule::{compute_next_fire, parse_cron, parse_timezone, CronExpr};

/// Only files with this extension are ever rotated.
pub const LOG_EXTENSION: &str = "log";
pub const BYTES_PER_MB: u64 = 1024 * 1024;

pub const DEFAULT_CONFIG_DIR: &str = "config/";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_TIMEZONE: &str = "UTC";

// Daemon settings, FHS locations first
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/logwheel/settings.yaml";
pub const USER_SETTINGS_PATH: &str = "logwheel.yaml";
