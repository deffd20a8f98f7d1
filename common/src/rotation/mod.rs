//! Size-triggered rotation: size policy, archive naming, compression,
//! retention and the per-service pass that ties them together.

pub mod archive;
pub mod compress;
pub mod job;
pub mod naming;
pub mod retention;
pub mod size;

pub use archive::Archiver;
pub use job::{list_log_files, FileFailure, RotatedFile, RotationJob, RotationReport};
pub use naming::{ArchiveNamer, TIMESTAMP_FORMAT};
pub use retention::RetentionReport;
pub use size::should_rotate;
