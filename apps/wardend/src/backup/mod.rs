mod manifest;
pub mod retention;
mod scheduler;
mod vault;

pub use manifest::{FsCopier, TreeCopier};
pub use retention::RetentionConfig;
pub use scheduler::{ScheduleSettings, ScheduleTarget, ScheduledRun, Scheduler};
pub use vault::BackupVault;
