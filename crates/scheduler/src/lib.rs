pub mod health;
pub mod journal;
pub mod scheduler;

pub use health::{HealthMonitor, HealthSnapshot, MaintenanceTarget, SystemStats};
pub use journal::RollingJournal;
pub use scheduler::{JobCounts, SelfHealingScheduler};
