pub mod history;
pub mod models;
pub mod orchestrator;
pub mod refresher;
pub mod runner;

pub use history::{ExternalBackup, HistoryStore, StatusFilter};
pub use models::{BackupRequest, BackupStatus, JobRecord, RecordError};
pub use orchestrator::{BackupSlot, Orchestrator, Running};
pub use refresher::HistoryRefresher;
pub use runner::BackupRunner;
