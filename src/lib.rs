// Ledger Desk - Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod error;
pub mod config;
pub mod db;
pub mod storage;
pub mod auth;
pub mod context;
pub mod ledger;         // Amount parsing + debit/credit totals
pub mod csv_export;     // Macedonian-header CSV writer
pub mod files;          // Upload gate, storage keys, file rows
pub mod records;        // Ledger lines produced by processing
pub mod clients;        // Invitation token lifecycle
pub mod merge;          // Merge jobs + merge statistics
pub mod routes;         // Page table + navigation guard

#[cfg(feature = "server")]
pub mod processing;     // Remote process-file function

// Re-export commonly used types
pub use error::{AppError, AppResult, InvitationError};
pub use config::Config;
pub use db::{setup_database, insert_event, get_events_for_entity, Event};
pub use storage::{LocalObjectStore, ObjectStore, UrlSigner, EXPORTS_BUCKET, UPLOADS_BUCKET};
pub use auth::{AuthSettings, Profile, ProfileUpdate, Role, Session, SignUpMetadata};
pub use context::{open_database, open_store, AppContext};
pub use ledger::{parse_amount, SourceTotals};
pub use files::{FileFilters, FileRow, FileStatus};
pub use records::{ListOptions, NewRecord, Record, RecordPage, RecordStats, RecordWithSource, SortField};
pub use clients::{ClientRelationship, RelationshipStatus, RelationshipWithProfile};
pub use merge::{
    calculate_merge_stats, MergeJob, MergeJobDetail, MergeJobFile, MergeJobStatus,
    MergeResult, MergeStats, MergedRecord,
};
pub use routes::{guard, GuardDecision};

#[cfg(feature = "server")]
pub use processing::{FileProcessor, ProcessOutcome, RemoteFunctionProcessor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
