// Classroom Scores - Core Library
// Exposes all modules for use in the CLI, the API server and tests

pub mod config;
pub mod error;
pub mod db;
pub mod parser;
pub mod reconciliation;
pub mod stats;
pub mod chart;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use config::{init_tracing, AppConfig};
pub use error::ImportError;
pub use db::{
    Student, Subject, Score, ScoreRecord, UploadEvent,
    open_database, setup_database,
    find_or_create_student, find_or_create_subject, upsert_score,
    load_relation, get_upload_events,
};
pub use parser::{Cell, FileKind, Table, TableParser, get_parser, parse_upload};
pub use reconciliation::{
    Layout, ScoreTriple, NormalizedUpload, ImportReport,
    detect_layout, normalize, import_upload,
};
pub use stats::{
    SubjectStat, StudentStat, TopPerformer, SubjectMean, SubjectExtremes,
    build_relation, per_subject_stats, per_student_stats, top_performer, subject_extremes,
};
pub use chart::render_subject_mean_chart;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
