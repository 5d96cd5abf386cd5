/// Widgets and submissions are keyed by time-ordered UUIDs (v7).
pub type WidgetId = uuid::Uuid;

/// Submission identifier.
pub type SubmissionId = uuid::Uuid;

/// Owner identifiers are opaque strings issued by the auth layer.
pub type OwnerId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
