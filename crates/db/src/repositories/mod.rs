//! Repository layer.
//!
//! Each repository is a zero-sized struct with async methods that take a
//! `&Store` as the first argument.

pub mod index_rebuild;
pub mod stats_repo;
pub mod submission_repo;
pub mod widget_index;
pub mod widget_loader;
pub mod widget_query;
pub mod widget_repo;

pub use index_rebuild::{IndexRebuild, IndexSnapshot, RebuildReport};
pub use stats_repo::StatsRepo;
pub use submission_repo::SubmissionRepo;
pub use widget_index::{ReconcileReport, WidgetIndex};
pub use widget_loader::WidgetLoader;
pub use widget_query::{IdPage, WidgetQuery};
pub use widget_repo::WidgetRepo;
