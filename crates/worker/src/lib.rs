//! Background maintenance for the widget store.
//!
//! The worker runs inside the process that owns the store: it takes that
//! process's [`WidgetService`](widgetry_db::WidgetService) and is started
//! with [`Maintenance::spawn`](maintenance::Maintenance::spawn).
//!
//! - [`config`]: environment-driven worker configuration.
//! - [`maintenance`]: the periodic loop draining the index reconciliation
//!   outbox, optionally rebuilding indexes, and sweeping expired keys.

pub mod config;
pub mod maintenance;
