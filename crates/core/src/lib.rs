//! Domain constants, enums, and pure helpers shared by the widget store
//! and its maintenance tooling. No I/O lives here.

pub mod access;
pub mod error;
pub mod pagination;
pub mod types;
pub mod widget_filter;
pub mod widget_types;
