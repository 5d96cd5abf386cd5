//! Domain model structs and DTOs.
//!
//! Each submodule contains:
//! - The stored entity struct with its hash-field codec (`to_fields` / `from_fields`)
//! - `Deserialize` create/update DTOs where the entity is written by callers

mod fields;

pub mod stats;
pub mod submission;
pub mod widget;

pub(crate) use fields::encode_timestamp;
