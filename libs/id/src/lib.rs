//! # mansion-id
//!
//! Identifier types shared by the provisioning controller.
//!
//! ## ID Format
//!
//! Runtime objects created by the controller (allocations, live nodes) use a
//! prefixed ULID: `{prefix}_{ulid}`.
//!
//! Examples:
//! - `alloc_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! The prefix keeps the two kinds apart in logs and in the status view, and
//! the ULID makes them sort by creation time.
//!
//! Templates are named by operators in configuration, so [`TemplateId`] is a
//! validated name rather than a generated ULID.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
