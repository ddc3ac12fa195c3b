//! # batchq-id
//!
//! Stable ID types, parsing, and validation for batchq clusters.
//!
//! ## Design Principles
//!
//! - Job IDs are system-generated; worker names are derived labels
//! - All IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//!
//! ## ID Format
//!
//! Job IDs use a prefixed format: `job_{ulid}`, for example
//! `job_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//!
//! The ULID payload is time-ordered, so sorting `JobId`s sorts jobs by
//! submission time. The cluster's retirement policy relies on this when
//! it retires the most recently submitted job first.
//!
//! Worker names are free-form labels (validated, not generated): the
//! join key between the cluster's plan and the workers the compute
//! scheduler reports as connected.

mod error;
mod types;

pub use error::IdError;
pub use types::{JobId, WorkerName};

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
