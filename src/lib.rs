//! portgate - per-server port access rules for containerized game servers
//!
//! Keeps a declarative, store-backed set of allow/block rules (remote
//! address, port, protocol) enforced on the host packet filter, ahead of
//! Docker's port translation.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, rule store, enforcement adapters and the reconciliation engine
//! - [`audit`] - Audit logging for every rule mutation
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privilege elevation for packet filter commands
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Idempotent applies: an entry is only inserted when a check finds none
//! - Full rollback of a create whose enforcement fails
//! - Single writer lock around every chain mutation
//! - Bounded packet filter invocations (5s checks, 10s changes)
//! - Atomic store writes with SHA-256 checksums and 0o600 permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::manager::{BulkOutcome, Manager};
pub use core::rule::{Protocol, Rule, RuleKind};
