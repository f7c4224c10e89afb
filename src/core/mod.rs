//! Core rule reconciliation functionality
//!
//! This module contains the types and logic that keep declared access rules
//! and the host packet filter in agreement. It provides:
//!
//! - [`rule`]: Declared rules, match keys and client request types
//! - [`store`]: The rule store interface and an in-memory store
//! - [`json_store`]: Durable file-backed rule store
//! - [`allocation`]: Port allocations used by cleanup
//! - [`enforcement`]: Packet filter adapters (iptables, no-op)
//! - [`position`]: Insert position of a rule in the live chain
//! - [`manager`]: The reconciliation engine
//! - [`error`]: Error types for all of the above

pub mod allocation;
pub mod enforcement;
pub mod error;
pub mod json_store;
pub mod manager;
pub mod position;
pub mod rule;
pub mod store;

#[cfg(test)]
pub mod test_helpers;
