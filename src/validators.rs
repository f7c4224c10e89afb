//! Input validation and sanitization functions for portgate
//!
//! Every field that ends up on a packet filter command line passes through
//! here first. All functions are pure.

use crate::core::allocation::PortAllocation;
use crate::core::rule::{Protocol, RuleKind};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;

/// Sanitizes a rule description for safe storage and logging.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use portgate::validators::sanitize_description;
///
/// let safe = sanitize_description("Lobby players");
/// assert_eq!(safe, "Lobby players");
///
/// let unsafe_text = "Test\nNewline\"Quote";
/// let safe = sanitize_description(unsafe_text);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_description(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':'))
        .take(64)
        .collect()
}

/// Validates a remote address or network.
///
/// CIDR notation is tried first, then a bare address, which becomes a host
/// network (/32 or /128).
///
/// # Errors
///
/// Returns `Err` if the input is empty or neither form parses.
///
/// # Examples
///
/// ```
/// use portgate::validators::validate_address;
///
/// assert_eq!(validate_address("10.0.0.0/8").unwrap().prefix(), 8);
/// assert_eq!(validate_address("10.1.2.3").unwrap().prefix(), 32);
/// assert!(validate_address("10.0.0.300").is_err());
/// ```
pub fn validate_address(input: &str) -> Result<IpNetwork, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Address cannot be empty".to_string());
    }

    if input.contains('/') {
        return IpNetwork::from_str(input)
            .map_err(|e| format!("Invalid CIDR '{input}': {e}"));
    }

    IpAddr::from_str(input)
        .map(IpNetwork::from)
        .map_err(|_| format!("Invalid IP address or CIDR '{input}'"))
}

/// Validates a protocol token.
///
/// Accepts exactly `tcp` or `udp`; no case folding.
///
/// # Errors
///
/// Returns `Err` for any other token.
pub fn validate_protocol(input: &str) -> Result<Protocol, String> {
    Protocol::from_str(input).map_err(|_| format!("Protocol must be 'tcp' or 'udp', got '{input}'"))
}

/// Validates a rule kind token (`allow` or `block`).
///
/// # Errors
///
/// Returns `Err` for any other token.
pub fn validate_kind(input: &str) -> Result<RuleKind, String> {
    RuleKind::from_str(input).map_err(|_| format!("Kind must be 'allow' or 'block', got '{input}'"))
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is outside 1..=65535.
pub fn validate_port(port: u32) -> Result<u16, String> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(format!("Port must be between 1 and 65535, got {port}")),
    }
}

/// Validates a server identifier.
///
/// Identifiers are opaque but must be non-empty and free of whitespace and
/// control characters, since they appear in logs and the audit trail.
///
/// # Errors
///
/// Returns `Err` if the identifier is empty, longer than 128 bytes, or
/// contains whitespace/control characters.
pub fn validate_server_id(id: &str) -> Result<String, String> {
    if id.is_empty() {
        return Err("Server id cannot be empty".to_string());
    }

    if id.len() > 128 {
        return Err("Server id too long (max 128 characters)".to_string());
    }

    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("Server id contains whitespace or control characters".to_string());
    }

    Ok(id.to_string())
}

/// Validates that a port is currently assigned to a server.
///
/// # Errors
///
/// Returns `Err` if the port is invalid or not part of the allocation.
pub fn validate_allocated_port(allocation: &PortAllocation, port: u32) -> Result<u16, String> {
    let port = validate_port(port)?;
    if allocation.is_allocated(port) {
        Ok(port)
    } else {
        Err(format!("Port {port} is not allocated to this server"))
    }
}
