use std::time::Duration;
use thiserror::Error;

/// Core error types for portgate
#[derive(Debug, Error)]
pub enum Error {
    /// Input validation failed (address, protocol, port, kind)
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Unknown rule or server
    #[error("Not found: {0}")]
    NotFound(String),

    /// Packet filter command failed
    #[error("Enforcement error: {0}")]
    Enforcement(#[from] EnforcementError),

    /// Rule store failure, passed through
    #[error("Store error: {0}")]
    Store(StoreError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be used
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { id } => Error::NotFound(format!("rule {id}")),
            other => Error::Store(other),
        }
    }
}

/// Rule store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rule {id} not found")]
    NotFound { id: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store corrupted: {0}")]
    Corrupted(String),
}

/// Packet filter invocation errors.
///
/// None of these are retried at the adapter layer.
#[derive(Debug, Error)]
pub enum EnforcementError {
    /// Process could not be started (binary missing, elevation unavailable)
    #[error("failed to run `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// Process ended without an exit code
    #[error("`{command}` was killed{}", signal_suffix(.signal))]
    Killed {
        command: String,
        signal: Option<i32>,
    },

    #[error("`{command}` exited with {}: {}", exit_status(.code), .stderr.trim())]
    Exit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn signal_suffix(signal: &Option<i32>) -> String {
    signal.map(|s| format!(" by signal {s}")).unwrap_or_default()
}

fn exit_status(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown status".to_string(), |c| format!("status {c}"))
}

impl EnforcementError {
    /// Captured diagnostic output, if the process produced any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            EnforcementError::Exit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Whether the packet filter refused a delete because no matching entry
    /// exists. Any other exit, permission and lock failures included, means
    /// the entry may still be live.
    pub fn is_absent_entry(&self) -> bool {
        matches!(
            self,
            EnforcementError::Exit { code: Some(1), stderr, .. }
                if stderr.contains("Bad rule") || stderr.contains("does a matching rule exist")
        )
    }

    pub fn command(&self) -> &str {
        match self {
            EnforcementError::Spawn { command, .. }
            | EnforcementError::Timeout { command, .. }
            | EnforcementError::Killed { command, .. }
            | EnforcementError::Exit { command, .. } => command,
        }
    }

    /// Translated operator hint for logs
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            EnforcementError::Exit { stderr, .. } => IptablesErrorPattern::match_error(stderr),
            EnforcementError::Spawn { reason, .. } => IptablesErrorPattern::match_error(reason),
            EnforcementError::Timeout { .. } => IptablesErrorPattern::match_error("timed out"),
            EnforcementError::Killed { .. } => {
                ErrorTranslation::new("Packet filter command was terminated unexpectedly")
                    .with_suggestion("Check for OOM kills or a supervisor restarting the host")
            }
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify packet filter rules")
                .with_suggestion("Run portgate as root or set enforcement.elevation to sudo/run0")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("xtables lock") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Enable enforcement.wait_for_lock so iptables waits with -w")
                .with_suggestion("Check for Docker or firewalld reloading rules concurrently");
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use proper IP format: 192.168.1.1 or 192.168.1.0/24");
        }

        if lower.contains("no such file") || lower.contains("not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or point enforcement.ipv4_command at the binary");
        }

        if lower.contains("table does not exist") || lower.contains("can't initialize") {
            return ErrorTranslation::new("The raw table is not available on this kernel")
                .with_suggestion("Load the module: sudo modprobe iptable_raw")
                .with_suggestion("For IPv6 rules: sudo modprobe ip6table_raw");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match extension not found")
                .with_suggestion("Verify enforcement.chain exists in enforcement.table")
                .with_suggestion("Check kernel modules: lsmod | grep xt_");
        }

        if lower.contains("index of insertion too big") {
            return ErrorTranslation::new("Insert position is past the end of the chain")
                .with_suggestion("The chain changed while rules were being positioned")
                .with_suggestion("Run `portgate sync <server>` to reconcile");
        }

        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("Rule is not present in the chain")
                .with_suggestion("The rule was removed outside portgate; nothing to delete");
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Packet filter command timed out")
                .with_suggestion("Check system load: uptime")
                .with_suggestion("Check whether another process holds the xtables lock");
        }

        ErrorTranslation::new(format!("Packet filter error: {msg}"))
            .with_suggestion("Verify iptables is working: sudo iptables -t raw -S PREROUTING")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
