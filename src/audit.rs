/// Audit logging for rule mutations
///
/// Every mutating Manager operation (create, update, delete, sync, rebuild,
/// cleanup, purge) is recorded as one JSON object per line. Audit failures
/// are logged and never fail the operation itself.
use crate::core::rule::{Rule, RuleId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CreateRule,
    UpdateRule,
    DeleteRule,
    SyncServer,
    RebuildAll,
    CleanupPorts,
    PurgeServer,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Creates an audit log writing to `path`
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        if let Some(parent) = self.log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Writes an event, downgrading failures to a warning
    pub async fn record(
        &self,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        let event = AuditEvent::new(event_type, success, details, error);
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Logs a single-rule mutation
    pub async fn log_rule(
        &self,
        event_type: EventType,
        rule: &Rule,
        success: bool,
        error: Option<String>,
    ) {
        self.record(
            event_type,
            success,
            serde_json::json!({
                "rule_id": rule.id,
                "server_id": rule.server_id,
                "remote": rule.remote.to_string(),
                "port": rule.port,
                "protocol": rule.protocol.as_str(),
                "kind": rule.kind.as_str(),
                "priority": rule.priority,
            }),
            error,
        )
        .await;
    }

    /// Logs a rejected request that never produced a stored rule
    pub async fn log_rejected(
        &self,
        event_type: EventType,
        rule_id: Option<RuleId>,
        server_id: &str,
        error: String,
    ) {
        self.record(
            event_type,
            false,
            serde_json::json!({
                "rule_id": rule_id,
                "server_id": server_id,
            }),
            Some(error),
        )
        .await;
    }

    /// Logs a bulk operation outcome
    pub async fn log_bulk(
        &self,
        event_type: EventType,
        server_id: Option<&str>,
        attempted: usize,
        succeeded: usize,
        failed: usize,
    ) {
        self.record(
            event_type,
            failed == 0,
            serde_json::json!({
                "server_id": server_id,
                "attempted": attempted,
                "succeeded": succeeded,
                "failed": failed,
            }),
            None,
        )
        .await;
    }
}
