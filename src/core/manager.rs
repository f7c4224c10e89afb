//! Reconciliation engine
//!
//! The [`Manager`] keeps the enforcement chain in line with the rule store.
//! Every mutation runs under one process-wide writer lock, held across the
//! packet filter invocations, because concurrent inserts into a shared
//! ordered chain race on position. Read-only queries never take it.
//!
//! Rule lifecycle:
//!
//! - **create**: validate, insert, position, apply. An apply failure
//!   hard-deletes the new row, so nothing is left declared but unenforced.
//! - **update**: validate the merged rule, remove the old entry (best
//!   effort), save, apply. An apply failure is returned and the store keeps
//!   the update; `sync` reconciles it later.
//! - **delete**: remove the entry (best effort), tombstone the row.
//!
//! Identical rules share one chain entry. Removal paths leave an entry in
//! place while any other active rule still declares it.
//!
//! Bulk operations (sync, rebuild, cleanup, purge) never stop at a failing
//! rule. They report a [`BulkOutcome`] instead of an error.

use crate::audit::{AuditLog, EventType};
use crate::core::allocation::PortAllocation;
use crate::core::enforcement::EnforcementAdapter;
use crate::core::error::{Error, Result};
use crate::core::position::calculate_position;
use crate::core::rule::{DEFAULT_PRIORITY, NewRule, Protocol, Rule, RuleId, RulePatch, RuleRequest};
use crate::core::store::{RuleFilter, RuleStore};
use crate::validators;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Per-rule tally of a best-effort bulk operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BulkOutcome {
    fn record(&mut self, ok: bool) {
        self.attempted += 1;
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    fn merge(&mut self, other: BulkOutcome) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Outcome of [`Manager::rebuild_all_rules`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildOutcome {
    /// Servers with at least one active rule
    pub servers: usize,
    pub rules: BulkOutcome,
}

pub struct Manager {
    store: Arc<dyn RuleStore>,
    adapter: Arc<dyn EnforcementAdapter>,
    writer: Mutex<()>,
    audit: Option<AuditLog>,
}

impl Manager {
    pub fn new(store: Arc<dyn RuleStore>, adapter: Arc<dyn EnforcementAdapter>) -> Self {
        Self {
            store,
            adapter,
            writer: Mutex::new(()),
            audit: None,
        }
    }

    /// Records every mutation to `audit`
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    /// Validates, stores and enforces a new rule.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` for a malformed request, nothing is stored
    /// - `Error::Enforcement` if the rule could not be installed, the stored
    ///   row is removed again
    /// - `Error::Store` if the store fails
    pub async fn create_rule(&self, request: RuleRequest) -> Result<Rule> {
        let new_rule = match validate_request(&request) {
            Ok(rule) => rule,
            Err(e) => {
                self.audit_rejected(EventType::CreateRule, None, &request.server_id, &e)
                    .await;
                return Err(e);
            }
        };

        let _guard = self.writer.lock().await;
        let rule = self.store.insert(new_rule).await?;

        if let Err(e) = self.apply_unlocked(&rule).await {
            error!("Rolling back rule {}: {e}", rule.describe());
            if let Err(rollback) = self.store.hard_delete(rule.id).await {
                error!("Rollback of rule {} failed: {rollback}", rule.id);
            }
            self.audit_rule(EventType::CreateRule, &rule, Some(&e)).await;
            return Err(e);
        }

        info!("Created rule {}", rule.describe());
        self.audit_rule(EventType::CreateRule, &rule, None).await;
        Ok(rule)
    }

    /// Merges `patch` into rule `id` and re-enforces it.
    ///
    /// The patch is validated before anything changes. If the new entry
    /// cannot be installed the error is returned while the store keeps the
    /// update; the rule is then declared but not enforced until the next
    /// successful sync.
    ///
    /// # Errors
    ///
    /// `Error::NotFound`, `Error::Validation`, `Error::Enforcement` or
    /// `Error::Store`.
    pub async fn update_rule(&self, id: RuleId, patch: RulePatch) -> Result<Rule> {
        let _guard = self.writer.lock().await;
        let existing = self.store.get(id).await?;

        let updated = match merge_patch(&existing, &patch) {
            Ok(rule) => rule,
            Err(e) => {
                self.audit_rejected(EventType::UpdateRule, Some(id), &existing.server_id, &e)
                    .await;
                return Err(e);
            }
        };

        self.remove_unlocked(&existing, &HashSet::new()).await;
        self.store.save(&updated).await?;

        if let Err(e) = self.apply_unlocked(&updated).await {
            error!(
                "Rule {} updated in store but not enforced, run sync for {}: {e}",
                updated.describe(),
                updated.server_id
            );
            self.audit_rule(EventType::UpdateRule, &updated, Some(&e)).await;
            return Err(e);
        }

        info!("Updated rule {}", updated.describe());
        self.audit_rule(EventType::UpdateRule, &updated, None).await;
        Ok(updated)
    }

    /// Removes rule `id` from enforcement (best effort) and tombstones it.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` for unknown or already deleted rules, `Error::Store`
    /// if the tombstone cannot be written.
    pub async fn delete_rule(&self, id: RuleId) -> Result<()> {
        let _guard = self.writer.lock().await;
        let rule = self.store.get(id).await?;

        self.remove_unlocked(&rule, &HashSet::new()).await;
        if let Err(e) = self.store.soft_delete(id).await {
            let e = Error::from(e);
            self.audit_rule(EventType::DeleteRule, &rule, Some(&e)).await;
            return Err(e);
        }

        info!("Deleted rule {}", rule.describe());
        self.audit_rule(EventType::DeleteRule, &rule, None).await;
        Ok(())
    }

    /// Re-applies every active rule of one server.
    ///
    /// # Errors
    ///
    /// Only if the store cannot be read; enforcement failures are counted.
    pub async fn sync_rules(&self, server_id: &str) -> Result<BulkOutcome> {
        let _guard = self.writer.lock().await;
        let rules = self.store.active_rules(&RuleFilter::server(server_id)).await?;

        let outcome = self.sync_unlocked(rules).await;
        info!(
            "Synced server {server_id}: {} applied, {} failed",
            outcome.succeeded, outcome.failed
        );
        self.audit_bulk(EventType::SyncServer, Some(server_id), outcome)
            .await;
        Ok(outcome)
    }

    /// Re-applies every active rule of every server.
    ///
    /// Used at startup: the store is the source of truth and the chain may
    /// be empty or stale after a reboot.
    ///
    /// # Errors
    ///
    /// Only if the store cannot be read.
    pub async fn rebuild_all_rules(&self) -> Result<RebuildOutcome> {
        let _guard = self.writer.lock().await;
        let rules = self.store.active_rules(&RuleFilter::all()).await?;

        let mut by_server: BTreeMap<String, Vec<Rule>> = BTreeMap::new();
        for rule in rules {
            by_server.entry(rule.server_id.clone()).or_default().push(rule);
        }

        let mut result = RebuildOutcome {
            servers: by_server.len(),
            rules: BulkOutcome::default(),
        };
        for (server_id, rules) in by_server {
            let outcome = self.sync_unlocked(rules).await;
            if !outcome.is_clean() {
                warn!("Rebuild of server {server_id}: {} of {} rules failed", outcome.failed, outcome.attempted);
            }
            result.rules.merge(outcome);
        }

        info!(
            "Rebuilt {} rules across {} servers ({} failed)",
            result.rules.succeeded, result.servers, result.rules.failed
        );
        self.audit_bulk(EventType::RebuildAll, None, result.rules)
            .await;
        Ok(result)
    }

    /// Removes and tombstones every rule of `server_id` whose port is not in
    /// `valid_ports`.
    ///
    /// Only out-of-allocation rules are attempted. A rule counts as failed
    /// if its entry could not be removed or its row could not be tombstoned.
    ///
    /// # Errors
    ///
    /// Only if the store cannot be read.
    pub async fn cleanup_invalid_port_rules(
        &self,
        server_id: &str,
        valid_ports: &HashSet<u16>,
    ) -> Result<BulkOutcome> {
        let _guard = self.writer.lock().await;
        let rules = self.store.active_rules(&RuleFilter::server(server_id)).await?;

        let stale: Vec<&Rule> = rules
            .iter()
            .filter(|r| !valid_ports.contains(&r.port))
            .collect();
        let leaving: HashSet<RuleId> = stale.iter().map(|r| r.id).collect();

        let mut outcome = BulkOutcome::default();
        for rule in stale {
            let removed = self.remove_unlocked(rule, &leaving).await;
            let tombstoned = match self.store.soft_delete(rule.id).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to delete stale rule {}: {e}", rule.describe());
                    false
                }
            };
            info!("Cleaned up rule {} (port no longer allocated)", rule.describe());
            outcome.record(removed && tombstoned);
        }

        self.audit_bulk(EventType::CleanupPorts, Some(server_id), outcome)
            .await;
        Ok(outcome)
    }

    /// [`cleanup_invalid_port_rules`](Self::cleanup_invalid_port_rules) against
    /// the ports of `allocation`.
    ///
    /// # Errors
    ///
    /// Only if the store cannot be read.
    pub async fn cleanup_unallocated(
        &self,
        server_id: &str,
        allocation: &PortAllocation,
    ) -> Result<BulkOutcome> {
        self.cleanup_invalid_port_rules(server_id, &allocation.valid_ports())
            .await
    }

    /// Removes every rule of a server from enforcement and tombstones them.
    ///
    /// # Errors
    ///
    /// If the store cannot be read or the bulk tombstone fails.
    pub async fn delete_all_rules_for_server(&self, server_id: &str) -> Result<BulkOutcome> {
        let _guard = self.writer.lock().await;
        let rules = self.store.active_rules(&RuleFilter::server(server_id)).await?;

        let leaving: HashSet<RuleId> = rules.iter().map(|r| r.id).collect();
        let mut outcome = BulkOutcome::default();
        for rule in &rules {
            outcome.record(self.remove_unlocked(rule, &leaving).await);
        }

        let deleted = self.store.soft_delete_server(server_id).await?;
        info!(
            "Purged {deleted} rules of server {server_id} ({} enforcement removals failed)",
            outcome.failed
        );
        self.audit_bulk(EventType::PurgeServer, Some(server_id), outcome)
            .await;
        Ok(outcome)
    }

    // ── Queries (no writer lock) ────────────────────────────────────────────

    /// Active rules of one server in declared order
    pub async fn rules(&self, server_id: &str) -> Result<Vec<Rule>> {
        Ok(self.store.active_rules(&RuleFilter::server(server_id)).await?)
    }

    /// Active rules of every server in declared order
    pub async fn all_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.store.active_rules(&RuleFilter::all()).await?)
    }

    pub async fn rule(&self, id: RuleId) -> Result<Rule> {
        Ok(self.store.get(id).await?)
    }

    pub async fn rules_by_port(&self, server_id: &str, port: u16) -> Result<Vec<Rule>> {
        Ok(self
            .store
            .active_rules(&RuleFilter::port(server_id, port))
            .await?)
    }

    /// Whether rule `id` is currently present on the enforcement surface
    ///
    /// # Errors
    ///
    /// `Error::NotFound` for unknown rules, `Error::Enforcement` if the
    /// surface cannot be queried.
    pub async fn enforcement_status(&self, id: RuleId) -> Result<bool> {
        let rule = self.store.get(id).await?;
        Ok(self.adapter.exists(&rule).await?)
    }

    // ── Lock-held internals ─────────────────────────────────────────────────

    /// Positions and applies one rule. Caller holds the writer lock.
    async fn apply_unlocked(&self, rule: &Rule) -> Result<()> {
        let position = calculate_position(self.store.as_ref(), self.adapter.as_ref(), rule).await?;
        self.adapter.apply(rule, position).await?;
        Ok(())
    }

    /// Best-effort removal, returns whether it succeeded. Caller holds the
    /// writer lock.
    ///
    /// `leaving` holds the ids removed by the same operation; they do not
    /// keep a shared entry alive.
    async fn remove_unlocked(&self, rule: &Rule, leaving: &HashSet<RuleId>) -> bool {
        if let Some(owner) = self.entry_owner(rule, leaving).await {
            info!(
                "Keeping entry of rule {}, still declared by rule {owner}",
                rule.describe()
            );
            return true;
        }
        match self.adapter.remove(rule).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not remove rule {} from enforcement: {e}", rule.describe());
                false
            }
        }
    }

    /// Another active rule enforced by the same chain entry as `rule`.
    ///
    /// Entries carry no server id, so rules of every server are considered.
    /// If the store cannot be read the entry is treated as unshared.
    async fn entry_owner(&self, rule: &Rule, leaving: &HashSet<RuleId>) -> Option<RuleId> {
        let filter = RuleFilter {
            server_id: None,
            port: Some(rule.port),
            protocol: Some(rule.protocol),
        };
        let candidates = match self.store.active_rules(&filter).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Could not check shared entry of rule {}: {e}", rule.describe());
                return None;
            }
        };
        candidates
            .iter()
            .find(|r| {
                r.id != rule.id
                    && !leaving.contains(&r.id)
                    && r.remote == rule.remote
                    && r.kind == rule.kind
            })
            .map(|r| r.id)
    }

    /// Applies rules in declared order, one match key at a time. Caller
    /// holds the writer lock.
    ///
    /// Inserting a key's cohort consecutively keeps its relative order even
    /// when other keys of the same server interleave by priority.
    async fn sync_unlocked(&self, mut rules: Vec<Rule>) -> BulkOutcome {
        // stable, so declared order survives inside each key
        rules.sort_by(|a, b| {
            a.server_id
                .cmp(&b.server_id)
                .then(a.port.cmp(&b.port))
                .then(a.protocol.as_str().cmp(b.protocol.as_str()))
        });

        let mut outcome = BulkOutcome::default();
        for rule in &rules {
            match self.apply_unlocked(rule).await {
                Ok(()) => outcome.record(true),
                Err(e) => {
                    error!("Failed to apply rule {}: {e}", rule.describe());
                    outcome.record(false);
                }
            }
        }
        outcome
    }

    // ── Audit ───────────────────────────────────────────────────────────────

    async fn audit_rule(&self, event_type: EventType, rule: &Rule, error: Option<&Error>) {
        if let Some(audit) = &self.audit {
            audit
                .log_rule(event_type, rule, error.is_none(), error.map(ToString::to_string))
                .await;
        }
    }

    async fn audit_rejected(
        &self,
        event_type: EventType,
        id: Option<RuleId>,
        server_id: &str,
        error: &Error,
    ) {
        if let Some(audit) = &self.audit {
            audit
                .log_rejected(event_type, id, server_id, error.to_string())
                .await;
        }
    }

    async fn audit_bulk(&self, event_type: EventType, server_id: Option<&str>, outcome: BulkOutcome) {
        if let Some(audit) = &self.audit {
            audit
                .log_bulk(
                    event_type,
                    server_id,
                    outcome.attempted,
                    outcome.succeeded,
                    outcome.failed,
                )
                .await;
        }
    }
}

/// Turns a raw create request into a storable rule, applying defaults
/// (tcp, priority 100).
fn validate_request(request: &RuleRequest) -> Result<NewRule> {
    let server_id = validators::validate_server_id(&request.server_id)
        .map_err(|e| Error::validation("server_id", e))?;
    let remote =
        validators::validate_address(&request.remote).map_err(|e| Error::validation("remote", e))?;
    let port = validators::validate_port(request.port).map_err(|e| Error::validation("port", e))?;
    let protocol = match request.protocol.as_deref() {
        None | Some("") => Protocol::default(),
        Some(p) => validators::validate_protocol(p).map_err(|e| Error::validation("protocol", e))?,
    };
    let kind = validators::validate_kind(&request.kind).map_err(|e| Error::validation("kind", e))?;
    let priority = if request.priority == 0 {
        DEFAULT_PRIORITY
    } else {
        request.priority
    };

    Ok(NewRule {
        server_id,
        remote,
        port,
        protocol,
        kind,
        priority,
        description: validators::sanitize_description(&request.description),
    })
}

/// Applies the set fields of `patch` on top of `existing`
fn merge_patch(existing: &Rule, patch: &RulePatch) -> Result<Rule> {
    let mut rule = existing.clone();

    if let Some(remote) = patch.remote() {
        rule.remote =
            validators::validate_address(remote).map_err(|e| Error::validation("remote", e))?;
    }
    if let Some(port) = patch.port() {
        rule.port = validators::validate_port(port).map_err(|e| Error::validation("port", e))?;
    }
    if let Some(protocol) = patch.protocol() {
        rule.protocol =
            validators::validate_protocol(protocol).map_err(|e| Error::validation("protocol", e))?;
    }
    if let Some(kind) = patch.kind() {
        rule.kind = validators::validate_kind(kind).map_err(|e| Error::validation("kind", e))?;
    }
    if let Some(priority) = patch.priority() {
        rule.priority = priority;
    }
    if let Some(description) = patch.description() {
        rule.description = validators::sanitize_description(description);
    }

    Ok(rule)
}
