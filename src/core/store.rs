//! Rule store interface and an in-memory implementation
//!
//! The store is the durable source of truth. Rows are soft-deleted by
//! setting `deleted_at`; every read filters tombstoned rows explicitly and
//! returns rules in declared order (see [`declared_order`]).

use crate::core::error::StoreError;
use crate::core::rule::{MatchKey, NewRule, Protocol, Rule, RuleId, declared_order};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Selects active rules by any combination of server, port and protocol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub server_id: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
}

impl RuleFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn server(server_id: &str) -> Self {
        Self {
            server_id: Some(server_id.to_string()),
            ..Self::default()
        }
    }

    pub fn port(server_id: &str, port: u16) -> Self {
        Self {
            server_id: Some(server_id.to_string()),
            port: Some(port),
            protocol: None,
        }
    }

    pub fn match_key(key: &MatchKey) -> Self {
        Self {
            server_id: Some(key.server_id.clone()),
            port: Some(key.port),
            protocol: Some(key.protocol),
        }
    }

    /// Tombstoned rules never match.
    pub fn matches(&self, rule: &Rule) -> bool {
        rule.is_active()
            && self.server_id.as_deref().is_none_or(|s| s == rule.server_id)
            && self.port.is_none_or(|p| p == rule.port)
            && self.protocol.is_none_or(|p| p == rule.protocol)
    }
}

/// Durable CRUD over declared rules.
///
/// `get`, `save`, `soft_delete` and `hard_delete` fail with
/// [`StoreError::NotFound`] for unknown or tombstoned ids.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Persists a new rule, assigning its id and creation time
    async fn insert(&self, rule: NewRule) -> StoreResult<Rule>;

    async fn get(&self, id: RuleId) -> StoreResult<Rule>;

    /// Overwrites the mutable fields of an existing active rule
    async fn save(&self, rule: &Rule) -> StoreResult<()>;

    async fn soft_delete(&self, id: RuleId) -> StoreResult<()>;

    /// Tombstones every active rule of a server, returns how many
    async fn soft_delete_server(&self, server_id: &str) -> StoreResult<usize>;

    /// Physically removes a row (create rollback)
    async fn hard_delete(&self, id: RuleId) -> StoreResult<()>;

    /// Active rules matching `filter`, in declared order
    async fn active_rules(&self, filter: &RuleFilter) -> StoreResult<Vec<Rule>>;
}

/// Rows shared by the in-memory and file-backed stores
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct RuleTable {
    pub next_id: RuleId,
    pub rules: BTreeMap<RuleId, Rule>,
}

impl RuleTable {
    pub fn insert(&mut self, rule: NewRule) -> Rule {
        self.next_id += 1;
        let rule = rule.into_rule(self.next_id, Utc::now());
        self.rules.insert(rule.id, rule.clone());
        rule
    }

    pub fn get(&self, id: RuleId) -> StoreResult<&Rule> {
        self.rules
            .get(&id)
            .filter(|r| r.is_active())
            .ok_or(StoreError::NotFound { id })
    }

    fn get_mut(&mut self, id: RuleId) -> StoreResult<&mut Rule> {
        self.rules
            .get_mut(&id)
            .filter(|r| r.is_active())
            .ok_or(StoreError::NotFound { id })
    }

    pub fn save(&mut self, rule: &Rule) -> StoreResult<()> {
        let stored = self.get_mut(rule.id)?;
        // identity, creation time and tombstone are owned by the store
        let (id, created_at) = (stored.id, stored.created_at);
        *stored = Rule {
            id,
            created_at,
            deleted_at: None,
            ..rule.clone()
        };
        Ok(())
    }

    pub fn soft_delete(&mut self, id: RuleId) -> StoreResult<()> {
        self.get_mut(id)?.deleted_at = Some(Utc::now());
        Ok(())
    }

    pub fn soft_delete_server(&mut self, server_id: &str) -> usize {
        let now = Utc::now();
        let mut count = 0;
        for rule in self.rules.values_mut() {
            if rule.is_active() && rule.server_id == server_id {
                rule.deleted_at = Some(now);
                count += 1;
            }
        }
        count
    }

    pub fn hard_delete(&mut self, id: RuleId) -> StoreResult<()> {
        self.rules
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound { id })
    }

    pub fn active(&self, filter: &RuleFilter) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .rules
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rules.sort_by(declared_order);
        rules
    }
}

/// In-process rule store
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<RuleTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row including tombstoned ones, for inspection
    pub fn all_rows(&self) -> Vec<Rule> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.rules.values().cloned().collect()
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn insert(&self, rule: NewRule) -> StoreResult<Rule> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        Ok(table.insert(rule))
    }

    async fn get(&self, id: RuleId) -> StoreResult<Rule> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.get(id).cloned()
    }

    async fn save(&self, rule: &Rule) -> StoreResult<()> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.save(rule)
    }

    async fn soft_delete(&self, id: RuleId) -> StoreResult<()> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.soft_delete(id)
    }

    async fn soft_delete_server(&self, server_id: &str) -> StoreResult<usize> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        Ok(table.soft_delete_server(server_id))
    }

    async fn hard_delete(&self, id: RuleId) -> StoreResult<()> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.hard_delete(id)
    }

    async fn active_rules(&self, filter: &RuleFilter) -> StoreResult<Vec<Rule>> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        Ok(table.active(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::RuleKind;

    fn new_rule(server: &str, port: u16, priority: i32) -> NewRule {
        NewRule {
            server_id: server.to_string(),
            remote: "10.0.0.1".parse().unwrap(),
            port,
            protocol: Protocol::Tcp,
            kind: RuleKind::Allow,
            priority,
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.insert(new_rule("s1", 80, 100)).await.unwrap();
        let b = store.insert(new_rule("s1", 80, 100)).await.unwrap();

        assert!(b.id > a.id);
        assert!(a.is_active());
        assert_eq!(store.get(a.id).await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_active_rules_are_in_declared_order() {
        let store = MemoryStore::new();
        store.insert(new_rule("s1", 80, 30)).await.unwrap();
        store.insert(new_rule("s1", 80, 10)).await.unwrap();
        store.insert(new_rule("s1", 80, 20)).await.unwrap();
        store.insert(new_rule("s1", 80, 10)).await.unwrap();

        let rules = store.active_rules(&RuleFilter::server("s1")).await.unwrap();
        let priorities: Vec<i32> = rules.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![10, 10, 20, 30]);
        // equal priority keeps arrival order
        assert!(rules[0].id < rules[1].id);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_rule() {
        let store = MemoryStore::new();
        let rule = store.insert(new_rule("s1", 80, 100)).await.unwrap();

        store.soft_delete(rule.id).await.unwrap();

        assert!(matches!(
            store.get(rule.id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.active_rules(&RuleFilter::all()).await.unwrap().is_empty());
        assert!(matches!(
            store.soft_delete(rule.id).await,
            Err(StoreError::NotFound { .. })
        ));
        // the row itself is still there
        assert_eq!(store.all_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_hard_delete_removes_row() {
        let store = MemoryStore::new();
        let rule = store.insert(new_rule("s1", 80, 100)).await.unwrap();

        store.hard_delete(rule.id).await.unwrap();

        assert!(store.all_rows().is_empty());
        assert!(store.hard_delete(rule.id).await.is_err());
    }

    #[tokio::test]
    async fn test_save_keeps_identity_and_creation_time() {
        let store = MemoryStore::new();
        let rule = store.insert(new_rule("s1", 80, 100)).await.unwrap();

        let mut edited = rule.clone();
        edited.port = 443;
        edited.created_at = Utc::now() + chrono::Duration::days(1);
        store.save(&edited).await.unwrap();

        let stored = store.get(rule.id).await.unwrap();
        assert_eq!(stored.port, 443);
        assert_eq!(stored.created_at, rule.created_at);
    }

    #[tokio::test]
    async fn test_filters() {
        let store = MemoryStore::new();
        store.insert(new_rule("s1", 80, 100)).await.unwrap();
        store.insert(new_rule("s1", 443, 100)).await.unwrap();
        store.insert(new_rule("s2", 80, 100)).await.unwrap();
        let mut udp = new_rule("s1", 80, 100);
        udp.protocol = Protocol::Udp;
        store.insert(udp).await.unwrap();

        assert_eq!(store.active_rules(&RuleFilter::all()).await.unwrap().len(), 4);
        assert_eq!(store.active_rules(&RuleFilter::server("s1")).await.unwrap().len(), 3);
        assert_eq!(store.active_rules(&RuleFilter::port("s1", 80)).await.unwrap().len(), 2);

        let key = MatchKey {
            server_id: "s1".into(),
            port: 80,
            protocol: Protocol::Tcp,
        };
        assert_eq!(store.active_rules(&RuleFilter::match_key(&key)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_server() {
        let store = MemoryStore::new();
        store.insert(new_rule("s1", 80, 100)).await.unwrap();
        store.insert(new_rule("s1", 443, 100)).await.unwrap();
        store.insert(new_rule("s2", 80, 100)).await.unwrap();

        assert_eq!(store.soft_delete_server("s1").await.unwrap(), 2);
        assert_eq!(store.soft_delete_server("s1").await.unwrap(), 0);
        assert_eq!(store.active_rules(&RuleFilter::all()).await.unwrap().len(), 1);
    }
}
