//! File-backed rule store
//!
//! The whole table lives in one JSON document that is rewritten atomically
//! after every mutation. A SHA-256 sidecar (`<file>.sha256`) detects manual
//! edits and partial writes; a mismatch is logged but does not block loading.

use crate::core::error::StoreError;
use crate::core::rule::{NewRule, Rule, RuleId};
use crate::core::store::{RuleFilter, RuleStore, RuleTable, StoreResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Upper bound on rows accepted from disk
pub const MAX_RULES: usize = 100_000;

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    table: RwLock<RuleTable>,
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or parsed, or
    /// holds more than [`MAX_RULES`] rows.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let table = if tokio::fs::try_exists(&path).await? {
            let json = tokio::fs::read_to_string(&path).await?;
            verify_checksum(&path, &json).await;

            let table: RuleTable = serde_json::from_str(&json)?;
            if table.rules.len() > MAX_RULES {
                return Err(StoreError::Corrupted(format!(
                    "{} contains {} rules (max: {MAX_RULES})",
                    path.display(),
                    table.rules.len()
                )));
            }
            if let Some(max_id) = table.rules.keys().max()
                && *max_id > table.next_id
            {
                return Err(StoreError::Corrupted(format!(
                    "next_id {} is behind rule id {max_id}",
                    table.next_id
                )));
            }
            info!("Loaded {} rule rows from {}", table.rules.len(), path.display());
            table
        } else {
            info!("No rule store at {}, starting empty", path.display());
            RuleTable::default()
        };

        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the table atomically: temp file (0o600) → fsync → rename,
    /// then refreshes the checksum sidecar.
    async fn persist(&self, table: &RuleTable) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(table)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut temp_path = self.path.clone();
        temp_path.set_extension("json.tmp");

        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)
                .await?;

            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            tokio::fs::write(&temp_path, &json).await?;
        }

        tokio::fs::rename(&temp_path, &self.path).await?;
        tokio::fs::write(checksum_path(&self.path), compute_checksum(&json)).await?;

        debug!("Persisted {} rule rows to {}", table.rules.len(), self.path.display());
        Ok(())
    }

    /// Applies `change` to a scratch copy and only commits it in memory once
    /// the copy is on disk, so a failed write leaves both sides unchanged.
    /// Readers share the table; only mutations take it exclusively.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut RuleTable) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut table = self.table.write().await;
        let mut scratch = table.clone();
        let out = change(&mut scratch)?;
        self.persist(&scratch).await?;
        *table = scratch;
        Ok(out)
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".sha256");
    PathBuf::from(p)
}

fn compute_checksum(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

async fn verify_checksum(path: &Path, json: &str) {
    if let Ok(expected) = tokio::fs::read_to_string(checksum_path(path)).await {
        let actual = compute_checksum(json);
        if expected.trim() != actual {
            warn!(
                "Rule store {} checksum mismatch (expected: {}, got: {}), file was edited outside portgate",
                path.display(),
                expected.trim(),
                actual
            );
        }
    }
}

#[async_trait]
impl RuleStore for JsonFileStore {
    async fn insert(&self, rule: NewRule) -> StoreResult<Rule> {
        self.mutate(|t| Ok(t.insert(rule))).await
    }

    async fn get(&self, id: RuleId) -> StoreResult<Rule> {
        self.table.read().await.get(id).cloned()
    }

    async fn save(&self, rule: &Rule) -> StoreResult<()> {
        self.mutate(|t| t.save(rule)).await
    }

    async fn soft_delete(&self, id: RuleId) -> StoreResult<()> {
        self.mutate(|t| t.soft_delete(id)).await
    }

    async fn soft_delete_server(&self, server_id: &str) -> StoreResult<usize> {
        self.mutate(|t| Ok(t.soft_delete_server(server_id))).await
    }

    async fn hard_delete(&self, id: RuleId) -> StoreResult<()> {
        self.mutate(|t| t.hard_delete(id)).await
    }

    async fn active_rules(&self, filter: &RuleFilter) -> StoreResult<Vec<Rule>> {
        Ok(self.table.read().await.active(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{Protocol, RuleKind};

    fn new_rule(port: u16) -> NewRule {
        NewRule {
            server_id: "srv".to_string(),
            remote: "192.0.2.0/24".parse().unwrap(),
            port,
            protocol: Protocol::Udp,
            kind: RuleKind::Block,
            priority: 40,
            description: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("rules.json")).await.unwrap();

        assert!(store.active_rules(&RuleFilter::all()).await.unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_rules_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let kept = store.insert(new_rule(27015)).await.unwrap();
        let gone = store.insert(new_rule(27016)).await.unwrap();
        store.soft_delete(gone.id).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let rules = reopened.active_rules(&RuleFilter::all()).await.unwrap();
        assert_eq!(rules, vec![kept]);

        // ids keep increasing after reopen
        let next = reopened.insert(new_rule(27017)).await.unwrap();
        assert!(next.id > gone.id);
    }

    #[tokio::test]
    async fn test_checksum_sidecar_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store.insert(new_rule(80)).await.unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        let sidecar = std::fs::read_to_string(checksum_path(&path)).unwrap();
        assert_eq!(sidecar, compute_checksum(&json));
        assert_eq!(sidecar.len(), 64);
    }

    #[tokio::test]
    async fn test_edited_file_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store.insert(new_rule(80)).await.unwrap();
        drop(store);

        let json = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, json.replace("\"test\"", "\"edited\"")).unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let rules = reopened.active_rules(&RuleFilter::all()).await.unwrap();
        assert_eq!(rules[0].description, "edited");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_table_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("rules.json")).await.unwrap();

        assert!(matches!(
            store.soft_delete(99).await,
            Err(StoreError::NotFound { id: 99 })
        ));
        assert!(store.active_rules(&RuleFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_do_not_wait_on_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("rules.json")).await.unwrap();
        let rule = store.insert(new_rule(80)).await.unwrap();

        let _reader = store.table.read().await;
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), store.get(rule.id))
            .await
            .expect("get blocked behind another reader")
            .unwrap();
        let active = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            store.active_rules(&RuleFilter::all()),
        )
        .await
        .expect("active_rules blocked behind another reader")
        .unwrap();

        assert_eq!(got, rule);
        assert_eq!(active, vec![rule]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_store_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        store.insert(new_rule(80)).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
