//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::enforcement::{EnforcementAdapter, Position};
use crate::core::error::EnforcementError;
use crate::core::rule::{IpFamily, NewRule, Protocol, Rule, RuleId, RuleKind, RuleRequest};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("PORTGATE_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("PORTGATE_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// In-memory enforcement chain with iptables semantics.
///
/// Keeps one ordered chain per address family, rejects inserts past the end
/// and deletes of absent entries like the real binary does. Failures can be
/// injected to exercise rollback and best-effort paths.
#[derive(Debug, Default)]
pub struct ChainRecorder {
    chains: Mutex<HashMap<IpFamily, Vec<Rule>>>,
    inserts: Mutex<Vec<(RuleId, Position)>>,
    failing_ports: Mutex<HashSet<u16>>,
    timeout: AtomicBool,
}

impl ChainRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live IPv4 chain in order
    pub fn entries(&self) -> Vec<Rule> {
        self.entries_for(IpFamily::V4)
    }

    pub fn entries_for(&self, family: IpFamily) -> Vec<Rule> {
        let chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        chains.get(&family).cloned().unwrap_or_default()
    }

    /// Ids of the live IPv4 chain in order
    pub fn ids(&self) -> Vec<RuleId> {
        self.entries().iter().map(|r| r.id).collect()
    }

    /// Every successful insert with the position it was given
    pub fn inserts(&self) -> Vec<(RuleId, Position)> {
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes inserts for `port` fail with a non-zero exit
    pub fn fail_port(&self, port: u16) {
        self.failing_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port);
    }

    /// Makes every invocation time out
    pub fn fail_with_timeout(&self, enabled: bool) {
        self.timeout.store(enabled, Ordering::SeqCst);
    }

    /// Removes an entry behind the engine's back
    pub fn tamper_remove(&self, rule: &Rule) {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(chain) = chains.get_mut(&rule.family()) {
            chain.retain(|r| !same_tuple(r, rule));
        }
    }

    fn timed_out(&self, op: &str) -> Result<(), EnforcementError> {
        if self.timeout.load(Ordering::SeqCst) {
            return Err(EnforcementError::Timeout {
                command: format!("recorder {op}"),
                after: Duration::from_secs(5),
            });
        }
        Ok(())
    }
}

/// Entries match on the tuple the packet filter sees, not on rule identity
fn same_tuple(a: &Rule, b: &Rule) -> bool {
    a.remote == b.remote && a.port == b.port && a.protocol == b.protocol && a.kind == b.kind
}

fn exit(op: &str, stderr: &str) -> EnforcementError {
    EnforcementError::Exit {
        command: format!("recorder {op}"),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl EnforcementAdapter for ChainRecorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn exists(&self, rule: &Rule) -> Result<bool, EnforcementError> {
        self.timed_out("-C")?;
        let chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(chains
            .get(&rule.family())
            .is_some_and(|chain| chain.iter().any(|r| same_tuple(r, rule))))
    }

    async fn insert(&self, rule: &Rule, position: Position) -> Result<(), EnforcementError> {
        self.timed_out("-I")?;
        if self
            .failing_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&rule.port)
        {
            return Err(EnforcementError::Exit {
                command: "recorder -I".to_string(),
                code: Some(4),
                stderr: "iptables v1.8.10: Permission denied (you must be root)".to_string(),
            });
        }

        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        let chain = chains.entry(rule.family()).or_default();
        match position {
            Position::Append => chain.push(rule.clone()),
            Position::At(n) if n >= 1 && n <= chain.len() + 1 => chain.insert(n - 1, rule.clone()),
            Position::At(_) => return Err(exit("-I", "iptables: Index of insertion too big.")),
        }
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((rule.id, position));
        Ok(())
    }

    async fn delete(&self, rule: &Rule) -> Result<(), EnforcementError> {
        self.timed_out("-D")?;
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        let chain = chains.entry(rule.family()).or_default();
        match chain.iter().position(|r| same_tuple(r, rule)) {
            Some(index) => {
                chain.remove(index);
                Ok(())
            }
            None => Err(exit(
                "-D",
                "iptables: Bad rule (does a matching rule exist in that chain?).",
            )),
        }
    }

    async fn chain_length(&self, family: IpFamily) -> Result<usize, EnforcementError> {
        self.timed_out("-S")?;
        let chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(chains.get(&family).map_or(0, Vec::len))
    }
}

/// Unsaved TCP rule from 10.0.0.1
pub fn new_rule(server: &str, port: u16, kind: RuleKind, priority: i32) -> NewRule {
    NewRule {
        server_id: server.to_string(),
        remote: "10.0.0.1".parse().expect("valid address"),
        port,
        protocol: Protocol::Tcp,
        kind,
        priority,
        description: String::new(),
    }
}

/// Stored-looking TCP rule, bypassing any store
pub fn sample_rule(id: RuleId, remote: &str, port: u16, kind: RuleKind) -> Rule {
    let remote = crate::validators::validate_address(remote).expect("valid address");
    NewRule {
        server_id: "srv".to_string(),
        remote,
        port,
        protocol: Protocol::Tcp,
        kind,
        priority: 100,
        description: String::new(),
    }
    .into_rule(id, Utc::now())
}

/// Create request with an explicit priority
pub fn request(server: &str, remote: &str, port: u32, kind: &str, priority: i32) -> RuleRequest {
    RuleRequest::new(server, remote, port, kind).with_priority(priority)
}
