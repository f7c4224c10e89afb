//! Enforcement adapter: installs declared rules on the host packet filter
//!
//! Rules are matched in the pre-translation stage (`raw`/`PREROUTING` by
//! default). Docker rewrites the destination of published ports later in
//! `nat`/`PREROUTING`, so only this stage still sees the externally visible
//! port a rule is declared against. Allow and block rules share one chain and
//! differ only in their terminal target (`ACCEPT` vs `DROP`).
//!
//! Every invocation is bounded by a timeout and none is retried here; retry
//! policy belongs to the caller. Dropping an in-flight call kills the child.
//!
//! # Example
//!
//! ```
//! use portgate::core::enforcement::Position;
//!
//! assert_eq!(Position::At(1).to_string(), "position 1");
//! assert_eq!(Position::Append.to_string(), "end of chain");
//! ```

use crate::config::{CommandSpec, EnforcementConfig};
use crate::core::error::EnforcementError;
use crate::core::rule::{IpFamily, Rule};
use crate::elevation::{ElevationMethod, create_elevated_command};
use async_trait::async_trait;
use std::fmt;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where a rule is inserted in the enforcement chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// 1-based index, the rule currently at that index moves down
    At(usize),
    Append,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::At(n) => write!(f, "position {n}"),
            Position::Append => write!(f, "end of chain"),
        }
    }
}

/// Host enforcement surface.
///
/// Implementations provide the four primitive invocations; [`apply`] and
/// [`remove`] layer idempotency on top of them.
///
/// [`apply`]: EnforcementAdapter::apply
/// [`remove`]: EnforcementAdapter::remove
#[async_trait]
pub trait EnforcementAdapter: Send + Sync {
    /// Short backend name for logs and `status`
    fn name(&self) -> &'static str;

    /// Membership check for the exact match tuple.
    ///
    /// A non-zero exit means "not present" and yields `Ok(false)`; only a
    /// surface that could not be asked at all (spawn failure, timeout, kill)
    /// is an error.
    async fn exists(&self, rule: &Rule) -> Result<bool, EnforcementError>;

    async fn insert(&self, rule: &Rule, position: Position) -> Result<(), EnforcementError>;

    async fn delete(&self, rule: &Rule) -> Result<(), EnforcementError>;

    /// Number of live entries in the chain for one address family
    async fn chain_length(&self, family: IpFamily) -> Result<usize, EnforcementError>;

    /// Installs `rule` unless an identical entry is already enforced.
    async fn apply(&self, rule: &Rule, position: Position) -> Result<(), EnforcementError> {
        if self.exists(rule).await? {
            debug!("Rule {} already enforced, skipping insert", rule.describe());
            return Ok(());
        }
        self.insert(rule, position).await
    }

    /// Removes `rule`; an entry that is already gone counts as removed.
    /// Every other failure, a refused delete included, is returned.
    async fn remove(&self, rule: &Rule) -> Result<(), EnforcementError> {
        match self.delete(rule).await {
            Err(e) if e.is_absent_entry() => {
                warn!(
                    "Rule {} was not present on the enforcement surface: {e}",
                    rule.describe()
                );
                Ok(())
            }
            other => other,
        }
    }
}

/// Chain operation of a single invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainOp {
    Check,
    Insert(Position),
    Delete,
}

/// `iptables`/`ip6tables` backed adapter
#[derive(Debug, Clone)]
pub struct IptablesAdapter {
    table: String,
    chain: String,
    ipv4: CommandSpec,
    ipv6: CommandSpec,
    wait_for_lock: bool,
    elevation: ElevationMethod,
    check_timeout: Duration,
    apply_timeout: Duration,
}

impl IptablesAdapter {
    pub fn new(config: &EnforcementConfig) -> Self {
        Self {
            table: config.table.clone(),
            chain: config.chain.clone(),
            ipv4: config.ipv4_command.clone(),
            ipv6: config.ipv6_command.clone(),
            wait_for_lock: config.wait_for_lock,
            elevation: config.elevation,
            check_timeout: config.check_timeout(),
            apply_timeout: config.apply_timeout(),
        }
    }

    /// Overrides the configured timeouts (whole seconds in config)
    #[must_use]
    pub fn with_timeouts(mut self, check: Duration, apply: Duration) -> Self {
        self.check_timeout = check;
        self.apply_timeout = apply;
        self
    }

    fn command_for(&self, family: IpFamily) -> &CommandSpec {
        match family {
            IpFamily::V4 => &self.ipv4,
            IpFamily::V6 => &self.ipv6,
        }
    }

    /// `[-w] -t <table> <op> <chain>` prefix shared by every invocation
    fn chain_args(&self, op_flag: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(16);
        if self.wait_for_lock {
            args.push("-w".to_string());
        }
        args.extend([
            "-t".to_string(),
            self.table.clone(),
            op_flag.to_string(),
            self.chain.clone(),
        ]);
        args
    }

    /// Full argument list for a rule operation, excluding the program and
    /// its configured leading args.
    fn rule_args(&self, op: ChainOp, rule: &Rule) -> Vec<String> {
        let mut args = match op {
            ChainOp::Check => self.chain_args("-C"),
            ChainOp::Delete => self.chain_args("-D"),
            ChainOp::Insert(Position::Append) => self.chain_args("-A"),
            ChainOp::Insert(Position::At(n)) => {
                let mut args = self.chain_args("-I");
                args.push(n.to_string());
                args
            }
        };
        args.extend([
            "-p".to_string(),
            rule.protocol.as_str().to_string(),
            "-s".to_string(),
            rule.remote.to_string(),
            "--dport".to_string(),
            rule.port.to_string(),
            "-j".to_string(),
            rule.kind.target().to_string(),
        ]);
        args
    }

    /// Runs one invocation to completion or until `timeout` elapses.
    async fn run(
        &self,
        family: IpFamily,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<Output, EnforcementError> {
        let spec = self.command_for(family);
        let mut full_args = spec.args.clone();
        full_args.extend(args);
        let command = render_command(&spec.program, &full_args);

        let mut cmd = create_elevated_command(&spec.program, &full_args, self.elevation).map_err(
            |e| EnforcementError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            },
        )?;

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EnforcementError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        debug!("Running `{command}`");

        // On timeout the child is dropped and killed (kill_on_drop)
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(EnforcementError::Spawn {
                    command,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(EnforcementError::Timeout {
                    command,
                    after: timeout,
                });
            }
        };

        if output.status.success() {
            return Ok(output);
        }

        match output.status.code() {
            Some(code) => Err(EnforcementError::Exit {
                command,
                code: Some(code),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            None => Err(EnforcementError::Killed {
                command,
                signal: exit_signal(&output.status),
            }),
        }
    }
}

#[async_trait]
impl EnforcementAdapter for IptablesAdapter {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn exists(&self, rule: &Rule) -> Result<bool, EnforcementError> {
        let args = self.rule_args(ChainOp::Check, rule);
        match self.run(rule.family(), args, self.check_timeout).await {
            Ok(_) => Ok(true),
            Err(EnforcementError::Exit { code, .. }) => {
                debug!("Rule {} not enforced (check exit {code:?})", rule.describe());
                Ok(false)
            }
            Err(e) => {
                log_failure("check", rule, &e);
                Err(e)
            }
        }
    }

    async fn insert(&self, rule: &Rule, position: Position) -> Result<(), EnforcementError> {
        let args = self.rule_args(ChainOp::Insert(position), rule);
        match self.run(rule.family(), args, self.apply_timeout).await {
            Ok(_) => {
                info!(
                    "Enforced rule {} in {}/{} at {position}",
                    rule.describe(),
                    self.table,
                    self.chain
                );
                Ok(())
            }
            Err(e) => {
                log_failure("insert", rule, &e);
                Err(e)
            }
        }
    }

    async fn delete(&self, rule: &Rule) -> Result<(), EnforcementError> {
        let args = self.rule_args(ChainOp::Delete, rule);
        match self.run(rule.family(), args, self.apply_timeout).await {
            Ok(_) => {
                info!("Removed rule {} from {}/{}", rule.describe(), self.table, self.chain);
                Ok(())
            }
            // absence is reported by `remove`, anything else is a real failure
            Err(e) if e.is_absent_entry() => Err(e),
            Err(e) => {
                log_failure("delete", rule, &e);
                Err(e)
            }
        }
    }

    async fn chain_length(&self, family: IpFamily) -> Result<usize, EnforcementError> {
        let args = self.chain_args("-S");
        let output = self.run(family, args, self.check_timeout).await?;
        Ok(count_chain_entries(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Counts the rule lines of `iptables -S <chain>` output.
///
/// The listing starts with a `-P` (policy) or `-N` (user chain) line which
/// is not an entry.
pub fn count_chain_entries(listing: &str) -> usize {
    listing
        .lines()
        .filter(|line| line.trim_start().starts_with("-A "))
        .count()
}

fn render_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn log_failure(action: &str, rule: &Rule, err: &EnforcementError) {
    let translation = err.translate();
    error!(
        rule_id = rule.id,
        server = %rule.server_id,
        command = err.command(),
        "Failed to {action} rule {}: {err}",
        rule.describe()
    );
    warn!("{}", translation.user_message);
    for suggestion in &translation.suggestions {
        warn!("  hint: {suggestion}");
    }
}

/// Adapter for hosts without a usable packet filter.
///
/// Every operation succeeds and nothing is enforced, access control is
/// declared-only.
#[derive(Debug)]
pub struct NoopAdapter {
    reason: String,
}

impl NoopAdapter {
    pub fn new(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!("Rule enforcement disabled ({reason}): rules are stored but NOT enforced");
        Self { reason }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl EnforcementAdapter for NoopAdapter {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn exists(&self, _rule: &Rule) -> Result<bool, EnforcementError> {
        Ok(false)
    }

    async fn insert(&self, _rule: &Rule, _position: Position) -> Result<(), EnforcementError> {
        Ok(())
    }

    async fn delete(&self, _rule: &Rule) -> Result<(), EnforcementError> {
        Ok(())
    }

    async fn chain_length(&self, _family: IpFamily) -> Result<usize, EnforcementError> {
        Ok(0)
    }
}

/// Picks the adapter for this host and configuration.
pub fn default_adapter(config: &EnforcementConfig) -> Arc<dyn EnforcementAdapter> {
    if !config.enabled {
        return Arc::new(NoopAdapter::new("disabled in configuration"));
    }
    platform_adapter(config)
}

#[cfg(target_os = "linux")]
fn platform_adapter(config: &EnforcementConfig) -> Arc<dyn EnforcementAdapter> {
    Arc::new(IptablesAdapter::new(config))
}

#[cfg(not(target_os = "linux"))]
fn platform_adapter(_config: &EnforcementConfig) -> Arc<dyn EnforcementAdapter> {
    Arc::new(NoopAdapter::new("no supported packet filter on this platform"))
}
