//! Declared access rules and the request types clients use to shape them
//!
//! A [`Rule`] is the unit of access control owned by one game/application
//! server: allow or block traffic from a remote address/CIDR to one
//! externally visible port over TCP or UDP.
//!
//! # Ordering
//!
//! Rules sharing a [`MatchKey`] compete for position in the enforcement
//! chain. The declared order is `(priority asc, created_at asc, id asc)`;
//! see [`declared_order`].
//!
//! # Example
//!
//! ```
//! use portgate::core::rule::{RuleRequest, Protocol, RuleKind};
//!
//! let request = RuleRequest::new("srv-1", "203.0.113.0/24", 25565, "allow")
//!     .with_protocol("udp")
//!     .with_priority(50);
//!
//! assert_eq!(request.port, 25565);
//! assert_eq!(request.protocol.as_deref(), Some("udp"));
//! assert_eq!(Protocol::default(), Protocol::Tcp);
//! assert_eq!(RuleKind::Block.target(), "DROP");
//! ```

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Store-assigned rule identity
pub type RuleId = u64;

/// Priority applied when a request leaves it unset (or zero)
pub const DEFAULT_PRIORITY: i32 = 100;

/// Transport protocol matched by a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Whether matching traffic is let through or dropped
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    #[strum(serialize = "allow")]
    Allow,
    #[strum(serialize = "block")]
    Block,
}

impl RuleKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RuleKind::Allow => "allow",
            RuleKind::Block => "block",
        }
    }

    /// Terminal packet filter verdict for this kind
    pub const fn target(self) -> &'static str {
        match self {
            RuleKind::Allow => "ACCEPT",
            RuleKind::Block => "DROP",
        }
    }
}

/// Address family of a rule, selects `iptables` vs `ip6tables`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum IpFamily {
    #[strum(serialize = "ipv4")]
    V4,
    #[strum(serialize = "ipv6")]
    V6,
}

/// Grouping over which relative rule position is computed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub server_id: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.server_id, self.port, self.protocol)
    }
}

/// A declared access rule as persisted by the rule store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub server_id: String,
    /// Remote address or network, a bare address is stored as a host network
    pub remote: IpNetwork,
    /// Externally visible (pre-translation) port
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub kind: RuleKind,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Tombstone, a rule with this set is absent from every query
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Rule {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn family(&self) -> IpFamily {
        match self.remote {
            IpNetwork::V4(_) => IpFamily::V4,
            IpNetwork::V6(_) => IpFamily::V6,
        }
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            server_id: self.server_id.clone(),
            port: self.port,
            protocol: self.protocol,
        }
    }

    /// Human-readable match tuple used in logs
    pub fn describe(&self) -> String {
        format!(
            "#{} {} {} from {} to {}/{}",
            self.id,
            self.server_id,
            self.kind,
            self.remote,
            self.port,
            self.protocol
        )
    }
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// Total order used for both store retrieval and position calculation.
pub fn declared_order(a: &Rule, b: &Rule) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Validated fields of a rule that has not been persisted yet.
///
/// The store assigns `id` and `created_at` on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub server_id: String,
    pub remote: IpNetwork,
    pub port: u16,
    pub protocol: Protocol,
    pub kind: RuleKind,
    pub priority: i32,
    pub description: String,
}

impl NewRule {
    pub fn into_rule(self, id: RuleId, created_at: DateTime<Utc>) -> Rule {
        Rule {
            id,
            server_id: self.server_id,
            remote: self.remote,
            port: self.port,
            protocol: self.protocol,
            kind: self.kind,
            priority: self.priority,
            description: self.description,
            created_at,
            deleted_at: None,
        }
    }
}

/// Raw rule creation input as received from the orchestration layer.
///
/// Values are validated by the manager; `port` is wider than `u16` so that
/// out-of-range input reaches validation instead of failing to deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleRequest {
    pub server_id: String,
    pub remote: String,
    pub port: u32,
    #[serde(default)]
    pub protocol: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
}

impl RuleRequest {
    pub fn new(
        server_id: impl Into<String>,
        remote: impl Into<String>,
        port: u32,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            remote: remote.into(),
            port,
            protocol: None,
            kind: kind.into(),
            priority: 0,
            description: String::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Partial update of an existing rule.
///
/// `None`, empty strings and zero numbers leave the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RulePatch {
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RulePatch {
    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref().filter(|s| !s.is_empty())
    }

    pub fn port(&self) -> Option<u32> {
        self.port.filter(|p| *p != 0)
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref().filter(|s| !s.is_empty())
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref().filter(|s| !s.is_empty())
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority.filter(|p| *p != 0)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref().filter(|s| !s.is_empty())
    }
}
