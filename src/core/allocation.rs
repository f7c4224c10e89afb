//! Port allocations assigned to a server by the orchestration layer
//!
//! An allocation is a default `ip:port` binding plus any number of named
//! port ranges (query ports, RCON, voice, ...). Cleanup uses it to decide
//! which rules still refer to a port the server owns.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl std::str::FromStr for PortRange {
    type Err = String;

    /// Parses `80` or `27015-27020`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| format!("Invalid port '{p}'"))
        };

        match s.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("Invalid range '{s}': start is after end"));
                }
                Ok(Self { start, end })
            }
            None => parse(s).map(Self::single),
        }
    }
}

/// Default binding of a server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefaultMapping {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortAllocation {
    #[serde(default)]
    pub default: DefaultMapping,
    #[serde(default)]
    pub mappings: BTreeMap<String, Vec<PortRange>>,
}

impl PortAllocation {
    pub fn with_default(ip: impl Into<String>, port: u16) -> Self {
        Self {
            default: DefaultMapping {
                ip: ip.into(),
                port,
            },
            mappings: BTreeMap::new(),
        }
    }

    pub fn add_range(&mut self, name: impl Into<String>, range: PortRange) {
        self.mappings.entry(name.into()).or_default().push(range);
    }

    /// Returns `true` if `port` is the default port or inside any named range.
    pub fn is_allocated(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        if self.default.port == port {
            return true;
        }
        self.mappings
            .values()
            .flatten()
            .any(|range| range.contains(port))
    }

    /// Every allocated port, expanded from the ranges.
    pub fn valid_ports(&self) -> HashSet<u16> {
        let mut ports: HashSet<u16> = self
            .mappings
            .values()
            .flatten()
            .flat_map(|range| range.start..=range.end)
            .filter(|p| *p != 0)
            .collect();
        if self.default.port != 0 {
            ports.insert(self.default.port);
        }
        ports
    }
}
