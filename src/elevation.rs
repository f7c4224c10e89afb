//! Privilege elevation for packet filter commands
//!
//! Modifying the `raw` table requires `CAP_NET_ADMIN`. portgate normally runs
//! as root next to the container runtime, in which case commands run
//! directly. When it does not, one of the elevation wrappers is used:
//!
//! - **run0**: systemd v256+, no SUID, preferred
//! - **sudo**: for hosts with a sudoers NOPASSWD entry
//!
//! There is no interactive fallback; portgate runs unattended.
//!
//! # Environment Variables
//!
//! - `PORTGATE_ELEVATION_METHOD`: Overrides the configured method (`none`,
//!   `sudo`, or `run0`).
//!
//! # Security
//!
//! - Arguments are passed directly without shell interpolation
//! - All rule fields are validated before a command is built
//! - Wrapper binaries are checked for availability

use serde::{Deserialize, Serialize};
use std::io;
use tokio::process::Command;

/// Environment variable overriding [`ElevationMethod`]
pub const ELEVATION_ENV: &str = "PORTGATE_ELEVATION_METHOD";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `PORTGATE_ELEVATION_METHOD`
    #[error("Invalid PORTGATE_ELEVATION_METHOD '{0}'. Valid options: none, sudo, run0")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How non-root processes obtain privileges
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ElevationMethod {
    /// Run the binary directly
    #[default]
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "sudo")]
    Sudo,
    #[strum(serialize = "run0")]
    Run0,
}

impl ElevationMethod {
    /// Resolves the effective method: environment override first, then `configured`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the environment variable holds an unknown method.
    pub fn resolve(configured: Self) -> Result<Self, ElevationError> {
        match std::env::var(ELEVATION_ENV) {
            Ok(value) if !value.trim().is_empty() => value
                .trim()
                .parse()
                .map_err(|_| ElevationError::InvalidMethod(value)),
            _ => Ok(configured),
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Builds a command running `program args...` with the requested privileges.
///
/// Root never elevates. The returned command has `kill_on_drop` set so a
/// dropped invocation never leaves a child behind.
///
/// # Errors
///
/// Returns `Err` if the method comes from an invalid environment override
/// or its wrapper binary is missing.
pub fn create_elevated_command(
    program: &str,
    args: &[String],
    method: ElevationMethod,
) -> Result<Command, ElevationError> {
    let method = ElevationMethod::resolve(method)?;
    let is_root = nix::unistd::getuid().is_root();

    let mut cmd = match method {
        ElevationMethod::None => Command::new(program),
        _ if is_root => Command::new(program),
        ElevationMethod::Sudo | ElevationMethod::Run0 => {
            let wrapper = method.to_string();
            if !binary_exists(&wrapper) {
                return Err(ElevationError::MethodNotAvailable(wrapper));
            }
            let mut cmd = Command::new(wrapper);
            cmd.arg(program);
            cmd
        }
    };

    cmd.args(args).kill_on_drop(true);
    Ok(cmd)
}
