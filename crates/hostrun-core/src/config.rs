//! Process-wide execution defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The default set of ssh client command line flags.
///
/// Pseudo-terminal allocation, X11 forwarding and interactive host key
/// prompts are all disabled so a spawned client can never stall waiting
/// for a terminal.
pub const DEFAULT_SSH_OPTS: &[&str] = &[
    "-e",
    "none",
    "-T",
    "-x",
    "-q",
    "-o",
    "CheckHostIP=no",
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=no",
];

/// Defaults consulted when a request payload omits a field
///
/// Produced by the configuration subsystem of the surrounding job system
/// and injected into each executor at construction. Executions only read
/// it; changing defaults while executions are in flight is a race the
/// caller must avoid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshDefaults {
    /// Full path to the local ssh client binary
    #[serde(default = "default_path")]
    pub path: String,
    /// User to connect as when the payload names none
    #[serde(default = "default_user")]
    pub user: String,
    /// Client options placed before the per-request flags
    #[serde(default = "default_opts")]
    pub opts: Vec<String>,
    /// Path to a password-free private key
    pub key: Option<PathBuf>,
}

fn default_path() -> String {
    "/usr/bin/ssh".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

fn default_opts() -> Vec<String> {
    DEFAULT_SSH_OPTS.iter().map(ToString::to_string).collect()
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            path: default_path(),
            user: default_user(),
            opts: default_opts(),
            key: None,
        }
    }
}
