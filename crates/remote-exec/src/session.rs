//! Session and transport traits shared by all backends

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Sentinel echoed after every remote command so the exit code survives
/// transports that only hand back captured output.
pub const EXIT_CODE_SENTINEL: &str = "REMOTE_COMMAND_EXIT_CODE";

/// Outcome of one remote command, recorded regardless of success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// The command line as given to the session
    pub command: String,
    /// Combined captured output (stdout then stderr)
    pub output: String,
    /// Exit code parsed from the sentinel (0 when the sentinel was absent)
    pub exit_code: i32,
    /// User the command ran as
    pub user: String,
}

impl CommandRecord {
    /// True when the remote command exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Authentication options for opening a session
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// Private key file; when set, only this key is offered
    pub identity: Option<PathBuf>,
    /// Forward the local agent to the remote side
    pub forward_agent: bool,
}

/// An open connection to one remote host.
///
/// A non-zero remote exit code is NOT an `Err` — errors are reserved for
/// transport failures. Callers inspect [`CommandRecord::exit_code`].
#[async_trait]
pub trait Session: Send + Sync {
    /// Run a shell command on the remote host and record its outcome.
    async fn run(&self, command: &str) -> Result<CommandRecord>;

    /// Copy a local file to a destination path on the remote host.
    async fn copy_file(&self, local: &Path, remote_dest: &str) -> Result<()>;

    /// The user this session authenticates as
    fn user(&self) -> &str;
}

/// Opens sessions against remote hosts
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `host` as `user`
    async fn connect(&self, host: &str, user: &str, auth: &AuthOptions)
    -> Result<Box<dyn Session>>;
}

/// Wrap a command so its exit code is echoed on a line of its own
pub fn wrap_with_sentinel(command: &str) -> String {
    format!("{command} ; echo \"{EXIT_CODE_SENTINEL}=$?\"")
}

/// Parse the sentinel out of captured output.
///
/// A missing sentinel parses as 0, matching shells that swallow the trailing
/// echo when the connection drops mid-command.
pub fn parse_exit_code(output: &str) -> i32 {
    output
        .lines()
        .rev()
        .find_map(|line| {
            line.strip_prefix(EXIT_CODE_SENTINEL)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .and_then(|code| code.trim().parse().ok())
        .unwrap_or(0)
}

/// Escape a string for safe inclusion in a remote shell command
pub fn shell_quote(s: &str) -> String {
    if s.contains(|c: char| c.is_whitespace() || "\"'\\$`!*?<>|&;()[]{}".contains(c)) {
        // Single quotes, with embedded single quotes spliced out
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    } else {
        s.to_string()
    }
}
