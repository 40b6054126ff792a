//! SSH remote execution backend using the system CLI

use std::path::{Path, PathBuf};

use async_process::Command;
use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::session::{
    AuthOptions, CommandRecord, Session, Transport, parse_exit_code, wrap_with_sentinel,
};

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Target host (hostname or IP)
    host: String,
    /// SSH user
    user: String,
    /// SSH port (optional, defaults to 22)
    port: Option<u16>,
    /// Path to identity file (private key)
    identity_file: Option<PathBuf>,
    /// Forward the local agent
    forward_agent: bool,
    /// Additional SSH arguments
    extra_args: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host and user
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: None,
            identity_file: None,
            forward_agent: false,
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Forward the local SSH agent to the remote side
    pub fn with_agent_forwarding(mut self, forward: bool) -> Self {
        self.forward_agent = forward;
        self
    }

    /// Add an extra SSH argument
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Get the host string (`user@host`)
    fn host_string(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Arguments for an `ssh` invocation running `command` remotely
    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
            // Only the given key is offered when one is pinned
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        if self.forward_agent {
            args.push("-A".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.host_string());
        args.push(command.to_string());
        args
    }

    /// Arguments for an `scp` invocation copying `local` to `remote_dest`
    fn scp_args(&self, local: &Path, remote_dest: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            // scp spells the port flag differently than ssh
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(local.to_string_lossy().to_string());
        args.push(format!("{}:{}", self.host_string(), remote_dest));
        args
    }
}

/// A session backed by one-shot `ssh`/`scp` processes.
///
/// No connection is held open between commands; `ControlMaster` in the
/// operator's `ssh_config` gives multiplexing for free when wanted.
#[derive(Debug, Clone)]
pub struct SshSession {
    config: SshConfig,
}

impl SshSession {
    /// Create a session from a prepared configuration
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(&self, command: &str) -> Result<CommandRecord> {
        let wrapped = wrap_with_sentinel(command);
        debug!(host = %self.config.host, %command, "running remote command");

        let output = Command::new("ssh")
            .args(self.config.ssh_args(&wrapped))
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        // ssh reserves 255 for its own failures; anything else reached the
        // remote shell and is reported through the sentinel
        if output.status.code() == Some(255) {
            return Err(Error::Connect {
                host: self.config.host.clone(),
                message: combined.trim().to_string(),
            });
        }

        let exit_code = parse_exit_code(&combined);
        trace!(host = %self.config.host, exit_code, "remote command finished");
        Ok(CommandRecord {
            command: command.to_string(),
            output: combined,
            exit_code,
            user: self.config.user.clone(),
        })
    }

    async fn copy_file(&self, local: &Path, remote_dest: &str) -> Result<()> {
        debug!(host = %self.config.host, ?local, remote_dest, "copying file");
        let output = Command::new("scp")
            .args(self.config.scp_args(local, remote_dest))
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Transfer {
                dest: format!("{}:{}", self.config.host_string(), remote_dest),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn user(&self) -> &str {
        &self.config.user
    }
}

/// Transport that opens [`SshSession`]s with shared defaults
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    port: Option<u16>,
    extra_args: Vec<String>,
}

impl SshTransport {
    /// Create a transport with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the SSH port used for every session
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Add an extra SSH argument used for every session
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        auth: &AuthOptions,
    ) -> Result<Box<dyn Session>> {
        let mut config = SshConfig::new(host, user).with_agent_forwarding(auth.forward_agent);
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(identity) = &auth.identity {
            config = config.with_identity_file(identity);
        }
        for arg in &self.extra_args {
            config = config.with_extra_arg(arg.clone());
        }

        let session = SshSession::new(config);
        // Probe eagerly so unreachable hosts fail at connect time, not midway
        // through a deployment sequence
        session.run("true").await?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_string() {
        let config = SshConfig::new("example.com", "alice");
        assert_eq!(config.host_string(), "alice@example.com");
    }

    #[test]
    fn test_ssh_args() {
        let config = SshConfig::new("example.com", "alice")
            .with_port(2222)
            .with_identity_file("/home/alice/.ssh/id_ed25519")
            .with_agent_forwarding(true);

        let args = config.ssh_args("uptime");
        assert_eq!(
            args,
            vec![
                "-p",
                "2222",
                "-i",
                "/home/alice/.ssh/id_ed25519",
                "-o",
                "IdentitiesOnly=yes",
                "-A",
                "alice@example.com",
                "uptime",
            ]
        );
    }

    #[test]
    fn test_scp_args() {
        let config = SshConfig::new("10.0.0.8", "deploy").with_port(2222);
        let args = config.scp_args(Path::new("/tmp/app.slug"), "/mnt/app.slug");
        assert_eq!(
            args,
            vec!["-P", "2222", "/tmp/app.slug", "deploy@10.0.0.8:/mnt/app.slug"]
        );
    }
}
