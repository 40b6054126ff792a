//! Runtime-agnostic remote command execution.
//!
//! This crate is the transport layer for pushing artifacts to remote hosts:
//! a [`Transport`] opens a [`Session`] against one host, and a session runs
//! shell commands (capturing combined output and the remote exit code) and
//! copies files. The shipped backend drives the system `ssh`/`scp` binaries
//! through `async-process`, so it cooperates with whatever agent, multiplexer,
//! or `ssh_config` setup the operator already has.

pub mod error;
pub mod session;
pub mod ssh;

pub use error::{Error, Result};
pub use session::{
    AuthOptions, CommandRecord, EXIT_CODE_SENTINEL, Session, Transport, parse_exit_code,
    shell_quote, wrap_with_sentinel,
};
pub use ssh::{SshConfig, SshSession, SshTransport};
