//! Shared test doubles for deployment flow tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use remote_exec::{AuthOptions, CommandRecord, Error, Result, Session, Transport};

/// Scripted behavior for one host reached through the [`MockTransport`]
#[derive(Debug, Clone, Default)]
pub enum HostBehavior {
    /// Every command exits 0
    #[default]
    Succeed,
    /// The slug is already present in the first staging directory probed
    SlugAlreadyStaged,
    /// Commands containing the substring exit non-zero
    FailCommand(String),
    /// `connect` fails outright
    FailConnect,
    /// File transfers fail
    FailTransfer,
    /// Commands block until the channel is closed (or the task is cancelled)
    Hang(async_channel::Receiver<()>),
}

#[derive(Default)]
struct Inner {
    behaviors: Mutex<HashMap<String, HostBehavior>>,
    connects: Mutex<Vec<String>>,
    commands: Mutex<Vec<(String, String)>>,
}

/// A transport whose sessions follow per-host scripts
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior for `host`; unscripted hosts succeed
    pub fn behave(&self, host: &str, behavior: HostBehavior) {
        self.inner
            .behaviors
            .lock()
            .unwrap()
            .insert(host.to_string(), behavior);
    }

    /// Hosts that were connected to, in order
    pub fn connects(&self) -> Vec<String> {
        self.inner.connects.lock().unwrap().clone()
    }

    /// Every `(host, command)` pair that ran
    pub fn commands(&self) -> Vec<(String, String)> {
        self.inner.commands.lock().unwrap().clone()
    }

    /// Commands that ran against `host`
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, command)| command)
            .collect()
    }

    fn behavior_for(&self, host: &str) -> HostBehavior {
        self.inner
            .behaviors
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        _auth: &AuthOptions,
    ) -> Result<Box<dyn Session>> {
        if let HostBehavior::FailConnect = self.behavior_for(host) {
            return Err(Error::Connect {
                host: host.to_string(),
                message: "scripted connection failure".to_string(),
            });
        }
        self.inner.connects.lock().unwrap().push(host.to_string());
        Ok(Box::new(MockSession {
            host: host.to_string(),
            user: user.to_string(),
            inner: self.inner.clone(),
            behavior: self.behavior_for(host),
        }))
    }
}

struct MockSession {
    host: String,
    user: String,
    inner: Arc<Inner>,
    behavior: HostBehavior,
}

#[async_trait]
impl Session for MockSession {
    async fn run(&self, command: &str) -> Result<CommandRecord> {
        if let HostBehavior::Hang(release) = &self.behavior {
            let _ = release.recv().await;
        }
        self.inner
            .commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));

        let (output, exit_code) = match &self.behavior {
            HostBehavior::SlugAlreadyStaged if command.starts_with("find ") => {
                ("1\n".to_string(), 0)
            }
            HostBehavior::FailCommand(marker) if command.contains(marker.as_str()) => {
                ("scripted command failure\n".to_string(), 1)
            }
            _ => ("0\n".to_string(), 0),
        };
        Ok(CommandRecord {
            command: command.to_string(),
            output,
            exit_code,
            user: self.user.clone(),
        })
    }

    async fn copy_file(&self, _local: &Path, remote_dest: &str) -> Result<()> {
        if let HostBehavior::FailTransfer = self.behavior {
            return Err(Error::Transfer {
                dest: format!("{}:{}", self.host, remote_dest),
                message: "scripted transfer failure".to_string(),
            });
        }
        Ok(())
    }

    fn user(&self) -> &str {
        &self.user
    }
}
