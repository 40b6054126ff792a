//! Deployment lifecycle events.
//!
//! Subscribers are optional and best-effort: a failing subscriber is logged
//! and the deployment carries on. Nothing in the core depends on anyone
//! listening.

use serde::Serialize;
use tracing::warn;

/// Which partial-deploy selector limited the install set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialMethod {
    /// First-N selection
    Count,
    /// Percentage selection
    Percent,
}

/// Per-group summary carried in deploy lifecycle events
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    /// The pattern the group resolved from
    pub name: String,
    /// Total hosts in the group
    pub host_count: usize,
    /// Hosts selected for installation
    pub install_count: usize,
}

/// Events published over the course of a deployment
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum DeployEvent {
    /// Published once before the first batch executes
    #[serde(rename = "deploy.started")]
    DeployStarted {
        /// Partial-deploy selector in effect, if any
        method: Option<PartialMethod>,
        /// The numeric limit given to the selector
        limit: Option<u64>,
        /// Resolved host groups
        host_groups: Vec<GroupSummary>,
        /// Hosts per batch
        batch_size: usize,
        /// Project the artifact belongs to
        project: Option<String>,
        /// Name of the artifact being deployed
        slug_name: String,
    },

    /// Published once after the last batch finishes
    #[serde(rename = "deploy.finished")]
    DeployFinished {
        /// True when every host reported success
        success: bool,
        /// Partial-deploy selector in effect, if any
        method: Option<PartialMethod>,
        /// The numeric limit given to the selector
        limit: Option<u64>,
        /// Resolved host groups
        host_groups: Vec<GroupSummary>,
        /// Hosts per batch
        batch_size: usize,
        /// Project the artifact belongs to
        project: Option<String>,
        /// Name of the artifact being deployed
        slug_name: String,
    },

    /// Published per host after its install command ran
    #[serde(rename = "install.completed")]
    InstallCompleted {
        /// Display name of the host
        host: String,
        /// Path of the slug on the host
        slug_path: String,
        /// Directory the slug was installed into
        deploy_dir: String,
        /// User the install ran as
        user: String,
    },
}

/// A deployment event listener.
///
/// Errors are swallowed (logged) by the bus; subscribers cannot abort a
/// deployment.
pub trait EventSubscriber: Send + Sync {
    /// Handle one event
    fn on_event(
        &self,
        event: &DeployEvent,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Fan-out publisher for [`DeployEvent`]s
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Box<dyn EventSubscriber>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber
    pub fn subscribe(&mut self, subscriber: Box<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Deliver an event to every subscriber, logging (not propagating)
    /// subscriber failures
    pub fn publish(&self, event: &DeployEvent) {
        for subscriber in &self.subscribers {
            if let Err(err) = subscriber.on_event(event) {
                warn!(%err, "event subscriber failed");
            }
        }
    }
}
