//! # Fleet deploy
//!
//! Deployment orchestration for slug artifacts across a fleet of remote
//! hosts: pattern-based host discovery, partial rollouts, batched parallel
//! execution with straggler recovery, and per-host status timelines.
//!
//! The flow: user-supplied patterns are resolved into [`HostGroup`]s against
//! a [`FleetInventory`]; the [`Deployer`] picks the install subset per group,
//! orders and stripes the deduplicated host list into batches, and runs one
//! concurrent deployment task per host in the current batch over a
//! [`remote_exec::Transport`]. Host failures stay host-local — a batch never
//! aborts because one member died.

#![warn(missing_docs)]

pub mod context;
pub mod events;
pub mod group;
pub mod host;
pub mod inventory;
pub mod orchestrator;
pub mod recovery;
pub mod report;
pub mod retry;
pub mod task_group;

pub use context::RunContext;
pub use events::{DeployEvent, EventBus, EventSubscriber, GroupSummary, PartialMethod};
pub use group::{HostGroup, resolve};
pub use host::{
    ArtifactSource, CopyMethod, Host, HostAction, HostReport, HostStatus, SharedHost, deploy_host,
};
pub use inventory::{
    AUTOSCALING_GROUP_TAG, FleetInventory, InventoryError, ServerRecord, StaticInventory,
};
pub use orchestrator::{
    DEFAULT_BATCH_SIZE, DeployOptions, Deployer, batch_size_for, order_deploy, unique_hosts,
};
pub use recovery::{KeepWaitingPrompt, RecoveryAction, RecoveryPrompt, ScriptedPrompt, Straggler};
pub use report::write_run_report;

use thiserror::Error;

/// Result type for deployment operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for deployment operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid options or unresolvable targets; fatal before any transport
    /// activity happens
    #[error("configuration error: {0}")]
    Config(String),

    /// Fleet inventory provider failure
    #[error("inventory error: {0}")]
    Inventory(#[from] inventory::InventoryError),

    /// Remote execution transport failure
    #[error("remote execution error: {0}")]
    Exec(#[from] remote_exec::Error),

    /// Status report serialization failure
    #[error("status report error: {0}")]
    Report(#[from] serde_json::Error),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
