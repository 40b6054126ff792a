//! Per-host deployment state machine and protocol

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use remote_exec::{AuthOptions, CommandRecord, Session, Transport, shell_quote};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::format_elapsed;
use crate::events::{DeployEvent, EventBus};
use crate::inventory::ServerRecord;
use crate::orchestrator::DeployOptions;

/// Well-known staging directories probed for an already-transferred slug
const STAGING_PATHS: &[&str] = &["/tmp", "/mnt"];

/// Log file remote install commands append to
const REMOTE_LOG: &str = "/var/log/slug_deploy.log";

/// A host wrapped for sharing between the orchestrator and its deploy task.
///
/// The deploy task is the only writer while it runs; the orchestrator reads
/// for straggler displays and writes only during straggler recovery, after
/// the task was cancelled.
pub type SharedHost = Arc<RwLock<Host>>;

/// Actions scheduled against a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostAction {
    /// Pre-position the slug on the host without activating it
    Stage,
    /// Activate the slug; implies staging happened
    Install,
}

impl fmt::Display for HostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAction::Stage => write!(f, "stage"),
            HostAction::Install => write!(f, "install"),
        }
    }
}

/// Lifecycle states of a host during one deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Deployment task picked the host up
    Started,
    /// An existing slug copy was found on the host
    Detected,
    /// The slug was transferred to the host
    Copied,
    /// The install command completed
    Installed,
    /// The whole sequence finished
    Deployed,
    /// The sequence raised; host-local, never propagated
    Failed,
    /// The host was cancelled and its instance terminated
    Terminated,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HostStatus::Started => "started",
            HostStatus::Detected => "detected",
            HostStatus::Copied => "copied",
            HostStatus::Installed => "installed",
            HostStatus::Deployed => "deployed",
            HostStatus::Failed => "failed",
            HostStatus::Terminated => "terminated",
        };
        write!(f, "{label}")
    }
}

/// One entry in a host's status timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// The status entered
    pub status: HostStatus,
    /// Elapsed `MM:SS` since the host was created
    pub elapsed: String,
}

/// How the host pattern was classified during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOrigin {
    /// A literal IP address pattern
    IpAddress,
    /// A fully-qualified hostname pattern
    Hostname,
    /// A record resolved through the fleet inventory
    Instance,
}

/// Where the slug comes from and how it gets onto hosts
#[derive(Debug, Clone)]
pub struct ArtifactSource {
    /// Artifact file name, e.g. `web-20260807.slug`
    pub slug_name: String,
    /// Transfer mode
    pub method: CopyMethod,
}

/// Supported slug transfer modes
#[derive(Debug, Clone)]
pub enum CopyMethod {
    /// Copy a local file over the transport
    Push {
        /// Local path of the slug file
        local_path: PathBuf,
    },
    /// Have the host pull the slug from the artifact store via an expiring URL
    Pull {
        /// Credential-free download URL
        url: String,
    },
    /// The operator stages the file out of band; nothing is transferred
    Manual,
}

/// Serializable snapshot of a host's final state for the run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostReport {
    /// Display name
    pub name: String,
    /// Address used for transport connections
    pub ip: String,
    /// The pattern that matched this host
    pub pattern: String,
    /// Slug that was staged/installed, when one was
    pub slug_name: Option<String>,
    /// Effective action
    pub action: String,
    /// Final status, empty when the task never started
    pub status: String,
    /// Every command run against the host
    pub output: Vec<CommandRecord>,
    /// When the host record was created
    pub start_time: DateTime<Utc>,
    /// Human-readable status timeline
    pub timeline: String,
    /// Backing instance id, for inventory-resolved hosts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Private DNS name, for inventory-resolved hosts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_name: Option<String>,
    /// Public DNS name, for inventory-resolved hosts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_name: Option<String>,
}

/// State machine for one deployment target
#[derive(Debug)]
pub struct Host {
    pattern: String,
    origin: HostOrigin,
    server: Option<ServerRecord>,
    actions: Vec<HostAction>,
    status: Option<HostStatus>,
    timeline: Vec<TimelineEvent>,
    results: Vec<CommandRecord>,
    slug_name: Option<String>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Host {
    fn new(pattern: impl Into<String>, origin: HostOrigin, server: Option<ServerRecord>) -> Self {
        Self {
            pattern: pattern.into(),
            origin,
            server,
            actions: Vec::new(),
            status: None,
            timeline: Vec::new(),
            results: Vec::new(),
            slug_name: None,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// A host addressed by a literal IP
    pub fn ip_address(pattern: impl Into<String>) -> Self {
        Self::new(pattern, HostOrigin::IpAddress, None)
    }

    /// A host addressed by hostname
    pub fn hostname(pattern: impl Into<String>) -> Self {
        Self::new(pattern, HostOrigin::Hostname, None)
    }

    /// A host backed by an inventory record
    pub fn instance(pattern: impl Into<String>, server: ServerRecord) -> Self {
        Self::new(pattern, HostOrigin::Instance, Some(server))
    }

    /// Wrap for sharing with a deploy task
    pub fn shared(self) -> SharedHost {
        Arc::new(RwLock::new(self))
    }

    /// Display name; unique per concrete host, used for deduplication
    pub fn name(&self) -> String {
        match (&self.origin, &self.server) {
            (HostOrigin::IpAddress, _) => format!("ip:{}", self.pattern),
            (HostOrigin::Hostname, _) => format!("hostname:{}", self.pattern),
            (HostOrigin::Instance, Some(server)) => format!(
                "instance:{}, private_name:{}, public_name:{}, ip:{}",
                server.id,
                server.private_dns_name.as_deref().unwrap_or(""),
                server.dns_name.as_deref().unwrap_or(""),
                server.public_ip.as_deref().unwrap_or(""),
            ),
            (HostOrigin::Instance, None) => format!("name:{}", self.pattern),
        }
    }

    /// The address partial-deploy ordering sorts by
    pub fn ip(&self) -> String {
        self.server
            .as_ref()
            .and_then(|server| server.public_ip.clone())
            .unwrap_or_else(|| self.pattern.clone())
    }

    /// The address the transport connects to
    pub fn ssh_host(&self) -> String {
        self.server
            .as_ref()
            .and_then(|server| server.dns_name.clone())
            .unwrap_or_else(|| self.pattern.clone())
    }

    /// Backing instance id, when inventory-resolved
    pub fn instance_id(&self) -> Option<String> {
        self.server.as_ref().map(|server| server.id.clone())
    }

    /// True when the backing instance belongs to an autoscaling group
    pub fn is_autoscaled(&self) -> bool {
        self.server
            .as_ref()
            .is_some_and(ServerRecord::is_autoscaled)
    }

    /// The pattern that matched this host
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Schedule an action
    pub fn add_action(&mut self, action: HostAction) {
        self.actions.push(action);
    }

    /// Unschedule an action
    pub fn remove_action(&mut self, action: HostAction) {
        self.actions.retain(|existing| *existing != action);
    }

    /// Whether an action is scheduled
    pub fn has_action(&self, action: HostAction) -> bool {
        self.actions.contains(&action)
    }

    /// Whether staging is scheduled
    pub fn stage(&self) -> bool {
        self.has_action(HostAction::Stage)
    }

    /// Whether installation is scheduled
    pub fn install(&self) -> bool {
        self.has_action(HostAction::Install)
    }

    /// Install wins over stage when both are scheduled
    pub fn effective_action(&self) -> HostAction {
        if self.install() {
            HostAction::Install
        } else {
            HostAction::Stage
        }
    }

    /// Current status
    pub fn status(&self) -> Option<HostStatus> {
        self.status
    }

    /// Append a status to the timeline and make it current.
    ///
    /// The timeline is append-only; nothing ever rewrites earlier entries.
    pub fn record_event(&mut self, status: HostStatus) {
        self.timeline.push(TimelineEvent {
            status,
            elapsed: format_elapsed(self.started.elapsed()),
        });
        self.status = Some(status);
    }

    /// Record the outcome of a remote command
    pub fn push_result(&mut self, record: CommandRecord) {
        self.results.push(record);
    }

    /// Note which slug ended up on the host
    pub fn set_slug_name(&mut self, slug_name: impl Into<String>) {
        self.slug_name = Some(slug_name.into());
    }

    /// Output of every command that exited non-zero
    pub fn output(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|record| record.exit_code != 0)
            .map(|record| record.output.clone())
            .collect()
    }

    /// Whether the deployment counts as successful for this host.
    ///
    /// Stage-only hosts always count; install targets must have reached
    /// `deployed` or `terminated` with no failed commands.
    pub fn success(&self) -> bool {
        if !self.install() {
            return true;
        }
        matches!(
            self.status,
            Some(HostStatus::Deployed | HostStatus::Terminated)
        ) && self.output().is_empty()
    }

    /// Whether the host reached the failed state
    pub fn failed(&self) -> bool {
        self.status == Some(HostStatus::Failed)
    }

    /// Whether the host reached a terminal state
    pub fn complete(&self) -> bool {
        self.success() || self.failed()
    }

    /// Whether the host was terminated during straggler recovery
    pub fn terminated(&self) -> bool {
        self.status == Some(HostStatus::Terminated)
    }

    /// The timeline as `status @ MM:SS` entries joined with commas
    pub fn timeline_summary(&self) -> String {
        self.timeline
            .iter()
            .map(|event| format!("{} @ {}", event.status, event.elapsed))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Snapshot for the run report
    pub fn report(&self) -> HostReport {
        HostReport {
            name: self.name(),
            ip: self.ip(),
            pattern: self.pattern.clone(),
            slug_name: self.slug_name.clone(),
            action: self.effective_action().to_string(),
            status: self
                .status
                .map(|status| status.to_string())
                .unwrap_or_default(),
            output: self.results.clone(),
            start_time: self.started_at,
            timeline: self.timeline_summary(),
            instance_id: self.server.as_ref().map(|server| server.id.clone()),
            private_name: self
                .server
                .as_ref()
                .and_then(|server| server.private_dns_name.clone()),
            public_name: self
                .server
                .as_ref()
                .and_then(|server| server.dns_name.clone()),
        }
    }
}

/// Run the full deployment protocol against one host.
///
/// Failures are host-local: any error is converted into a `failed` status
/// plus a synthetic result record, and sibling hosts are unaffected.
pub async fn deploy_host(
    host: &SharedHost,
    artifact: &ArtifactSource,
    transport: &dyn Transport,
    events: &EventBus,
    opts: &DeployOptions,
) {
    let (name, ip) = {
        let host = host.read().unwrap();
        (host.name(), host.ip())
    };

    if let Err(err) = run_protocol(host, artifact, transport, events, opts).await {
        let message = err.to_string();
        error!(host = %name, %ip, %message, "deployment failed");
        let mut host = host.write().unwrap();
        host.record_event(HostStatus::Failed);
        host.push_result(CommandRecord {
            command: String::new(),
            output: message,
            exit_code: -1,
            user: resolve_user(opts),
        });
    }

    let host = host.read().unwrap();
    if host.success() {
        info!(host = %name, action = %host.effective_action(), "deployment complete");
    } else {
        warn!(host = %name, action = %host.effective_action(), "deployment incomplete");
    }
}

async fn run_protocol(
    host: &SharedHost,
    artifact: &ArtifactSource,
    transport: &dyn Transport,
    events: &EventBus,
    opts: &DeployOptions,
) -> crate::Result<()> {
    let (name, ssh_host, action, wants_stage, wants_install) = {
        let mut host = host.write().unwrap();
        host.record_event(HostStatus::Started);
        (
            host.name(),
            host.ssh_host(),
            host.effective_action(),
            host.stage(),
            host.install(),
        )
    };

    if opts.pretend {
        info!(host = %name, %action, "pretend mode: not actually deploying slug");
    } else {
        let user = resolve_user(opts);
        info!(host = %name, %action, %user, "deploying");
        let auth = AuthOptions {
            identity: opts.identity.clone(),
            forward_agent: true,
        };
        let session = transport.connect(&ssh_host, &user, &auth).await?;

        let mut slug_path = None;
        if !opts.force {
            slug_path = detect_slug(host, session.as_ref(), &artifact.slug_name).await?;
        }
        let slug_path = match slug_path {
            Some(path) => path,
            None => copy_slug(host, session.as_ref(), artifact).await?,
        };

        if wants_stage {
            explode_slug(host, session.as_ref(), &slug_path, artifact, opts).await?;
        }
        if wants_install {
            install_slug(host, session.as_ref(), &slug_path, artifact, events, opts).await?;
        }
    }

    host.write().unwrap().record_event(HostStatus::Deployed);
    Ok(())
}

/// Run one remote command and append its record to the host
async fn run_recorded(
    host: &SharedHost,
    session: &dyn Session,
    command: &str,
) -> crate::Result<CommandRecord> {
    let record = session.run(command).await?;
    if !record.success() {
        warn!(command = %record.command, exit_code = record.exit_code, "remote command failed");
    }
    host.write().unwrap().push_result(record.clone());
    Ok(record)
}

/// Probe the staging directories for a pre-existing copy of the slug.
///
/// Probes are not recorded in the host's results; they are part of the
/// detection machinery, not the deployment itself.
async fn detect_slug(
    host: &SharedHost,
    session: &dyn Session,
    slug_name: &str,
) -> crate::Result<Option<String>> {
    for path in STAGING_PATHS {
        let probe = format!(
            "find {path} -maxdepth 1 -name {} -type f -size +0 | wc -l",
            shell_quote(slug_name)
        );
        let record = session.run(&probe).await?;
        let count: u64 = record
            .output
            .lines()
            .find_map(|line| line.trim().parse().ok())
            .unwrap_or(0);
        if count > 0 {
            let slug_path = format!("{path}/{slug_name}");
            let mut host = host.write().unwrap();
            info!(
                host = %host.name(),
                %slug_path,
                "found existing slug on host; use force to overwrite"
            );
            host.record_event(HostStatus::Detected);
            return Ok(Some(slug_path));
        }
    }
    Ok(None)
}

/// Transfer the slug onto the host, returning its remote path
async fn copy_slug(
    host: &SharedHost,
    session: &dyn Session,
    artifact: &ArtifactSource,
) -> crate::Result<String> {
    let slug_path = format!("/mnt/{}", artifact.slug_name);
    let name = host.read().unwrap().name();

    match &artifact.method {
        CopyMethod::Manual => {
            info!(host = %name, %slug_path, "manual transfer mode: expecting the slug to be staged out of band");
        }
        CopyMethod::Push { local_path } => {
            info!(host = %name, "copying slug to host over the transport");
            session
                .copy_file(local_path, &artifact.slug_name)
                .await?;
            // land in the user's home, then move into place as root
            run_recorded(
                host,
                session,
                &format!("sudo mv {} {}", shell_quote(&artifact.slug_name), slug_path),
            )
            .await?;
        }
        CopyMethod::Pull { url } => {
            info!(host = %name, "having host pull slug from the artifact store");
            run_recorded(
                host,
                session,
                &format!("sudo curl -fsSL {} -o {}", shell_quote(url), slug_path),
            )
            .await?;
        }
    }

    host.write().unwrap().record_event(HostStatus::Copied);
    Ok(slug_path)
}

/// Unpack the slug on the host without activating it
async fn explode_slug(
    host: &SharedHost,
    session: &dyn Session,
    slug_path: &str,
    artifact: &ArtifactSource,
    opts: &DeployOptions,
) -> crate::Result<()> {
    info!(host = %host.read().unwrap().name(), "exploding package as root");
    let command = install_command(slug_path, opts, InstallMode::Unpack);
    run_recorded(host, session, &command).await?;
    host.write().unwrap().set_slug_name(&artifact.slug_name);
    Ok(())
}

/// Activate the slug on the host
async fn install_slug(
    host: &SharedHost,
    session: &dyn Session,
    slug_path: &str,
    artifact: &ArtifactSource,
    events: &EventBus,
    opts: &DeployOptions,
) -> crate::Result<()> {
    info!(host = %host.read().unwrap().name(), "installing package as root");
    let command = install_command(slug_path, opts, InstallMode::Activate);
    let record = run_recorded(host, session, &command).await?;

    let name = {
        let mut host = host.write().unwrap();
        host.set_slug_name(&artifact.slug_name);
        host.name()
    };
    events.publish(&DeployEvent::InstallCompleted {
        host: name,
        slug_path: slug_path.to_string(),
        deploy_dir: opts.deploy_dir.clone(),
        user: record.user,
    });
    host.write().unwrap().record_event(HostStatus::Installed);
    Ok(())
}

enum InstallMode {
    Unpack,
    Activate,
}

/// Build the remote install command line.
///
/// The slug is self-executing; `-y` always clobbers an existing install so
/// re-runs are idempotent.
fn install_command(slug_path: &str, opts: &DeployOptions, mode: InstallMode) -> String {
    let env = opts
        .env
        .as_deref()
        .map(|env| format!("{env} "))
        .unwrap_or_default();
    let mut command = format!(
        "TERM=dumb sudo bash -l -c 'date >> {REMOTE_LOG} ; chmod +x {slug_path} && {env}{slug_path} -y -i {} ",
        opts.deploy_dir
    );
    if let Some(owner) = &opts.owner {
        command.push_str(&format!("-o {owner} "));
    }
    match mode {
        InstallMode::Unpack => command.push_str("-u "),
        InstallMode::Activate => {
            if opts.force {
                command.push_str("-f ");
            }
        }
    }
    command.push_str(&format!("-v | tee -a {REMOTE_LOG}'"));
    command
}

fn resolve_user(opts: &DeployOptions) -> String {
    opts.username
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_host() -> Host {
        let mut host = Host::ip_address("10.0.0.1");
        host.add_action(HostAction::Install);
        host
    }

    fn record(exit_code: i32) -> CommandRecord {
        CommandRecord {
            command: "true".to_string(),
            output: String::new(),
            exit_code,
            user: "deploy".to_string(),
        }
    }

    #[test]
    fn test_effective_action_prefers_install() {
        let mut host = Host::ip_address("10.0.0.1");
        assert_eq!(host.effective_action(), HostAction::Stage);
        host.add_action(HostAction::Stage);
        host.add_action(HostAction::Install);
        assert_eq!(host.effective_action(), HostAction::Install);
        host.remove_action(HostAction::Install);
        assert_eq!(host.effective_action(), HostAction::Stage);
    }

    #[test]
    fn test_timeline_is_append_only() {
        let mut host = install_host();
        host.record_event(HostStatus::Started);
        host.record_event(HostStatus::Copied);
        host.record_event(HostStatus::Deployed);
        let summary = host.timeline_summary();
        assert!(summary.starts_with("started @ "));
        assert!(summary.contains("copied @ "));
        assert!(summary.ends_with(&format!("deployed @ {}", host.timeline.last().unwrap().elapsed)));
        assert_eq!(host.timeline.len(), 3);
    }

    #[test]
    fn test_success_requires_deployed_and_clean_output() {
        let mut host = install_host();
        assert!(!host.success());

        host.record_event(HostStatus::Deployed);
        assert!(host.success());

        host.push_result(record(1));
        assert!(!host.success());
    }

    #[test]
    fn test_stage_only_host_always_succeeds() {
        let mut host = Host::ip_address("10.0.0.1");
        host.add_action(HostAction::Stage);
        assert!(host.success());
        host.record_event(HostStatus::Failed);
        // success? only considers install targets; failed() still reports
        assert!(host.success());
        assert!(host.failed());
    }

    #[test]
    fn test_terminated_install_counts_as_success() {
        let mut host = install_host();
        host.record_event(HostStatus::Started);
        host.record_event(HostStatus::Terminated);
        assert!(host.success());
    }

    #[test]
    fn test_output_collects_only_failures() {
        let mut host = install_host();
        host.push_result(record(0));
        host.push_result(CommandRecord {
            command: "install".to_string(),
            output: "boom".to_string(),
            exit_code: 3,
            user: "deploy".to_string(),
        });
        assert_eq!(host.output(), vec!["boom"]);
    }

    #[test]
    fn test_names_by_origin() {
        assert_eq!(Host::ip_address("10.0.0.1").name(), "ip:10.0.0.1");
        assert_eq!(
            Host::hostname("web1.example.com").name(),
            "hostname:web1.example.com"
        );
    }

    #[test]
    fn test_install_command_shape() {
        let opts = DeployOptions {
            deploy_dir: "/opt/app".to_string(),
            owner: Some("app".to_string()),
            env: Some("RAILS_ENV=production".to_string()),
            force: true,
            ..DeployOptions::default()
        };

        let install = install_command("/mnt/web.slug", &opts, InstallMode::Activate);
        assert!(install.contains("chmod +x /mnt/web.slug"));
        assert!(install.contains("RAILS_ENV=production /mnt/web.slug"));
        assert!(install.contains("-y "));
        assert!(install.contains("-i /opt/app"));
        assert!(install.contains("-o app"));
        assert!(install.contains("-f "));
        assert!(!install.contains("-u "));

        let unpack = install_command("/mnt/web.slug", &opts, InstallMode::Unpack);
        assert!(unpack.contains("-u "));
        assert!(!unpack.contains("-f "));
    }
}
