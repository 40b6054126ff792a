//! Deployment orchestration: install subsets, ordering, batching, and
//! concurrent per-host rollout with straggler recovery

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use async_io::Timer;
use futures::FutureExt;
use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::{FuturesUnordered, StreamExt};
use remote_exec::{CommandRecord, Transport};
use tracing::{info, warn};

use crate::context::RunContext;
use crate::events::{DeployEvent, EventBus, GroupSummary, PartialMethod};
use crate::group::{self, HostGroup};
use crate::host::{ArtifactSource, HostAction, HostStatus, SharedHost, deploy_host};
use crate::inventory::FleetInventory;
use crate::recovery::{KeepWaitingPrompt, RecoveryAction, RecoveryPrompt, Straggler};
use crate::report;
use crate::{Error, Result};

/// Default hosts per batch. The artifact store may throttle simultaneous
/// downloads of one object, so batches stay well under that ceiling.
pub const DEFAULT_BATCH_SIZE: usize = 85;

/// Options controlling one deployment run
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Project the artifact belongs to; carried into events and reports
    pub project: Option<String>,
    /// Remote user; defaults to the local `$USER`
    pub username: Option<String>,
    /// Identity (private key) file for transport authentication
    pub identity: Option<PathBuf>,
    /// Directory the slug installs into on each host
    pub deploy_dir: String,
    /// Account the application runs as after installation
    pub owner: Option<String>,
    /// Space-delimited `KEY=value` list prefixed to the install command
    pub env: Option<String>,
    /// Skip slug detection and clobber whatever is already installed
    pub force: bool,
    /// Log what would happen without touching any transport
    pub pretend: bool,
    /// Do not stage the slug on group members not targeted for install
    pub no_stage: bool,
    /// Install to only the first N hosts of each group
    pub count: Option<usize>,
    /// Install to only the first ceil(N%) hosts of each group
    pub percent: Option<u32>,
    /// Hosts per batch
    pub batch_size: Option<usize>,
    /// Number of batches; takes precedence over `batch_size`
    pub batch_count: Option<usize>,
    /// Pause between batches
    pub batch_pause: Option<Duration>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            project: None,
            username: None,
            identity: None,
            deploy_dir: "/opt/app".to_string(),
            owner: None,
            env: None,
            force: false,
            pretend: false,
            no_stage: false,
            count: None,
            percent: None,
            batch_size: Some(DEFAULT_BATCH_SIZE),
            batch_count: None,
            batch_pause: None,
        }
    }
}

impl DeployOptions {
    fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("count", self.count),
            ("batch-size", self.batch_size),
            ("batch-count", self.batch_count),
        ] {
            if value == Some(0) {
                return Err(Error::Config(format!("{label} must be greater than 0")));
            }
        }
        if self.percent == Some(0) {
            return Err(Error::Config("percent must be greater than 0".to_string()));
        }
        if self.count.is_some() && self.percent.is_some() {
            return Err(Error::Config(
                "count and percent are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    fn partial_method(&self) -> Option<(PartialMethod, u64)> {
        if let Some(count) = self.count {
            return Some((PartialMethod::Count, count as u64));
        }
        self.percent
            .map(|percent| (PartialMethod::Percent, percent as u64))
    }
}

/// Pick the batch size for `host_count` hosts.
///
/// A requested batch count wins when there are at least that many hosts;
/// otherwise a requested batch size applies when the host count exceeds it;
/// otherwise everything goes in a single batch.
pub fn batch_size_for(host_count: usize, opts: &DeployOptions) -> usize {
    if let Some(batch_count) = opts.batch_count {
        if host_count >= batch_count {
            let batch_count = batch_count.max(1);
            return host_count.div_ceil(batch_count);
        }
    }
    if let Some(batch_size) = opts.batch_size {
        if host_count > batch_size && batch_size >= 1 {
            return batch_size;
        }
    }
    host_count.max(1)
}

/// Order hosts for batching: install targets first (stable), then striped
/// round-robin across `host_count / batch_size` buckets so installs and
/// stage-only work spread evenly over the batches instead of front-loading
/// one batch.
pub fn order_deploy(hosts: Vec<SharedHost>, batch_size: usize) -> Vec<SharedHost> {
    let (installs, stages): (Vec<SharedHost>, Vec<SharedHost>) = hosts
        .into_iter()
        .partition(|host| host.read().unwrap().install());
    let mut ordered = installs;
    ordered.extend(stages);

    let buckets = (ordered.len() / batch_size.max(1)).max(1);
    let mut striped: Vec<Vec<SharedHost>> = vec![Vec::new(); buckets];
    for (index, host) in ordered.into_iter().enumerate() {
        striped[index % buckets].push(host);
    }
    striped.into_iter().flatten().collect()
}

/// Deduplicate hosts across groups by name, preserving first-seen order.
///
/// With staging disabled only install targets are part of the deployment set.
pub fn unique_hosts(groups: &[HostGroup], install_only: bool) -> Vec<SharedHost> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for group in groups {
        let members = if install_only {
            group.hosts_for_action(HostAction::Install)
        } else {
            group.hosts().to_vec()
        };
        for host in members {
            let name = host.read().unwrap().name();
            if seen.insert(name) {
                unique.push(host);
            }
        }
    }
    unique
}

enum BatchControl {
    Continue,
    Abandon,
}

/// Consumes resolved host groups plus an artifact locator and runs the
/// batched, concurrent rollout
pub struct Deployer {
    transport: Arc<dyn Transport>,
    inventory: Arc<dyn FleetInventory>,
    events: EventBus,
    prompt: Arc<dyn RecoveryPrompt>,
    interrupts: Option<Receiver<()>>,
    report_dir: Option<PathBuf>,
}

impl Deployer {
    /// Create a deployer over the given transport and inventory
    pub fn new(transport: Arc<dyn Transport>, inventory: Arc<dyn FleetInventory>) -> Self {
        Self {
            transport,
            inventory,
            events: EventBus::new(),
            prompt: Arc::new(KeepWaitingPrompt),
            interrupts: None,
            report_dir: None,
        }
    }

    /// Replace the event bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Set the straggler-recovery decision source
    pub fn with_prompt(mut self, prompt: Arc<dyn RecoveryPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Listen for operator interrupts (one message per interrupt) while
    /// waiting on a batch
    pub fn with_interrupts(mut self, interrupts: Receiver<()>) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    /// Write a JSON status snapshot into `dir` after each run
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    /// Deploy `artifact` to every host the patterns resolve to.
    ///
    /// Returns the host groups annotated with final per-host status. Only
    /// configuration errors abort the run; per-host failures are recorded on
    /// the host and reported through [`crate::host::Host::success`].
    pub async fn deploy(
        &self,
        patterns: &[String],
        artifact: &ArtifactSource,
        opts: &DeployOptions,
    ) -> Result<Vec<HostGroup>> {
        opts.validate()?;
        let context = RunContext::new();

        info!(patterns = ?patterns, slug = %artifact.slug_name, "determining deployment targets");
        let groups = group::resolve(patterns, self.inventory.as_ref()).await?;

        if let Some(percent) = opts.percent {
            for group in &groups {
                group.install_percent_of_hosts(percent);
            }
        } else if let Some(count) = opts.count {
            for group in &groups {
                group.install_number_of_hosts(count);
            }
        } else {
            for group in &groups {
                group.install_all();
            }
        }

        for group in &groups {
            if group.hosts().is_empty() {
                return Err(Error::Config(format!(
                    "host group '{}' was empty",
                    group.name()
                )));
            }
        }

        // Pre-position the slug on everything else so later rollouts hit the
        // detection fast path
        if !opts.no_stage {
            for group in &groups {
                for host in group.hosts() {
                    let mut host = host.write().unwrap();
                    if !host.install() {
                        host.add_action(HostAction::Stage);
                    }
                }
            }
        }

        let hosts = unique_hosts(&groups, opts.no_stage);
        let batch_size = batch_size_for(hosts.len(), opts);
        let ordered = order_deploy(hosts, batch_size);
        let batches: Vec<&[SharedHost]> = ordered.chunks(batch_size).collect();

        let (method, limit) = opts
            .partial_method()
            .map(|(method, limit)| (Some(method), Some(limit)))
            .unwrap_or((None, None));
        self.events.publish(&DeployEvent::DeployStarted {
            method,
            limit,
            host_groups: group_summaries(&groups),
            batch_size,
            project: opts.project.clone(),
            slug_name: artifact.slug_name.clone(),
        });
        info!(
            hosts = ordered.len(),
            batches = batches.len(),
            batch_size,
            "beginning deployment"
        );

        for (index, batch) in batches.iter().enumerate() {
            self.run_batch(index, batches.len(), batch, artifact, opts, &context)
                .await;
            if index + 1 < batches.len() {
                if let Some(pause) = opts.batch_pause {
                    if !pause.is_zero() {
                        info!(batch = index + 1, ?pause, "batch complete, pausing");
                        Timer::after(pause).await;
                    }
                }
            }
        }

        let success = ordered
            .iter()
            .all(|host| host.read().unwrap().success());
        self.events.publish(&DeployEvent::DeployFinished {
            success,
            method,
            limit,
            host_groups: group_summaries(&groups),
            batch_size,
            project: opts.project.clone(),
            slug_name: artifact.slug_name.clone(),
        });
        info!(success, elapsed = %context.elapsed_label(), "deployment complete");

        if let Some(dir) = &self.report_dir {
            let path = report::write_run_report(dir, &context, &groups, success)?;
            info!(path = %path.display(), "wrote deployment status report");
        }
        Ok(groups)
    }

    /// Deploy one batch: one concurrent task per host, joined before the
    /// next batch starts. An interrupt pauses the wait and consults the
    /// recovery prompt instead of aborting anything outright.
    async fn run_batch(
        &self,
        index: usize,
        total: usize,
        batch: &[SharedHost],
        artifact: &ArtifactSource,
        opts: &DeployOptions,
        context: &RunContext,
    ) {
        if total > 1 {
            info!(batch = index + 1, total, hosts = batch.len(), "deploying batch");
        }

        let mut aborts: HashMap<String, AbortHandle> = HashMap::new();
        let mut tasks = FuturesUnordered::new();
        for host in batch {
            let (abort, registration) = AbortHandle::new_pair();
            aborts.insert(host.read().unwrap().name(), abort);
            let task = Abortable::new(
                deploy_host(host, artifact, self.transport.as_ref(), &self.events, opts),
                registration,
            );
            tasks.push(task.map(|_| ()));
        }

        let mut interrupts = self.interrupts.clone();
        loop {
            let interrupted = if let Some(receiver) = interrupts.clone() {
                let recv = receiver.recv().fuse();
                futures::pin_mut!(recv);
                futures::select! {
                    next = tasks.next() => {
                        if next.is_none() {
                            break;
                        }
                        false
                    }
                    result = recv => {
                        if result.is_err() {
                            // interrupt source went away; stop listening
                            interrupts = None;
                        }
                        result.is_ok()
                    }
                }
            } else {
                if tasks.next().await.is_none() {
                    break;
                }
                false
            };

            if interrupted {
                match self.handle_stragglers(batch, &aborts, context).await {
                    BatchControl::Continue => {}
                    BatchControl::Abandon => break,
                }
            }
        }
    }

    async fn handle_stragglers(
        &self,
        batch: &[SharedHost],
        aborts: &HashMap<String, AbortHandle>,
        context: &RunContext,
    ) -> BatchControl {
        let stragglers: Vec<(&SharedHost, Straggler)> = batch
            .iter()
            .filter_map(|host| {
                let snapshot = host.read().unwrap();
                if snapshot.complete() {
                    return None;
                }
                Some((
                    host,
                    Straggler {
                        name: snapshot.name(),
                        timeline: snapshot.timeline_summary(),
                        can_terminate: snapshot.instance_id().is_some()
                            && snapshot.is_autoscaled(),
                    },
                ))
            })
            .collect();

        if stragglers.is_empty() {
            return BatchControl::Continue;
        }

        let reports: Vec<Straggler> = stragglers
            .iter()
            .map(|(_, straggler)| straggler.clone())
            .collect();
        info!(
            elapsed = %context.elapsed_label(),
            count = reports.len(),
            "batch wait interrupted with stragglers remaining"
        );

        match self.prompt.decide(&context.elapsed_label(), &reports) {
            RecoveryAction::KeepWaiting => BatchControl::Continue,
            RecoveryAction::FailStragglers => {
                for (host, straggler) in &stragglers {
                    if let Some(abort) = aborts.get(&straggler.name) {
                        abort.abort();
                    }
                    warn!(host = %straggler.name, "marking straggler as failed");
                    let mut host = host.write().unwrap();
                    host.record_event(HostStatus::Failed);
                    host.push_result(CommandRecord {
                        command: String::new(),
                        output: "marked failed during straggler recovery".to_string(),
                        exit_code: -1,
                        user: String::new(),
                    });
                }
                BatchControl::Abandon
            }
            RecoveryAction::TerminateStragglers => {
                for (host, straggler) in &stragglers {
                    if !straggler.can_terminate {
                        info!(
                            host = %straggler.name,
                            "cannot terminate host, it is not part of an autoscaling group"
                        );
                        continue;
                    }
                    if let Some(abort) = aborts.get(&straggler.name) {
                        abort.abort();
                    }
                    let id = {
                        let mut host = host.write().unwrap();
                        host.record_event(HostStatus::Terminated);
                        host.instance_id()
                    };
                    if let Some(id) = id {
                        // best effort; the autoscaling group replaces the
                        // instance either way
                        match self.inventory.terminate_instance(&id).await {
                            Ok(true) => {
                                info!(host = %straggler.name, %id, "requested instance termination");
                            }
                            Ok(false) => {
                                warn!(host = %straggler.name, %id, "provider declined to terminate instance");
                            }
                            Err(err) => {
                                warn!(host = %straggler.name, %id, %err, "terminate request failed");
                            }
                        }
                    }
                }
                BatchControl::Continue
            }
        }
    }
}

fn group_summaries(groups: &[HostGroup]) -> Vec<GroupSummary> {
    groups
        .iter()
        .map(|group| GroupSummary {
            name: group.name().to_string(),
            host_count: group.hosts().len(),
            install_count: group.hosts_for_action(HostAction::Install).len(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;

    fn opts() -> DeployOptions {
        DeployOptions::default()
    }

    fn hosts(specs: &[(&str, bool)]) -> Vec<SharedHost> {
        specs
            .iter()
            .map(|(ip, install)| {
                let mut host = Host::ip_address(*ip);
                if *install {
                    host.add_action(HostAction::Install);
                } else {
                    host.add_action(HostAction::Stage);
                }
                host.shared()
            })
            .collect()
    }

    #[test]
    fn test_batch_size_defaults_to_single_batch() {
        assert_eq!(batch_size_for(7, &opts()), 7);
        assert_eq!(batch_size_for(0, &opts()), 1);
        assert_eq!(batch_size_for(85, &opts()), 85);
        // only past the default size does batching kick in
        assert_eq!(batch_size_for(86, &opts()), 85);
    }

    #[test]
    fn test_batch_size_honors_requested_size() {
        let options = DeployOptions {
            batch_size: Some(3),
            ..opts()
        };
        assert_eq!(batch_size_for(7, &options), 3);
        assert_eq!(batch_size_for(3, &options), 3);
        assert_eq!(batch_size_for(2, &options), 2);
    }

    #[test]
    fn test_batch_count_takes_precedence() {
        let options = DeployOptions {
            batch_size: Some(3),
            batch_count: Some(4),
            ..opts()
        };
        assert_eq!(batch_size_for(10, &options), 3); // ceil(10/4)
        assert_eq!(batch_size_for(4, &options), 1);
        // fewer hosts than batches falls back to the size rule
        assert_eq!(batch_size_for(2, &options), 2);
    }

    fn numbered_hosts(total: usize) -> Vec<SharedHost> {
        (0..total)
            .map(|i| {
                let mut host = Host::ip_address(format!("10.0.0.{i}"));
                host.add_action(if i % 2 == 0 {
                    HostAction::Install
                } else {
                    HostAction::Stage
                });
                host.shared()
            })
            .collect()
    }

    #[test]
    fn test_batches_partition_exactly() {
        for (total, size) in [(7usize, 3usize), (9, 3), (1, 5), (85, 85)] {
            let ordered = order_deploy(numbered_hosts(total), size);
            assert_eq!(ordered.len(), total);
            let batches: Vec<&[SharedHost]> = ordered.chunks(size).collect();
            assert_eq!(batches.len(), total.div_ceil(size));
            let mut names = HashSet::new();
            for batch in &batches {
                for host in *batch {
                    assert!(names.insert(host.read().unwrap().name()));
                }
            }
            assert_eq!(names.len(), total);
        }
    }

    #[test]
    fn test_seven_hosts_batch_size_three_gives_3_3_1() {
        let input = hosts(&[
            ("10.0.0.1", true),
            ("10.0.0.2", false),
            ("10.0.0.3", true),
            ("10.0.0.4", false),
            ("10.0.0.5", true),
            ("10.0.0.6", false),
            ("10.0.0.7", false),
        ]);
        let ordered = order_deploy(input, 3);
        let sizes: Vec<usize> = ordered.chunks(3).map(<[SharedHost]>::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_order_deploy_puts_installs_first() {
        for permutation in [
            [false, false, true, true],
            [true, false, true, false],
            [false, true, false, true],
        ] {
            let input: Vec<SharedHost> = permutation
                .iter()
                .enumerate()
                .map(|(i, install)| {
                    let mut host = Host::ip_address(format!("10.0.0.{i}"));
                    if *install {
                        host.add_action(HostAction::Install);
                    }
                    host.shared()
                })
                .collect();
            // striping happens within a single bucket here, preserving the
            // install-first partition
            let ordered = order_deploy(input, 4);
            let installs: Vec<bool> = ordered
                .iter()
                .map(|host| host.read().unwrap().install())
                .collect();
            let first_stage = installs.iter().position(|install| !install);
            if let Some(boundary) = first_stage {
                assert!(installs[boundary..].iter().all(|install| !install));
            }
        }
    }

    #[test]
    fn test_striping_spreads_installs_across_batches() {
        // 4 installs + 4 stage-only at batch size 4: without striping the
        // first batch would be all installs
        let input = hosts(&[
            ("10.0.0.1", true),
            ("10.0.0.2", true),
            ("10.0.0.3", true),
            ("10.0.0.4", true),
            ("10.0.0.5", false),
            ("10.0.0.6", false),
            ("10.0.0.7", false),
            ("10.0.0.8", false),
        ]);
        let ordered = order_deploy(input, 4);
        let batches: Vec<Vec<bool>> = ordered
            .chunks(4)
            .map(|batch| {
                batch
                    .iter()
                    .map(|host| host.read().unwrap().install())
                    .collect()
            })
            .collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].iter().filter(|i| **i).count(), 2);
        assert_eq!(batches[1].iter().filter(|i| **i).count(), 2);
    }

    #[test]
    fn test_unique_hosts_dedups_by_name() {
        let shared = hosts(&[("10.0.0.1", true)]).remove(0);
        let group_a = HostGroup::new("a", vec![shared.clone()]);
        let group_b = HostGroup::new("b", vec![shared, hosts(&[("10.0.0.2", false)]).remove(0)]);

        let all = unique_hosts(&[group_a, group_b], false);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_unique_hosts_install_only() {
        let group = HostGroup::new(
            "g",
            hosts(&[("10.0.0.1", true), ("10.0.0.2", false)]),
        );
        let only_installs = unique_hosts(&[group], true);
        assert_eq!(only_installs.len(), 1);
        assert!(only_installs[0].read().unwrap().install());
    }

    #[test]
    fn test_option_validation() {
        assert!(DeployOptions { count: Some(0), ..opts() }.validate().is_err());
        assert!(DeployOptions { percent: Some(0), ..opts() }.validate().is_err());
        assert!(DeployOptions { batch_size: Some(0), ..opts() }.validate().is_err());
        assert!(DeployOptions { batch_count: Some(0), ..opts() }.validate().is_err());
        assert!(
            DeployOptions {
                count: Some(1),
                percent: Some(50),
                ..opts()
            }
            .validate()
            .is_err()
        );
        assert!(opts().validate().is_ok());
    }
}
