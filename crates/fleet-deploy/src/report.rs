//! Per-run JSON status snapshots with bounded retention

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::group::HostGroup;
use crate::host::HostReport;
use crate::Result;

/// Prefix of every status report file
pub const REPORT_PREFIX: &str = "slug-deploy-status-";

/// How many status reports are kept before the oldest is deleted
pub const REPORT_RETENTION: usize = 10;

/// Full status snapshot of one deployment run
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// The command line of the invoking process
    pub command_line: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Total `MM:SS` run time at write time
    pub elapsed: String,
    /// Whether every host succeeded
    pub success: bool,
    /// Per-host status grouped by the pattern that matched the host
    pub host_groups: Vec<GroupReport>,
}

/// Host statuses for one group
#[derive(Debug, Serialize)]
pub struct GroupReport {
    /// The pattern the group resolved from
    pub group: String,
    /// Final per-host snapshots
    pub hosts: Vec<HostReport>,
}

/// Write a run's status snapshot into `dir` and prune old reports.
///
/// The file is named with the run's timestamp stamp; only the
/// [`REPORT_RETENTION`] most recent reports are kept.
pub fn write_run_report(
    dir: &Path,
    context: &RunContext,
    groups: &[HostGroup],
    success: bool,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let report = RunReport {
        command_line: std::env::args().collect::<Vec<_>>().join(" "),
        started_at: context.started_at(),
        elapsed: context.elapsed_label(),
        success,
        host_groups: groups
            .iter()
            .map(|group| GroupReport {
                group: group.name().to_string(),
                hosts: group
                    .hosts()
                    .iter()
                    .map(|host| host.read().unwrap().report())
                    .collect(),
            })
            .collect(),
    };

    let path = dir.join(format!("{REPORT_PREFIX}{}.json", context.stamp()));
    fs::write(&path, serde_json::to_string_pretty(&report)?)?;
    debug!(path = %path.display(), "wrote status report");

    purge_old_reports(dir, REPORT_RETENTION)?;
    Ok(path)
}

/// Delete all but the `keep` newest report files in `dir`
fn purge_old_reports(dir: &Path, keep: usize) -> std::io::Result<()> {
    let mut reports: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(REPORT_PREFIX) || !name.ends_with(".json") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        reports.push((modified, entry.path()));
    }

    reports.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in reports.into_iter().skip(keep) {
        if let Err(err) = fs::remove_file(&path) {
            warn!(path = %path.display(), %err, "failed to prune old status report");
        }
    }
    Ok(())
}
