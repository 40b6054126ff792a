//! `slugship deploy` subcommands

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Args, Subcommand};
use dialoguer::Confirm;
use fleet_deploy::{
    ArtifactSource, CopyMethod, DeployOptions, Deployer, HostGroup, StaticInventory, unique_hosts,
};
use remote_exec::SshTransport;
use serde_json::json;
use tracing::{info, warn};

use super::{CommandContext, file_name_of, slug};
use crate::prompt::{InteractivePrompt, interrupt_channel};

/// Expiring download URLs must outlive a slow batch
const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(60 * 60);

/// Options shared by every deploy subcommand
#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    /// Host patterns: IP, hostname, instance id, key=value tag, or group name
    #[arg(required = true)]
    pub hosts: Vec<String>,

    /// The identity (.pem) file to use for authentication
    #[arg(short, long)]
    pub identity: Option<PathBuf>,

    /// The directory to deploy to on the server
    #[arg(short = 'd', long)]
    pub deploy_dir: Option<String>,

    /// Account that the application will run with when deployed
    #[arg(short, long)]
    pub owner: Option<String>,

    /// A quoted, space-delimited list of environment variables and values
    #[arg(short, long)]
    pub env: Option<String>,

    /// Only deploy to the specified number of hosts per group
    #[arg(short, long)]
    pub count: Option<usize>,

    /// Only deploy to the specified percent of hosts per group
    #[arg(long)]
    pub percent: Option<u32>,

    /// Set the number of hosts per deployment batch to help slow your roll
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Set the number of deployment batches instead of a batch size
    #[arg(long)]
    pub batch_count: Option<usize>,

    /// Seconds to pause between deployment batches
    #[arg(long)]
    pub batch_pause: Option<u64>,

    /// Don't stage the slug on group members that were not targeted
    #[arg(long)]
    pub no_stage: bool,

    /// Log what would happen without touching any host
    #[arg(long)]
    pub pretend: bool,

    /// Skip slug detection and clobber existing installs
    #[arg(short, long)]
    pub force: bool,

    /// Do not prompt to proceed with the deploy
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Exit non-zero when any host fails
    #[arg(long)]
    pub strict: bool,
}

/// Ways of naming the slug to deploy
#[derive(Debug, Clone, Subcommand)]
pub enum DeployCommands {
    /// Deploy a local slug file to host(s)
    File {
        /// Slug file to deploy
        filename: PathBuf,

        #[command(flatten)]
        args: DeployArgs,
    },

    /// Deploy a stored slug by name fragment to host(s)
    Name {
        /// Enough of the slug name to identify it uniquely
        name_part: String,

        #[command(flatten)]
        args: DeployArgs,
    },

    /// Deploy the slug a tag currently points at to host(s)
    Tag {
        /// Tag to deploy
        tag: String,

        #[command(flatten)]
        args: DeployArgs,
    },

    /// Roll a tag back one entry and deploy the previous slug to host(s)
    Rollback {
        /// Tag to roll back
        tag: String,

        #[command(flatten)]
        args: DeployArgs,
    },
}

/// Entry point for `slugship deploy`
pub async fn run(ctx: &CommandContext, command: DeployCommands) -> Result<()> {
    let tags = ctx.tag_store();
    let (artifact, args) = match command {
        DeployCommands::File { filename, args } => {
            let slug_name = file_name_of(&filename)?;
            info!(slug = %slug_name, "deploying local slug file");
            (
                ArtifactSource {
                    slug_name,
                    method: CopyMethod::Push {
                        local_path: filename,
                    },
                },
                args,
            )
        }
        DeployCommands::Name { name_part, args } => {
            let project = ctx.project()?;
            let meta = slug::find_slug(ctx.store.as_ref(), project, &name_part).await?;
            (pull_source(ctx, meta.key).await?, args)
        }
        DeployCommands::Tag { tag, args } => {
            let project = ctx.verify_project(&tags).await?;
            let key = tags
                .slug_for_tag(project, &tag)
                .await?
                .with_context(|| format!("could not find tag '{tag}' for project '{project}'"))?;
            (pull_source(ctx, key).await?, args)
        }
        DeployCommands::Rollback { tag, args } => {
            let project = ctx.verify_project(&tags).await?;
            let key = tags
                .rollback_slug_for_tag(project, &tag)
                .await?
                .with_context(|| {
                    format!("no rollback history for tag '{tag}' in project '{project}'")
                })?;
            info!(%tag, slug = %key, "rolled tag back");
            (pull_source(ctx, key).await?, args)
        }
    };
    deploy(ctx, artifact, args).await
}

/// Build a pull-mode artifact source for a stored slug key
async fn pull_source(ctx: &CommandContext, key: String) -> Result<ArtifactSource> {
    let url = ctx.store.temporary_url(&key, DOWNLOAD_URL_TTL).await?;
    let slug_name = key.rsplit('/').next().unwrap_or(key.as_str()).to_string();
    info!(slug = %key, "deploying stored slug");
    Ok(ArtifactSource {
        slug_name,
        method: CopyMethod::Pull { url },
    })
}

async fn deploy(ctx: &CommandContext, artifact: ArtifactSource, args: DeployArgs) -> Result<()> {
    let opts = deploy_options(ctx, &args);
    if !confirm_deployment(ctx, &args)? {
        warn!("deployment aborted");
        return Ok(());
    }

    let mut transport = SshTransport::new();
    if let Some(port) = ctx.config.ssh.port {
        transport = transport.with_port(port);
    }
    let inventory = Arc::new(StaticInventory::new(ctx.config.fleet.clone()));

    let mut deployer = Deployer::new(Arc::new(transport), inventory)
        .with_prompt(Arc::new(InteractivePrompt))
        .with_report_dir(std::env::current_dir()?);
    match interrupt_channel() {
        Ok(interrupts) => deployer = deployer.with_interrupts(interrupts),
        Err(err) => warn!(%err, "could not install interrupt handler"),
    }

    let groups = deployer.deploy(&args.hosts, &artifact, &opts).await?;
    summarize(ctx, &artifact, &groups, opts.no_stage, args.strict)
}

fn confirm_deployment(ctx: &CommandContext, args: &DeployArgs) -> Result<bool> {
    if args.yes || args.force || args.pretend || ctx.json {
        return Ok(true);
    }
    Ok(Confirm::new()
        .with_prompt("Are you sure you wish to deploy?")
        .default(false)
        .interact()?)
}

fn deploy_options(ctx: &CommandContext, args: &DeployArgs) -> DeployOptions {
    let defaults = DeployOptions::default();
    DeployOptions {
        project: ctx.project.clone(),
        username: ctx.config.ssh.username.clone(),
        identity: args
            .identity
            .clone()
            .or_else(|| ctx.config.ssh.identity.clone()),
        deploy_dir: args
            .deploy_dir
            .clone()
            .or_else(|| ctx.config.deploy.dir.clone())
            .unwrap_or(defaults.deploy_dir),
        owner: args.owner.clone(),
        env: args.env.clone(),
        force: args.force,
        pretend: args.pretend,
        no_stage: args.no_stage,
        count: args.count,
        percent: args.percent,
        batch_size: args
            .batch_size
            .or(ctx.config.deploy.batch_size)
            .or(defaults.batch_size),
        batch_count: args.batch_count,
        batch_pause: args
            .batch_pause
            .or(ctx.config.deploy.batch_pause)
            .map(Duration::from_secs),
    }
}

fn summarize(
    ctx: &CommandContext,
    artifact: &ArtifactSource,
    groups: &[HostGroup],
    no_stage: bool,
    strict: bool,
) -> Result<()> {
    let hosts = unique_hosts(groups, no_stage);
    let total = hosts.len();
    let succeeded = hosts
        .iter()
        .filter(|host| host.read().unwrap().success())
        .count();
    let overall = succeeded == total;

    if ctx.json {
        let reports: Vec<_> = hosts
            .iter()
            .map(|host| host.read().unwrap().report())
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "slug_name": artifact.slug_name,
                "hosts": reports,
                "success": overall,
            }))?
        );
    } else {
        println!(
            "\nDeployed {} to {succeeded} of {total} hosts",
            artifact.slug_name
        );
        if !overall {
            println!("\nFailures:");
            let mut index = 0;
            for host in &hosts {
                let host = host.read().unwrap();
                if host.success() {
                    continue;
                }
                index += 1;
                println!("\n{index:>4}) {}", host.name());
                for line in host.output() {
                    println!("      {}", line.trim_end());
                }
            }
        }
    }

    if strict && !overall {
        bail!("{} of {total} hosts failed to deploy", total - succeeded);
    }
    Ok(())
}
