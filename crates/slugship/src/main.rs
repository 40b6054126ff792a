use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod logging;
mod prompt;

#[derive(Parser)]
#[command(name = "slugship")]
#[command(about = "Slugship - slug deployment and fleet rollout tool")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(long, global = true, default_value = "slugship.yaml")]
    config: PathBuf,

    /// Project the slugs belong to (overrides the config file)
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a slug to host(s)
    Deploy {
        #[command(subcommand)]
        command: commands::deploy::DeployCommands,
    },

    /// Manage a project's tags
    Tag {
        #[command(subcommand)]
        command: commands::tag::TagCommands,
    },

    /// Wrangle stored slugs
    Slug {
        #[command(subcommand)]
        command: commands::slug::SlugCommands,
    },

    /// List every project in the artifact store
    Projects,
}

fn main() -> Result<()> {
    smol::block_on(async {
        let cli = Cli::parse();
        logging::init(cli.verbose);

        let config = config::Config::load(&cli.config)?;
        let ctx = commands::CommandContext::new(&cli, config)?;

        match cli.command {
            Commands::Deploy { command } => commands::deploy::run(&ctx, command).await,
            Commands::Tag { command } => commands::tag::run(&ctx, command).await,
            Commands::Slug { command } => commands::slug::run(&ctx, command).await,
            Commands::Projects => commands::projects::run(&ctx).await,
        }
    })
}
