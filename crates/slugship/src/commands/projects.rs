//! `slugship projects` subcommand

use anyhow::Result;

use super::CommandContext;

/// List every project with at least one stored object
pub async fn run(ctx: &CommandContext) -> Result<()> {
    let mut projects = ctx.tag_store().projects().await?;
    projects.sort();

    if ctx.json {
        println!("{}", serde_json::to_string(&projects)?);
    } else if projects.is_empty() {
        println!("no projects in the store yet");
    } else {
        for project in projects {
            println!("{project}");
        }
    }
    Ok(())
}
