//! `slugship tag` subcommands

use anyhow::Result;
use clap::Subcommand;
use comfy_table::Table;
use dialoguer::Confirm;
use serde_json::json;
use slug_store::TagCleanOutcome;

use super::{CommandContext, slug};

/// Tag that deploy tooling treats as the production pointer; never cleaned
const PROTECTED_TAG: &str = "production-current";

/// Tag management operations
#[derive(Debug, Clone, Subcommand)]
pub enum TagCommands {
    /// Update a tag to point at a stored slug
    Set {
        /// Tag to create or move
        tag: String,

        /// Enough of the slug name to identify it uniquely
        name_part: String,
    },

    /// Show the slug a tag points at
    Show {
        /// Tag to inspect
        tag: String,
    },

    /// List the project's tags
    List,

    /// Show the rollback history of a tag
    History {
        /// Tag to inspect
        tag: String,
    },

    /// Create a new tag with the same history as an existing tag
    Clone {
        /// Existing tag
        tag: String,

        /// Name of the copy
        new_tag: String,
    },

    /// Delete a tag
    Delete {
        /// Tag to delete
        tag: String,

        /// Answer yes to the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Remove tags that point to missing slugs
    Clean,
}

/// Entry point for `slugship tag`
pub async fn run(ctx: &CommandContext, command: TagCommands) -> Result<()> {
    let tags = ctx.tag_store();
    let project = ctx.verify_project(&tags).await?;

    match command {
        TagCommands::Set { tag, name_part } => {
            let meta = slug::find_slug(ctx.store.as_ref(), project, &name_part).await?;
            tags.create_tag(project, &tag, &meta.key).await?;
            if ctx.json {
                println!(
                    "{}",
                    serde_json::to_string(&json!({
                        "project": project, "tag": tag, "slug": meta.key,
                    }))?
                );
            } else {
                println!("set {project} {tag} to slug {}", meta.key);
            }
        }

        TagCommands::Show { tag } => {
            match tags.slug_for_tag(project, &tag).await? {
                Some(slug_key) => {
                    let exists = ctx.store.head_object(&slug_key).await?;
                    if ctx.json {
                        println!(
                            "{}",
                            serde_json::to_string(&json!({
                                "project": project, "tag": tag,
                                "slug_name": slug_key, "exists": exists,
                            }))?
                        );
                    } else {
                        let note = if exists { "exists" } else { "missing" };
                        println!("{tag}: {slug_key} ({note})");
                    }
                }
                None => report_missing_tag(ctx, &tag)?,
            }
        }

        TagCommands::List => {
            let mut names = tags.tags(project).await?;
            tags.prefetch_tags(project).await?;
            names.sort();

            if ctx.json {
                println!("{}", serde_json::to_string(&names)?);
            } else {
                println!("Tags for {project}");
                let mut table = Table::new();
                table.set_header(["Tag", "Current slug"]);
                // the production pointer always leads the listing
                for name in names
                    .iter()
                    .filter(|name| *name == PROTECTED_TAG)
                    .chain(names.iter().filter(|name| *name != PROTECTED_TAG))
                {
                    let current = tags
                        .slug_for_tag(project, name)
                        .await?
                        .unwrap_or_default();
                    table.add_row([name.clone(), current]);
                }
                println!("{table}");
            }
        }

        TagCommands::History { tag } => {
            let history = tags.slugs_for_tag(project, &tag).await?;
            if history.is_empty() {
                report_missing_tag(ctx, &tag)?;
            } else if ctx.json {
                println!(
                    "{}",
                    serde_json::to_string(&json!({
                        "project": project, "tag": tag,
                        "slug_names": history, "exists": true,
                    }))?
                );
            } else {
                for (index, slug_key) in history.iter().enumerate() {
                    let label = if index == 0 {
                        "current".to_string()
                    } else {
                        format!("-{index}")
                    };
                    println!("{label:>8}: {slug_key}");
                }
            }
        }

        TagCommands::Clone { tag, new_tag } => {
            match tags.slug_for_tag(project, &tag).await? {
                Some(slug_key) => {
                    tags.clone_tag(project, &tag, &new_tag).await?;
                    if ctx.json {
                        println!(
                            "{}",
                            serde_json::to_string(&json!({
                                "project": project, "tag": new_tag, "slug": slug_key,
                            }))?
                        );
                    } else {
                        println!("set {project} {new_tag} to slug {slug_key}");
                    }
                }
                None => report_missing_tag(ctx, &tag)?,
            }
        }

        TagCommands::Delete { tag, yes } => {
            let confirmed = yes
                || ctx.json
                || Confirm::new()
                    .with_prompt(format!("Are you sure you wish to delete tag '{tag}'?"))
                    .default(true)
                    .interact()?;
            if confirmed {
                tags.delete_tag(project, &tag).await?;
                println!("deleted {project} {tag}");
            } else {
                println!("kept {project} {tag}");
            }
        }

        TagCommands::Clean => {
            let outcomes = tags.clean_tags(project, PROTECTED_TAG).await?;
            let deleted: Vec<&str> = outcomes
                .iter()
                .filter(|(_, outcome)| *outcome == TagCleanOutcome::Deleted)
                .map(|(tag, _)| tag.as_str())
                .collect();
            if ctx.json {
                println!("{}", serde_json::to_string(&json!({ "deleted": deleted }))?);
            } else if deleted.is_empty() {
                println!("nothing to clean for {project}");
            } else {
                for tag in deleted {
                    println!("deleted {tag}");
                }
            }
        }
    }
    Ok(())
}

fn report_missing_tag(ctx: &CommandContext, tag: &str) -> Result<()> {
    if ctx.json {
        println!(
            "{}",
            serde_json::to_string(&json!({ "tag": tag, "exists": false }))?
        );
    } else {
        println!("tag '{tag}' does not exist");
    }
    Ok(())
}
