//! `slugship slug` subcommands and shared slug lookup helpers

use std::fs;
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use comfy_table::Table;
use slug_store::{ArtifactStore, ObjectMeta};
use tracing::info;

use super::{CommandContext, file_name_of};

/// Slug wrangling operations
#[derive(Debug, Clone, Subcommand)]
pub enum SlugCommands {
    /// Push a slug file into the artifact store
    Push {
        /// Slug file to upload
        file: PathBuf,

        /// Tag the slug with this tag once pushed
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Pull a slug from the store (most recent if no name part is given)
    Pull {
        /// Enough of the slug name to identify it uniquely
        name_part: Option<String>,
    },

    /// List published slugs for the project
    List {
        /// How many slugs to list
        #[arg(short, long, default_value_t = 10)]
        count: usize,

        /// List all slugs
        #[arg(short, long)]
        all: bool,
    },
}

/// Entry point for `slugship slug`
pub async fn run(ctx: &CommandContext, command: SlugCommands) -> Result<()> {
    match command {
        SlugCommands::Push { file, tag } => push(ctx, file, tag).await,
        SlugCommands::Pull { name_part } => pull(ctx, name_part).await,
        SlugCommands::List { count, all } => list(ctx, count, all).await,
    }
}

async fn push(ctx: &CommandContext, file: PathBuf, tag: Option<String>) -> Result<()> {
    let project = ctx.project()?;
    if !file.is_file() {
        bail!("file does not exist: {}", file.display());
    }
    let name = file_name_of(&file)?;
    let key = format!("{project}/{name}");
    let bytes = fs::read(&file)?;
    info!(%key, size = bytes.len(), "uploading slug");
    ctx.store.put_object(&key, bytes).await?;
    println!("pushed {name} to {project}");

    if let Some(tag) = tag {
        ctx.tag_store().create_tag(project, &tag, &key).await?;
        println!("tagged {name} as {tag}");
    }
    Ok(())
}

async fn pull(ctx: &CommandContext, name_part: Option<String>) -> Result<()> {
    let project = ctx.project()?;
    let meta = match name_part {
        Some(part) => find_slug(ctx.store.as_ref(), project, &part).await?,
        None => find_latest_slug(ctx.store.as_ref(), project).await?,
    };
    let bytes = ctx
        .store
        .get_object(&meta.key)
        .await?
        .with_context(|| format!("slug vanished from the store: {}", meta.key))?;

    let dest = meta.name().to_string();
    fs::write(&dest, bytes)?;
    println!("pulled {dest} ({})", format_size(meta.size));
    Ok(())
}

async fn list(ctx: &CommandContext, count: usize, all: bool) -> Result<()> {
    if !all && count == 0 {
        bail!("count must be greater than 0");
    }
    let project = ctx.project()?;
    let mut slugs = list_slugs(ctx.store.as_ref(), project).await?;
    if slugs.is_empty() {
        bail!("no slugs found for {project}");
    }
    slugs.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    if !all {
        slugs.truncate(count);
    }

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&slugs)?);
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(["Slug", "Size", "Age"]);
    for meta in &slugs {
        table.add_row([
            meta.name().to_string(),
            format_size(meta.size),
            format_age(meta.last_modified),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Every `.slug` object stored under the project
pub async fn list_slugs(store: &dyn ArtifactStore, project: &str) -> Result<Vec<ObjectMeta>> {
    Ok(store
        .list_objects(&format!("{project}/"))
        .await?
        .into_iter()
        .filter(|meta| meta.key.ends_with(".slug"))
        .collect())
}

/// Find the single slug whose key contains `name_part`.
///
/// Zero matches and multiple matches are both configuration errors; the
/// caller gave us either a typo or not enough of the name.
pub async fn find_slug(
    store: &dyn ArtifactStore,
    project: &str,
    name_part: &str,
) -> Result<ObjectMeta> {
    let mut matches: Vec<ObjectMeta> = list_slugs(store, project)
        .await?
        .into_iter()
        .filter(|meta| meta.key.contains(name_part))
        .collect();
    match matches.len() {
        0 => bail!(
            "unable to find a slug from '{name_part}'; use `slugship slug list` to see available slugs"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let names: Vec<&str> = matches.iter().map(|meta| meta.name()).collect();
            bail!(
                "ambiguous slug name; found more than one slug with '{name_part}' in their names:\n  {}",
                names.join("\n  ")
            )
        }
    }
}

/// The most recently modified slug in the project
pub async fn find_latest_slug(store: &dyn ArtifactStore, project: &str) -> Result<ObjectMeta> {
    list_slugs(store, project)
        .await?
        .into_iter()
        .max_by_key(|meta| meta.last_modified)
        .with_context(|| format!("no slugs found for {project}"))
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Rough age of a timestamp, largest unit only
pub fn format_age(timestamp: DateTime<Utc>) -> String {
    let seconds = (Utc::now() - timestamp).num_seconds().max(0);
    match seconds {
        0..60 => format!("{seconds}s"),
        60..3600 => format!("{}m", seconds / 60),
        3600..86400 => format!("{}h", seconds / 3600),
        _ => format!("{}d", seconds / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slug_store::MemoryStore;

    fn block_on<T>(future: impl std::future::Future<Output = T>) -> T {
        smol::block_on(future)
    }

    #[test]
    fn test_find_slug_rejects_ambiguity() {
        block_on(async {
            let store = MemoryStore::new();
            store
                .put_object("demo/web-1.slug", vec![1])
                .await
                .unwrap();
            store
                .put_object("demo/web-2.slug", vec![2])
                .await
                .unwrap();
            store
                .put_object("demo/tags/prod", b"demo/web-1.slug".to_vec())
                .await
                .unwrap();

            // tag files never count as slugs
            assert_eq!(list_slugs(&store, "demo").await.unwrap().len(), 2);

            let unique = find_slug(&store, "demo", "web-1").await.unwrap();
            assert_eq!(unique.key, "demo/web-1.slug");

            assert!(find_slug(&store, "demo", "web").await.is_err());
            assert!(find_slug(&store, "demo", "api").await.is_err());
        });
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_age() {
        let now = Utc::now();
        assert_eq!(format_age(now), "0s");
        assert_eq!(format_age(now - chrono::Duration::minutes(5)), "5m");
        assert_eq!(format_age(now - chrono::Duration::hours(3)), "3h");
        assert_eq!(format_age(now - chrono::Duration::days(2)), "2d");
    }
}
