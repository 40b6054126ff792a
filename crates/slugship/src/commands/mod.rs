//! CLI subcommand implementations

pub mod deploy;
pub mod projects;
pub mod slug;
pub mod tag;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use slug_store::{ArtifactStore, DirStore, TagStore};

use crate::Cli;
use crate::config::Config;

/// Shared state every subcommand needs
pub struct CommandContext {
    /// Emit machine-readable JSON instead of human output
    pub json: bool,
    /// Project, from the flag or the config file
    pub project: Option<String>,
    /// Loaded configuration
    pub config: Config,
    /// The artifact store backing slugs and tags
    pub store: Arc<dyn ArtifactStore>,
}

impl CommandContext {
    /// Build the context from parsed flags and loaded configuration
    pub fn new(cli: &Cli, config: Config) -> Result<Self> {
        let store = DirStore::open(&config.store.root).with_context(|| {
            format!("opening artifact store at {}", config.store.root.display())
        })?;
        Ok(Self {
            json: cli.json,
            project: cli.project.clone().or_else(|| config.project.clone()),
            config,
            store: Arc::new(store),
        })
    }

    /// The project name, or an actionable error
    pub fn project(&self) -> Result<&str> {
        self.project.as_deref().ok_or_else(|| {
            anyhow!("could not determine project name; set `project` in slugship.yaml or pass --project")
        })
    }

    /// A tag store over the context's artifact store
    pub fn tag_store(&self) -> TagStore {
        TagStore::new(self.store.clone())
    }

    /// The project name, verified to exist in the store
    pub async fn verify_project(&self, tags: &TagStore) -> Result<&str> {
        let project = self.project()?;
        if !tags.projects().await?.iter().any(|existing| existing == project) {
            bail!("there is no project named '{project}'; push a slug first or check --project");
        }
        Ok(project)
    }
}

/// The final component of a path as a string
pub fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))
}
