//! Tag/version store: named pointers into bounded slug histories

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::ArtifactStore;
use crate::{Error, Result};

/// How many history entries a tag retains; older entries are dropped silently
pub const TAG_HISTORY_LIMIT: usize = 10;

/// Outcome of [`TagStore::clean_tags`] for one tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagCleanOutcome {
    /// The tag's current slug exists (or could not be verified) and the tag
    /// was kept
    Valid,
    /// The tag pointed at a missing slug and was deleted
    Deleted,
}

#[derive(Default)]
struct TagCache {
    /// project -> tag names
    tags: HashMap<String, Vec<String>>,
    /// project -> tag -> slug history, most recent first
    history: HashMap<String, HashMap<String, Vec<String>>>,
    dirty: bool,
}

/// Versioned-pointer persistence on top of an [`ArtifactStore`].
///
/// A tag is stored as a newline-joined list of slug keys at
/// `{project}/tags/{tag}`, most recent first, capped at
/// [`TAG_HISTORY_LIMIT`] entries. The store backend owns the data; this type
/// is a cache-through accessor — reads are memoized per instance and the
/// whole cache is recomputed after any write.
pub struct TagStore {
    store: Arc<dyn ArtifactStore>,
    cache: RwLock<TagCache>,
}

impl TagStore {
    /// Create a tag store over the given backend
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(TagCache::default()),
        }
    }

    /// Storage key for a tag's history file
    pub fn tag_key(project: &str, tag: &str) -> String {
        format!("{project}/tags/{tag}")
    }

    fn flush_if_dirty(&self) {
        let mut cache = self.cache.write().unwrap();
        if cache.dirty {
            *cache = TagCache::default();
        }
    }

    fn mark_dirty(&self) {
        self.cache.write().unwrap().dirty = true;
    }

    /// Every project that has at least one object in the store
    pub async fn projects(&self) -> Result<Vec<String>> {
        let mut projects: Vec<String> = Vec::new();
        for meta in self.store.list_objects("").await? {
            if let Some(project) = meta.project() {
                if !projects.iter().any(|existing| existing == project) {
                    projects.push(project.to_string());
                }
            }
        }
        Ok(projects)
    }

    /// Names of every tag defined for `project`
    pub async fn tags(&self, project: &str) -> Result<Vec<String>> {
        self.flush_if_dirty();
        if let Some(tags) = self.cache.read().unwrap().tags.get(project) {
            return Ok(tags.clone());
        }

        let prefix = format!("{project}/tags/");
        let tags: Vec<String> = self
            .store
            .list_objects(&prefix)
            .await?
            .into_iter()
            .filter_map(|meta| meta.key.strip_prefix(&prefix).map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect();

        self.cache
            .write()
            .unwrap()
            .tags
            .insert(project.to_string(), tags.clone());
        Ok(tags)
    }

    async fn fetch_history(&self, project: &str, tag: &str) -> Result<Vec<String>> {
        let body = match self.store.get_object(&Self::tag_key(project, tag)).await {
            Ok(body) => body,
            // Restricted history files read as empty rather than erroring the
            // whole scan
            Err(err) if err.is_forbidden() => {
                debug!(project, tag, "tag history forbidden, treating as empty");
                None
            }
            Err(err) => return Err(err),
        };
        Ok(body
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Full slug history for a tag, most recent first
    pub async fn slugs_for_tag(&self, project: &str, tag: &str) -> Result<Vec<String>> {
        self.flush_if_dirty();
        if let Some(slugs) = self
            .cache
            .read()
            .unwrap()
            .history
            .get(project)
            .and_then(|tags| tags.get(tag))
        {
            return Ok(slugs.clone());
        }

        let slugs = self.fetch_history(project, tag).await?;
        self.cache
            .write()
            .unwrap()
            .history
            .entry(project.to_string())
            .or_default()
            .insert(tag.to_string(), slugs.clone());
        Ok(slugs)
    }

    /// The slug a tag currently points at
    pub async fn slug_for_tag(&self, project: &str, tag: &str) -> Result<Option<String>> {
        Ok(self.slugs_for_tag(project, tag).await?.into_iter().next())
    }

    /// Point a tag at `slug_key`, pushing the previous value down the history
    pub async fn create_tag(&self, project: &str, tag: &str, slug_key: &str) -> Result<()> {
        let mut slugs = vec![slug_key.to_string()];
        slugs.extend(self.slugs_for_tag(project, tag).await?);
        slugs.truncate(TAG_HISTORY_LIMIT);
        self.save_tag(project, tag, &slugs).await
    }

    /// Drop the current head of a tag's history and return the new head.
    ///
    /// The shortened history is persisted unless it would be empty — a tag
    /// with a single entry is left untouched in the store.
    pub async fn rollback_slug_for_tag(&self, project: &str, tag: &str) -> Result<Option<String>> {
        let mut slugs = self.slugs_for_tag(project, tag).await?;
        if !slugs.is_empty() {
            slugs.remove(0);
        }
        if !slugs.is_empty() {
            self.save_tag(project, tag, &slugs).await?;
        }
        Ok(slugs.into_iter().next())
    }

    /// Copy a tag's full history under a new name
    pub async fn clone_tag(&self, project: &str, old_tag: &str, new_tag: &str) -> Result<()> {
        let slugs = self.slugs_for_tag(project, old_tag).await?;
        self.save_tag(project, new_tag, &slugs).await
    }

    /// Delete a tag outright
    pub async fn delete_tag(&self, project: &str, tag: &str) -> Result<()> {
        self.store
            .delete_object(&Self::tag_key(project, tag))
            .await?;
        self.mark_dirty();
        Ok(())
    }

    /// Every tag whose current head equals `slug_key`
    pub async fn tags_for_slug(&self, project: &str, slug_key: &str) -> Result<Vec<String>> {
        let mut matching = Vec::new();
        for tag in self.tags(project).await? {
            if self.slug_for_tag(project, &tag).await?.as_deref() == Some(slug_key) {
                matching.push(tag);
            }
        }
        Ok(matching)
    }

    /// Warm the history cache for a whole project with concurrent reads.
    ///
    /// Call this before looping over slugs with [`TagStore::tags_for_slug`];
    /// without it every uncached tag costs a serial round-trip.
    pub async fn prefetch_tags(&self, project: &str) -> Result<()> {
        let tags = self.tags(project).await?;
        let uncached: Vec<String> = {
            let cache = self.cache.read().unwrap();
            let known = cache.history.get(project);
            tags.into_iter()
                .filter(|tag| !known.is_some_and(|tags| tags.contains_key(tag)))
                .collect()
        };

        let fetches = uncached.into_iter().map(|tag| async move {
            let slugs = self.fetch_history(project, &tag).await;
            (tag, slugs)
        });
        let results = join_all(fetches).await;

        let mut cache = self.cache.write().unwrap();
        let project_cache = cache.history.entry(project.to_string()).or_default();
        for (tag, slugs) in results {
            // Last writer wins; a racing direct read stores the same data
            project_cache.insert(tag, slugs?);
        }
        Ok(())
    }

    /// Delete tags whose current slug is missing from the store.
    ///
    /// `protected` names a tag that is never considered for deletion. A
    /// forbidden response while checking a slug keeps the tag: an entry we
    /// cannot verify is treated as valid.
    pub async fn clean_tags(
        &self,
        project: &str,
        protected: &str,
    ) -> Result<Vec<(String, TagCleanOutcome)>> {
        self.prefetch_tags(project).await?;
        let tags: Vec<String> = self
            .tags(project)
            .await?
            .into_iter()
            .filter(|tag| tag != protected)
            .collect();

        let checks = tags.into_iter().map(|tag| async move {
            let slug = self.slug_for_tag(project, &tag).await?;
            let valid = match slug {
                Some(slug) => match self.store.head_object(&slug).await {
                    Ok(exists) => exists,
                    Err(err) if err.is_forbidden() => true,
                    Err(err) => return Err(err),
                },
                None => false,
            };
            Ok::<_, Error>((tag, valid))
        });

        let mut outcomes = Vec::new();
        for result in join_all(checks).await {
            let (tag, valid) = result?;
            if valid {
                outcomes.push((tag, TagCleanOutcome::Valid));
            } else {
                warn!(project, tag, "tag points at a missing slug, deleting");
                self.delete_tag(project, &tag).await?;
                outcomes.push((tag, TagCleanOutcome::Deleted));
            }
        }
        Ok(outcomes)
    }

    async fn save_tag(&self, project: &str, tag: &str, slugs: &[String]) -> Result<()> {
        self.store
            .put_object(
                &Self::tag_key(project, tag),
                slugs.join("\n").into_bytes(),
            )
            .await?;
        self.mark_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn tag_store() -> (Arc<MemoryStore>, TagStore) {
        let store = Arc::new(MemoryStore::new());
        let tags = TagStore::new(store.clone());
        (store, tags)
    }

    async fn stored_history(store: &MemoryStore, project: &str, tag: &str) -> Option<String> {
        store
            .get_object(&TagStore::tag_key(project, tag))
            .await
            .unwrap()
            .map(|bytes| String::from_utf8(bytes).unwrap())
    }

    #[smol_potat::test]
    async fn test_create_and_read_tags() {
        let (_, tags) = tag_store();

        tags.create_tag("demo", "prod", "v1.slug").await.unwrap();
        tags.create_tag("demo", "prod", "v2.slug").await.unwrap();

        assert_eq!(
            tags.slug_for_tag("demo", "prod").await.unwrap(),
            Some("v2.slug".to_string())
        );
        assert_eq!(
            tags.slugs_for_tag("demo", "prod").await.unwrap(),
            vec!["v2.slug", "v1.slug"]
        );
        assert_eq!(tags.tags("demo").await.unwrap(), vec!["prod"]);
    }

    #[smol_potat::test]
    async fn test_history_is_capped() {
        let (store, tags) = tag_store();

        for version in 0..11 {
            tags.create_tag("demo", "prod", &format!("v{version}.slug"))
                .await
                .unwrap();
        }

        let history = tags.slugs_for_tag("demo", "prod").await.unwrap();
        assert_eq!(history.len(), TAG_HISTORY_LIMIT);
        assert_eq!(history.first().unwrap(), "v10.slug");
        // the very first entry fell off the end
        assert_eq!(history.last().unwrap(), "v1.slug");

        let stored = stored_history(&store, "demo", "prod").await.unwrap();
        assert_eq!(stored.lines().count(), TAG_HISTORY_LIMIT);
    }

    #[smol_potat::test]
    async fn test_rollback_pops_the_head() {
        let (store, tags) = tag_store();
        store
            .put_object("demo/tags/prod", b"a.slug\nb.slug\nc.slug".to_vec())
            .await
            .unwrap();

        let next = tags.rollback_slug_for_tag("demo", "prod").await.unwrap();
        assert_eq!(next, Some("b.slug".to_string()));
        assert_eq!(
            stored_history(&store, "demo", "prod").await.unwrap(),
            "b.slug\nc.slug"
        );
    }

    #[smol_potat::test]
    async fn test_rollback_of_single_entry_leaves_store_untouched() {
        let (store, tags) = tag_store();
        store
            .put_object("demo/tags/prod", b"a.slug".to_vec())
            .await
            .unwrap();

        let next = tags.rollback_slug_for_tag("demo", "prod").await.unwrap();
        assert_eq!(next, None);
        assert_eq!(
            stored_history(&store, "demo", "prod").await.unwrap(),
            "a.slug"
        );
    }

    #[smol_potat::test]
    async fn test_clone_tag_copies_full_history() {
        let (_, tags) = tag_store();
        tags.create_tag("demo", "prod", "v1.slug").await.unwrap();
        tags.create_tag("demo", "prod", "v2.slug").await.unwrap();

        tags.clone_tag("demo", "prod", "staging").await.unwrap();
        assert_eq!(
            tags.slugs_for_tag("demo", "staging").await.unwrap(),
            vec!["v2.slug", "v1.slug"]
        );
    }

    #[smol_potat::test]
    async fn test_tags_for_slug_matches_heads_only() {
        let (_, tags) = tag_store();
        tags.create_tag("demo", "prod", "old.slug").await.unwrap();
        tags.create_tag("demo", "prod", "new.slug").await.unwrap();
        tags.create_tag("demo", "canary", "new.slug").await.unwrap();

        tags.prefetch_tags("demo").await.unwrap();
        let mut matching = tags.tags_for_slug("demo", "new.slug").await.unwrap();
        matching.sort();
        assert_eq!(matching, vec!["canary", "prod"]);
        // old.slug is only history, not a current pointer
        assert!(
            tags.tags_for_slug("demo", "old.slug")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[smol_potat::test]
    async fn test_projects_listing() {
        let (store, tags) = tag_store();
        store.put_object("app1/x.slug", vec![1]).await.unwrap();
        store.put_object("app2/y.slug", vec![2]).await.unwrap();

        let projects = tags.projects().await.unwrap();
        assert!(projects.contains(&"app1".to_string()));
        assert!(projects.contains(&"app2".to_string()));
    }

    #[smol_potat::test]
    async fn test_cache_invalidated_after_write() {
        let (store, tags) = tag_store();
        tags.create_tag("demo", "prod", "v1.slug").await.unwrap();
        assert_eq!(
            tags.slug_for_tag("demo", "prod").await.unwrap(),
            Some("v1.slug".to_string())
        );

        // a write through a different instance would go unnoticed; a write
        // through this one must refresh the caches
        tags.create_tag("demo", "prod", "v2.slug").await.unwrap();
        assert_eq!(
            tags.slug_for_tag("demo", "prod").await.unwrap(),
            Some("v2.slug".to_string())
        );
        assert!(
            stored_history(&store, "demo", "prod")
                .await
                .unwrap()
                .starts_with("v2.slug")
        );
    }

    #[smol_potat::test]
    async fn test_clean_tags_deletes_dangling_and_keeps_forbidden() {
        let (store, tags) = tag_store();
        store.put_object("demo/live.slug", vec![1]).await.unwrap();
        store.put_object("demo/locked.slug", vec![2]).await.unwrap();
        tags.create_tag("demo", "good", "demo/live.slug").await.unwrap();
        tags.create_tag("demo", "dangling", "demo/gone.slug")
            .await
            .unwrap();
        tags.create_tag("demo", "unverifiable", "demo/locked.slug")
            .await
            .unwrap();
        tags.create_tag("demo", "production-current", "demo/gone.slug")
            .await
            .unwrap();
        store.deny("demo/locked.slug");

        let mut outcomes = tags.clean_tags("demo", "production-current").await.unwrap();
        outcomes.sort();
        assert_eq!(
            outcomes,
            vec![
                ("dangling".to_string(), TagCleanOutcome::Deleted),
                ("good".to_string(), TagCleanOutcome::Valid),
                ("unverifiable".to_string(), TagCleanOutcome::Valid),
            ]
        );
        // the protected tag survives even though its slug is gone
        assert!(
            tags.tags("demo")
                .await
                .unwrap()
                .contains(&"production-current".to_string())
        );
    }
}
