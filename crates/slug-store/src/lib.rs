//! # Slug store
//!
//! Artifact ("slug") storage and the tag/version store built on top of it.
//!
//! [`ArtifactStore`] is the object-store abstraction the rest of the system
//! consumes: put/get/head/delete/list-by-prefix plus expiring download URLs.
//! Two backends ship here — [`MemoryStore`] for tests and [`DirStore`] for a
//! plain directory tree — and anything S3-shaped can be slotted in from the
//! outside.
//!
//! [`TagStore`] layers named pointers over the object store: a tag maps to a
//! bounded, most-recent-first history of slug keys per project, which is what
//! makes rollbacks possible.

#![warn(missing_docs)]

mod dir;
mod memory;
mod store;
mod tags;

pub use dir::DirStore;
pub use memory::MemoryStore;
pub use store::{ArtifactStore, ObjectMeta};
pub use tags::{TAG_HISTORY_LIMIT, TagCleanOutcome, TagStore};

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for store operations
#[derive(Debug, Error)]
pub enum Error {
    /// The backend refused access to an object. Bulk scans treat this as
    /// "skip the entry", never as "the entry is missing".
    #[error("access to '{0}' was forbidden")]
    Forbidden(String),

    /// The key cannot be mapped onto the backend
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    /// Backend I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure
    #[error("store error: {0}")]
    Other(String),
}

impl Error {
    /// True for access-denied errors, which bulk scans suppress
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden(_))
    }
}
