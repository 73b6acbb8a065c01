//! Error types for the download scheduler.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::store::StoreError;

/// Failure of one download attempt.
///
/// Its `Display` text becomes the item's `last_error`.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Page list or page bytes could not be obtained.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// A page could not be written.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The completed chapter could not be recorded.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rejection of a control operation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No chapter at this index of the manga.
    #[error("no chapter at index {chapter_index} of manga {manga_id}")]
    ChapterNotFound {
        /// Manga that was searched.
        manga_id: i64,
        /// Requested chapter index.
        chapter_index: i64,
    },

    /// Chapter metadata could not be read or written.
    #[error("chapter store error: {0}")]
    Store(#[from] StoreError),

    /// Stored pages could not be removed.
    #[error("page storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
