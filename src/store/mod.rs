//! Chapter metadata persistence.
//!
//! # Overview
//!
//! The scheduler reads chapter and manga records when chapters are enqueued
//! and records completed downloads afterwards. [`ChapterStore`] is that
//! boundary; [`SqliteChapterStore`] implements it on top of
//! [`Database`](crate::db::Database).
//!
//! # Example
//!
//! ```ignore
//! use chapter_core::{Database, store::SqliteChapterStore};
//!
//! let db = Database::new(Path::new("chapters.db")).await?;
//! let store = SqliteChapterStore::new(db);
//! store.import_manifest(&manifest).await?;
//! let targets = store.load_download_targets(&[70, 71]).await?;
//! ```

mod error;
mod sqlite;

pub use error::{StoreError, StoreErrorKind};
pub use sqlite::SqliteChapterStore;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;

use crate::queue::{ChapterRecord, MangaRecord};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Listing row for a manga with downloaded chapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedManga {
    /// Manga id.
    pub manga_id: i64,
    /// Title.
    pub title: String,
    /// Whether the manga is in the library.
    pub in_library: bool,
    /// Unix seconds of the last completed chapter download; 0 when none.
    pub last_download_at: i64,
    /// Owning source id.
    pub source_id: i64,
    /// Owning source name.
    pub source_name: String,
    /// Owning source language.
    pub source_lang: String,
}

/// Chapter metadata the scheduler reads and updates.
#[async_trait]
pub trait ChapterStore: Send + Sync {
    /// Loads manga and chapter records for `chapter_ids`, in input order.
    ///
    /// Unknown ids are skipped.
    async fn load_download_targets(
        &self,
        chapter_ids: &[i64],
    ) -> Result<Vec<(MangaRecord, ChapterRecord)>>;

    /// Finds the chapter id at `chapter_index` of a manga.
    async fn find_chapter_id(&self, manga_id: i64, chapter_index: i64) -> Result<Option<i64>>;

    /// Marks a chapter downloaded with its page count and stamps the manga's
    /// last download time.
    async fn mark_downloaded(&self, chapter_id: i64, page_count: u32) -> Result<()>;

    /// Returns true if the chapter is already marked downloaded.
    async fn is_downloaded(&self, chapter_id: i64) -> Result<bool>;

    /// Clears downloaded flags for every chapter of `manga_ids` and resets
    /// their last download time. Returns the number of chapters reset.
    async fn reset_downloads(&self, manga_ids: &[i64]) -> Result<u64>;

    /// Manga with a recorded download, most recent first, up to `limit`.
    async fn downloaded_manga(&self, limit: u32) -> Result<Vec<DownloadedManga>>;

    /// Listing rows for specific manga ids; unknown ids are skipped.
    async fn manga_summaries(&self, manga_ids: &[i64]) -> Result<Vec<DownloadedManga>>;
}
