//! On-disk page store.
//!
//! # Overview
//!
//! [`PageStore`] owns the two download roots and answers every question the
//! scheduler asks about stored pages: is page `i` already present, write
//! page `i`, read page `i` back, delete a chapter or a whole manga. Paths are
//! derived by the pure functions in [`layout`].
//!
//! Writes are idempotent at page granularity: a page that exists is skipped,
//! and a page only exists once it has been fully written (see
//! [`PageWriter`]).
//!
//! # Example
//!
//! ```no_run
//! use chapter_core::storage::{ChapterLocation, PageStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PageStore::new("data/downloads2", "data/downloads");
//! let location = ChapterLocation::new(7, 120);
//! if !store.has_page(&location, 0).await? {
//!     store.write_page(&location, 0, b"...").await?;
//! }
//! # Ok(())
//! # }
//! ```

mod error;
pub mod layout;
mod writer;

pub use error::StorageError;
pub use writer::PageWriter;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::queue::{ChapterRecord, MangaRecord};
use writer::PART_SUFFIX;

/// Content type reported for every stored page.
pub const PAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Identifies where one chapter's pages live in both layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterLocation {
    /// Owning manga id.
    pub manga_id: i64,
    /// Storage id of the chapter.
    pub chapter_id: i64,
    /// Legacy folder relative to the legacy root, when the names are known.
    pub legacy_dir: Option<PathBuf>,
}

impl ChapterLocation {
    /// Location in the current layout only.
    #[must_use]
    pub fn new(manga_id: i64, chapter_id: i64) -> Self {
        Self {
            manga_id,
            chapter_id,
            legacy_dir: None,
        }
    }

    /// Location of a queued chapter, including its legacy folder.
    #[must_use]
    pub fn for_chapter(manga: &MangaRecord, chapter: &ChapterRecord) -> Self {
        Self {
            manga_id: manga.id,
            chapter_id: chapter.storage_id(),
            legacy_dir: Some(layout::legacy_chapter_dir(manga, chapter)),
        }
    }
}

/// A page read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    /// Page bytes.
    pub bytes: Vec<u8>,
    /// Content type to serve the bytes with.
    pub content_type: &'static str,
}

/// Reader and writer for downloaded pages.
#[derive(Debug, Clone)]
pub struct PageStore {
    downloads_root: PathBuf,
    legacy_root: PathBuf,
}

impl PageStore {
    /// Creates a store over the current and legacy download roots.
    #[must_use]
    pub fn new(downloads_root: impl Into<PathBuf>, legacy_root: impl Into<PathBuf>) -> Self {
        Self {
            downloads_root: downloads_root.into(),
            legacy_root: legacy_root.into(),
        }
    }

    /// Root of the current layout.
    #[must_use]
    pub fn downloads_root(&self) -> &Path {
        &self.downloads_root
    }

    /// Root of the legacy layout.
    #[must_use]
    pub fn legacy_root(&self) -> &Path {
        &self.legacy_root
    }

    /// Folder holding the chapter's pages in the current layout.
    #[must_use]
    pub fn chapter_dir(&self, location: &ChapterLocation) -> PathBuf {
        layout::chapter_dir(&self.downloads_root, location.manga_id, location.chapter_id)
    }

    /// Path of page `index` in the current layout.
    #[must_use]
    pub fn page_path(&self, location: &ChapterLocation, index: u32) -> PathBuf {
        self.chapter_dir(location).join(index.to_string())
    }

    /// Returns true when page `index` has been fully written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the filesystem cannot be queried.
    pub async fn has_page(&self, location: &ChapterLocation, index: u32) -> Result<bool> {
        let path = self.page_path(location, index);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    /// Opens a streaming writer for page `index`, creating the chapter folder.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the folder or file cannot be created.
    pub async fn begin_page(&self, location: &ChapterLocation, index: u32) -> Result<PageWriter> {
        let dir = self.chapter_dir(location);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(dir.clone(), e))?;
        PageWriter::create(dir.join(index.to_string())).await
    }

    /// Writes page `index` in one go.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the page cannot be written.
    pub async fn write_page(
        &self,
        location: &ChapterLocation,
        index: u32,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let mut writer = self.begin_page(location, index).await?;
        writer.write_chunk(bytes).await?;
        writer.commit().await
    }

    /// Reads page `index`, trying the current layout first and the legacy
    /// layout second.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a page exists but cannot be read.
    #[instrument(skip(self), fields(manga_id = location.manga_id, chapter_id = location.chapter_id))]
    pub async fn read_page(
        &self,
        location: &ChapterLocation,
        index: u32,
    ) -> Result<Option<StoredPage>> {
        let path = self.page_path(location, index);
        if let Some(bytes) = read_if_exists(&path).await? {
            debug!(path = %path.display(), "page found in current layout");
            return Ok(Some(StoredPage {
                bytes,
                content_type: PAGE_CONTENT_TYPE,
            }));
        }

        let Some(legacy_dir) = &location.legacy_dir else {
            return Ok(None);
        };
        let Some(path) = self.legacy_page_path(legacy_dir, index).await? else {
            return Ok(None);
        };
        debug!(path = %path.display(), "page found in legacy layout");
        Ok(read_if_exists(&path).await?.map(|bytes| StoredPage {
            bytes,
            content_type: PAGE_CONTENT_TYPE,
        }))
    }

    /// Legacy pages are the folder's files sorted by name, addressed by position.
    async fn legacy_page_path(&self, legacy_dir: &Path, index: u32) -> Result<Option<PathBuf>> {
        let dir = self.legacy_root.join(legacy_dir);
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(dir.clone(), e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io(entry.path(), e))?
                .is_file();
            if is_file {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(usize::try_from(index)
            .ok()
            .and_then(|index| files.into_iter().nth(index)))
    }

    /// Deletes a chapter's pages from both layouts.
    ///
    /// Returns true if anything was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if an existing folder cannot be removed.
    #[instrument(skip(self), fields(manga_id = location.manga_id, chapter_id = location.chapter_id))]
    pub async fn delete_chapter(&self, location: &ChapterLocation) -> Result<bool> {
        let mut removed = false;
        if let Some(legacy_dir) = &location.legacy_dir {
            removed |= remove_dir_if_exists(&self.legacy_root.join(legacy_dir)).await?;
        }
        removed |= remove_dir_if_exists(&self.chapter_dir(location)).await?;
        info!(removed, "chapter pages deleted");
        Ok(removed)
    }

    /// Deletes every chapter of a manga in the current layout.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the folder exists but cannot be removed.
    #[instrument(skip(self))]
    pub async fn delete_manga(&self, manga_id: i64) -> Result<bool> {
        remove_dir_if_exists(&layout::manga_dir(&self.downloads_root, manga_id)).await
    }

    /// Deletes a manga folder in the legacy layout.
    ///
    /// The names are sanitized the same way they were when the folder was
    /// created, so they cannot point outside the legacy root.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the folder exists but cannot be removed.
    #[instrument(skip(self))]
    pub async fn delete_legacy_manga(&self, source_name: &str, title: &str) -> Result<bool> {
        let dir = self
            .legacy_root
            .join(layout::legacy_manga_dir(source_name, title));
        remove_dir_if_exists(&dir).await
    }

    /// Ids of manga with a folder in the current layout, up to `limit`.
    ///
    /// Walks `<root>/<hash>/<manga_id>` and ignores entries whose name is not
    /// an id. Order follows the directory listing, sorted for stability.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a folder cannot be listed.
    pub async fn downloaded_manga_ids(&self, limit: usize) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        for bucket in list_dirs(&self.downloads_root).await? {
            for manga_dir in list_dirs(&bucket).await? {
                if let Some(id) = manga_dir
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.parse::<i64>().ok())
                {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }
}

async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    if path.extension().is_some_and(|ext| ext == PART_SUFFIX) {
        return Ok(None);
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

async fn list_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::io(path, e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| StorageError::io(entry.path(), e))?;
        if file_type.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}
