//! Downloaded-library maintenance: removing stored chapters and listing
//! what is on disk.
//!
//! These operations touch both the page store and the chapter store but
//! never the download queue.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::storage::{PageStore, StorageError};
use crate::store::{ChapterStore, DownloadedManga, StoreError};

/// Most manga ids collected from disk by [`downloaded_manga_info`].
pub const MAX_SCANNED_MANGA: usize = 5000;

/// Most rows returned by [`downloaded_manga`].
pub const DOWNLOADED_MANGA_LIMIT: u32 = 300;

/// Error type for library maintenance.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    /// Page files could not be listed or removed.
    #[error("page storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chapter metadata could not be read or updated.
    #[error("chapter store error: {0}")]
    Store(#[from] StoreError),
}

/// A manga folder in the legacy layout, addressed by its display names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyManga {
    /// Source name the folder was created under.
    pub source: String,
    /// Manga title the folder was created under.
    pub title: String,
}

/// Source entry of [`DownloadedMangaInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedSource {
    /// Source id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Language code.
    pub lang: String,
}

/// Manga entry of [`DownloadedMangaInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedMangaEntry {
    /// Position of the manga's source in `source_list`.
    pub source_idx: usize,
    /// Manga id.
    pub manga_id: i64,
    /// Title.
    pub title: String,
    /// Whether the manga is in the library.
    pub in_library: bool,
    /// Unix seconds of the last completed download.
    pub last_download_at: i64,
}

/// Manga found on disk, with their sources listed once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedMangaInfo {
    /// Manga with pages in the current layout.
    pub list: Vec<DownloadedMangaEntry>,
    /// Sources referenced by `list`.
    pub source_list: Vec<DownloadedSource>,
}

impl DownloadedMangaInfo {
    fn from_summaries(summaries: Vec<DownloadedManga>) -> Self {
        let mut info = Self::default();
        for summary in summaries {
            let source_idx = match info
                .source_list
                .iter()
                .position(|source| source.id == summary.source_id)
            {
                Some(idx) => idx,
                None => {
                    info.source_list.push(DownloadedSource {
                        id: summary.source_id,
                        name: summary.source_name,
                        lang: summary.source_lang,
                    });
                    info.source_list.len() - 1
                }
            };
            info.list.push(DownloadedMangaEntry {
                source_idx,
                manga_id: summary.manga_id,
                title: summary.title,
                in_library: summary.in_library,
                last_download_at: summary.last_download_at,
            });
        }
        info
    }
}

/// Deletes the stored pages of each manga and clears their downloaded flags.
///
/// Returns the number of chapters whose flag was reset.
///
/// # Errors
///
/// Returns [`LibraryError::Storage`] if a folder cannot be removed and
/// [`LibraryError::Store`] if the flags cannot be reset. Folders removed
/// before the failure stay removed.
#[instrument(skip(store, pages, manga_ids), fields(count = manga_ids.len()))]
pub async fn remove_downloads(
    store: &dyn ChapterStore,
    pages: &PageStore,
    manga_ids: &[i64],
) -> Result<u64, LibraryError> {
    if manga_ids.is_empty() {
        return Ok(0);
    }
    let mut ids = manga_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    for manga_id in &ids {
        pages.delete_manga(*manga_id).await?;
    }
    let reset = store.reset_downloads(&ids).await?;
    info!(manga = ids.len(), chapters = reset, "downloads removed");
    Ok(reset)
}

/// Deletes manga folders in the legacy layout.
///
/// Entries with an empty source or title are skipped; a folder that cannot
/// be removed is logged and does not stop the rest. Returns the number of
/// folders removed.
#[instrument(skip(pages, manga), fields(count = manga.len()))]
pub async fn remove_legacy_downloads(pages: &PageStore, manga: &[LegacyManga]) -> usize {
    let mut removed = 0;
    for entry in manga {
        if entry.source.is_empty() || entry.title.is_empty() {
            continue;
        }
        match pages.delete_legacy_manga(&entry.source, &entry.title).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => warn!(source = %entry.source, title = %entry.title, error = %e, "legacy folder not removed"),
        }
    }
    removed
}

/// Manga with a recorded download, most recent first.
///
/// # Errors
///
/// Returns [`LibraryError::Store`] if the query fails.
pub async fn downloaded_manga(store: &dyn ChapterStore) -> Result<Vec<DownloadedManga>, LibraryError> {
    Ok(store.downloaded_manga(DOWNLOADED_MANGA_LIMIT).await?)
}

/// Lists manga that have pages in the current layout, whatever the store's
/// flags say.
///
/// # Errors
///
/// Returns [`LibraryError::Storage`] if the download root cannot be walked
/// and [`LibraryError::Store`] if the metadata query fails.
pub async fn downloaded_manga_info(
    store: &dyn ChapterStore,
    pages: &PageStore,
) -> Result<DownloadedMangaInfo, LibraryError> {
    let ids = pages.downloaded_manga_ids(MAX_SCANNED_MANGA).await?;
    if ids.is_empty() {
        return Ok(DownloadedMangaInfo::default());
    }
    let summaries = store.manga_summaries(&ids).await?;
    Ok(DownloadedMangaInfo::from_summaries(summaries))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn summary(manga_id: i64, source_id: i64) -> DownloadedManga {
        DownloadedManga {
            manga_id,
            title: format!("Manga {manga_id}"),
            in_library: true,
            last_download_at: 100,
            source_id,
            source_name: format!("Source {source_id}"),
            source_lang: "en".to_string(),
        }
    }

    #[test]
    fn test_sources_listed_once() {
        let info =
            DownloadedMangaInfo::from_summaries(vec![summary(1, 10), summary(2, 20), summary(3, 10)]);
        assert_eq!(info.source_list.len(), 2);
        let idx: Vec<usize> = info.list.iter().map(|m| m.source_idx).collect();
        assert_eq!(idx, vec![0, 1, 0]);
    }

    #[test]
    fn test_info_json_shape() {
        let info = DownloadedMangaInfo::from_summaries(vec![summary(4, 2)]);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["list"][0]["sourceIdx"], 0);
        assert_eq!(json["list"][0]["lastDownloadAt"], 100);
        assert_eq!(json["sourceList"][0]["name"], "Source 2");
    }
}
