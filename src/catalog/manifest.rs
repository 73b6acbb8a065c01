//! JSON manifest describing sources, manga, chapters and page URLs.
//!
//! ```json
//! {
//!   "sources": [{ "id": 1, "name": "Example", "lang": "en" }],
//!   "manga": [{
//!     "id": 7, "sourceId": 1, "title": "Blue Sky", "inLibrary": true,
//!     "chapters": [{
//!       "id": 70, "index": 1, "name": "Chapter 1",
//!       "pages": ["https://img.example.com/7/1/0.jpg"]
//!     }]
//!   }]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::CatalogError;

/// Upstream source entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSource {
    /// Source id; the scheduler's partition key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Language code.
    #[serde(default)]
    pub lang: String,
}

/// Chapter entry with its page URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestChapter {
    /// Chapter id.
    pub id: i64,
    /// Position in the source's listing.
    pub index: i64,
    /// Chapter name.
    pub name: String,
    /// Scanlation group.
    #[serde(default)]
    pub scanlator: Option<String>,
    /// Chapter this one was migrated from.
    #[serde(default)]
    pub original_chapter_id: Option<i64>,
    /// Page URLs in reading order.
    #[serde(default)]
    pub pages: Vec<String>,
}

/// Manga entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestManga {
    /// Manga id.
    pub id: i64,
    /// Owning source.
    pub source_id: i64,
    /// Title.
    pub title: String,
    /// Whether the manga is in the user's library.
    #[serde(default)]
    pub in_library: bool,
    /// Chapters.
    #[serde(default)]
    pub chapters: Vec<ManifestChapter>,
}

/// Whole manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Sources referenced by the manga entries.
    #[serde(default)]
    pub sources: Vec<ManifestSource>,
    /// Manga with their chapters.
    #[serde(default)]
    pub manga: Vec<ManifestManga>,
}

impl Manifest {
    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::ManifestIo`] if the file cannot be read, or
    /// [`CatalogError::ManifestParse`] if it is not a valid manifest.
    #[instrument(fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CatalogError::ManifestIo {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&raw).map_err(|source| CatalogError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Page URLs keyed by chapter id.
    #[must_use]
    pub fn page_lists(&self) -> HashMap<i64, Vec<String>> {
        self.manga
            .iter()
            .flat_map(|manga| manga.chapters.iter())
            .map(|chapter| (chapter.id, chapter.pages.clone()))
            .collect()
    }

    /// Every chapter id, in manifest order.
    #[must_use]
    pub fn chapter_ids(&self) -> Vec<i64> {
        self.manga
            .iter()
            .flat_map(|manga| manga.chapters.iter().map(|chapter| chapter.id))
            .collect()
    }

    /// Display name of a source, if listed.
    #[must_use]
    pub fn source_name(&self, source_id: i64) -> Option<&str> {
        self.sources
            .iter()
            .find(|source| source.id == source_id)
            .map(|source| source.name.as_str())
    }
}
