//! Download item types and state definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a queued chapter download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadState {
    /// Waiting for a worker of its source to claim it.
    Queued,
    /// Claimed by a worker; pages are being fetched.
    Downloading,
    /// All pages persisted; removed from the queue shortly after.
    Finished,
    /// Last attempt failed. Eligible again while `tries` is below the ceiling.
    Error,
}

impl DownloadState {
    /// Returns the wire representation used in status snapshots.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Downloading => "Downloading",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(Self::Queued),
            "Downloading" => Ok(Self::Downloading),
            "Finished" => Ok(Self::Finished),
            "Error" => Ok(Self::Error),
            _ => Err(format!("invalid download state: {s}")),
        }
    }
}

/// Queue identity of a chapter: the chapter index is only unique within its manga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadKey {
    /// Owning manga.
    pub manga_id: i64,
    /// Position of the chapter in the source's listing.
    pub chapter_index: i64,
}

impl DownloadKey {
    /// Creates a key for the given manga and chapter index.
    #[must_use]
    pub fn new(manga_id: i64, chapter_index: i64) -> Self {
        Self {
            manga_id,
            chapter_index,
        }
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.manga_id, self.chapter_index)
    }
}

/// Addresses one specific queue entry.
///
/// The ticket is assigned at enqueue time, so a chapter that was removed and
/// enqueued again gets a fresh ticket and a worker still holding the old one
/// can no longer touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryRef {
    /// Queue key of the entry.
    pub key: DownloadKey,
    /// Enqueue ticket of the entry.
    pub ticket: u64,
}

/// Manga metadata needed to place a chapter on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaRecord {
    /// Manga id.
    pub id: i64,
    /// Upstream source serving this manga (the partition key).
    pub source_id: i64,
    /// Display name of the source; used by the legacy folder layout.
    pub source_name: String,
    /// Manga title; used by the legacy folder layout.
    pub title: String,
}

/// Chapter metadata needed to resolve and store its pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRecord {
    /// Chapter id.
    pub id: i64,
    /// Owning manga id.
    pub manga_id: i64,
    /// Position in the source's chapter listing.
    pub index: i64,
    /// Chapter name.
    pub name: String,
    /// Scanlation group, when known.
    pub scanlator: Option<String>,
    /// Id of the chapter this one was migrated from; pages stay under that id.
    pub original_chapter_id: Option<i64>,
    /// Number of pages, known once the page list has been resolved.
    pub page_count: Option<u32>,
}

impl ChapterRecord {
    /// Returns the id the page folder is named after.
    #[must_use]
    pub fn storage_id(&self) -> i64 {
        self.original_chapter_id.unwrap_or(self.id)
    }
}

/// A single entry in the download queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadItem {
    pub(crate) ticket: u64,
    /// Owning manga.
    pub manga: MangaRecord,
    /// Chapter to download.
    pub chapter: ChapterRecord,
    /// Current state.
    pub state: DownloadState,
    /// Failed attempts so far.
    pub tries: u32,
    /// Completed fraction in `[0, 1]`; meaningful while downloading.
    pub progress: f32,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

impl DownloadItem {
    /// Creates a fresh queued item.
    #[must_use]
    pub fn new(manga: MangaRecord, chapter: ChapterRecord) -> Self {
        Self {
            ticket: 0,
            manga,
            chapter,
            state: DownloadState::Queued,
            tries: 0,
            progress: 0.0,
            last_error: None,
        }
    }

    /// Returns the queue key.
    #[must_use]
    pub fn key(&self) -> DownloadKey {
        DownloadKey::new(self.manga.id, self.chapter.index)
    }

    /// Returns the reference workers use to address this exact entry.
    #[must_use]
    pub fn entry(&self) -> EntryRef {
        EntryRef {
            key: self.key(),
            ticket: self.ticket,
        }
    }

    /// Returns the partition key.
    #[must_use]
    pub fn source_id(&self) -> i64 {
        self.manga.source_id
    }

    /// Returns true when a worker may claim this item.
    #[must_use]
    pub fn is_eligible(&self, max_tries: u32) -> bool {
        match self.state {
            DownloadState::Queued => true,
            DownloadState::Error => self.tries < max_tries,
            DownloadState::Downloading | DownloadState::Finished => false,
        }
    }
}

impl fmt::Display for DownloadItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DownloadItem {{ key: {}, source: {}, state: {}, tries: {} }}",
            self.key(),
            self.source_id(),
            self.state,
            self.tries
        )
    }
}
