//! Folder layouts for stored pages.
//!
//! Two layouts coexist on disk:
//!
//! - the current one, keyed by ids only:
//!   `<downloads2>/<hash>/<manga_id>/<chapter_id>/<page_index>`
//! - the legacy one, keyed by display names:
//!   `<downloads>/<source name>/<manga title>/<[scanlator_]chapter name>/<file>`
//!
//! New pages are only ever written in the current layout. The legacy layout
//! is read as a fallback and cleaned up on deletion.

use std::path::{Path, PathBuf};

use crate::queue::{ChapterRecord, MangaRecord};

/// Longest file name component most filesystems accept, in bytes.
const MAX_COMPONENT_BYTES: usize = 240;

/// Stand-in for a name that sanitizes to nothing.
const EMPTY_COMPONENT: &str = "(invalid)";

/// Two-character bucket a manga folder lives under.
///
/// The last two characters of `"00"` followed by the decimal id, so ids 7,
/// 42 and 1234 land in `07`, `42` and `34`.
#[must_use]
pub fn manga_hash(manga_id: i64) -> String {
    let padded = format!("00{manga_id}");
    padded[padded.len() - 2..].to_string()
}

/// Current-layout folder holding every chapter of a manga.
#[must_use]
pub fn manga_dir(root: &Path, manga_id: i64) -> PathBuf {
    root.join(manga_hash(manga_id)).join(manga_id.to_string())
}

/// Current-layout folder holding the pages of one chapter.
///
/// `chapter_id` must already be the storage id (original chapter id when the
/// chapter was migrated).
#[must_use]
pub fn chapter_dir(root: &Path, manga_id: i64, chapter_id: i64) -> PathBuf {
    manga_dir(root, manga_id).join(chapter_id.to_string())
}

/// Legacy-layout folder of a manga, relative to the legacy root.
#[must_use]
pub fn legacy_manga_dir(source_name: &str, title: &str) -> PathBuf {
    PathBuf::from(sanitize_component(source_name)).join(sanitize_component(title))
}

/// Legacy-layout folder of a chapter, relative to the legacy root.
#[must_use]
pub fn legacy_chapter_dir(manga: &MangaRecord, chapter: &ChapterRecord) -> PathBuf {
    let name = match &chapter.scanlator {
        Some(scanlator) => format!("{scanlator}_{}", chapter.name),
        None => chapter.name.clone(),
    };
    legacy_manga_dir(&manga.source_name, &manga.title).join(sanitize_component(&name))
}

/// Makes a display name safe to use as one path component.
///
/// Separators, reserved characters and control characters become `_`, the
/// result is trimmed and capped at [`MAX_COMPONENT_BYTES`] on a char
/// boundary. `.` and `..` cannot survive, so the component never escapes its
/// parent.
#[must_use]
pub fn sanitize_component(name: &str) -> String {
    let mapped: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let mut end = mapped.len().min(MAX_COMPONENT_BYTES);
    while !mapped.is_char_boundary(end) {
        end -= 1;
    }
    let capped = mapped[..end].trim_end();

    if capped.is_empty() || capped.chars().all(|c| c == '.') {
        EMPTY_COMPONENT.to_string()
    } else {
        capped.to_string()
    }
}
