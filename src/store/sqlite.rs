//! `SQLite` implementation of [`ChapterStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info, instrument};

use super::{ChapterStore, DownloadedManga, Result, StoreError};
use crate::catalog::manifest::{Manifest, ManifestChapter, ManifestManga};
use crate::db::Database;
use crate::queue::{ChapterRecord, MangaRecord};

const SUMMARY_COLUMNS: &str = "SELECT m.id AS manga_id, m.title, m.in_library, m.last_download_at, \
     m.source_id, COALESCE(s.name, '') AS source_name, COALESCE(s.lang, '') AS source_lang \
     FROM manga m LEFT JOIN source s ON s.id = m.source_id";

#[derive(Debug, FromRow)]
struct TargetRow {
    manga_id: i64,
    source_id: i64,
    source_name: String,
    title: String,
    chapter_id: i64,
    source_order: i64,
    name: String,
    scanlator: Option<String>,
    original_chapter_id: Option<i64>,
    page_count: Option<i64>,
}

impl TargetRow {
    fn into_records(self) -> (MangaRecord, ChapterRecord) {
        let manga = MangaRecord {
            id: self.manga_id,
            source_id: self.source_id,
            source_name: self.source_name,
            title: self.title,
        };
        let chapter = ChapterRecord {
            id: self.chapter_id,
            manga_id: self.manga_id,
            index: self.source_order,
            name: self.name,
            scanlator: self.scanlator,
            original_chapter_id: self.original_chapter_id,
            page_count: self.page_count.and_then(|count| u32::try_from(count).ok()),
        };
        (manga, chapter)
    }
}

/// Counts of rows written by [`SqliteChapterStore::import_manifest`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Sources inserted or updated.
    pub sources: usize,
    /// Manga inserted or updated.
    pub manga: usize,
    /// Chapters inserted or updated.
    pub chapters: usize,
}

/// Chapter store backed by the catalogue tables.
#[derive(Debug, Clone)]
pub struct SqliteChapterStore {
    db: Database,
}

impl SqliteChapterStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts or renames a source.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    pub async fn upsert_source(&self, id: i64, name: &str, lang: &str) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        upsert_source(&mut *conn, id, name, lang).await
    }

    /// Inserts or updates a manga row; its source must exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    pub async fn upsert_manga(&self, manga: &ManifestManga) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        upsert_manga(&mut *conn, manga).await
    }

    /// Inserts or updates a chapter row without touching its download state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    pub async fn upsert_chapter(&self, manga_id: i64, chapter: &ManifestChapter) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        upsert_chapter(&mut *conn, manga_id, chapter).await
    }

    /// Writes every source, manga and chapter of a manifest in one transaction.
    ///
    /// Manga that reference a source missing from the manifest get a
    /// placeholder source named after its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any write fails; nothing is
    /// committed in that case.
    #[instrument(skip(self, manifest), fields(manga = manifest.manga.len()))]
    pub async fn import_manifest(&self, manifest: &Manifest) -> Result<ImportSummary> {
        let mut tx = self.db.pool().begin().await?;
        let mut summary = ImportSummary::default();

        for source in &manifest.sources {
            upsert_source(&mut *tx, source.id, &source.name, &source.lang).await?;
            summary.sources += 1;
        }
        for manga in &manifest.manga {
            if manifest.source_name(manga.source_id).is_none() {
                sqlx::query("INSERT OR IGNORE INTO source (id, name) VALUES (?, ?)")
                    .bind(manga.source_id)
                    .bind(manga.source_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
            upsert_manga(&mut *tx, manga).await?;
            summary.manga += 1;
            for chapter in &manga.chapters {
                upsert_chapter(&mut *tx, manga.id, chapter).await?;
                summary.chapters += 1;
            }
        }

        tx.commit().await?;
        info!(
            sources = summary.sources,
            manga = summary.manga,
            chapters = summary.chapters,
            "manifest imported"
        );
        Ok(summary)
    }

    async fn summaries_where_in(&self, manga_ids: &[i64]) -> Result<Vec<DownloadedManga>> {
        let mut query = QueryBuilder::<Sqlite>::new(SUMMARY_COLUMNS);
        query.push(" WHERE m.id IN (");
        push_id_list(&mut query, manga_ids);
        query.push(") ORDER BY m.id");
        Ok(query
            .build_query_as::<DownloadedManga>()
            .fetch_all(self.db.pool())
            .await?)
    }
}

async fn upsert_source(conn: &mut SqliteConnection, id: i64, name: &str, lang: &str) -> Result<()> {
    sqlx::query(
        r"INSERT INTO source (id, name, lang) VALUES (?, ?, ?)
          ON CONFLICT(id) DO UPDATE SET name = excluded.name, lang = excluded.lang",
    )
    .bind(id)
    .bind(name)
    .bind(lang)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_manga(conn: &mut SqliteConnection, manga: &ManifestManga) -> Result<()> {
    sqlx::query(
        r"INSERT INTO manga (id, source_id, title, in_library) VALUES (?, ?, ?, ?)
          ON CONFLICT(id) DO UPDATE SET
              source_id = excluded.source_id,
              title = excluded.title,
              in_library = excluded.in_library",
    )
    .bind(manga.id)
    .bind(manga.source_id)
    .bind(&manga.title)
    .bind(manga.in_library)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_chapter(
    conn: &mut SqliteConnection,
    manga_id: i64,
    chapter: &ManifestChapter,
) -> Result<()> {
    sqlx::query(
        r"INSERT INTO chapter (id, manga_id, source_order, name, scanlator, original_chapter_id)
          VALUES (?, ?, ?, ?, ?, ?)
          ON CONFLICT(id) DO UPDATE SET
              manga_id = excluded.manga_id,
              source_order = excluded.source_order,
              name = excluded.name,
              scanlator = excluded.scanlator,
              original_chapter_id = excluded.original_chapter_id",
    )
    .bind(chapter.id)
    .bind(manga_id)
    .bind(chapter.index)
    .bind(&chapter.name)
    .bind(chapter.scanlator.as_deref())
    .bind(chapter.original_chapter_id)
    .execute(conn)
    .await?;
    Ok(())
}

fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
}

fn dedup_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(id) {
            seen.push(*id);
        }
    }
    seen
}

#[async_trait]
impl ChapterStore for SqliteChapterStore {
    #[instrument(skip(self, chapter_ids), fields(count = chapter_ids.len()))]
    async fn load_download_targets(
        &self,
        chapter_ids: &[i64],
    ) -> Result<Vec<(MangaRecord, ChapterRecord)>> {
        let ids = dedup_ids(chapter_ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            r"SELECT m.id AS manga_id, m.source_id, COALESCE(s.name, '') AS source_name, m.title,
                     c.id AS chapter_id, c.source_order, c.name, c.scanlator,
                     c.original_chapter_id, c.page_count
              FROM chapter c
              JOIN manga m ON m.id = c.manga_id
              LEFT JOIN source s ON s.id = m.source_id
              WHERE c.id IN (",
        );
        push_id_list(&mut query, &ids);
        query.push(")");

        let rows = query
            .build_query_as::<TargetRow>()
            .fetch_all(self.db.pool())
            .await?;
        let mut by_id: HashMap<i64, TargetRow> =
            rows.into_iter().map(|row| (row.chapter_id, row)).collect();

        let targets: Vec<_> = ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .map(TargetRow::into_records)
            .collect();
        debug!(found = targets.len(), "download targets loaded");
        Ok(targets)
    }

    async fn find_chapter_id(&self, manga_id: i64, chapter_index: i64) -> Result<Option<i64>> {
        let id: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM chapter WHERE manga_id = ? AND source_order = ?")
                .bind(manga_id)
                .bind(chapter_index)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(id.map(|(id,)| id))
    }

    #[instrument(skip(self))]
    async fn mark_downloaded(&self, chapter_id: i64, page_count: u32) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE chapter SET is_downloaded = 1, page_count = ? WHERE id = ?",
        )
        .bind(i64::from(page_count))
        .bind(chapter_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::ChapterNotFound(chapter_id));
        }

        sqlx::query(
            r"UPDATE manga SET last_download_at = CAST(strftime('%s', 'now') AS INTEGER)
              WHERE id = (SELECT manga_id FROM chapter WHERE id = ?)",
        )
        .bind(chapter_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn is_downloaded(&self, chapter_id: i64) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT is_downloaded FROM chapter WHERE id = ?")
            .bind(chapter_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|(downloaded,)| downloaded)
            .ok_or(StoreError::ChapterNotFound(chapter_id))
    }

    #[instrument(skip(self, manga_ids), fields(count = manga_ids.len()))]
    async fn reset_downloads(&self, manga_ids: &[i64]) -> Result<u64> {
        let ids = dedup_ids(manga_ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.db.pool().begin().await?;

        let mut manga = QueryBuilder::<Sqlite>::new("UPDATE manga SET last_download_at = 0 WHERE id IN (");
        push_id_list(&mut manga, &ids);
        manga.push(")");
        manga.build().execute(&mut *tx).await?;

        let mut chapters = QueryBuilder::<Sqlite>::new(
            "UPDATE chapter SET is_downloaded = 0 WHERE is_downloaded = 1 AND manga_id IN (",
        );
        push_id_list(&mut chapters, &ids);
        chapters.push(")");
        let reset = chapters.build().execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;
        Ok(reset)
    }

    async fn downloaded_manga(&self, limit: u32) -> Result<Vec<DownloadedManga>> {
        let sql = format!(
            "{SUMMARY_COLUMNS} WHERE m.last_download_at > 0 \
             ORDER BY m.last_download_at DESC, m.id LIMIT ?"
        );
        Ok(sqlx::query_as::<_, DownloadedManga>(&sql)
            .bind(i64::from(limit))
            .fetch_all(self.db.pool())
            .await?)
    }

    async fn manga_summaries(&self, manga_ids: &[i64]) -> Result<Vec<DownloadedManga>> {
        let ids = dedup_ids(manga_ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.summaries_where_in(&ids).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "sources": [{ "id": 1, "name": "Example", "lang": "en" }],
        "manga": [
            { "id": 7, "sourceId": 1, "title": "Blue Sky", "inLibrary": true, "chapters": [
                { "id": 70, "index": 1, "name": "Chapter 1", "pages": ["a"] },
                { "id": 71, "index": 2, "name": "Chapter 2", "scanlator": "Team", "pages": ["b"] }
            ]},
            { "id": 8, "sourceId": 2, "title": "Orphan", "chapters": [
                { "id": 80, "index": 1, "name": "Chapter 1", "originalChapterId": 60, "pages": [] }
            ]}
        ]
    }"#;

    async fn store() -> SqliteChapterStore {
        let store = SqliteChapterStore::new(Database::new_in_memory().await.unwrap());
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        store.import_manifest(&manifest).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_import_creates_placeholder_source() {
        let store = store().await;
        let targets = store.load_download_targets(&[80]).await.unwrap();
        let (manga, chapter) = &targets[0];
        assert_eq!(manga.source_id, 2);
        assert_eq!(manga.source_name, "2");
        assert_eq!(chapter.storage_id(), 60);
    }

    #[tokio::test]
    async fn test_load_download_targets_keeps_input_order_and_skips_unknown() {
        let store = store().await;
        let targets = store
            .load_download_targets(&[71, 999, 70, 71])
            .await
            .unwrap();
        let ids: Vec<i64> = targets.iter().map(|(_, chapter)| chapter.id).collect();
        assert_eq!(ids, vec![71, 70]);
        assert_eq!(targets[0].1.scanlator.as_deref(), Some("Team"));
        assert_eq!(targets[0].0.source_name, "Example");
    }

    #[tokio::test]
    async fn test_find_chapter_id_by_index() {
        let store = store().await;
        assert_eq!(store.find_chapter_id(7, 2).await.unwrap(), Some(71));
        assert_eq!(store.find_chapter_id(7, 9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mark_downloaded_sets_flag_and_timestamp() {
        let store = store().await;
        assert!(!store.is_downloaded(70).await.unwrap());

        store.mark_downloaded(70, 12).await.unwrap();

        assert!(store.is_downloaded(70).await.unwrap());
        let targets = store.load_download_targets(&[70]).await.unwrap();
        assert_eq!(targets[0].1.page_count, Some(12));
        let listed = store.downloaded_manga(300).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].manga_id, 7);
        assert!(listed[0].in_library);
        assert!(listed[0].last_download_at > 0);
    }

    #[tokio::test]
    async fn test_mark_downloaded_unknown_chapter() {
        let store = store().await;
        let err = store.mark_downloaded(999, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::ChapterNotFound(999)));
    }

    #[tokio::test]
    async fn test_reset_downloads_clears_flags() {
        let store = store().await;
        store.mark_downloaded(70, 1).await.unwrap();
        store.mark_downloaded(71, 1).await.unwrap();

        assert_eq!(store.reset_downloads(&[7, 7]).await.unwrap(), 2);
        assert!(!store.is_downloaded(70).await.unwrap());
        assert!(store.downloaded_manga(300).await.unwrap().is_empty());
        assert_eq!(store.reset_downloads(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manga_summaries_include_source() {
        let store = store().await;
        let summaries = store.manga_summaries(&[8, 7, 42]).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].manga_id, 7);
        assert_eq!(summaries[0].source_lang, "en");
        assert_eq!(summaries[1].source_name, "2");
    }

    #[tokio::test]
    async fn test_reimport_keeps_download_state() {
        let store = store().await;
        store.mark_downloaded(70, 3).await.unwrap();
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        store.import_manifest(&manifest).await.unwrap();
        assert!(store.is_downloaded(70).await.unwrap());
    }
}
