//! In-memory page source and chapter store for driving the scheduler.
//!
//! The fake source serves `pages` pages per chapter, sleeping `delay` per
//! page fetch, and records how many fetches run at once per source so
//! tests can check the concurrency ceilings.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chapter_core::store::Result as StoreResult;
use chapter_core::{
    CatalogError, ChapterRecord, ChapterStore, DownloadManager, DownloadState, DownloadedManga,
    MangaRecord, PageBody, PageDescriptor, PageSource, SchedulerConfig, StoreError,
};
use futures_util::stream;

/// Scheduler configuration with short intervals, rooted in `data_root`.
pub fn fast_config(data_root: &Path) -> SchedulerConfig {
    SchedulerConfig {
        rebalance_interval: Duration::from_millis(20),
        notify_interval: Duration::from_millis(20),
        finish_debounce: Duration::from_millis(10),
        progress_sample: Duration::from_millis(5),
        ..SchedulerConfig::new(data_root)
    }
}

pub fn manga(id: i64, source_id: i64) -> MangaRecord {
    MangaRecord {
        id,
        source_id,
        source_name: format!("Source {source_id}"),
        title: format!("Manga {id}"),
    }
}

pub fn chapter(id: i64, manga_id: i64, index: i64) -> ChapterRecord {
    ChapterRecord {
        id,
        manga_id,
        index,
        name: format!("Chapter {index}"),
        scanlator: None,
        original_chapter_id: None,
        page_count: None,
    }
}

/// Bytes the fake source serves for one page.
pub fn page_bytes(chapter_id: i64, index: u32) -> Vec<u8> {
    format!("page {index} of chapter {chapter_id}").into_bytes()
}

// ==================== Page source ====================

#[derive(Debug, Clone, Copy)]
pub struct ChapterPlan {
    pub source_id: i64,
    pub pages: u32,
    pub delay: Duration,
}

#[derive(Debug, Default)]
struct InFlight {
    per_source: HashMap<i64, usize>,
    max_per_source: HashMap<i64, usize>,
    max_sources: usize,
}

#[derive(Debug, Default)]
pub struct FakePageSource {
    plans: Mutex<HashMap<i64, ChapterPlan>>,
    failures_left: Mutex<HashMap<i64, usize>>,
    in_flight: Arc<Mutex<InFlight>>,
    resolves: Mutex<HashMap<i64, usize>>,
    fetches: Mutex<HashMap<i64, usize>>,
}

impl FakePageSource {
    pub fn plan(&self, chapter_id: i64, plan: ChapterPlan) {
        self.plans.lock().unwrap().insert(chapter_id, plan);
    }

    /// Makes the next `times` page-list resolutions of a chapter fail.
    pub fn fail(&self, chapter_id: i64, times: usize) {
        self.failures_left.lock().unwrap().insert(chapter_id, times);
    }

    pub fn resolves(&self, chapter_id: i64) -> usize {
        self.resolves.lock().unwrap().get(&chapter_id).copied().unwrap_or(0)
    }

    pub fn fetches(&self, chapter_id: i64) -> usize {
        self.fetches.lock().unwrap().get(&chapter_id).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self, source_id: i64) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .max_per_source
            .get(&source_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_sources_in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().max_sources
    }

    pub fn reset_max_in_flight(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let snapshot = in_flight.per_source.clone();
        in_flight.max_per_source = snapshot;
        in_flight.max_sources = in_flight.per_source.values().filter(|n| **n > 0).count();
    }
}

struct FlightGuard {
    in_flight: Arc<Mutex<InFlight>>,
    source_id: i64,
}

impl FlightGuard {
    fn enter(in_flight: &Arc<Mutex<InFlight>>, source_id: i64) -> Self {
        let mut state = in_flight.lock().unwrap();
        let count = state.per_source.entry(source_id).or_insert(0);
        *count += 1;
        let count = *count;
        let max = state.max_per_source.entry(source_id).or_insert(0);
        *max = (*max).max(count);
        let sources = state.per_source.values().filter(|n| **n > 0).count();
        state.max_sources = state.max_sources.max(sources);
        Self {
            in_flight: Arc::clone(in_flight),
            source_id,
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut state = self.in_flight.lock().unwrap();
        if let Some(count) = state.per_source.get_mut(&self.source_id) {
            *count -= 1;
        }
    }
}

fn parse_url(url: &str) -> (i64, i64, u32) {
    let parts: Vec<&str> = url.trim_start_matches("fake://").split('/').collect();
    (
        parts[0].parse().unwrap(),
        parts[1].parse().unwrap(),
        parts[2].parse().unwrap(),
    )
}

#[async_trait]
impl PageSource for FakePageSource {
    async fn resolve_pages(
        &self,
        manga: &MangaRecord,
        chapter: &ChapterRecord,
    ) -> Result<Vec<PageDescriptor>, CatalogError> {
        *self.resolves.lock().unwrap().entry(chapter.id).or_insert(0) += 1;
        {
            let mut failures = self.failures_left.lock().unwrap();
            if let Some(left) = failures.get_mut(&chapter.id)
                && *left > 0
            {
                *left -= 1;
                return Err(CatalogError::Other(format!("boom on chapter {}", chapter.id)));
            }
        }
        let plan = self.plans.lock().unwrap().get(&chapter.id).copied();
        let Some(plan) = plan else {
            return Err(CatalogError::UnknownChapter {
                chapter_id: chapter.id,
            });
        };
        Ok((0..plan.pages)
            .map(|index| PageDescriptor {
                index,
                url: format!("fake://{}/{}/{index}", manga.source_id, chapter.id),
            })
            .collect())
    }

    async fn fetch_page(&self, page: &PageDescriptor) -> Result<PageBody, CatalogError> {
        let (source_id, chapter_id, index) = parse_url(&page.url);
        *self.fetches.lock().unwrap().entry(chapter_id).or_insert(0) += 1;
        let delay = self
            .plans
            .lock()
            .unwrap()
            .get(&chapter_id)
            .map_or(Duration::ZERO, |plan| plan.delay);

        let _guard = FlightGuard::enter(&self.in_flight, source_id);
        tokio::time::sleep(delay).await;

        let bytes = page_bytes(chapter_id, index);
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        let chunks = vec![Ok(head.to_vec()), Ok(tail.to_vec())];
        Ok(PageBody {
            content_length: Some(bytes.len() as u64),
            stream: Box::pin(stream::iter(chunks)),
        })
    }
}

// ==================== Chapter store ====================

#[derive(Debug, Default)]
pub struct FakeChapterStore {
    chapters: Mutex<HashMap<i64, (MangaRecord, ChapterRecord)>>,
    downloaded: Mutex<Vec<(i64, u32)>>,
    reset: Mutex<HashSet<i64>>,
}

impl FakeChapterStore {
    pub fn insert(&self, manga: MangaRecord, chapter: ChapterRecord) {
        self.chapters.lock().unwrap().insert(chapter.id, (manga, chapter));
    }

    /// `(chapter_id, page_count)` in the order chapters were recorded.
    pub fn downloaded(&self) -> Vec<(i64, u32)> {
        self.downloaded.lock().unwrap().clone()
    }

    pub fn reset_manga(&self) -> HashSet<i64> {
        self.reset.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChapterStore for FakeChapterStore {
    async fn load_download_targets(
        &self,
        chapter_ids: &[i64],
    ) -> StoreResult<Vec<(MangaRecord, ChapterRecord)>> {
        let chapters = self.chapters.lock().unwrap();
        Ok(chapter_ids
            .iter()
            .filter_map(|id| chapters.get(id).cloned())
            .collect())
    }

    async fn find_chapter_id(&self, manga_id: i64, chapter_index: i64) -> StoreResult<Option<i64>> {
        Ok(self
            .chapters
            .lock()
            .unwrap()
            .values()
            .find(|(_, chapter)| chapter.manga_id == manga_id && chapter.index == chapter_index)
            .map(|(_, chapter)| chapter.id))
    }

    async fn mark_downloaded(&self, chapter_id: i64, page_count: u32) -> StoreResult<()> {
        if !self.chapters.lock().unwrap().contains_key(&chapter_id) {
            return Err(StoreError::ChapterNotFound(chapter_id));
        }
        self.downloaded.lock().unwrap().push((chapter_id, page_count));
        Ok(())
    }

    async fn is_downloaded(&self, chapter_id: i64) -> StoreResult<bool> {
        Ok(self
            .downloaded
            .lock()
            .unwrap()
            .iter()
            .any(|(id, _)| *id == chapter_id))
    }

    async fn reset_downloads(&self, manga_ids: &[i64]) -> StoreResult<u64> {
        self.reset.lock().unwrap().extend(manga_ids.iter().copied());
        let chapters = self.chapters.lock().unwrap();
        let mut downloaded = self.downloaded.lock().unwrap();
        let before = downloaded.len();
        downloaded.retain(|(id, _)| {
            chapters
                .get(id)
                .is_none_or(|(manga, _)| !manga_ids.contains(&manga.id))
        });
        Ok((before - downloaded.len()) as u64)
    }

    async fn downloaded_manga(&self, _limit: u32) -> StoreResult<Vec<DownloadedManga>> {
        Ok(Vec::new())
    }

    async fn manga_summaries(&self, manga_ids: &[i64]) -> StoreResult<Vec<DownloadedManga>> {
        let chapters = self.chapters.lock().unwrap();
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for (manga, _) in chapters.values() {
            if manga_ids.contains(&manga.id) && seen.insert(manga.id) {
                rows.push(DownloadedManga {
                    manga_id: manga.id,
                    title: manga.title.clone(),
                    in_library: true,
                    last_download_at: 1,
                    source_id: manga.source_id,
                    source_name: manga.source_name.clone(),
                    source_lang: "en".to_string(),
                });
            }
        }
        rows.sort_by_key(|row| row.manga_id);
        Ok(rows)
    }
}

// ==================== Harness ====================

pub struct Harness {
    pub manager: DownloadManager,
    pub source: Arc<FakePageSource>,
    pub store: Arc<FakeChapterStore>,
}

impl Harness {
    pub fn new(config: SchedulerConfig) -> Self {
        let source = Arc::new(FakePageSource::default());
        let store = Arc::new(FakeChapterStore::default());
        let manager = DownloadManager::new(config, source.clone(), store.clone()).unwrap();
        Self {
            manager,
            source,
            store,
        }
    }

    /// Registers a chapter with both fakes; chapter id is `manga_id * 100 + index`.
    pub fn add_chapter(&self, source_id: i64, manga_id: i64, index: i64, pages: u32, delay: Duration) -> i64 {
        let id = manga_id * 100 + index;
        self.store.insert(manga(manga_id, source_id), chapter(id, manga_id, index));
        self.source.plan(
            id,
            ChapterPlan {
                source_id,
                pages,
                delay,
            },
        );
        id
    }

    pub fn state_of(&self, chapter_id: i64) -> Option<(DownloadState, u32)> {
        self.manager
            .status()
            .items
            .iter()
            .find(|item| item.chapter_id == chapter_id)
            .map(|item| (item.state, item.tries))
    }

    pub fn downloading(&self) -> usize {
        self.manager
            .status()
            .items
            .iter()
            .filter(|item| item.state == DownloadState::Downloading)
            .count()
    }
}

/// Polls `condition` every 5ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
