//! HTTP page source backed by manifest page lists.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use super::{CatalogError, Manifest, PageBody, PageDescriptor, PageSource};
use crate::queue::{ChapterRecord, MangaRecord};

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for slow image hosts).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// User-Agent sent with every page request.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("chapter-downloader/{version}")
}

/// Fetches page images over HTTP.
///
/// Page lists are known up front (from a [`Manifest`]); only the page bytes
/// travel over the network. The client is created once and reused so
/// connections are pooled across pages and chapters.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    client: Client,
    pages: HashMap<i64, Vec<String>>,
}

impl HttpPageSource {
    /// Creates a source over explicit page lists keyed by chapter id.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the HTTP client cannot be constructed.
    pub fn new(pages: HashMap<i64, Vec<String>>) -> Result<Self, reqwest::Error> {
        Self::new_with_timeouts(pages, CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a source with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the HTTP client cannot be constructed.
    pub fn new_with_timeouts(
        pages: HashMap<i64, Vec<String>>,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(default_user_agent())
            .build()?;
        Ok(Self { client, pages })
    }

    /// Creates a source serving every chapter listed in the manifest.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the HTTP client cannot be constructed.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, reqwest::Error> {
        Self::new(manifest.page_lists())
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn resolve_pages(
        &self,
        _manga: &MangaRecord,
        chapter: &ChapterRecord,
    ) -> Result<Vec<PageDescriptor>, CatalogError> {
        let urls = self
            .pages
            .get(&chapter.id)
            .ok_or(CatalogError::UnknownChapter {
                chapter_id: chapter.id,
            })?;
        if urls.is_empty() {
            return Err(CatalogError::EmptyChapter {
                chapter_id: chapter.id,
            });
        }
        Ok(urls
            .iter()
            .zip(0u32..)
            .map(|(url, index)| PageDescriptor {
                index,
                url: url.clone(),
            })
            .collect())
    }

    #[instrument(skip(self), fields(url = %page.url, index = page.index))]
    async fn fetch_page(&self, page: &PageDescriptor) -> Result<PageBody, CatalogError> {
        let url = Url::parse(&page.url).map_err(|_| CatalogError::invalid_url(&page.url))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CatalogError::from_reqwest(&page.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::http_status(&page.url, status.as_u16()));
        }

        let content_length = response.content_length();
        debug!(content_length, "page response received");

        let url = page.url.clone();
        let stream = response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| CatalogError::from_reqwest(url.clone(), e))
            })
            .boxed();

        Ok(PageBody {
            content_length,
            stream,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn chapter(id: i64) -> ChapterRecord {
        ChapterRecord {
            id,
            manga_id: 1,
            index: 1,
            name: "Chapter 1".to_string(),
            scanlator: None,
            original_chapter_id: None,
            page_count: None,
        }
    }

    fn manga() -> MangaRecord {
        MangaRecord {
            id: 1,
            source_id: 1,
            source_name: "Example".to_string(),
            title: "Title".to_string(),
        }
    }

    #[tokio::test]
    async fn test_resolve_pages_indexes_in_order() {
        let source = HttpPageSource::new(HashMap::from([(
            5,
            vec!["https://a/0.jpg".to_string(), "https://a/1.jpg".to_string()],
        )]))
        .unwrap();

        let pages = source.resolve_pages(&manga(), &chapter(5)).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].index, 1);
        assert_eq!(pages[1].url, "https://a/1.jpg");
    }

    #[tokio::test]
    async fn test_resolve_pages_unknown_and_empty() {
        let source = HttpPageSource::new(HashMap::from([(5, Vec::new())])).unwrap();

        let err = source.resolve_pages(&manga(), &chapter(9)).await.unwrap_err();
        assert!(matches!(err, CatalogError::UnknownChapter { chapter_id: 9 }));

        let err = source.resolve_pages(&manga(), &chapter(5)).await.unwrap_err();
        assert!(matches!(err, CatalogError::EmptyChapter { chapter_id: 5 }));
    }

    #[tokio::test]
    async fn test_fetch_page_rejects_invalid_url() {
        let source = HttpPageSource::new(HashMap::new()).unwrap();
        let page = PageDescriptor {
            index: 0,
            url: "not a url".to_string(),
        };
        let err = source.fetch_page(&page).await.unwrap_err();
        assert!(matches!(err, CatalogError::InvalidUrl { .. }));
    }

    #[test]
    fn test_default_user_agent_has_version() {
        assert!(default_user_agent().starts_with("chapter-downloader/"));
    }
}
