//! Page sources: where chapter pages come from.
//!
//! The scheduler only needs two capabilities from a catalogue: list the pages
//! of a chapter, and stream the bytes of one page. [`PageSource`] captures
//! both so the download loop can run against HTTP in production and against
//! in-memory fakes in tests.

mod error;
pub mod http;
pub mod manifest;

pub use error::CatalogError;
pub use http::HttpPageSource;
pub use manifest::Manifest;

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};

use crate::queue::{ChapterRecord, MangaRecord};

/// One page of a chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    /// Zero-based page index.
    pub index: u32,
    /// Where the page bytes live.
    pub url: String,
}

/// Body of a fetched page: optional declared length and a chunk stream.
pub struct PageBody {
    /// Declared total length, when the source knows it.
    pub content_length: Option<u64>,
    /// Page bytes, chunk by chunk.
    pub stream: BoxStream<'static, Result<Vec<u8>, CatalogError>>,
}

impl PageBody {
    /// Wraps an in-memory page as a single-chunk body.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            content_length: Some(bytes.len() as u64),
            stream: Box::pin(stream::once(async move { Ok(bytes) })),
        }
    }
}

impl fmt::Debug for PageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Supplies the pages of queued chapters.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Lists the pages of a chapter in reading order.
    async fn resolve_pages(
        &self,
        manga: &MangaRecord,
        chapter: &ChapterRecord,
    ) -> Result<Vec<PageDescriptor>, CatalogError>;

    /// Opens the byte stream of one page.
    async fn fetch_page(&self, page: &PageDescriptor) -> Result<PageBody, CatalogError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_page_body_from_bytes_yields_single_chunk() {
        let mut body = PageBody::from_bytes(b"jpeg".to_vec());
        assert_eq!(body.content_length, Some(4));
        assert_eq!(body.stream.next().await.unwrap().unwrap(), b"jpeg");
        assert!(body.stream.next().await.is_none());
    }

    #[test]
    fn test_page_body_debug_omits_stream() {
        let body = PageBody::from_bytes(Vec::new());
        assert!(format!("{body:?}").contains("content_length: Some(0)"));
    }
}
