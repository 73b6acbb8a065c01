//! Integration tests for the HTTP page source against a mock server,
//! including a full scheduler run backed by SQLite.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chapter_core::{
    CatalogError, ChapterLocation, ChapterRecord, ChapterStore, Database, DownloadManager,
    HttpPageSource, Manifest, MangaRecord, PageDescriptor, PageSource, SchedulerConfig,
    SqliteChapterStore,
};
use futures_util::StreamExt;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn page(url: String) -> PageDescriptor {
    PageDescriptor { index: 0, url }
}

async fn collect(source: &HttpPageSource, url: String) -> Result<Vec<u8>, CatalogError> {
    let mut body = source.fetch_page(&page(url)).await?;
    let mut bytes = Vec::new();
    while let Some(chunk) = body.stream.next().await {
        bytes.extend(chunk?);
    }
    Ok(bytes)
}

// ==================== Fetch Tests ====================

#[tokio::test]
async fn test_fetch_page_streams_body() -> Result<(), Box<dyn std::error::Error>> {
    let server = MockServer::start().await;
    let body = vec![7u8; 64 * 1024];
    Mock::given(method("GET"))
        .and(path("/7/1/0.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let source = HttpPageSource::new(HashMap::new())?;
    let url = format!("{}/7/1/0.jpg", server.uri());
    let declared = source.fetch_page(&page(url.clone())).await?.content_length;
    assert_eq!(declared, Some(body.len() as u64));
    assert_eq!(collect(&source, url).await?, body);
    Ok(())
}

#[tokio::test]
async fn test_fetch_page_maps_http_status() -> Result<(), Box<dyn std::error::Error>> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let source = HttpPageSource::new(HashMap::new())?;
    let err = collect(&source, format!("{}/missing.jpg", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::HttpStatus { status: 404, .. }));
    assert!(err.to_string().contains("404"));
    Ok(())
}

#[tokio::test]
async fn test_fetch_page_times_out() -> Result<(), Box<dyn std::error::Error>> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.jpg"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let source = HttpPageSource::new_with_timeouts(HashMap::new(), 1, 1)?;
    let started = Instant::now();
    let err = collect(&source, format!("{}/slow.jpg", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Timeout { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    Ok(())
}

#[tokio::test]
async fn test_resolve_pages_from_manifest() -> Result<(), Box<dyn std::error::Error>> {
    let manifest: Manifest = serde_json::from_str(
        r#"{ "manga": [{ "id": 7, "sourceId": 1, "title": "T", "chapters": [
            { "id": 70, "index": 1, "name": "C1", "pages": ["https://a/0.jpg", "https://a/1.jpg"] }
        ]}]}"#,
    )?;
    let source = HttpPageSource::from_manifest(&manifest)?;
    let manga = MangaRecord {
        id: 7,
        source_id: 1,
        source_name: "S".to_string(),
        title: "T".to_string(),
    };
    let chapter = ChapterRecord {
        id: 70,
        manga_id: 7,
        index: 1,
        name: "C1".to_string(),
        scanlator: None,
        original_chapter_id: None,
        page_count: None,
    };
    let pages = source.resolve_pages(&manga, &chapter).await?;
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].index, 0);
    Ok(())
}

// ==================== Scheduler Run Tests ====================

#[tokio::test]
async fn test_manager_downloads_manifest_over_http() -> Result<(), Box<dyn std::error::Error>> {
    let server = MockServer::start().await;
    for index in 0..3 {
        Mock::given(method("GET"))
            .and(path(format!("/7/1/{index}.jpg")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![index as u8; 2048]))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/7/2/0.jpg"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let manifest: Manifest = serde_json::from_value(serde_json::json!({
        "sources": [{ "id": 1, "name": "Example", "lang": "en" }],
        "manga": [{ "id": 7, "sourceId": 1, "title": "Blue Sky", "chapters": [
            { "id": 70, "index": 1, "name": "Chapter 1", "pages": [
                format!("{}/7/1/0.jpg", server.uri()),
                format!("{}/7/1/1.jpg", server.uri()),
                format!("{}/7/1/2.jpg", server.uri()),
            ]},
            { "id": 71, "index": 2, "name": "Chapter 2", "pages": [
                format!("{}/7/2/0.jpg", server.uri()),
            ]}
        ]}]
    }))?;

    let temp_dir = TempDir::new()?;
    let db = Database::new(&temp_dir.path().join("chapters.db")).await?;
    let store = Arc::new(SqliteChapterStore::new(db));
    store.import_manifest(&manifest).await?;

    let config = SchedulerConfig {
        rebalance_interval: Duration::from_millis(20),
        notify_interval: Duration::from_millis(20),
        finish_debounce: Duration::from_millis(10),
        ..SchedulerConfig::new(temp_dir.path())
    };
    let source = Arc::new(HttpPageSource::from_manifest(&manifest)?);
    let manager = DownloadManager::new(config, source, store.clone())?;

    assert_eq!(manager.enqueue(&manifest.chapter_ids()).await?, 2);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = manager.status();
        let settled = status.finished_count == 1
            && status.items.len() == 1
            && status.items[0].tries == 3;
        if settled || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(store.is_downloaded(70).await?);
    assert!(!store.is_downloaded(71).await?);
    let status = manager.status();
    assert_eq!(status.items[0].chapter_id, 71);
    assert!(status.items[0].last_error.as_deref().unwrap_or("").contains("500"));

    let stored = manager
        .pages()
        .read_page(&ChapterLocation::new(7, 70), 2)
        .await?
        .unwrap();
    assert_eq!(stored.bytes, vec![2u8; 2048]);
    assert_eq!(stored.content_type, "image/jpeg");

    let downloaded = manager.downloaded_manga().await?;
    assert_eq!(downloaded.len(), 1);
    assert_eq!(downloaded[0].title, "Blue Sky");

    manager.shutdown().await;
    Ok(())
}
