//! Chapter Downloader Core Library
//!
//! This library provides the background download scheduler for manga
//! chapters: a shared queue, one worker pool per source, and a supervisor
//! that bounds how many sources and workers run at once.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`queue`] - In-memory download queue and item state machine
//! - [`scheduler`] - Download manager, per-source worker pools, observers
//! - [`storage`] - On-disk page store in the current and legacy layouts
//! - [`catalog`] - Page sources (HTTP) and the chapter manifest
//! - [`store`] - Chapter metadata persistence
//! - [`db`] - Database connection and schema management
//! - [`library`] - Removing and listing downloaded manga
//! - [`config`] - Scheduler configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod config;
pub mod db;
pub mod library;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod store;

// Re-export commonly used types
pub use catalog::{CatalogError, HttpPageSource, Manifest, PageBody, PageDescriptor, PageSource};
pub use config::{ConfigError, SchedulerConfig};
pub use db::{Database, DbError};
pub use library::{DownloadedMangaInfo, LegacyManga, LibraryError};
pub use queue::{ChapterRecord, DownloadItem, DownloadKey, DownloadQueue, DownloadState, MangaRecord};
pub use scheduler::{
    BackgroundResult, DownloadError, DownloadManager, DownloadStatus, ItemStatus, ManagerState, Observer,
    ObserverMessage, SchedulerError,
};
pub use storage::{ChapterLocation, PageStore, StorageError};
pub use store::{ChapterStore, DownloadedManga, SqliteChapterStore, StoreError};
