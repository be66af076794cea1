//! Attendance monitoring on top of the MoyClass CRM API: paged loading of
//! entity collections with a local cache, and a recency rule that flags
//! students who stopped attending.

pub mod attendance;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod loader;
pub mod models;
pub mod report;
pub mod risk;
pub mod source;

pub use cache::{CacheStore, FileCacheStore};
pub use db::PgCacheStore;
pub use error::{CacheError, FetchError, LoadError, MalformedAttendanceError};
pub use loader::PagedEntityLoader;
pub use models::{ClassificationResult, EntityTable, Record};
pub use source::{Entity, LazyClient, MoyClassClient, PageSource, QueryParams, RemotePage};
