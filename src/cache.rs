//! Local persistence of loaded entity tables, keyed by entity name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::CacheError;
use crate::models::EntityTable;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<EntityTable>, CacheError>;

    /// Stores `table` under `key`, replacing any previous entry.
    async fn put(&self, key: &str, table: &EntityTable) -> Result<(), CacheError>;
}

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Box<T> {
    async fn get(&self, key: &str) -> Result<Option<EntityTable>, CacheError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, table: &EntityTable) -> Result<(), CacheError> {
        (**self).put(key, table).await
    }
}

/// One JSON document per entity under a cache directory.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<EntityTable>, CacheError> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        debug!(path = %path.display(), "cache hit");
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn put(&self, key: &str, table: &EntityTable) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.entry_path(key);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec(table)?).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!(path = %path.display(), rows = table.len(), "cache written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
    }

    fn lesson_row() -> Record {
        json!({
            "id": 10,
            "date": "2024-01-08",
            "price": 12.5,
            "online": false,
            "comment": null,
            "records": [{"userId": 1, "visit": true}]
        })
        .as_object()
        .cloned()
        .expect("object")
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let store = FileCacheStore::new(temp_dir("cache-missing"));
        assert!(store.get("users").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn round_trip_preserves_field_types() {
        let dir = temp_dir("cache-roundtrip");
        let store = FileCacheStore::new(&dir);
        let table = EntityTable::new("lessons", vec![lesson_row()]);

        store.put("lessons", &table).await.expect("put");
        let cached = store.get("lessons").await.expect("get").expect("entry");

        assert_eq!(cached, table);
        assert!(cached.rows[0]["records"].is_array());
        assert_eq!(cached.rows[0]["online"], json!(false));
        assert!(!dir.join("lessons.json.tmp").exists());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn put_overwrites_previous_entry() {
        let dir = temp_dir("cache-overwrite");
        let store = FileCacheStore::new(&dir);
        store
            .put("lessons", &EntityTable::new("lessons", vec![lesson_row(), lesson_row()]))
            .await
            .expect("first put");
        store
            .put("lessons", &EntityTable::new("lessons", vec![lesson_row()]))
            .await
            .expect("second put");

        let cached = store.get("lessons").await.expect("get").expect("entry");
        assert_eq!(cached.len(), 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn round_trip_keeps_every_float_digit() {
        let dir = temp_dir("cache-floats");
        let store = FileCacheStore::new(&dir);
        let rows: Vec<Record> = [1234.5670000714379, 2.6383446160331653e-256, 0.1 + 0.2]
            .into_iter()
            .map(|v| json!({ "v": v }).as_object().cloned().expect("object"))
            .collect();
        let table = EntityTable::new("payments", rows);

        store.put("payments", &table).await.expect("put");
        let cached = store.get("payments").await.expect("get").expect("entry");
        std::fs::remove_dir_all(dir).ok();

        assert_eq!(cached.rows[0]["v"].as_f64(), Some(1234.5670000714379));
        assert_eq!(cached.rows[1]["v"].as_f64(), Some(2.6383446160331653e-256));
        assert_eq!(cached, table);
    }

    #[test]
    fn keys_map_to_safe_file_names() {
        let store = FileCacheStore::new("/cache");
        assert_eq!(store.entry_path("lessonRecords"), PathBuf::from("/cache/lessonRecords.json"));
        assert_eq!(store.entry_path("../etc"), PathBuf::from("/cache/___etc.json"));
    }
}
