//! Paged loading of whole entity collections, with a per-entity cache.

use std::time::Instant;

use serde_json::Value;
use tracing::info;

use crate::cache::CacheStore;
use crate::config::DEFAULT_PAGE_LIMIT;
use crate::error::LoadError;
use crate::models::EntityTable;
use crate::source::{PageSource, QueryParams, RemotePage};

pub struct PagedEntityLoader<C> {
    cache: C,
    default_limit: u64,
}

impl<C: CacheStore> PagedEntityLoader<C> {
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            default_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    /// Page size used when the caller's params carry no `limit`.
    pub fn with_default_limit(mut self, limit: u64) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Returns the cached table for `entity` unless `force_refresh` is set or
    /// nothing is cached; otherwise pages through `source` and replaces the
    /// cache entry.
    pub async fn load(
        &self,
        source: &dyn PageSource,
        entity: &str,
        base_params: &QueryParams,
        force_refresh: bool,
    ) -> Result<EntityTable, LoadError> {
        if !force_refresh {
            if let Some(table) = self.cache.get(entity).await? {
                info!(entity, rows = table.len(), "loaded from cache");
                return Ok(table);
            }
        }

        let table = self.fetch_all(source, entity, base_params).await?;
        self.cache.put(entity, &table).await?;
        info!(entity, rows = table.len(), "loaded");
        Ok(table)
    }

    async fn fetch_all(
        &self,
        source: &dyn PageSource,
        entity: &str,
        base_params: &QueryParams,
    ) -> Result<EntityTable, LoadError> {
        let page_size = self.page_size(base_params)?;
        let params = base_params.with("limit", page_size.to_string());
        let started = Instant::now();

        let first = fetch(source, entity, &params.with("offset", "0")).await?;
        let (mut rows, total_items) = match RemotePage::decode(entity, first)? {
            RemotePage::Collection { items, total_items } => (items, total_items),
            RemotePage::RawList { items } => {
                info!(entity, items = items.len(), "bare list response, single page");
                return Ok(EntityTable::new(entity, items));
            }
        };

        let page_count = total_items.div_ceil(page_size);
        info!(entity, total_items, page_count, "collection size reported");

        for page in 1..page_count {
            let offset = page_size * page;
            let next = fetch(source, entity, &params.with("offset", offset.to_string())).await?;
            rows.extend(RemotePage::decode_items(entity, next)?);
        }

        info!(entity, elapsed = ?started.elapsed(), "data loaded");
        Ok(EntityTable::new(entity, rows))
    }

    fn page_size(&self, params: &QueryParams) -> Result<u64, LoadError> {
        match params.get_last("limit") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| LoadError::InvalidParams(format!("limit must be a positive integer, got '{raw}'"))),
            None => Ok(self.default_limit),
        }
    }
}

async fn fetch(
    source: &dyn PageSource,
    entity: &str,
    params: &QueryParams,
) -> Result<Value, LoadError> {
    source
        .fetch_page(params)
        .await
        .map_err(|source| LoadError::RemoteFetch {
            entity: entity.to_string(),
            source,
        })
}
