//! Runtime configuration, read from the environment (and `.env` outside tests).

use std::path::PathBuf;

pub const DEFAULT_BASE_URL: &str = "https://api.moyklass.com/v1/company";
pub const DEFAULT_PAGE_LIMIT: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_key: Option<String>,
    pub base_url: String,
    pub cache_dir: PathBuf,
    pub database_url: Option<String>,
    pub page_limit: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("MOYCLASS_API_KEY").filter(|v| !v.trim().is_empty());
        let base_url = lookup("MOYCLASS_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("saved_data"));
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        let page_limit = match lookup("PAGE_LIMIT") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| {
                    ConfigError::InvalidValue(
                        "PAGE_LIMIT".to_string(),
                        format!("'{raw}' is not a positive integer"),
                    )
                })?,
            None => DEFAULT_PAGE_LIMIT,
        };

        Ok(Self {
            api_key,
            base_url,
            cache_dir,
            database_url,
            page_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.cache_dir, PathBuf::from("saved_data"));
        assert_eq!(config.page_limit, 100);
        assert!(config.database_url.is_none());
        assert!(config.api_key.is_none());
    }

    #[test]
    fn rejects_zero_page_limit() {
        let err = Config::from_lookup(lookup_from(&[("PAGE_LIMIT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(..)));
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("MOYCLASS_API_KEY", "secret"),
            ("CACHE_DIR", "/tmp/cache"),
            ("PAGE_LIMIT", "250"),
        ]))
        .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(config.page_limit, 250);
    }
}
