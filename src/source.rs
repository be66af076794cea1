//! The remote entity source: query parameters, the page-fetch port and the
//! MoyClass HTTP adapter that implements it.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{FetchError, LoadError};
use crate::models::Record;

/// An ordered, immutable list of query pairs. Repeated keys are allowed
/// (the API takes two `date` entries for a range).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pair, keeping earlier entries for the same key.
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Returns a copy where `key` holds exactly `value`.
    pub fn with(&self, key: &str, value: impl Into<String>) -> Self {
        let mut pairs: Vec<(String, String)> = self
            .pairs
            .iter()
            .filter(|(k, _)| k != key)
            .cloned()
            .collect();
        pairs.push((key.to_string(), value.into()));
        Self { pairs }
    }

    pub fn get_last(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Parses CLI style `key=value` arguments.
    pub fn parse_pairs<I, S>(args: I) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Self::new();
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| LoadError::InvalidParams(format!("expected key=value, got '{arg}'")))?;
            if key.trim().is_empty() {
                return Err(LoadError::InvalidParams(format!("empty key in '{arg}'")));
            }
            params = params.and(key.trim(), value.trim());
        }
        Ok(params)
    }
}

/// Performs one remote GET and returns the decoded JSON body.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, params: &QueryParams) -> Result<Value, FetchError>;
}

/// The two response shapes the API produces for list endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum RemotePage {
    Collection { items: Vec<Record>, total_items: u64 },
    RawList { items: Vec<Record> },
}

impl RemotePage {
    /// Resolves the response shape. A mapping must carry the entity-named
    /// item list and `stats.totalItems`; anything else is malformed.
    pub fn decode(entity: &str, value: Value) -> Result<Self, LoadError> {
        let malformed = |reason: String| LoadError::MalformedResponse {
            entity: entity.to_string(),
            reason,
        };

        match value {
            Value::Array(list) => Ok(RemotePage::RawList {
                items: records_from(list).map_err(malformed)?,
            }),
            Value::Object(mut map) => {
                let total_items = map
                    .get("stats")
                    .and_then(|stats| stats.get("totalItems"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| malformed("missing stats.totalItems".to_string()))?;
                let items = match map.remove(entity) {
                    Some(Value::Array(list)) => records_from(list).map_err(malformed)?,
                    Some(_) => return Err(malformed(format!("field '{entity}' is not a list"))),
                    None => return Err(malformed(format!("missing field '{entity}'"))),
                };
                Ok(RemotePage::Collection { items, total_items })
            }
            other => Err(malformed(format!("unexpected JSON value: {other}"))),
        }
    }

    /// Items of a follow-up page. Only the first page has to carry
    /// `stats.totalItems`, so later pages are read for their item list alone.
    pub fn decode_items(entity: &str, value: Value) -> Result<Vec<Record>, LoadError> {
        let malformed = |reason: String| LoadError::MalformedResponse {
            entity: entity.to_string(),
            reason,
        };

        match value {
            Value::Array(list) => records_from(list).map_err(malformed),
            Value::Object(mut map) => match map.remove(entity) {
                Some(Value::Array(list)) => records_from(list).map_err(malformed),
                Some(_) => Err(malformed(format!("field '{entity}' is not a list"))),
                None => Err(malformed(format!("missing field '{entity}'"))),
            },
            other => Err(malformed(format!("unexpected JSON value: {other}"))),
        }
    }
}

fn records_from(list: Vec<Value>) -> Result<Vec<Record>, String> {
    list.into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(record) => Ok(record),
            other => Err(format!("item {index} is not an object: {other}")),
        })
        .collect()
}

/// List endpoints of the company API used by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Entity {
    Users,
    Lessons,
    LessonRecords,
    Joins,
    Classes,
    Courses,
    Filials,
    Rooms,
    Managers,
}

impl Entity {
    /// Name of the collection field in responses, also used as the cache key.
    pub fn name(self) -> &'static str {
        match self {
            Entity::Users => "users",
            Entity::Lessons => "lessons",
            Entity::LessonRecords => "lessonRecords",
            Entity::Joins => "joins",
            Entity::Classes => "classes",
            Entity::Courses => "courses",
            Entity::Filials => "filials",
            Entity::Rooms => "rooms",
            Entity::Managers => "managers",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Authenticated client for the MoyClass company API.
#[derive(Clone)]
pub struct MoyClassClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl MoyClassClient {
    /// Exchanges the API key for an access token.
    pub async fn connect(base_url: &str, api_key: &str) -> Result<Self, FetchError> {
        let http = reqwest::Client::new();
        let base_url = base_url.trim_end_matches('/').to_string();

        let response = http
            .post(format!("{base_url}/auth/getToken"))
            .json(&serde_json::json!({ "apiKey": api_key }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Auth(format!(
                "token request returned {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        let token = body
            .get("accessToken")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Auth("response has no accessToken".to_string()))?
            .to_string();
        info!("Token granted");

        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn endpoint(&self, entity: Entity) -> Endpoint<'_> {
        Endpoint {
            client: self,
            entity,
        }
    }

    async fn get(&self, path: &str, params: &QueryParams) -> Result<Value, FetchError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, params = ?params.pairs(), "GET");
        let response = self
            .http
            .get(&url)
            .header("x-access-token", &self.token)
            .query(params.pairs())
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let code = body
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(FetchError::Status {
                status: status.as_u16(),
                code,
            });
        }
        Ok(response.json().await?)
    }
}

/// One list endpoint bound to a connected client.
pub struct Endpoint<'a> {
    client: &'a MoyClassClient,
    entity: Entity,
}

#[async_trait]
impl PageSource for Endpoint<'_> {
    async fn fetch_page(&self, params: &QueryParams) -> Result<Value, FetchError> {
        self.client.get(self.entity.name(), params).await
    }
}

/// Connects to the API on first use, so runs served from the cache need
/// neither an API key nor network access.
pub struct LazyClient {
    base_url: String,
    api_key: Option<String>,
    client: OnceCell<MoyClassClient>,
}

impl LazyClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            client: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.initialized()
    }

    pub async fn client(&self) -> Result<&MoyClassClient, FetchError> {
        self.client
            .get_or_try_init(|| async {
                match self.api_key.as_deref() {
                    Some(api_key) => MoyClassClient::connect(&self.base_url, api_key).await,
                    None => Err(FetchError::Auth("MOYCLASS_API_KEY is not set".to_string())),
                }
            })
            .await
    }

    pub fn endpoint(&self, entity: Entity) -> LazyEndpoint<'_> {
        LazyEndpoint { lazy: self, entity }
    }
}

pub struct LazyEndpoint<'a> {
    lazy: &'a LazyClient,
    entity: Entity,
}

#[async_trait]
impl PageSource for LazyEndpoint<'_> {
    async fn fetch_page(&self, params: &QueryParams) -> Result<Value, FetchError> {
        let client = self.lazy.client().await?;
        client.endpoint(self.entity).fetch_page(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_replaces_every_prior_value() {
        let base = QueryParams::new()
            .and("limit", "20")
            .and("date", "2024-01-01")
            .and("limit", "50");
        let derived = base.with("limit", "10");
        assert_eq!(derived.get_last("limit"), Some("10"));
        assert_eq!(
            derived.pairs().iter().filter(|(k, _)| k == "limit").count(),
            1
        );
        // the original is untouched
        assert_eq!(base.get_last("limit"), Some("50"));
        assert_eq!(base.pairs().len(), 3);
    }

    #[test]
    fn parses_key_value_arguments() {
        let params =
            QueryParams::parse_pairs(["date=2024-01-01", "date=2024-01-31", "includeRecords=true"])
                .unwrap();
        assert_eq!(params.pairs().len(), 3);
        assert_eq!(params.get_last("date"), Some("2024-01-31"));
        assert!(QueryParams::parse_pairs(["broken"]).is_err());
        assert!(QueryParams::parse_pairs(["=x"]).is_err());
    }

    #[test]
    fn decodes_collection_shape() {
        let page = RemotePage::decode(
            "users",
            json!({"users": [{"id": 1}, {"id": 2}], "stats": {"totalItems": 7}}),
        )
        .unwrap();
        match page {
            RemotePage::Collection { items, total_items } => {
                assert_eq!(items.len(), 2);
                assert_eq!(total_items, 7);
            }
            other => panic!("unexpected page {other:?}"),
        }
    }

    #[test]
    fn decodes_bare_list_shape() {
        let page = RemotePage::decode("rooms", json!([{"id": 1}])).unwrap();
        assert!(matches!(page, RemotePage::RawList { items } if items.len() == 1));
    }

    #[test]
    fn collection_without_total_is_malformed() {
        let err = RemotePage::decode("users", json!({"users": []})).unwrap_err();
        assert!(matches!(err, LoadError::MalformedResponse { .. }));

        let err = RemotePage::decode("users", json!({"stats": {"totalItems": 1}})).unwrap_err();
        assert!(matches!(err, LoadError::MalformedResponse { .. }));
    }

    #[test]
    fn follow_up_pages_need_only_the_item_list() {
        let items = RemotePage::decode_items("users", json!({"users": [{"id": 3}]})).unwrap();
        assert_eq!(items.len(), 1);

        let err = RemotePage::decode_items("users", json!({"stats": {"totalItems": 4}})).unwrap_err();
        assert!(matches!(err, LoadError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn lazy_client_without_key_fails_only_when_used() {
        let lazy = LazyClient::new("http://127.0.0.1:9", None);
        let endpoint = lazy.endpoint(Entity::Users);
        assert!(!lazy.is_connected());

        let err = endpoint.fetch_page(&QueryParams::new()).await.unwrap_err();

        assert!(matches!(err, FetchError::Auth(_)));
        assert!(!lazy.is_connected());
    }

    #[test]
    fn entity_names_match_collection_fields() {
        assert_eq!(Entity::LessonRecords.name(), "lessonRecords");
        assert_eq!(Entity::Users.to_string(), "users");
    }
}
