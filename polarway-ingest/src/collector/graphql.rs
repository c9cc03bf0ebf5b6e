//! GraphQL front-end: cursor pagination over `pageInfo { endCursor hasNextPage }`

use super::{Collector, CollectorReport, PageContext, PageFetcher, RunSpec, UnitKey};
use crate::client::ApiClient;
use crate::config::CollectorConfig;
use crate::error::{FetchError, IngestError, Result};
use crate::identity::CollectionIdentity;
use crate::pagination::{PageOutcome, PaginationMode, ParsedPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Query document plus variables for one page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphqlQuery {
    pub query: String,
    pub variables: Value,
}

impl GraphqlQuery {
    pub fn new(query: impl Into<String>, variables: Value) -> Self {
        Self {
            query: query.into(),
            variables,
        }
    }
}

/// Relay-style page info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPageInfo {
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

impl CursorPageInfo {
    /// Read the `pageInfo` object at a JSON pointer into `data`,
    /// e.g. `/repository/pullRequests/pageInfo`.
    pub fn from_pointer(data: &Value, pointer: &str) -> Result<Self> {
        let raw = data
            .pointer(pointer)
            .ok_or_else(|| IngestError::Protocol(format!("response has no page info at {}", pointer)))?;
        serde_json::from_value(raw.clone())
            .map_err(|e| IngestError::Protocol(format!("malformed page info at {}: {}", pointer, e)))
    }
}

/// Builds the query for a page; `ctx.request.cursor` is the cursor to resume after.
pub type GraphqlQueryBuilder = Arc<dyn Fn(&PageContext) -> Result<GraphqlQuery> + Send + Sync>;

/// Reads the page info out of the response `data`.
pub type PageInfoExtractor = Arc<dyn Fn(&Value) -> Result<CursorPageInfo> + Send + Sync>;

/// Maps the response `data` to staged units.
pub type GraphqlResponseParser = Arc<dyn Fn(&PageContext, &Value) -> PageOutcome + Send + Sync>;

pub struct GraphqlCollectorArgs {
    pub identity: CollectionIdentity,
    pub client: ApiClient,
    /// Path of the GraphQL endpoint relative to the client base URL
    pub endpoint: String,
    pub config: CollectorConfig,
    pub inputs: Vec<Value>,
    pub created_after: Option<DateTime<Utc>>,
    pub build_query: GraphqlQueryBuilder,
    pub get_page_info: PageInfoExtractor,
    pub response_parser: GraphqlResponseParser,
    /// Source identity of a staged unit, see [`PageFetcher::unit_key`]
    pub unit_key: Option<UnitKey>,
    pub cancel: CancellationToken,
}

impl GraphqlCollectorArgs {
    pub fn new(
        identity: CollectionIdentity,
        client: ApiClient,
        build_query: GraphqlQueryBuilder,
        get_page_info: PageInfoExtractor,
        response_parser: GraphqlResponseParser,
    ) -> Self {
        Self {
            identity,
            client,
            endpoint: "graphql".to_string(),
            config: CollectorConfig::default(),
            inputs: Vec::new(),
            created_after: None,
            build_query,
            get_page_info,
            response_parser,
            unit_key: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_created_after(mut self, created_after: Option<DateTime<Utc>>) -> Self {
        self.created_after = created_after;
        self
    }

    pub fn with_unit_key(mut self, unit_key: UnitKey) -> Self {
        self.unit_key = Some(unit_key);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Collector for cursor-paginated GraphQL connections.
pub struct GraphqlCollector {
    args: GraphqlCollectorArgs,
}

impl GraphqlCollector {
    pub fn new(args: GraphqlCollectorArgs) -> Result<Self> {
        args.config.validate()?;
        Ok(Self { args })
    }

    pub async fn execute(self, collector: &Collector) -> Result<CollectorReport> {
        let args = self.args;
        let spec = RunSpec::new(args.identity, PaginationMode::Cursor)
            .with_config(args.config)
            .with_inputs(args.inputs)
            .with_created_after(args.created_after)
            .with_cancel(args.cancel);
        let fetcher = GraphqlFetcher {
            client: args.client,
            endpoint: args.endpoint,
            build_query: args.build_query,
            get_page_info: args.get_page_info,
            parser: args.response_parser,
            unit_key: args.unit_key,
        };
        collector.execute(spec, fetcher).await
    }
}

struct GraphqlFetcher {
    client: ApiClient,
    endpoint: String,
    build_query: GraphqlQueryBuilder,
    get_page_info: PageInfoExtractor,
    parser: GraphqlResponseParser,
    unit_key: Option<UnitKey>,
}

#[async_trait]
impl PageFetcher for GraphqlFetcher {
    async fn fetch(&self, ctx: &PageContext) -> std::result::Result<Value, FetchError> {
        let query = (self.build_query)(ctx).map_err(|e| FetchError::Permanent(e.to_string()))?;
        let body = json!({
            "query": query.query,
            "variables": query.variables,
        });
        let response = self.client.post_json(&self.endpoint, &body).await?;
        unwrap_envelope(response)
    }

    fn parse(&self, ctx: &PageContext, data: Value) -> ParsedPage {
        let page_info = match (self.get_page_info)(&data) {
            Ok(info) => info,
            Err(e) => return ParsedPage::fatal(e),
        };
        let outcome = (self.parser)(ctx, &data);
        ParsedPage::cursor(outcome, page_info.end_cursor, page_info.has_next_page)
    }

    fn unit_key(&self, _ctx: &PageContext, unit: &Value) -> Option<String> {
        self.unit_key.as_ref().and_then(|key| key(unit))
    }
}

/// Strip the `{ data, errors }` envelope.
///
/// A `RATE_LIMITED` error is retried like an HTTP 429; any other error, or a
/// response without data, is a protocol error.
pub fn unwrap_envelope(mut response: Value) -> std::result::Result<Value, FetchError> {
    if let Some(errors) = response.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let rate_limited = errors
                .iter()
                .any(|e| e.get("type").and_then(Value::as_str) == Some("RATE_LIMITED"));
            if rate_limited {
                debug!("graphql source reported RATE_LIMITED");
                return Err(FetchError::RateLimited { retry_after: None });
            }

            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect();
            return Err(FetchError::Protocol(format!(
                "graphql errors: {}",
                messages.join("; ")
            )));
        }
    }

    match response.get_mut("data").map(Value::take) {
        Some(data) if !data.is_null() => Ok(data),
        _ => Err(FetchError::Protocol("graphql response has no data".to_string())),
    }
}
