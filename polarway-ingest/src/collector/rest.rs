//! REST front-end: offset pagination over an URL template

use super::{Collector, CollectorReport, PageContext, PageFetcher, RunSpec, UnitKey};
use crate::client::ApiClient;
use crate::config::CollectorConfig;
use crate::error::{FetchError, IngestError, Result};
use crate::identity::CollectionIdentity;
use crate::pagination::{PageOutcome, PaginationMode, ParsedPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builds the query string of a page request.
pub type QueryBuilder = Arc<dyn Fn(&PageContext) -> Result<Vec<(String, String)>> + Send + Sync>;

/// Maps a response body to staged units.
pub type ResponseParser = Arc<dyn Fn(&PageContext, Value) -> PageOutcome + Send + Sync>;

pub struct ApiCollectorArgs {
    pub identity: CollectionIdentity,
    pub client: ApiClient,
    /// Path relative to the client base URL; `{key}` placeholders are filled from
    /// the lane input (`{repo.name}` reaches into nested objects)
    pub url_template: String,
    pub config: CollectorConfig,
    pub inputs: Vec<Value>,
    pub created_after: Option<DateTime<Utc>>,
    pub query: QueryBuilder,
    pub response_parser: ResponseParser,
    /// Source identity of a staged unit, see [`PageFetcher::unit_key`]
    pub unit_key: Option<UnitKey>,
    pub cancel: CancellationToken,
}

impl ApiCollectorArgs {
    /// Arguments with `page`/`per_page` query parameters and default config.
    pub fn new(
        identity: CollectionIdentity,
        client: ApiClient,
        url_template: impl Into<String>,
        response_parser: ResponseParser,
    ) -> Self {
        Self {
            identity,
            client,
            url_template: url_template.into(),
            config: CollectorConfig::default(),
            inputs: Vec::new(),
            created_after: None,
            query: page_query("page", "per_page"),
            response_parser,
            unit_key: None,
            cancel: CancellationToken::new(),
        }
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

    pub fn with_query(mut self, query: QueryBuilder) -> Self {
        self.query = query;
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

/// Query builder sending the 1-based page number and the page size.
pub fn page_query(page_param: &str, size_param: &str) -> QueryBuilder {
    let page_param = page_param.to_string();
    let size_param = size_param.to_string();
    Arc::new(move |ctx: &PageContext| -> Result<Vec<(String, String)>> {
        Ok(vec![
            (page_param.clone(), ctx.request.page.to_string()),
            (size_param.clone(), ctx.request.size.to_string()),
        ])
    })
}

/// Collector for paged REST endpoints.
pub struct ApiCollector {
    args: ApiCollectorArgs,
}

impl ApiCollector {
    pub fn new(args: ApiCollectorArgs) -> Result<Self> {
        if args.url_template.trim().is_empty() {
            return Err(IngestError::Config("url_template is required".to_string()));
        }
        args.config.validate()?;
        Ok(Self { args })
    }

    pub async fn execute(self, collector: &Collector) -> Result<CollectorReport> {
        let args = self.args;
        // Fail before the first request if a lane input cannot fill the template
        if args.inputs.is_empty() {
            render_template(&args.url_template, &Value::Null)?;
        }
        for input in &args.inputs {
            render_template(&args.url_template, input)?;
        }

        let spec = RunSpec::new(args.identity, PaginationMode::Offset)
            .with_config(args.config)
            .with_inputs(args.inputs)
            .with_created_after(args.created_after)
            .with_cancel(args.cancel);
        let fetcher = RestFetcher {
            client: args.client,
            url_template: args.url_template,
            query: args.query,
            parser: args.response_parser,
            unit_key: args.unit_key,
        };
        collector.execute(spec, fetcher).await
    }
}

struct RestFetcher {
    client: ApiClient,
    url_template: String,
    query: QueryBuilder,
    parser: ResponseParser,
    unit_key: Option<UnitKey>,
}

#[async_trait]
impl PageFetcher for RestFetcher {
    async fn fetch(&self, ctx: &PageContext) -> std::result::Result<Value, FetchError> {
        let path = render_template(&self.url_template, &ctx.input)
            .map_err(|e| FetchError::Permanent(e.to_string()))?;
        let query = (self.query)(ctx).map_err(|e| FetchError::Permanent(e.to_string()))?;
        self.client.get_json(&path, &query).await
    }

    fn parse(&self, ctx: &PageContext, response: Value) -> ParsedPage {
        ParsedPage::offset((self.parser)(ctx, response))
    }

    fn unit_key(&self, _ctx: &PageContext, unit: &Value) -> Option<String> {
        self.unit_key.as_ref().and_then(|key| key(unit))
    }
}

/// Fill `{key}` placeholders from `input`.
///
/// Values are percent-encoded per path segment, so `{repo}` = `"a/b c"` renders
/// as `a/b%20c`.
pub fn render_template(template: &str, input: &Value) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            IngestError::Config(format!("unclosed placeholder in url template {:?}", template))
        })?;
        let key = &after[..close];

        let pointer = format!("/{}", key.replace('.', "/"));
        let value = match input.pointer(&pointer) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => {
                return Err(IngestError::Config(format!(
                    "url template {:?} needs `{}` but the input has no such value",
                    template, key
                )))
            }
        };
        let encoded: Vec<String> = value
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        rendered.push_str(&encoded.join("/"));

        rest = &after[close + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}
