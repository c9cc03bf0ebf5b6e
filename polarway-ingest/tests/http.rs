mod common;

use chrono::{DateTime, Utc};
use common::*;
use polarway_ingest::collector::graphql::{GraphqlQueryBuilder, GraphqlResponseParser, PageInfoExtractor};
use polarway_ingest::collector::rest::ResponseParser;
use polarway_ingest::{
    key_at, split_at_cutoff, ApiClient, ApiClientConfig, ApiCollector, ApiCollectorArgs, Collector,
    CursorPageInfo, GraphqlCollector, GraphqlCollectorArgs, GraphqlQuery, IngestError, MemoryStore,
    PageContext, PageOutcome,
};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> ApiClient {
    ApiClient::new(ApiClientConfig::new(server.uri()).with_token("secret")).unwrap()
}

fn array_parser() -> ResponseParser {
    Arc::new(|_ctx: &PageContext, body: Value| {
        PageOutcome::Continue(body.as_array().cloned().unwrap_or_default())
    })
}

async fn mount_page(server: &MockServer, page: u64, body: Value) {
    Mock::given(method("GET"))
        .and(path("/repos/apache/incubator-devlake/issues"))
        .and(query_param("page", page.to_string()))
        .and(query_param("per_page", "2"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_rest_collector_pages_through_repo() {
    let server = MockServer::start().await;
    mount_page(&server, 1, json!([record(5, 50), record(4, 40)])).await;
    // One 503 before page 2 succeeds
    Mock::given(method("GET"))
        .and(path("/repos/apache/incubator-devlake/issues"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream busy"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, 2, json!([record(3, 30), record(2, 20)])).await;
    mount_page(&server, 3, json!([record(1, 10)])).await;

    let store = Arc::new(MemoryStore::new());
    let collector = Collector::new(store.clone(), store.clone());
    let id = identity("github_api_issues");

    let args = ApiCollectorArgs::new(
        id.clone(),
        client(&server),
        "repos/{owner}/{repo}/issues",
        array_parser(),
    )
    .with_config(fast_config().with_page_size(2).with_concurrency(1))
    .with_inputs(vec![json!({"owner": "apache", "repo": "incubator-devlake"})])
    .with_unit_key(key_at("/id"));
    let report = ApiCollector::new(args).unwrap().execute(&collector).await.unwrap();

    assert_eq!(report.pages_fetched, 3);
    assert_eq!(report.records_staged, 5);
    assert_eq!(staged_ids(&store, &id), vec![5, 4, 3, 2, 1]);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);

    let first = &store.published(&id)[0];
    assert_eq!(first.source_input["input"]["repo"], "incubator-devlake");
    assert!(first.key.as_deref().is_some_and(|k| k.ends_with("#5")), "{:?}", first.key);
}

#[tokio::test]
async fn test_rest_rejection_fails_without_publishing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let collector = Collector::new(store.clone(), store.clone());
    let id = identity("github_api_issues");

    let args = ApiCollectorArgs::new(id.clone(), client(&server), "repos/{repo}/issues", array_parser())
        .with_config(fast_config())
        .with_inputs(vec![json!({"repo": "x"})]);
    let err = ApiCollector::new(args).unwrap().execute(&collector).await.unwrap_err();

    assert!(matches!(err.root_cause(), IngestError::Rejected(_)), "{:?}", err);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert!(store.published(&id).is_empty());
}

#[tokio::test]
async fn test_rest_template_gap_fails_before_any_request() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());
    let collector = Collector::new(store.clone(), store.clone());

    let args = ApiCollectorArgs::new(
        identity("github_api_issues"),
        client(&server),
        "repos/{owner}/{repo}/issues",
        array_parser(),
    )
    .with_config(fast_config())
    .with_inputs(vec![json!({"repo": "only-repo"})]);
    let err = ApiCollector::new(args).unwrap().execute(&collector).await.unwrap_err();

    assert!(matches!(err, IngestError::Config(_)), "{:?}", err);
    assert!(server.received_requests().await.unwrap().is_empty());
}

fn created(node: &Value) -> Option<DateTime<Utc>> {
    node["createdAt"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn pr_query() -> GraphqlQueryBuilder {
    Arc::new(|ctx: &PageContext| -> polarway_ingest::Result<GraphqlQuery> {
        Ok(GraphqlQuery::new(
            "query($owner: String!, $name: String!, $first: Int!, $after: String) { ... }",
            json!({
                "owner": ctx.input["owner"],
                "name": ctx.input["repo"],
                "first": ctx.request.size,
                "after": ctx.request.cursor,
            }),
        ))
    })
}

fn pr_page_info() -> PageInfoExtractor {
    Arc::new(|data: &Value| CursorPageInfo::from_pointer(data, "/repository/pullRequests/pageInfo"))
}

fn pr_parser() -> GraphqlResponseParser {
    Arc::new(|ctx: &PageContext, data: &Value| {
        let nodes = data
            .pointer("/repository/pullRequests/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        split_at_cutoff(nodes, ctx.cutoff, created)
    })
}

fn pr_page(nodes: Value, end_cursor: &str, has_next: bool) -> Value {
    json!({
        "data": {
            "repository": {
                "pullRequests": {
                    "nodes": nodes,
                    "pageInfo": {"endCursor": end_cursor, "hasNextPage": has_next},
                }
            }
        }
    })
}

async fn mount_graphql(server: &MockServer, after: Value, body: Value) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"variables": {"after": after}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn graphql_args(server: &MockServer, id: polarway_ingest::CollectionIdentity) -> GraphqlCollectorArgs {
    GraphqlCollectorArgs::new(id, client(server), pr_query(), pr_page_info(), pr_parser())
        .with_config(fast_config().with_page_size(2).with_concurrency(1))
        .with_inputs(vec![json!({"owner": "apache", "repo": "incubator-devlake"})])
        .with_unit_key(key_at("/number"))
}

#[tokio::test]
async fn test_graphql_follows_cursor_after_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"variables": {"after": null}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{"type": "RATE_LIMITED", "message": "API rate limit exceeded"}]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_graphql(
        &server,
        Value::Null,
        pr_page(
            json!([
                {"number": 12, "createdAt": "2024-03-02T00:00:00Z"},
                {"number": 11, "createdAt": "2024-03-01T00:00:00Z"}
            ]),
            "c1",
            true,
        ),
    )
    .await;
    mount_graphql(
        &server,
        json!("c1"),
        pr_page(json!([{"number": 10, "createdAt": "2024-02-01T00:00:00Z"}]), "c2", false),
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let collector = Collector::new(store.clone(), store.clone());
    let id = identity("github_graphql_prs");
    let report = GraphqlCollector::new(graphql_args(&server, id.clone()))
        .unwrap()
        .execute(&collector)
        .await
        .unwrap();

    assert_eq!(report.pages_fetched, 2);
    assert_eq!(report.records_staged, 3);
    let numbers: Vec<u64> = store
        .published(&id)
        .iter()
        .map(|r| r.json::<Value>().unwrap()["number"].as_u64().unwrap())
        .collect();
    assert_eq!(numbers, vec![12, 11, 10]);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_graphql_cutoff_finishes_early() {
    let server = MockServer::start().await;
    mount_graphql(
        &server,
        Value::Null,
        pr_page(
            json!([
                {"number": 12, "createdAt": "2024-03-02T00:00:00Z"},
                {"number": 11, "createdAt": "2024-01-01T00:00:00Z"}
            ]),
            "c1",
            true,
        ),
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let collector = Collector::new(store.clone(), store.clone());
    let id = identity("github_graphql_prs");
    let cutoff = DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    let args = graphql_args(&server, id.clone()).with_created_after(Some(cutoff));
    let report = GraphqlCollector::new(args).unwrap().execute(&collector).await.unwrap();

    assert!(report.finished_early);
    assert_eq!(report.records_staged, 1);
    // The second page is never requested
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_graphql_error_response_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{"type": "NOT_FOUND", "message": "Could not resolve to a Repository"}]
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let collector = Collector::new(store.clone(), store.clone());
    let id = identity("github_graphql_prs");
    let err = GraphqlCollector::new(graphql_args(&server, id.clone()))
        .unwrap()
        .execute(&collector)
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), IngestError::Protocol(_)), "{:?}", err);
    // Protocol errors are not retried
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert!(store.published(&id).is_empty());
}
