// tests/api_http.rs
//
// HTTP-level tests for the command Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET / and /health
// - POST /sync (api key, day bounds, reply text)
// - GET /status, /status.json, /recent, /digest, /search, /export

mod common;

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _; // for `oneshot`

use branding_sync::api::{self, AppState, HEALTH_TEXT};
use branding_sync::config::SyncConfig;
use branding_sync::store::InMemoryStore;

use common::{adapter, article, harness, Harness, StaticSource};

const BODY_LIMIT: usize = 1024 * 1024;
const TOKEN: &str = "s3cret";

struct App {
    router: Router,
    store: Arc<InMemoryStore>,
}

fn app(token: Option<&str>) -> App {
    let src = Arc::new(StaticSource::new(vec![
        article("brand-new", "New Logo for Acme", "https://example.com/acme"),
        article("brand-new", "Packaging, \"Bolt\"", "https://example.com/bolt"),
    ]));
    let Harness { orch, store, .. } = harness(vec![("brand-new", adapter(&src))]);
    let state = AppState::new(
        Arc::new(orch),
        &SyncConfig::default(),
        token.map(str::to_string),
        CancellationToken::new(),
    );
    App {
        router: api::router(state),
        store,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, header::HeaderMap, String) {
    let resp = router.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    (status, headers, String::from_utf8(bytes.to_vec()).expect("utf8"))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).expect("build GET")
}

fn sync_req(key: Option<&str>, payload: Json) -> Request<Body> {
    let mut b = Request::builder()
        .method("POST")
        .uri("/sync")
        .header("content-type", "application/json");
    if let Some(k) = key {
        b = b.header("x-api-key", k);
    }
    b.body(Body::from(payload.to_string())).expect("build POST /sync")
}

#[tokio::test]
async fn health_and_root_say_live() {
    let App { router, .. } = app(None);
    for uri in ["/", "/health"] {
        let (status, _, body) = send(&router, get(uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, HEALTH_TEXT);
    }
}

#[tokio::test]
async fn sync_requires_the_configured_api_key() {
    let App { router, .. } = app(Some(TOKEN));
    let payload = json!({ "sources": "brand-new", "days": 2 });

    let (status, _, _) = send(&router, sync_req(None, payload.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = send(&router, sync_req(Some("wrong"), payload.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = send(&router, sync_req(Some(TOKEN), payload)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let v: Json = serde_json::from_str(&body).expect("json");
    assert_eq!(v["reply"], "Finished. Added 2 new articles.");
    assert_eq!(v["total_inserted"], 2);
    assert_eq!(v["results"][0]["source_id"], "brand-new");
    assert_eq!(v["results"][0]["trigger"], "manual");
}

#[tokio::test]
async fn sync_rejects_out_of_range_days_and_bad_json() {
    let App { router, .. } = app(None);
    for days in [0, 366] {
        let (status, _, body) = send(&router, sync_req(None, json!({ "sources": "brand-new", "days": days }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "days={days}: {body}");
    }
    let bad = Request::builder()
        .method("POST")
        .uri("/sync")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, _) = send(&router, bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn second_sync_finds_nothing_new() {
    let App { router, .. } = app(None);
    let payload = json!({ "sources": "brand-new", "days": 2 });
    send(&router, sync_req(None, payload.clone())).await;
    let (_, _, body) = send(&router, sync_req(None, payload)).await;
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v["reply"], "No new articles found for this timeframe.");
}

#[tokio::test]
async fn read_surfaces_render_stored_records() {
    let App { router, store } = app(None);
    send(&router, sync_req(None, json!({ "sources": "brand-new" }))).await;
    assert_eq!(store.len(), 2);

    let (status, _, body) = send(&router, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("Branding Scraper status\n"));
    assert!(body.contains("Sync runs total=1, success=1, failed=0"));
    assert!(body.contains("Articles uploaded total=2"));

    let (_, _, body) = send(&router, get("/status.json")).await;
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v["totals"]["inserted"], 2);
    assert_eq!(v["sources"][0]["source_id"], "brand-new");

    let (_, _, body) = send(&router, get("/recent?limit=5")).await;
    assert!(body.starts_with("Latest 2 entries from Notion:"), "{body}");
    assert!(body.contains("New Logo for Acme"));

    let (_, _, body) = send(&router, get("/digest")).await;
    assert!(body.starts_with("Weekly digest (last 7 days)\nTotal new entries: 2"), "{body}");
    assert!(body.contains("Brand New (2):"));

    let (_, _, body) = send(&router, get("/search?q=acme")).await;
    assert!(body.starts_with("Search results for \"acme\" (1 shown):"), "{body}");

    let (status, _, _) = send(&router, get("/search?q=%20")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, headers, body) = send(&router, get("/export?format=csv")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/csv"));
    assert!(body.starts_with("title,source,date,url,created_time\r\n"));
    assert!(body.contains("\"Packaging, \"\"Bolt\"\"\",Brand New,"));

    let (_, _, body) = send(&router, get("/export?format=md")).await;
    assert!(body.starts_with("# Branding export"));

    let (status, _, _) = send(&router, get("/export?format=xlsx")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
