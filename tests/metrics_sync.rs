// tests/metrics_sync.rs
//
// Installs the global Prometheus recorder, so it runs only with `--features strict-metrics`
// and keeps to a single test in this binary.
#![cfg(feature = "strict-metrics")]

mod common;

use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use branding_sync::ingest::types::SourceId;
use branding_sync::metrics::Metrics;
use branding_sync::orchestrator::RunOptions;

use common::{adapter, article, harness, StaticSource};

#[tokio::test]
async fn metrics_endpoint_reports_sync_series() {
    let metrics = Metrics::install().expect("first recorder in this process");

    let src = Arc::new(StaticSource::new(vec![
        article("brand-new", "A", "https://example.com/a"),
        article("brand-new", "A again", "https://example.com/a?utm_source=x"),
    ]));
    let h = harness(vec![("brand-new", adapter(&src))]);
    let r = h
        .orch
        .run_sync(&SourceId::from("brand-new"), &RunOptions::manual(2), &CancellationToken::new())
        .await;
    assert_eq!(r.items_inserted, 1);
    assert_eq!(r.duplicates_in_batch, 1);

    let app = metrics.router(h.status.clone(), h.orch.sources());
    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "branding_sync_runs_total",
        "branding_sync_runs_success_total",
        "branding_articles_uploaded_total",
        "branding_duplicate_skipped_batch_total",
        "branding_sync_run_duration_ms",
        "branding_source_last_success_age_seconds",
        "branding_notifications_total",
    ] {
        assert!(text.contains(needle), "metrics exposition missing '{needle}'\n{text}");
    }
    assert!(text.contains("source=\"brand-new\""));
}
