use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use hsw_adapters::{adapter_for_source, IngestContext, IngestMode, SourceSpec};
use hsw_core::{AllocationStatus, DeliveryStatus};
use hsw_storage::{HttpClientConfig, HttpFetcher};
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn spec(source_id: &str, mode: IngestMode, path: Option<&str>) -> SourceSpec {
    SourceSpec {
        source_id: source_id.to_string(),
        display_name: source_id.to_string(),
        enabled: true,
        mode,
        url: None,
        path: path.map(str::to_string),
        notes: None,
    }
}

fn ctx() -> IngestContext {
    IngestContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc.with_ymd_and_hms(2026, 8, 6, 6, 0, 0).single().expect("ts"),
        workspace_root: workspace_root(),
    }
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig::default()).expect("http client")
}

#[tokio::test]
async fn fixture_feed_parses_the_workspace_csv() {
    let adapter = adapter_for_source(&spec("doe-allocations", IngestMode::Fixture, None))
        .expect("registered adapter");
    let raw = adapter.fetch(&fetcher(), &ctx()).await.expect("fixture read");
    let batch = adapter.parse(&raw).expect("parse");

    assert_eq!(batch.allocations.len(), 6);
    assert!(batch.deliveries.is_empty());
    assert_eq!(batch.allocations[0].id, "doe-2024-001");
    assert_eq!(batch.allocations[5].allocated_to, "Newcleo");
    assert!(batch
        .allocations
        .iter()
        .all(|a| a.kg > 0.0 && !a.id.is_empty()));
}

#[tokio::test]
async fn hub_sample_parses_round_selections() {
    let raw = std::fs::read_to_string(workspace_root().join("fixtures/doe-hub/sample.html"))
        .expect("hub sample");
    let adapter =
        adapter_for_source(&spec("doe-hub", IngestMode::Fetch, None)).expect("registered adapter");
    let batch = adapter.parse(&raw).expect("parse");

    let ids: Vec<&str> = batch.allocations.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "doe-r1-x-energy-llc",
            "doe-r1-terrapower-llc",
            "doe-r1-nuscale-power-corp",
            "doe-r2-kairos-power",
            "doe-r2-ultra-safe-nuclear-corp",
            "doe-r2-newcleo-ltd",
        ]
    );
    assert!(batch
        .allocations
        .iter()
        .all(|a| a.status == AllocationStatus::Conditional));
    assert!(!ids.iter().any(|id| id.contains("radiant")));

    // Same bytes, same records.
    assert_eq!(batch, adapter.parse(&raw).expect("reparse"));
}

#[tokio::test]
async fn news_sample_yields_delivery_batches() {
    let raw = std::fs::read_to_string(workspace_root().join("fixtures/centrus-news/sample.html"))
        .expect("news sample");
    let adapter = adapter_for_source(&spec("centrus-news", IngestMode::Fetch, None))
        .expect("registered adapter");
    let batch = adapter.parse(&raw).expect("parse");

    assert!(batch.allocations.is_empty());
    assert_eq!(batch.deliveries.len(), 2);
    assert_eq!(batch.deliveries[0].kg, 900.0);
    assert_eq!(batch.deliveries[0].status, DeliveryStatus::Received);
    assert_eq!(batch.deliveries[1].kg, 2500.0);
    assert_eq!(batch.deliveries[1].status, DeliveryStatus::Planned);
}

#[tokio::test]
async fn press_document_yields_milestones_and_recipients() {
    let adapter = adapter_for_source(&spec("doe-press", IngestMode::Manual, None))
        .expect("registered adapter");
    let raw = adapter.fetch(&fetcher(), &ctx()).await.expect("manual read");
    let batch = adapter.parse(&raw).expect("parse");

    assert_eq!(batch.deliveries.len(), 3);
    assert_eq!(batch.deliveries[0].id, "doe-milestone-2024-09-30");
    assert_eq!(batch.deliveries[2].kg, 10_000.0);
    assert_eq!(batch.allocations.len(), 2);
    assert_eq!(batch.allocations[0].id, "doe-pdf-x-energy-llc");
}

#[tokio::test]
async fn missing_fixture_path_is_an_io_error() {
    let adapter = adapter_for_source(&spec(
        "doe-allocations",
        IngestMode::Fixture,
        Some("fixtures/not-there.csv"),
    ))
    .expect("registered adapter");
    let err = adapter.fetch(&fetcher(), &ctx()).await.unwrap_err();
    assert!(err.to_string().contains("not-there.csv"));
}
