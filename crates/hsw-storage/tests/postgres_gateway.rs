use anyhow::Result;
use chrono::{DateTime, Utc};
use hsw_core::{AllocationStatus, AllocationUpsert, DeliveryBatchUpsert, DeliveryStatus};
use hsw_storage::{AllocationFilter, Database};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

fn ts(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

fn allocation(id: &str, kg: f64, status: AllocationStatus) -> AllocationUpsert {
    AllocationUpsert {
        id: id.to_string(),
        allocated_to: "X-energy".to_string(),
        kg,
        status,
        allocation_date: Some(ts("2025-04-09T00:00:00Z")),
        delivery_window_start: None,
        delivery_window_end: None,
        notes: Some("reactor fuel".to_string()),
        source_doc_id: None,
    }
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn upsert_gateway_counts_mutations_and_events_append() -> Result<()> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let db = Database::connect(&url).await?;
    db.migrate().await?;
    // Re-running the DDL must be harmless.
    db.migrate().await?;

    let batch = vec![
        allocation("doe-2024-001", 1200.0, AllocationStatus::Confirmed),
        allocation("doe-2024-002", 850.0, AllocationStatus::Conditional),
    ];

    let first_now = ts("2026-08-01T06:00:00Z");
    let first = db.upsert_allocations(&batch, first_now).await;
    assert_eq!(first.upserted, 2);
    assert_eq!(first.total, 2);

    // Identical resubmission: still counted in the total, zero mutations.
    let second = db.upsert_allocations(&batch, ts("2026-08-02T06:00:00Z")).await;
    assert_eq!(second.upserted, 0);
    assert_eq!(second.total, 2);

    let unchanged = db.get_allocation("doe-2024-001").await?.expect("row exists");
    assert_eq!(unchanged.updated_at, first_now);

    // One field changes: exactly one mutation, timestamp re-stamped.
    let mut third_batch = batch.clone();
    third_batch[1].status = AllocationStatus::Confirmed;
    let third_now = ts("2026-08-03T06:00:00Z");
    let third = db.upsert_allocations(&third_batch, third_now).await;
    assert_eq!(third.upserted, 1);
    assert_eq!(third.total, 2);
    let changed = db.get_allocation("doe-2024-002").await?.expect("row exists");
    assert_eq!(changed.status, AllocationStatus::Confirmed);
    assert_eq!(changed.updated_at, third_now);

    // Events append-only, newest first.
    db.insert_change_event(
        hsw_core::ENTITY_ALLOCATION,
        hsw_core::BATCH_ENTITY_ID,
        serde_json::json!({"upserted": 2, "total": 2}),
        "ingest/doe-allocations",
        first_now,
    )
    .await?;
    db.insert_change_event(
        hsw_core::ENTITY_INGEST,
        "doe-hub",
        serde_json::json!({"error": "http status 503"}),
        "cron/doe-hub",
        third_now,
    )
    .await?;

    let events = db.list_changes(None, 10).await?;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].entity_type, hsw_core::ENTITY_INGEST);
    assert_eq!(events[0].entity_id, "doe-hub");
    assert_eq!(events[1].change_json["total"], 2);

    // Delivery batches flow through the same conflict-guarded gateway.
    let deliveries = vec![DeliveryBatchUpsert {
        id: "centrus-phase-iii-900kg".to_string(),
        allocation_id: "centrus-haleu-program".to_string(),
        kg: 900.0,
        status: DeliveryStatus::Received,
        shipped_at: None,
        received_at: Some(ts("2026-07-15T00:00:00Z")),
        notes: None,
    }];
    let outcome = db.upsert_deliveries(&deliveries, third_now).await;
    assert_eq!(outcome.upserted, 1);
    let outcome = db.upsert_deliveries(&deliveries, ts("2026-08-04T06:00:00Z")).await;
    assert_eq!(outcome.upserted, 0);
    let linked = db.deliveries_for_allocation("centrus-haleu-program").await?;
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].status, DeliveryStatus::Received);

    // Keyset filtering over the updated_at column.
    let confirmed_only = db
        .list_allocations(&AllocationFilter {
            status: Some(AllocationStatus::Confirmed),
            since: None,
            cursor: None,
            limit: 10,
        })
        .await?;
    assert_eq!(confirmed_only.len(), 2);
    let recent = db
        .list_allocations(&AllocationFilter {
            status: None,
            since: Some(third_now),
            cursor: None,
            limit: 10,
        })
        .await?;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, "doe-2024-002");

    Ok(())
}
