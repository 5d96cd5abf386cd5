//! Integration tests for widget records, counters, and service errors.

mod common;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{run, seed, service, widget_at, Fault, FaultyBackend};
use widgetry_core::error::CoreError;
use widgetry_core::widget_types::WidgetType;
use widgetry_db::keys::{
    daily_views_key, record_key, stats_key, type_index_key, visibility_index_key,
};
use widgetry_db::models::stats::WidgetStats;
use widgetry_db::models::widget::{CreateWidget, UpdateWidget, FIELD_VERSION};
use widgetry_db::repositories::stats_repo::DAILY_VIEWS_TTL;
use widgetry_db::repositories::widget_loader::LOAD_BATCH;
use widgetry_db::repositories::{StatsRepo, WidgetLoader, WidgetRepo};
use widgetry_db::{RequestContext, ServiceError, StoreError};

fn create_input(owner: &str, name: &str) -> CreateWidget {
    CreateWidget {
        owner_id: owner.to_string(),
        widget_type: WidgetType::LeadForm,
        name: name.to_string(),
        is_visible: true,
        config: serde_json::json!({"fields": ["email"]}),
    }
}

// ---------------------------------------------------------------------------
// Create / read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_after_create_returns_identical_fields() {
    let (service, _memory) = service();
    let created = service.create(&create_input("u1", "Signup")).await.unwrap();

    let fetched = service.get_by_id(&created.id).await.unwrap();
    let mut expected = created.clone();
    expected.stats = Some(WidgetStats::zeroed(created.id));
    assert_eq!(fetched, expected);
}

#[tokio::test]
async fn create_rejects_invalid_name() {
    let (service, memory) = service();
    let err = service.create(&create_input("u1", "")).await.unwrap_err();
    assert_matches!(err, ServiceError::Core(CoreError::Validation(_)));

    let long = "x".repeat(201);
    let err = service.create(&create_input("u1", &long)).await.unwrap_err();
    assert_matches!(err, ServiceError::Core(CoreError::Validation(_)));
    assert!(memory.keys("*").is_empty());
}

#[tokio::test]
async fn insert_with_existing_id_conflicts() {
    let (service, _memory) = service();
    let widget = widget_at("u1", WidgetType::Banner, "Sale", true, 0);
    service.insert(&widget).await.unwrap();

    let err = service.insert(&widget).await.unwrap_err();
    assert_matches!(err, ServiceError::Core(CoreError::Conflict(_)));
}

#[tokio::test]
async fn missing_widget_is_not_found() {
    let (service, _memory) = service();
    let err = service.get_by_id(&uuid::Uuid::now_v7()).await.unwrap_err();
    assert_matches!(
        err,
        ServiceError::Core(CoreError::NotFound { entity: "widget", .. })
    );
}

#[tokio::test]
async fn get_owned_rejects_other_owner() {
    let (service, _memory) = service();
    let widget = service.create(&create_input("u1", "Signup")).await.unwrap();

    assert!(service.get_owned(&widget.id, "u1").await.is_ok());
    let err = service.get_owned(&widget.id, "u2").await.unwrap_err();
    assert_matches!(err, ServiceError::Core(CoreError::Forbidden(_)));
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_moves_index_membership() {
    let (service, _memory) = service();
    let widget = service.create(&create_input("u1", "Signup")).await.unwrap();
    let id = widget.id.to_string();

    let updated = service
        .update(
            &widget.id,
            &UpdateWidget {
                widget_type: Some(WidgetType::Popup),
                is_visible: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.version, widget.version + 1);
    assert_eq!(updated.name, "Signup");

    let snapshot = service.index_snapshot().await.unwrap();
    assert!(!snapshot.members(&type_index_key(WidgetType::LeadForm)).contains(&id));
    assert_eq!(snapshot.members(&type_index_key(WidgetType::Popup)), [id.clone()]);
    assert!(!snapshot.members(&visibility_index_key(true)).contains(&id));
    assert_eq!(snapshot.members(&visibility_index_key(false)), [id]);
    assert_eq!(service.pending_reconciliations().await.unwrap(), 0);
}

#[tokio::test]
async fn replace_keeps_identity_and_creation_time() {
    let (service, _memory) = service();
    let widget = service.create(&create_input("u1", "Signup")).await.unwrap();

    let mut edited = widget.clone();
    edited.name = "Signup v2".to_string();
    edited.owner_id = "someone-else".to_string();
    edited.created_at = Utc::now() + chrono::Duration::days(1);
    let replaced = service.replace(&edited).await.unwrap();

    assert_eq!(replaced.name, "Signup v2");
    assert_eq!(replaced.owner_id, "u1");
    assert_eq!(replaced.created_at, widget.created_at);
    let fetched = service.get_by_id(&widget.id).await.unwrap();
    assert_eq!(fetched.name, "Signup v2");
}

#[tokio::test]
async fn update_of_missing_widget_is_not_found() {
    let (service, _memory) = service();
    let err = service
        .update(&uuid::Uuid::now_v7(), &UpdateWidget::default())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Core(CoreError::NotFound { .. }));
}

#[tokio::test]
async fn update_of_unversioned_record_succeeds() {
    let (service, _memory) = service();
    let widget = service.create(&create_input("u1", "Legacy")).await.unwrap();
    // Strip the version field to mimic a record written before versioning.
    let fields: Vec<(String, String)> = widget
        .to_fields()
        .into_iter()
        .filter(|(k, _)| k != FIELD_VERSION)
        .collect();
    run(service.store(), |p| {
        p.del(record_key(&widget.id)).hset(record_key(&widget.id), fields);
    })
    .await;

    let updated = service
        .update(
            &widget.id,
            &UpdateWidget {
                name: Some("Legacy v2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 1);
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_removes_record_stats_and_indexes() {
    let (service, memory) = service();
    let widget = service.create(&create_input("u1", "Signup")).await.unwrap();
    service.increment_view(&widget.id).await.unwrap();

    service.delete(&widget.id).await.unwrap();

    assert_matches!(
        service.get_by_id(&widget.id).await,
        Err(ServiceError::Core(CoreError::NotFound { .. }))
    );
    assert!(memory.keys(&record_key(&widget.id)).is_empty());
    assert!(memory.keys(&stats_key(&widget.id)).is_empty());
    let snapshot = service.index_snapshot().await.unwrap();
    assert!(!snapshot.contains_member(&widget.id.to_string()));

    let err = service.delete(&widget.id).await.unwrap_err();
    assert_matches!(err, ServiceError::Core(CoreError::NotFound { .. }));
}

#[tokio::test]
async fn owner_count_tracks_creates_and_deletes() {
    let (service, _memory) = service();
    let widgets = seed(
        &service,
        vec![
            widget_at("u1", WidgetType::Quiz, "a", true, 0),
            widget_at("u1", WidgetType::Quiz, "b", true, 1),
            widget_at("u2", WidgetType::Quiz, "c", true, 2),
        ],
    )
    .await;
    assert_eq!(WidgetRepo::count_by_owner(service.store(), "u1").await.unwrap(), 2);

    service.delete(&widgets[0].id).await.unwrap();
    assert_eq!(WidgetRepo::count_by_owner(service.store(), "u1").await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn increments_update_counters() {
    let (service, _memory) = service();
    let widget = service.create(&create_input("u1", "Signup")).await.unwrap();

    for _ in 0..3 {
        service.increment_view(&widget.id).await.unwrap();
    }
    service.increment_submit(&widget.id).await.unwrap();
    service.increment_close(&widget.id).await.unwrap();
    service.increment_close(&widget.id).await.unwrap();

    let stats = service.stats(&widget.id).await.unwrap();
    assert_eq!((stats.views, stats.submits, stats.closes), (3, 1, 2));
    assert!(stats.last_view.is_some());

    let daily = service.daily_views(&widget.id, 7).await.unwrap();
    assert_eq!(daily.len(), 7);
    assert_eq!(daily.last().unwrap().date, Utc::now().date_naive());
    assert_eq!(daily.last().unwrap().views, 3);
    assert!(daily[..6].iter().all(|d| d.views == 0));

    // Each view refreshes the daily counter's expiry.
    let replies = run(service.store(), |p| {
        p.pttl(daily_views_key(&widget.id, Utc::now().date_naive()));
    })
    .await;
    let ttl_ms = replies[0].clone().into_int().unwrap();
    let full_ms = DAILY_VIEWS_TTL.as_millis() as i64;
    assert!(ttl_ms > full_ms - 60_000, "daily views ttl too short: {ttl_ms}ms");
    assert!(ttl_ms <= full_ms);
}

#[tokio::test]
async fn increments_on_missing_widget_do_not_create_stats() {
    let (service, memory) = service();
    let id = uuid::Uuid::now_v7();

    let err = service.increment_view(&id).await.unwrap_err();
    assert_matches!(err, ServiceError::Core(CoreError::NotFound { .. }));
    assert!(!StatsRepo::increment_closes(service.store(), &id).await.unwrap());
    assert!(memory.keys("*").is_empty());
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_request_fails_fast() {
    let (service, _memory) = service();
    let widget = service.create(&create_input("u1", "Signup")).await.unwrap();

    let ctx = RequestContext::new();
    ctx.cancel_token().cancel();
    let err = service.for_request(&ctx).get_by_id(&widget.id).await.unwrap_err();
    assert_matches!(err, ServiceError::Store(StoreError::Cancelled));

    // The root service is unaffected.
    assert!(service.get_by_id(&widget.id).await.is_ok());
}

#[tokio::test]
async fn request_deadline_bounds_a_hanging_store() {
    let backend = FaultyBackend::new();
    let service = backend.service();
    backend.set(Fault::Hang);

    let ctx = RequestContext::new().with_timeout(std::time::Duration::from_millis(50));
    let err = service
        .for_request(&ctx)
        .get_by_owner("u1", Default::default())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Store(StoreError::Timeout));
}

// ---------------------------------------------------------------------------
// Batch loading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loader_batches_round_trips_and_skips_missing() {
    let (service, memory) = service();
    let widgets = seed(
        &service,
        (0..LOAD_BATCH + 10)
            .map(|i| widget_at("u1", WidgetType::Banner, &format!("Banner {i}"), true, i as i64))
            .collect(),
    )
    .await;
    let mut ids: Vec<_> = widgets.iter().rev().map(|w| w.id).collect();
    let gone = ids[7];
    run(service.store(), |p| {
        p.del(record_key(&gone));
    })
    .await;
    ids.push(uuid::Uuid::now_v7());

    let before = memory.round_trips();
    let loaded = WidgetLoader::load(service.store(), &ids).await.unwrap();
    // Two batches, each one record and one stats pipeline.
    assert_eq!(memory.round_trips() - before, 4);

    let expected: Vec<_> = ids[..ids.len() - 1]
        .iter()
        .copied()
        .filter(|id| *id != gone)
        .collect();
    assert_eq!(loaded.iter().map(|w| w.id).collect::<Vec<_>>(), expected);
    assert!(loaded.iter().all(|w| w.stats.is_some()));
}
