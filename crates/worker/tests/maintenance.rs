//! Integration tests for the maintenance loop against the embedded store.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use widgetry_core::widget_types::WidgetType;
use widgetry_db::keys::type_index_key;
use widgetry_db::models::widget::CreateWidget;
use widgetry_db::repositories::WidgetIndex;
use widgetry_db::store::{Pipeline, StoreConfig};
use widgetry_db::WidgetService;
use widgetry_worker::config::WorkerConfig;
use widgetry_worker::maintenance::Maintenance;

fn maintenance() -> (Maintenance, WidgetService) {
    let config = WorkerConfig {
        reconcile_interval: Duration::from_millis(10),
        purge_interval: Duration::from_millis(10),
        reconcile_batch: 2,
        ..Default::default()
    };
    let (service, memory) = WidgetService::embedded(&StoreConfig::default());
    (
        Maintenance::new(service.clone(), Some(memory), config),
        service,
    )
}

fn quiz(owner: &str, name: &str) -> CreateWidget {
    CreateWidget {
        owner_id: owner.to_string(),
        widget_type: WidgetType::Quiz,
        name: name.to_string(),
        is_visible: true,
        config: serde_json::json!({}),
    }
}

#[tokio::test]
async fn reconcile_tick_repairs_queued_widgets() {
    let (maintenance, service) = maintenance();
    let mut widgets = Vec::new();
    for i in 0..5 {
        widgets.push(service.create(&quiz("u1", &format!("Quiz {i}"))).await.unwrap());
    }
    let expected = service.index_snapshot().await.unwrap();

    let mut pipe = Pipeline::new();
    pipe.srem(
        type_index_key(WidgetType::Quiz),
        widgets.iter().map(|w| w.id.to_string()).collect(),
    );
    service.store().run(pipe).await.unwrap();
    for widget in &widgets {
        WidgetIndex::enqueue(service.store(), &widget.id, &widget.owner_id).await;
    }

    // Batch size 2: one tick keeps draining until the outbox is empty.
    let report = maintenance.reconcile_tick().await;
    assert_eq!(report.reconciled, 5);
    assert_eq!(service.pending_reconciliations().await.unwrap(), 0);
    assert_eq!(service.index_snapshot().await.unwrap(), expected);

    let idle = maintenance.reconcile_tick().await;
    assert_eq!(idle.reconciled, 0);
}

#[tokio::test]
async fn rebuild_tick_reports_indexed_widgets() {
    let (maintenance, service) = maintenance();
    service.create(&quiz("u1", "a")).await.unwrap();
    service.create(&quiz("u2", "b")).await.unwrap();

    let report = maintenance.rebuild_tick().await.unwrap();
    assert_eq!(report.widgets_indexed, 2);
    assert_eq!(report.owners, 2);
}

#[tokio::test]
async fn purge_tick_sweeps_expired_keys() {
    let (maintenance, service) = maintenance();
    let mut pipe = Pipeline::new();
    pipe.hset("{scratch}:a", vec![("k".to_string(), "v".to_string())])
        .expire("{scratch}:a", Duration::from_millis(1))
        .hset("{scratch}:b", vec![("k".to_string(), "v".to_string())]);
    service.store().run(pipe).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(maintenance.purge_tick(), 1);
    assert_eq!(maintenance.purge_tick(), 0);
}

#[tokio::test]
async fn spawned_worker_repairs_host_store_and_stops_on_cancel() {
    let (maintenance, service) = maintenance();
    let widget = service.create(&quiz("u1", "a")).await.unwrap();
    let mut pipe = Pipeline::new();
    pipe.srem(type_index_key(WidgetType::Quiz), vec![widget.id.to_string()]);
    service.store().run(pipe).await.unwrap();
    WidgetIndex::enqueue(service.store(), &widget.id, &widget.owner_id).await;

    let cancel = CancellationToken::new();
    let handle = maintenance.spawn(cancel.clone());

    // The first reconcile tick fires immediately.
    let mut drained = false;
    for _ in 0..50 {
        if service.pending_reconciliations().await.unwrap() == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(drained);
    let repaired = service.index_snapshot().await.unwrap();
    assert_eq!(
        repaired.members(&type_index_key(WidgetType::Quiz)),
        [widget.id.to_string()]
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("maintenance loop did not stop")
        .unwrap();
}
