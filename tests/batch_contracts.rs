//! Integration test contracts for the batch engine

use kvsession::{
    keys, BatchDescriptor, BatchOperation, BatchOutcome, DataStore, InfoInput, Metadata,
    MessageUpdate,
};
use serde_json::json;

async fn started() -> DataStore {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = DataStore::in_memory();
    store.start().await.expect("in-memory store should start");
    store
}

/// Isolation contract:
/// - a batch of three where the second updates a missing key
/// - reports two successes and one `not_found`
/// - still applies the other two
#[tokio::test]
async fn test_batch_isolation_contract() {
    let store = started().await;

    let report = store
        .batch()
        .execute(vec![
            BatchOperation::create_info("docs", "a", "alpha", None),
            BatchOperation::update_info("docs", "missing", "x", None),
            BatchOperation::create_session("abc", Metadata::new(), Some(600)),
        ])
        .await
        .into_result()
        .expect("batch should run");

    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.results[1].result, BatchOutcome::NotFound);

    assert!(store.info().get_info("docs", "a").await.success);
    assert!(store.sessions().get_session("abc").await.success);
}

/// Batch writes invalidate what the managers cached
#[tokio::test]
async fn test_batch_invalidates_manager_cache_contract() {
    let store = started().await;
    store.sessions().create_session("abc", None, None).await;
    let message = store
        .messages()
        .create_message("abc", "user", "draft", None)
        .await
        .into_result()
        .unwrap();

    // warm the page cache
    store.messages().get_messages("abc", None, None).await;

    store
        .batch()
        .execute(vec![BatchOperation::update_message(
            "abc",
            message.message_id.clone(),
            MessageUpdate::content("final"),
        )])
        .await;

    let page = store
        .messages()
        .get_messages("abc", None, None)
        .await
        .into_result()
        .unwrap();
    assert_eq!(page.items[0].content, "final");
}

/// Descriptor contract: loose JSON operations decode and run; a bad one
/// fails alone
#[tokio::test]
async fn test_descriptor_batch_contract() {
    let store = started().await;
    let descriptors: Vec<BatchDescriptor> = serde_json::from_value(json!([
        {"operation": "create", "type": "info", "key": "faq:shipping", "data": {"data": "2 days"}},
        {"operation": "delete", "type": "message", "key": "abc"},
        {"operation": "create", "type": "session", "key": "abc"}
    ]))
    .unwrap();

    let report = store
        .batch()
        .execute_descriptors(descriptors)
        .await
        .into_result()
        .unwrap();

    assert_eq!(report.successful, 2);
    assert_eq!(report.results[1].result, BatchOutcome::Error);
    assert_eq!(
        store.info().get_info("faq", "shipping").await.into_result().unwrap().data,
        "2 days"
    );
}

/// Bulk contract: counts add up across chunks and the indexes follow
#[tokio::test]
async fn test_bulk_info_contract() {
    let store = started().await;
    let items: Vec<InfoInput> = (0..250)
        .map(|i| InfoInput {
            category: "catalog".to_string(),
            key: format!("sku{}", i),
            data: format!("item {}", i),
            ttl: None,
        })
        .collect();

    let counts = store
        .batch()
        .bulk_create_info(items)
        .await
        .into_result()
        .unwrap();
    assert_eq!(counts.succeeded, 250);
    assert_eq!(counts.failed, 0);

    let category = store
        .info()
        .get_category_info("catalog")
        .await
        .into_result()
        .unwrap();
    assert_eq!(category.count, 250);

    let stats = store.batch().get_batch_stats().await.into_result().unwrap();
    assert_eq!(stats.info_count, 250);
    assert_eq!(stats.total_keys, 250);

    let removed = store
        .batch()
        .bulk_delete_info("catalog", vec!["sku0".to_string(), "sku1".to_string()])
        .await
        .into_result()
        .unwrap();
    assert_eq!(removed.succeeded, 2);
    assert_eq!(
        store.client().smembers(&keys::category_key("catalog")).await.unwrap().len(),
        248
    );
}
