//! Event reporting through the full reconciliation pipeline

use super::test_utils::{harness, seed_endpoints, test_virtual_server, test_virtual_server_route};

#[tokio::test]
async fn test_repeated_orphan_increments_counter_only() {
    let h = harness();
    seed_endpoints(&h).await;

    for _ in 0..3 {
        h.reconciler
            .upsert_virtual_server_route(test_virtual_server_route("tea-route"))
            .await
            .unwrap();
    }

    // one published event, count accumulated on the single record
    let events = h.sink.events().await;
    let orphans: Vec<_> = events
        .iter()
        .filter(|e| e.reason == "NoVirtualServersFound")
        .collect();
    assert_eq!(orphans.len(), 1);

    let records = h.reconciler.reporter().records().await;
    let orphan_record = records
        .iter()
        .find(|r| r.reason == "NoVirtualServersFound")
        .unwrap();
    assert_eq!(orphan_record.count, 3);
}

#[tokio::test]
async fn test_transition_out_of_and_back_into_message() {
    let h = harness();
    seed_endpoints(&h).await;

    // valid, then invalid, then valid again: three distinct records
    h.reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();

    let mut invalid = test_virtual_server("cafe");
    invalid.spec.host = String::new();
    h.reconciler.upsert_virtual_server(invalid).await.unwrap();

    h.reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();

    let records = h.reconciler.reporter().records().await;
    let cafe_records: Vec<_> = records.iter().filter(|r| r.object == "default/cafe").collect();
    assert_eq!(cafe_records.len(), 3);
    assert_eq!(cafe_records[0].reason, "AddedOrUpdated");
    assert_eq!(cafe_records[1].reason, "Rejected");
    assert_eq!(cafe_records[2].reason, "AddedOrUpdated");
    assert!(cafe_records.iter().all(|r| r.count == 1));
}

#[tokio::test]
async fn test_steady_state_reconciles_do_not_spam_events() {
    let h = harness();
    seed_endpoints(&h).await;

    h.reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();
    for _ in 0..5 {
        h.reconciler
            .reconcile_host(&crate::crd::ResourceKey::new("default", "cafe"))
            .await
            .unwrap();
    }

    let events = h.sink.events().await;
    assert_eq!(events.len(), 1);

    let records = h.reconciler.reporter().records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].count, 6);
}
