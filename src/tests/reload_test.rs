//! Fail-static behavior: reload failures and ConfigMap rejection

use crate::crd::ResourceKey;
use crate::sync::ReconcileOutcome;

use super::test_utils::{harness, seed_endpoints, test_config_map, test_virtual_server};

fn cafe_key() -> ResourceKey {
    ResourceKey::new("default", "cafe")
}

#[tokio::test]
async fn test_reload_failure_keeps_previous_artifact() {
    let h = harness();
    seed_endpoints(&h).await;

    h.reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();
    let before = h.proxy.file(&cafe_key()).await.unwrap();

    h.proxy.set_fail_reloads(true);
    let mut vs = test_virtual_server("cafe");
    vs.spec.upstreams[0].connect_timeout = Some("55s".to_string());
    let outcome = h.reconciler.upsert_virtual_server(vs).await.unwrap();

    assert!(matches!(outcome, ReconcileOutcome::NotApplied(_)));
    assert_eq!(h.proxy.file(&cafe_key()).await.unwrap(), before);

    let events = h.sink.events().await;
    let not_applied = events
        .iter()
        .find(|e| e.reason == "AddedOrUpdatedWithError")
        .unwrap();
    assert!(not_applied
        .message
        .starts_with("Configuration for default/cafe was updated but was not applied:"));
    assert!(not_applied.warning);
}

#[tokio::test]
async fn test_no_automatic_retry_after_reload_failure() {
    let h = harness();
    seed_endpoints(&h).await;

    h.proxy.set_fail_reloads(true);
    h.reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();
    assert_eq!(h.proxy.reload_count(), 0);

    // the next triggering change is the only retry path
    h.proxy.set_fail_reloads(false);
    let outcome = h
        .reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));
    assert_eq!(h.proxy.reload_count(), 1);
    assert!(h.proxy.has_file(&cafe_key()).await);
}

#[tokio::test]
async fn test_config_map_overrides_are_applied_to_all_hosts() {
    let h = harness();
    seed_endpoints(&h).await;

    h.reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();
    h.reconciler
        .upsert_virtual_server(test_virtual_server("bar"))
        .await
        .unwrap();

    h.reconciler
        .apply_config_map(&test_config_map(&[
            ("proxy-connect-timeout", "44s"),
            ("max-fails", "5"),
        ]))
        .await
        .unwrap();

    for name in ["cafe", "bar"] {
        let key = ResourceKey::new("default", name);
        let text = String::from_utf8(h.proxy.file(&key).await.unwrap()).unwrap();
        assert!(text.contains("proxy_connect_timeout 44s;"));
        assert!(text.contains("max_fails=5"));
    }
}

#[tokio::test]
async fn test_explicit_field_beats_config_map_value() {
    let h = harness();
    seed_endpoints(&h).await;

    let mut vs = test_virtual_server("cafe");
    vs.spec.upstreams[0].connect_timeout = Some("55s".to_string());
    h.reconciler.upsert_virtual_server(vs).await.unwrap();

    h.reconciler
        .apply_config_map(&test_config_map(&[("proxy-connect-timeout", "44s")]))
        .await
        .unwrap();

    let text = String::from_utf8(h.proxy.file(&cafe_key()).await.unwrap()).unwrap();
    assert!(text.contains("proxy_connect_timeout 55s;"));
    assert!(!text.contains("44s"));
}

#[tokio::test]
async fn test_invalid_config_map_is_rejected_whole() {
    let h = harness();
    seed_endpoints(&h).await;

    h.reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();
    let before = h.proxy.file(&cafe_key()).await.unwrap();
    let version_before = h.params.current().await.version;

    h.reconciler
        .apply_config_map(&test_config_map(&[
            ("proxy-connect-timeout", "44s"), // valid key...
            ("max-fails", "minus-one"),       // ...but any invalid value rejects the update
        ]))
        .await
        .unwrap();

    // previously rendered artifact is unchanged byte-for-byte
    assert_eq!(h.proxy.file(&cafe_key()).await.unwrap(), before);
    assert_eq!(h.params.current().await.version, version_before);

    let events = h.sink.events().await;
    let not_applied = events
        .iter()
        .find(|e| e.reason == "AddedOrUpdatedWithError")
        .unwrap();
    assert_eq!(not_applied.object, "routegate-system/routegate-config");
    assert!(not_applied.message.starts_with(
        "Configuration for routegate-system/routegate-config was updated but was not applied:"
    ));
    assert!(not_applied.message.contains("max-fails"));
}

#[tokio::test]
async fn test_config_map_deletion_reverts_to_builtins() {
    let h = harness();
    seed_endpoints(&h).await;

    h.reconciler
        .upsert_virtual_server(test_virtual_server("cafe"))
        .await
        .unwrap();
    h.reconciler
        .apply_config_map(&test_config_map(&[("proxy-connect-timeout", "44s")]))
        .await
        .unwrap();

    h.reconciler.reset_config_params().await.unwrap();

    let text = String::from_utf8(h.proxy.file(&cafe_key()).await.unwrap()).unwrap();
    assert!(text.contains("proxy_connect_timeout 60s;"));
}
