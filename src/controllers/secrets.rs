//! Secrets watcher
//!
//! Tracks TLS secrets so hosts can be re-resolved when their certificate
//! changes. A missing secret never fails a host; the resolver degrades to
//! the placeholder certificate.

use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tracing::{error, info};

use crate::crd::ResourceKey;
use crate::store::Store;
use crate::sync::Reconciler;

/// Watch Secrets cluster-wide (or in one namespace) until the stream ends.
pub async fn run(
    client: Client,
    namespace: Option<String>,
    store: Arc<Store>,
    reconciler: Arc<Reconciler>,
) {
    let api: Api<Secret> = match &namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    info!("Secrets watcher started");

    let mut stream = pin!(watcher::watcher(api, watcher::Config::default()).default_backoff());
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(secret)) => {
                if !is_tls_secret(&secret) {
                    continue;
                }
                let key = ResourceKey::from_object(&secret);
                store.upsert_secret(secret).await;
                reconciler.secret_changed(&key.namespace, &key.name).await;
            }
            Ok(watcher::Event::Deleted(secret)) => {
                let key = ResourceKey::from_object(&secret);
                store.remove_secret(&key).await;
                reconciler.secret_changed(&key.namespace, &key.name).await;
            }
            Ok(watcher::Event::Restarted(all)) => {
                for secret in all {
                    if !is_tls_secret(&secret) {
                        continue;
                    }
                    let key = ResourceKey::from_object(&secret);
                    store.upsert_secret(secret).await;
                    reconciler.secret_changed(&key.namespace, &key.name).await;
                }
            }
            Err(err) => {
                error!(error = %err, "error from Secrets stream");
            }
        }
    }
}

fn is_tls_secret(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some("kubernetes.io/tls")
}
