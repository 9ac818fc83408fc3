//! Endpoints watcher
//!
//! Keeps the store's endpoint view current and re-resolves the hosts whose
//! upstreams are backed by the changed service.

use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tracing::{error, info};

use crate::crd::ResourceKey;
use crate::store::Store;
use crate::sync::Reconciler;

/// Watch Endpoints cluster-wide (or in one namespace) until the stream
/// ends.
pub async fn run(
    client: Client,
    namespace: Option<String>,
    store: Arc<Store>,
    reconciler: Arc<Reconciler>,
) {
    let api: Api<Endpoints> = match &namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    info!("Endpoints watcher started");

    let mut stream = pin!(watcher::watcher(api, watcher::Config::default()).default_backoff());
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(endpoints)) => {
                let key = ResourceKey::from_object(&endpoints);
                store.upsert_endpoints(endpoints).await;
                reconciler.service_changed(&key.namespace, &key.name).await;
            }
            Ok(watcher::Event::Deleted(endpoints)) => {
                let key = ResourceKey::from_object(&endpoints);
                store.remove_endpoints(&key).await;
                reconciler.service_changed(&key.namespace, &key.name).await;
            }
            Ok(watcher::Event::Restarted(all)) => {
                for endpoints in all {
                    let key = ResourceKey::from_object(&endpoints);
                    store.upsert_endpoints(endpoints).await;
                    reconciler.service_changed(&key.namespace, &key.name).await;
                }
            }
            Err(err) => {
                error!(error = %err, "error from Endpoints stream");
            }
        }
    }
}
