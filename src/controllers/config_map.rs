//! Watcher for the global defaults ConfigMap
//!
//! A change to the defaults re-resolves every live host; an invalid
//! update is rejected as a whole and the previous snapshot stays live.
//! Deleting the ConfigMap reverts to the built-in defaults.

use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tracing::{error, info};

use crate::crd::ResourceKey;
use crate::sync::Reconciler;

/// Watch the named ConfigMap until the stream ends.
pub async fn run(client: Client, key: ResourceKey, reconciler: Arc<Reconciler>) {
    let api: Api<ConfigMap> = Api::namespaced(client, &key.namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", key.name));

    info!(configmap = %key, "ConfigMap watcher started");

    let mut stream = pin!(watcher::watcher(api, config).default_backoff());
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(cm)) => {
                if let Err(err) = reconciler.apply_config_map(&cm).await {
                    error!(configmap = %key, error = %err, "failed to apply ConfigMap");
                }
            }
            Ok(watcher::Event::Deleted(_)) => {
                if let Err(err) = reconciler.reset_config_params().await {
                    error!(configmap = %key, error = %err, "failed to reset defaults");
                }
            }
            Ok(watcher::Event::Restarted(cms)) => {
                for cm in cms {
                    if let Err(err) = reconciler.apply_config_map(&cm).await {
                        error!(configmap = %key, error = %err, "failed to apply ConfigMap");
                    }
                }
            }
            Err(err) => {
                error!(configmap = %key, error = %err, "error from ConfigMap stream");
            }
        }
    }
}
