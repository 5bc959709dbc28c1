//! Health Loop (spec §4.F) — a cooperative periodic timer that fans out
//! `check_health()` across every live instance, republishes the aggregate
//! gauges, and debounces the down-threshold alert.

use std::time::Duration;

use tokio::sync::watch;

use crate::supervisor::SharedInner;

pub(crate) async fn run(inner: SharedInner, interval: Duration, mut cancel: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.changed() => break,
        }
        if *cancel.borrow() {
            break;
        }

        tick(&inner).await;
    }
    tracing::debug!("health loop exiting");
}

async fn tick(inner: &SharedInner) {
    let instances = inner.live_instances().await;
    let results = futures::future::join_all(instances.iter().map(|instance| {
        let instance = instance.clone();
        async move { instance.check_health().await }
    }))
    .await;

    for (instance, result) in instances.iter().zip(results) {
        if let Err(err) = result {
            tracing::debug!(node_id = %instance.node_id, error = %err, "health probe failed");
        }
    }

    inner.publish().await;
}
