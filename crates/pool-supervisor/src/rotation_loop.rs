//! Rotation Loop (spec §4.G) — only spawned when auto-rotation is enabled;
//! otherwise identical in shape to the Health Loop.

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

        let instances = inner.live_instances().await;
        let results = futures::future::join_all(instances.iter().map(|instance| {
            let instance = instance.clone();
            async move { instance.rotate().await }
        }))
        .await;
        for (instance, result) in instances.iter().zip(results) {
            if let Err(err) = result {
                tracing::debug!(node_id = %instance.node_id, error = %err, "auto-rotation failed");
            }
        }
    }
    tracing::debug!("rotation loop exiting");
}
