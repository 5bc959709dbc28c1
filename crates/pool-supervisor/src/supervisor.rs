//! Pool Supervisor (spec §4.E) — owns the instance set and the background
//! loops. Map mutation (initialize/scale/shutdown) is guarded by a
//! supervisor-wide mutex; per-instance state is guarded by each instance's
//! own mutex, acquired outside the map lock (spec §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use pool_config::PoolConfig;
use pool_metrics::{AlertSink, PoolMetrics};
use pool_protocol::ControlClient;

use crate::alloc::{self, allocate};
use crate::health_loop;
use crate::instance::{InstanceOptions, InstanceSnapshot, RelayInstance};
use crate::rotation_loop;
use crate::PoolError;

/// Per-slot outcome of a bounded-parallel start/stop fan-out (spec §4.E,
/// §7 "never a single early return").
pub struct SlotResult {
    pub node_id: String,
    pub result: Result<(), PoolError>,
}

pub(crate) struct Inner {
    config: PoolConfig,
    control: Arc<dyn ControlClient>,
    metrics: Arc<dyn PoolMetrics>,
    alerts: Arc<dyn AlertSink>,
    instances: Mutex<Vec<Arc<RelayInstance>>>,
    alerting: AtomicBool,
}

impl Inner {
    fn make_instance(&self, slot: u32) -> Arc<RelayInstance> {
        let slot_alloc = allocate(
            self.config.base_socks_port,
            self.config.base_ctrl_port,
            &self.config.data_dir,
            slot,
        );
        let options = InstanceOptions {
            relay_binary: self.config.relay_binary.clone(),
            countries: self.config.countries.clone(),
            strict_nodes: self.config.strict_nodes,
            bootstrap_timeout: self.config.bootstrap_timeout,
            control_timeout: self.config.control_session_timeout,
            max_failed_checks: self.config.max_failed_checks,
            shutdown_grace: self.config.shutdown_grace,
        };
        Arc::new(RelayInstance::new(
            slot_alloc,
            options,
            Arc::clone(&self.control),
            Arc::clone(&self.metrics),
        ))
    }

    /// Recompute and publish `nodes_up`/`nodes_total`, debouncing the
    /// down-threshold alert so it fires once per crossing (spec §4.F).
    async fn publish_gauges(&self) {
        let instances = self.instances.lock().await;
        let total = instances.len() as u32;
        let mut up = 0u32;
        for instance in instances.iter() {
            if instance.is_healthy().await {
                up += 1;
            }
        }
        drop(instances);

        self.metrics.set_nodes_total(total);
        self.metrics.set_nodes_up(up);

        if total == 0 {
            return;
        }
        let unhealthy_fraction = 1.0 - (up as f64 / total as f64);
        let above_threshold = unhealthy_fraction > self.config.alert_node_down_threshold;
        let was_alerting = self.alerting.swap(above_threshold, Ordering::SeqCst);
        if above_threshold && !was_alerting {
            self.alerts.alert(&format!(
                "pool degraded: {up}/{total} nodes healthy ({unhealthy_fraction:.0?} unhealthy)"
            ));
        }
    }
}

/// Owns the instance set and the Health/Rotation loop handles (spec §4.E–G).
pub struct PoolSupervisor {
    inner: Arc<Inner>,
    scale_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolSupervisor {
    /// Validates the configuration, builds the instance set, starts it with
    /// bounded parallelism, and launches the background loops (spec §4.E
    /// `initialize`).
    pub async fn initialize(
        config: PoolConfig,
        control: Arc<dyn ControlClient>,
        metrics: Arc<dyn PoolMetrics>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<(Self, Vec<SlotResult>), PoolError> {
        config.validate()?;
        alloc::validate_ranges(config.base_socks_port, config.base_ctrl_port, config.pool_size)?;

        let size = config.pool_size;
        let health_interval = config.health_check_interval;
        let rotation_interval = config.auto_rotate_interval;
        let auto_rotate = config.auto_rotate_enabled;

        let inner = Arc::new(Inner {
            config,
            control,
            metrics,
            alerts,
            instances: Mutex::new(Vec::new()),
            alerting: AtomicBool::new(false),
        });

        let mut instances = Vec::with_capacity(size as usize);
        for slot in 0..size {
            instances.push(inner.make_instance(slot));
        }

        let results = start_all(&instances).await;
        {
            let mut guard = inner.instances.lock().await;
            *guard = instances;
        }
        inner.publish_gauges().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::new();
        loops.push(tokio::spawn(health_loop::run(
            Arc::clone(&inner),
            health_interval,
            shutdown_rx.clone(),
        )));
        if auto_rotate {
            loops.push(tokio::spawn(rotation_loop::run(
                Arc::clone(&inner),
                rotation_interval,
                shutdown_rx,
            )));
        }

        let supervisor = Self {
            inner,
            scale_lock: Mutex::new(()),
            shutdown_tx,
            loops: Mutex::new(loops),
        };
        Ok((supervisor, results))
    }

    /// spec §4.E `scale(new_size)`. Serialized against itself; returns
    /// `ScaleInProgress` rather than queuing a second concurrent caller.
    pub async fn scale(&self, new_size: u32) -> Result<Vec<SlotResult>, PoolError> {
        use pool_config::{MAX_POOL_SIZE, MIN_POOL_SIZE};
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&new_size) {
            return Err(PoolError::ConfigInvalid(format!(
                "pool size must be in {MIN_POOL_SIZE}..={MAX_POOL_SIZE}, got {new_size}"
            )));
        }

        let _permit = self
            .scale_lock
            .try_lock()
            .map_err(|_| PoolError::ScaleInProgress)?;

        let current = self.inner.instances.lock().await.len() as u32;
        if new_size == current {
            return Ok(Vec::new());
        }

        let results = if new_size > current {
            let mut fresh = Vec::new();
            for slot in current..new_size {
                fresh.push(self.inner.make_instance(slot));
            }
            let results = start_all(&fresh).await;
            let mut guard = self.inner.instances.lock().await;
            guard.extend(fresh);
            results
        } else {
            let removed: Vec<Arc<RelayInstance>> = {
                let mut guard = self.inner.instances.lock().await;
                guard.split_off(new_size as usize)
            };
            stop_all(&removed).await
        };

        self.inner.publish_gauges().await;
        Ok(results)
    }

    /// spec §4.E `rotate_all()`.
    pub async fn rotate_all(&self) -> Vec<SlotResult> {
        let instances = self.inner.instances.lock().await.clone();
        let results = futures::future::join_all(instances.iter().map(|instance| {
            let instance = Arc::clone(instance);
            async move {
                let result = instance.rotate().await;
                SlotResult {
                    node_id: instance.node_id.clone(),
                    result,
                }
            }
        }))
        .await;
        results
    }

    /// spec §4.E `rotate_node(node_id)`.
    pub async fn rotate_node(&self, node_id: &str) -> Result<(), PoolError> {
        let instance = self.find(node_id).await?;
        instance.rotate().await
    }

    /// spec §4.E `status(node_id)`.
    pub async fn status(&self, node_id: &str) -> Result<InstanceSnapshot, PoolError> {
        let instance = self.find(node_id).await?;
        Ok(instance.snapshot().await)
    }

    /// spec §4.E `status_all()`.
    pub async fn status_all(&self) -> Vec<InstanceSnapshot> {
        let instances = self.inner.instances.lock().await.clone();
        let mut snapshots = Vec::with_capacity(instances.len());
        for instance in &instances {
            snapshots.push(instance.snapshot().await);
        }
        snapshots
    }

    /// spec §4.E `shutdown()`. Cancels the background loops, then stops
    /// every instance with bounded parallelism.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let loops = self.loops.into_inner();
        for handle in loops {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        }

        let instances = self.inner.instances.lock().await.clone();
        stop_all(&instances).await;
    }

    async fn find(&self, node_id: &str) -> Result<Arc<RelayInstance>, PoolError> {
        self.inner
            .instances
            .lock()
            .await
            .iter()
            .find(|instance| instance.node_id == node_id)
            .cloned()
            .ok_or_else(|| PoolError::NotFound(node_id.to_string()))
    }
}

async fn start_all(instances: &[Arc<RelayInstance>]) -> Vec<SlotResult> {
    futures::future::join_all(instances.iter().map(|instance| {
        let instance = Arc::clone(instance);
        async move {
            let result = instance.start().await;
            if let Err(err) = &result {
                tracing::warn!(node_id = %instance.node_id, error = %err, "start failed");
            }
            SlotResult {
                node_id: instance.node_id.clone(),
                result,
            }
        }
    }))
    .await
}

async fn stop_all(instances: &[Arc<RelayInstance>]) -> Vec<SlotResult> {
    futures::future::join_all(instances.iter().map(|instance| {
        let instance = Arc::clone(instance);
        async move {
            let result = instance.stop().await;
            SlotResult {
                node_id: instance.node_id.clone(),
                result,
            }
        }
    }))
    .await
}

pub(crate) type SharedInner = Arc<Inner>;

impl Inner {
    pub(crate) async fn live_instances(&self) -> Vec<Arc<RelayInstance>> {
        self.instances.lock().await.clone()
    }

    pub(crate) async fn publish(&self) {
        self.publish_gauges().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_metrics::{NoopMetrics, RecordingMetrics};
    use pool_protocol::testing::StubControlClient;
    use pool_protocol::ControlError;

    fn config(size: u32, data_dir: &std::path::Path) -> PoolConfig {
        PoolConfig {
            pool_size: size,
            base_socks_port: 30000,
            base_ctrl_port: 40000,
            data_dir: data_dir.to_str().unwrap().to_string(),
            relay_binary: "sleep".to_string(),
            countries: vec![],
            strict_nodes: false,
            auto_rotate_enabled: false,
            auto_rotate_interval: Duration::from_secs(600),
            health_check_interval: Duration::from_millis(50),
            health_check_timeout: Duration::from_secs(1),
            max_failed_checks: 3,
            alert_node_down_threshold: 0.5,
            bootstrap_timeout: Duration::from_millis(200),
            control_session_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(200),
        }
    }

    /// A "relay binary" for tests: ignores every argument and sleeps, so the
    /// arg-parsing quirks of a real system binary never race the bootstrap
    /// poll below.
    fn fake_relay_binary(dir: &std::path::Path) -> String {
        let path = dir.join("fake-relay.sh");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 3600\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    async fn boot(size: u32, control: Arc<StubControlClient>) -> (PoolSupervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(size, dir.path());
        cfg.relay_binary = fake_relay_binary(dir.path());
        let (supervisor, results) = PoolSupervisor::initialize(
            cfg,
            control,
            Arc::new(RecordingMetrics::default()),
            Arc::new(NoopMetrics::default()),
        )
        .await
        .unwrap();
        for r in &results {
            assert!(r.result.is_ok(), "{}: {:?}", r.node_id, r.result);
        }
        (supervisor, dir)
    }

    #[tokio::test]
    async fn initialize_allocates_expected_ports_and_ids() {
        let (supervisor, _dir) = boot(3, Arc::new(StubControlClient::always_ok())).await;
        let snapshots = supervisor.status_all().await;
        let mut ids: Vec<_> = snapshots.iter().map(|s| s.node_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["relay-0000", "relay-0001", "relay-0002"]);
        let node0 = supervisor.status("relay-0000").await.unwrap();
        assert_eq!(node0.socks_port, 30000);
        assert_eq!(node0.control_port, 40000);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn rotate_node_increments_rotation_count() {
        let (supervisor, _dir) = boot(3, Arc::new(StubControlClient::always_ok())).await;
        supervisor.rotate_node("relay-0002").await.unwrap();
        let node = supervisor.status("relay-0002").await.unwrap();
        assert_eq!(node.rotation_count, 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn rotate_node_not_found() {
        let (supervisor, _dir) = boot(2, Arc::new(StubControlClient::always_ok())).await;
        let err = supervisor.rotate_node("does-not-exist").await.unwrap_err();
        assert!(matches!(err, PoolError::NotFound(_)));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn scale_rejects_zero_and_over_max() {
        let (supervisor, _dir) = boot(2, Arc::new(StubControlClient::always_ok())).await;
        assert!(supervisor.scale(0).await.is_err());
        assert!(supervisor.scale(101).await.is_err());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn scale_current_size_is_a_no_op() {
        let (supervisor, _dir) = boot(3, Arc::new(StubControlClient::always_ok())).await;
        let results = supervisor.scale(3).await.unwrap();
        assert!(results.is_empty());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn scale_up_adds_instances_without_disturbing_existing() {
        let (supervisor, _dir) = boot(3, Arc::new(StubControlClient::always_ok())).await;
        supervisor.scale(5).await.unwrap();
        let mut ids: Vec<_> = supervisor
            .status_all()
            .await
            .iter()
            .map(|s| s.node_id.clone())
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            vec!["relay-0000", "relay-0001", "relay-0002", "relay-0003", "relay-0004"]
        );
        let node3 = supervisor.status("relay-0003").await.unwrap();
        assert_eq!(node3.socks_port, 30003);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn scale_down_removes_highest_indices_first() {
        let (supervisor, _dir) = boot(5, Arc::new(StubControlClient::always_ok())).await;
        supervisor.scale(2).await.unwrap();
        let mut ids: Vec<_> = supervisor
            .status_all()
            .await
            .iter()
            .map(|s| s.node_id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["relay-0000", "relay-0001"]);
        assert!(matches!(
            supervisor.rotate_node("relay-0004").await.unwrap_err(),
            PoolError::NotFound(_)
        ));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn rotate_all_collects_every_instance_result() {
        let (supervisor, _dir) = boot(3, Arc::new(StubControlClient::always_ok())).await;
        let results = supervisor.rotate_all().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.result.is_ok()));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_every_instance() {
        let (supervisor, _dir) = boot(3, Arc::new(StubControlClient::always_ok())).await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn health_tick_recomputes_nodes_up() {
        let (supervisor, _dir) = boot(3, Arc::new(StubControlClient::always_ok())).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let healthy = supervisor
            .status_all()
            .await
            .iter()
            .filter(|s| s.is_healthy)
            .count();
        assert_eq!(healthy, 3);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn health_tick_detects_and_recovers_unhealthy_node() {
        let control = Arc::new(StubControlClient::always_ok());
        let (supervisor, _dir) = boot(3, Arc::clone(&control)).await;
        control.fail_n_times(40001, 3, ControlError::Unavailable("down".to_string()));

        tokio::time::sleep(Duration::from_millis(170)).await;
        let unhealthy = supervisor
            .status_all()
            .await
            .iter()
            .filter(|s| !s.is_healthy)
            .count();
        assert_eq!(unhealthy, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let healthy = supervisor
            .status_all()
            .await
            .iter()
            .filter(|s| s.is_healthy)
            .count();
        assert_eq!(healthy, 3);
        supervisor.shutdown().await;
    }
}
