//! Relay Instance (spec §4.D) — one child process plus its control client,
//! behind a per-instance mutex so at most one control session or lifecycle
//! transition is ever in flight for a given node (spec §5).

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use pool_metrics::PoolMetrics;
use pool_protocol::ControlClient;

use crate::alloc::SlotAllocation;
use crate::config_emitter;
use crate::PoolError;

/// Mirrors spec §3's `status` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Read-only snapshot of a [`RelayInstance`] (spec §4.E `status`/`status_all`).
/// Owns its data; holding one does not keep the instance's lock held.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub node_id: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub data_dir: PathBuf,
    pub status: InstanceStatus,
    pub is_healthy: bool,
    pub exit_ip: Option<String>,
    pub exit_country: Option<String>,
    pub latency_ms: Option<f64>,
    pub failed_checks: u32,
    pub rotation_count: u64,
    pub restart_count: u64,
    pub last_rotation: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

struct State {
    status: InstanceStatus,
    child: Option<Child>,
    is_healthy: bool,
    exit_ip: Option<String>,
    exit_country: Option<String>,
    latency_ms: Option<f64>,
    failed_checks: u32,
    rotation_count: u64,
    restart_count: u64,
    last_rotation: Option<DateTime<Utc>>,
    last_check: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            status: InstanceStatus::Stopped,
            child: None,
            is_healthy: false,
            exit_ip: None,
            exit_country: None,
            latency_ms: None,
            failed_checks: 0,
            rotation_count: 0,
            restart_count: 0,
            last_rotation: None,
            last_check: None,
            started_at: None,
        }
    }
}

/// Tuning knobs the instance needs that aren't part of its slot allocation.
pub struct InstanceOptions {
    pub relay_binary: String,
    pub countries: Vec<String>,
    pub strict_nodes: bool,
    pub bootstrap_timeout: Duration,
    pub control_timeout: Duration,
    pub max_failed_checks: u32,
    pub shutdown_grace: Duration,
}

pub struct RelayInstance {
    pub node_id: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub data_dir: PathBuf,
    options: InstanceOptions,
    control: Arc<dyn ControlClient>,
    metrics: Arc<dyn PoolMetrics>,
    state: Mutex<State>,
}

impl RelayInstance {
    pub fn new(
        alloc: SlotAllocation,
        options: InstanceOptions,
        control: Arc<dyn ControlClient>,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Self {
        Self {
            node_id: alloc.node_id,
            socks_port: alloc.socks_port,
            control_port: alloc.control_port,
            data_dir: alloc.data_dir,
            options,
            control,
            metrics,
            state: Mutex::new(State::default()),
        }
    }

    pub async fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock().await;
        InstanceSnapshot {
            node_id: self.node_id.clone(),
            socks_port: self.socks_port,
            control_port: self.control_port,
            data_dir: self.data_dir.clone(),
            status: state.status,
            is_healthy: state.is_healthy,
            exit_ip: state.exit_ip.clone(),
            exit_country: state.exit_country.clone(),
            latency_ms: state.latency_ms,
            failed_checks: state.failed_checks,
            rotation_count: state.rotation_count,
            restart_count: state.restart_count,
            last_rotation: state.last_rotation,
            last_check: state.last_check,
            started_at: state.started_at,
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.lock().await.is_healthy
    }

    /// spec §4.D `start()`.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        state.status = InstanceStatus::Starting;

        let alloc = SlotAllocation {
            node_id: self.node_id.clone(),
            socks_port: self.socks_port,
            control_port: self.control_port,
            data_dir: self.data_dir.clone(),
        };
        config_emitter::emit(&alloc, &self.options.countries, self.options.strict_nodes).await?;

        let config_path = config_emitter::config_file_path(&self.data_dir);
        let mut child = Command::new(&self.options.relay_binary)
            .arg("-f")
            .arg(&config_path)
            .arg("--DataDirectory")
            .arg(&self.data_dir)
            .arg("--SocksPort")
            .arg(self.socks_port.to_string())
            .arg("--ControlPort")
            .arg(self.control_port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                state.status = InstanceStatus::Error;
                PoolError::SpawnFailed {
                    node_id: self.node_id.clone(),
                    reason: err.to_string(),
                }
            })?;

        self.pipe_output(&mut child);

        let bootstrap = self.await_bootstrap(&mut child).await;
        match bootstrap {
            Ok(()) => {
                state.child = Some(child);
                state.status = InstanceStatus::Running;
                state.is_healthy = true;
                state.failed_checks = 0;
                state.started_at = Some(Utc::now());
                tracing::info!(node_id = %self.node_id, "relay instance bootstrapped");
                Ok(())
            }
            Err(err) => {
                state.status = InstanceStatus::Error;
                let _ = child.start_kill();
                let _ = child.wait().await;
                tracing::warn!(node_id = %self.node_id, error = %err, "relay instance failed to bootstrap");
                Err(err)
            }
        }
    }

    fn pipe_output(&self, child: &mut Child) {
        let node_id = self.node_id.clone();
        if let Some(stdout) = child.stdout.take() {
            let id = node_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(node_id = %id, stream = "stdout", "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(node_id = %node_id, stream = "stderr", "{line}");
                }
            });
        }
    }

    async fn await_bootstrap(&self, child: &mut Child) -> Result<(), PoolError> {
        let deadline = tokio::time::Instant::now() + self.options.bootstrap_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(PoolError::BootstrapTimeout {
                    node_id: self.node_id.clone(),
                    timeout_secs: self.options.bootstrap_timeout.as_secs(),
                });
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(PoolError::SpawnFailed {
                    node_id: self.node_id.clone(),
                    reason: format!("relay process exited before bootstrap: {status}"),
                });
            }

            match self
                .control
                .bootstrap_phase(self.control_port, &self.data_dir, self.options.control_timeout)
                .await
            {
                Ok(reply) if reply.contains("PROGRESS=100") => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(PoolError::BootstrapTimeout {
                            node_id: self.node_id.clone(),
                            timeout_secs: self.options.bootstrap_timeout.as_secs(),
                        });
                    }
                    return Ok(());
                }
                _ => tokio::time::sleep(Duration::from_millis(250)).await,
            }
        }
    }

    /// spec §4.D `stop()`.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let Some(mut child) = state.child.take() else {
            state.status = InstanceStatus::Stopped;
            state.is_healthy = false;
            return Ok(());
        };

        if let Some(pid) = child.id() {
            // SAFETY: pid is the live child's own pid; kill(2) with SIGTERM on
            // a valid pid cannot corrupt process state.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let graceful = tokio::time::timeout(self.options.shutdown_grace, child.wait()).await;
        if graceful.is_err() {
            tracing::warn!(node_id = %self.node_id, "relay instance ignored SIGTERM, sending SIGKILL");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        state.status = InstanceStatus::Stopped;
        state.is_healthy = false;
        tracing::info!(node_id = %self.node_id, "relay instance stopped");
        Ok(())
    }

    /// spec §4.D `rotate()` / NEWNYM. Holds the instance lock across the
    /// control session itself, not just the bookkeeping update after it, so
    /// at most one control session is ever in flight per instance (spec §5).
    pub async fn rotate(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock().await;
            self.control
                .signal_newnym(self.control_port, &self.data_dir, self.options.control_timeout)
                .await
                .map_err(|err| PoolError::from_control(&self.node_id, err))?;

            state.rotation_count += 1;
            state.last_rotation = Some(Utc::now());
        }
        self.metrics.inc_newnym(&self.node_id);

        tokio::time::sleep(Duration::from_secs(2)).await;
        self.update_exit_info().await;
        Ok(())
    }

    /// Best-effort; a full implementation would probe an IP-echo endpoint
    /// through the instance's own SOCKS port (spec §9 open question). Left as
    /// a stub: rotation success never depends on it.
    async fn update_exit_info(&self) {}

    /// spec §4.D `check_health()`. Holds the instance lock across the control
    /// session itself, not just the bookkeeping update after it (spec §5).
    pub async fn check_health(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;

        let started = tokio::time::Instant::now();
        let result = self
            .control
            .circuit_status(self.control_port, &self.data_dir, self.options.control_timeout)
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(_) => {
                state.failed_checks = 0;
                state.is_healthy = true;
                state.latency_ms = Some(elapsed_ms);
                state.last_check = Some(Utc::now());
                self.metrics.observe_latency_ms(&self.node_id, elapsed_ms);
                Ok(())
            }
            Err(err) => {
                state.failed_checks += 1;
                if state.failed_checks >= self.options.max_failed_checks {
                    state.is_healthy = false;
                }
                state.last_check = Some(Utc::now());
                Err(PoolError::from_control(&self.node_id, err))
            }
        }
    }
}
