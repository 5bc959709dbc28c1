//! A scriptable [`ControlClient`] for tests — no relay binary, no open port.
//!
//! Queue up per-port results (e.g. "fail the first 3 circuit-status probes,
//! then succeed") and the Health/Rotation loops exercise exactly as they
//! would against a real child (spec §8 end-to-end scenarios).

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::{ControlClient, ControlError};

/// Per-call outcome queued for a given control port.
pub type ScriptedResult = Result<(), ControlError>;

#[derive(Debug)]
pub struct StubControlClient {
    queues: Mutex<HashMap<u16, VecDeque<ScriptedResult>>>,
    default_ok: bool,
    default_err: Option<ControlError>,
}

impl Default for StubControlClient {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            default_ok: true,
            default_err: None,
        }
    }
}

impl StubControlClient {
    /// Every call on every port succeeds unless scripted otherwise.
    pub fn always_ok() -> Self {
        Self::default()
    }

    /// Every call on every port fails unless scripted otherwise.
    pub fn always_fail(err: ControlError) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            default_ok: false,
            default_err: Some(err),
        }
    }

    /// Queue `count` failures for `port`, then fall back to the default
    /// (`always_ok`/`always_fail`) behavior once the queue drains.
    pub fn fail_n_times(&self, port: u16, count: usize, err: ControlError) {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(port).or_default();
        for _ in 0..count {
            queue.push_back(Err(err.clone()));
        }
    }

    /// Queue an explicit sequence of outcomes for `port`.
    pub fn script(&self, port: u16, results: impl IntoIterator<Item = ScriptedResult>) {
        let mut queues = self.queues.lock().unwrap();
        *queues.entry(port).or_default() = results.into_iter().collect();
    }

    fn next_result(&self, port: u16) -> ScriptedResult {
        let mut queues = self.queues.lock().unwrap();
        if let Some(queue) = queues.get_mut(&port) {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        if self.default_ok {
            Ok(())
        } else {
            Err(self
                .default_err
                .clone()
                .unwrap_or_else(|| ControlError::Unavailable("stub: default failure".to_string())))
        }
    }
}

#[async_trait]
impl ControlClient for StubControlClient {
    async fn bootstrap_phase(
        &self,
        control_port: u16,
        _data_dir: &Path,
        _timeout: Duration,
    ) -> Result<String, ControlError> {
        self.next_result(control_port)
            .map(|_| "PROGRESS=100 TAG=done".to_string())
    }

    async fn circuit_status(
        &self,
        control_port: u16,
        _data_dir: &Path,
        _timeout: Duration,
    ) -> Result<String, ControlError> {
        self.next_result(control_port).map(|_| String::new())
    }

    async fn signal_newnym(
        &self,
        control_port: u16,
        _data_dir: &Path,
        _timeout: Duration,
    ) -> Result<(), ControlError> {
        self.next_result(control_port)
    }
}
