//! Proxy pool supervisor: owns the lifecycle of N relay child processes,
//! a concurrent health-check loop, and an automatic rotation loop (spec §1).

pub mod alloc;
mod config_emitter;
mod error;
pub mod health_loop;
pub mod instance;
pub mod rotation_loop;
pub mod supervisor;

pub use alloc::SlotAllocation;
pub use error::PoolError;
pub use instance::{InstanceOptions, InstanceSnapshot, InstanceStatus, RelayInstance};
pub use supervisor::{PoolSupervisor, SlotResult};
