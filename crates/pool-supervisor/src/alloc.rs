//! Port Allocator (spec §4.A) — a pure function of `(base_socks, base_ctrl, size, slot)`.

use std::path::PathBuf;

use crate::PoolError;

/// Ports and paths owned by slot `i` (spec §3, "Slot index → ports").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAllocation {
    pub node_id: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub data_dir: PathBuf,
}

/// `node_id = "relay-" + zero-padded(i, 4)`.
pub fn node_id(slot: u32) -> String {
    format!("relay-{slot:04}")
}

/// Allocate the ports and data directory for slot `i` under `data_root`.
/// Total and injective over `i ∈ [0, size)` as long as `validate_ranges`
/// passed for `(base_socks, base_ctrl, size)`.
pub fn allocate(
    base_socks: u16,
    base_ctrl: u16,
    data_root: &str,
    slot: u32,
) -> SlotAllocation {
    let id = node_id(slot);
    SlotAllocation {
        socks_port: base_socks + slot as u16,
        control_port: base_ctrl + slot as u16,
        data_dir: PathBuf::from(data_root).join(&id),
        node_id: id,
    }
}

/// Reject configurations where `[base_socks, base_socks+size)` overlaps
/// `[base_ctrl, base_ctrl+size)` (spec §3, §4.A).
pub fn validate_ranges(base_socks: u16, base_ctrl: u16, size: u32) -> Result<(), PoolError> {
    let socks_base = base_socks as u32;
    let ctrl_base = base_ctrl as u32;
    let disjoint = socks_base + size <= ctrl_base || ctrl_base + size <= socks_base;
    if disjoint {
        Ok(())
    } else {
        Err(PoolError::ConfigInvalid(format!(
            "SOCKS port range [{base_socks}, {base_socks}+{size}) overlaps \
             control port range [{base_ctrl}, {base_ctrl}+{size})"
        )))
    }
}
