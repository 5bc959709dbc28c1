use thiserror::Error;

/// Control-protocol failure modes (spec §4.C "Contract", §7).
///
/// The Health Loop treats all three identically for the purpose of
/// `failed_checks` bookkeeping; operator-invoked `rotate` surfaces them
/// directly (spec §7 propagation policy).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Connect, auth, or timeout failure — the child is unreachable.
    #[error("control session unavailable: {0}")]
    Unavailable(String),
    /// The relay replied with a non-2xx status line.
    #[error("control session rejected: {0}")]
    Rejected(String),
    /// The reply could not be parsed as a control-protocol reply.
    #[error("control session malformed reply: {0}")]
    Malformed(String),
}
