//! Workspace error taxonomy.
//!
//! Four classes, applied uniformly:
//!
//! - **Config** — invalid parameter or mismatched chain types. The
//!   mutation is not applied; processing continues.
//! - **Capacity** — a queue or buffer has no room. The operation is
//!   dropped (event codes) or left pending for a later tic (history
//!   snapshots); never retried synchronously.
//! - **Consistency** — redundant state disagrees (clock sources, history
//!   lengths). The requested operation is aborted and cleared.
//! - **Fatal** — setup allocation failure or an invariant violation that
//!   would corrupt shared buffers. The process halts after flushing
//!   diagnostics.
//!
//! No unwinding is relied on: every fallible call site returns
//! `Result<_, RigError>` and the scheduler converts failures into
//! diagnostics rather than propagating them out of the tic.

use thiserror::Error;

/// Unified error type for the rig engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RigError {
    /// Invalid or rejected configuration change.
    #[error("config: {0}")]
    Config(&'static str),

    /// A bounded queue or buffer had no room.
    #[error("capacity: {0}")]
    Capacity(&'static str),

    /// Redundant state disagreed; the operation was aborted.
    #[error("consistency: {0}")]
    Consistency(&'static str),

    /// Unrecoverable: halt after flushing diagnostics.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RigError {
    /// Whether the error must stop the process.
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, RigError::Fatal(_))
    }
}
