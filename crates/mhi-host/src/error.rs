use thiserror::Error;

use crate::config::ConfigError;
use crate::state::PmState;

pub type Result<T> = std::result::Result<T, MhiError>;

/// Errors surfaced by the host transport.
///
/// Transfer-level failures (overflow, buffers flushed by a channel reset) are
/// not errors of the submitting call; they are delivered through
/// [`crate::TransferResult::status`] instead.
#[derive(Debug, Error)]
pub enum MhiError {
    /// The transfer ring (or command ring) has no free descriptor slot.
    #[error("ring exhausted: no free descriptor slots")]
    Exhausted,

    /// The channel is not in a lifecycle state that permits the operation, or
    /// the current execution environment does not expose it.
    #[error("channel {chan} not connected: {reason}")]
    NotConnected { chan: u32, reason: &'static str },

    /// The link is in an error state, a register read hit the bus-down
    /// sentinel, or the device did not answer a command in time.
    #[error("link i/o error: {0}")]
    Io(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unknown channel {0}")]
    UnknownChannel(u32),

    #[error("unknown logical device {0:?}")]
    UnknownDevice(String),

    /// Mapping a buffer or allocating coherent memory failed.
    #[error("out of DMA memory")]
    NoMemory,

    /// A low-power request was refused because traffic is outstanding.
    #[error("device busy: {0}")]
    Busy(&'static str),

    #[error("illegal power state transition {from:?} -> {to:?}")]
    IllegalTransition { from: PmState, to: PmState },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MhiError {
    pub(crate) fn not_connected(chan: u32, reason: &'static str) -> Self {
        Self::NotConnected { chan, reason }
    }
}
