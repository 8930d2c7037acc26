//! Error types shared across the scheduler

use crate::scheduler::LoopState;
use thiserror::Error;

/// Errors raised while building datapath identifiers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("coordinate {value} does not fit the 6-bit high coordinate field")]
    CoordinateOutOfRange { value: u8 },

    #[error("fat-tree arity must be even and within 2..=64, got {0}")]
    InvalidArity(u8),
}

/// Errors raised while parsing fabric host addresses
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("invalid host address '{0}'")]
    Malformed(String),

    #[error("address '{0}' is outside the 10.0.0.0/8 fabric")]
    OutsideFabric(String),
}

/// Errors from the placement and slice stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from the southbound sinks (stats transport, route installer)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("southbound channel closed")]
    Closed,

    #[error("request for switch {dpid:#06x} rejected: {reason}")]
    Rejected { dpid: u16, reason: String },
}

/// Errors surfaced by the scheduler and the controller event layer
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cannot {action} a scheduler that is {state}")]
    InvalidState {
        action: &'static str,
        state: LoopState,
    },

    #[error("builder is missing the {0}")]
    MissingComponent(&'static str),

    #[error("unknown datapath identifier {0:#x}")]
    UnknownSwitch(u64),

    #[error("stats transport is gone")]
    TransportClosed,

    #[error("scheduler task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
