//! Crate-wide error type.

use thiserror::Error;

use crate::gpu::DeviceError;
use crate::store::chunk::TableKey;
use crate::store::compressor::CompressionError;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A fixed-capacity shared pool (contexts, chunk slots) has no free entry.
    #[error("no free {resource} available (capacity {capacity})")]
    ResourceExhausted {
        resource: &'static str,
        capacity: usize,
    },

    /// An internal invariant was broken; indicates a latent bug.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(
        "table {table} is pinned on GPU device {pinned}, but the context is bound to {context:?}"
    )]
    DeviceMismatch {
        table: TableKey,
        pinned: usize,
        context: Option<usize>,
    },

    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("table {0} is not empty")]
    TableNotEmpty(TableKey),

    /// Another transaction inserted into or deleted from the table after
    /// the current snapshot was taken.
    #[error("table {0} was modified by a concurrent transaction")]
    ConcurrentUpdate(TableKey),

    #[error("table {0} is not pinned on a GPU device")]
    NotPinned(TableKey),

    #[error("corrupt chunk image: {0}")]
    Layout(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl StoreError {
    /// Whether this error reports a broken internal invariant.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, StoreError::ProtocolViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
