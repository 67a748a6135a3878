//! # Error Types
//!
//! Lifecycle failures surface as [`Error`]. The data-path errors are separate
//! enums because their ownership story differs: a full ring hands the frame
//! back, every other encapsulation failure consumes it.

use std::io;

use thiserror::Error;

use crate::packet::Packet;

/// Device lifecycle and control-plane failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported hardware version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("unsupported UPT version {0:#x}")]
    UnsupportedUptVersion(u32),
    #[error("cannot allocate any interrupt vector")]
    NoInterrupts,
    #[error("DMA allocation failed: {0}")]
    Dma(#[from] io::Error),
    #[error("cannot populate Rx queue {0}")]
    RxPopulate(u16),
    #[error("device enable command failed")]
    EnableFailed,
    #[error("invalid MTU {0}")]
    InvalidMtu(u32),
}

/// Failure to bind a buffer for bus access.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The buffer needs more segments (or bytes) than the map allows.
    #[error("buffer does not fit the DMA map")]
    TooBig,
}

/// Offload context could not be derived from the frame headers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OffloadError {
    #[error("unsupported ethertype {0:#06x} for offload")]
    UnsupportedProtocol(u16),
    #[error("frame headers are truncated or malformed")]
    Malformed,
}

/// Receive buffer replenish failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufError {
    #[error("no receive buffer available")]
    NoBuffers,
    #[error("cannot map receive buffer: {0}")]
    Map(LoadError),
    #[error("body ring is not populated")]
    Unsupported,
}

/// Transmit encapsulation failure.
#[derive(Debug, Error)]
pub enum EncapError {
    #[error("empty frame")]
    Empty,
    /// Not enough descriptors; the frame is handed back untouched.
    #[error("transmit ring full")]
    NoSpace(Packet),
    #[error("frame cannot be defragmented into a mappable chain")]
    DefragFailed,
    #[error("offload setup failed: {0}")]
    Offload(#[from] OffloadError),
}

/// Submission path failure as seen by the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    #[error("interface send queue is full")]
    QueueFull,
    #[error("transmit backlog is full")]
    NoBufs,
}
