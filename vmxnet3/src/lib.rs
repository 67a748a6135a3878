// Public modules and re-exports
pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod dma;
pub mod error;
pub mod packet;
pub mod regs;
pub mod stats;

pub use config::{IntrResources, Tunables, VmxConfig};
pub use context::NetStack;
pub use device::Device;
pub use dispatch::{PollScheduler, Scheduler, TokioScheduler};
pub use dma::{BusDma, DmaRegion, HostDma};
pub use error::{EncapError, Error, TxError};
pub use packet::{CsumFlags, Packet, Segment};
pub use regs::{Command, IntrMaskMode, IntrType, Registers};

// Ring internals, hidden from documentation
#[doc(hidden)]
pub mod desc;
#[doc(hidden)]
pub mod queue;
#[doc(hidden)]
pub mod ring;
#[doc(hidden)]
pub mod rx;
#[doc(hidden)]
pub mod tx;

#[cfg(test)]
mod tests;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `m`, recovering the guard if a previous holder panicked.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
