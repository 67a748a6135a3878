//! # Configuration
//!
//! ## Purpose
//!
//! Attach-time sizing (`VmxConfig`) and the knobs that stay adjustable while
//! the device runs (`Tunables`).
//!
//! ## How it works
//!
//! Every `VmxConfig` field is optional; `None` selects the built-in default.
//! `Tunables` is seeded from the resolved config and read with relaxed atomics
//! on every completion pass, so a change takes effect on the next interrupt.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const DEF_TX_NDESC: u32 = 512;
pub const DEF_RX_NDESC: u32 = 256;
pub const MAX_TX_NDESC: u32 = 4096;
pub const MAX_RX_NDESC: u32 = 2048;
pub const MIN_NDESC: u32 = 4;

pub const MAX_TX_QUEUES: u32 = 8;
pub const MAX_RX_QUEUES: u32 = 16;

pub const DEF_RX_INTR_PROCESS_LIMIT: u32 = 0;
pub const DEF_TX_INTR_PROCESS_LIMIT: u32 = 256;
pub const DEF_RX_PROCESS_LIMIT: u32 = 256;
pub const DEF_TX_PROCESS_LIMIT: u32 = 256;

pub const MIN_MTU: u32 = 60;
pub const MAX_MTU: u32 = 9000;
pub const DEF_MTU: u32 = 1500;

/// Interrupt vectors the platform is willing to grant, per method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrResources {
    pub msix_vectors: u32,
    pub msi_vectors: u32,
    pub legacy: bool,
}

impl Default for IntrResources {
    fn default() -> Self {
        IntrResources {
            msix_vectors: MAX_TX_QUEUES + 1,
            msi_vectors: 1,
            legacy: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VmxConfig {
    /// Interface name used as the log prefix.
    pub name: Option<String>,
    pub ntxdescs: Option<u32>,
    pub nrxdescs: Option<u32>,
    /// CPUs available for queue distribution.
    pub ncpu: Option<u32>,
    pub intr: Option<IntrResources>,
    pub mtu: Option<u32>,
    pub rx_intr_process_limit: Option<u32>,
    pub tx_intr_process_limit: Option<u32>,
    pub rx_process_limit: Option<u32>,
    pub tx_process_limit: Option<u32>,
    /// Run deferred completion work on the workqueue instead of a softint.
    pub txrx_workqueue: Option<bool>,
}

impl VmxConfig {
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "vmx0".to_string())
    }

    pub fn ntxdescs(&self) -> u32 {
        clamp_ndesc(self.ntxdescs.unwrap_or(DEF_TX_NDESC), MAX_TX_NDESC)
    }

    pub fn nrxdescs(&self) -> u32 {
        clamp_ndesc(self.nrxdescs.unwrap_or(DEF_RX_NDESC), MAX_RX_NDESC)
    }

    pub fn ncpu(&self) -> u32 {
        self.ncpu
            .or_else(|| {
                std::thread::available_parallelism()
                    .ok()
                    .map(|n| n.get() as u32)
            })
            .unwrap_or(1)
            .max(1)
    }

    pub fn intr(&self) -> IntrResources {
        self.intr.unwrap_or_default()
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.unwrap_or(DEF_MTU)
    }
}

/// Ring sizes are rounded down to a multiple of the minimum size.
fn clamp_ndesc(n: u32, max: u32) -> u32 {
    let n = n.clamp(MIN_NDESC, max);
    n & !(MIN_NDESC - 1)
}

/// Largest power of two not above `n`.
pub fn calc_queue_size(n: u32) -> u32 {
    if n == 0 { 0 } else { 1 << (31 - n.leading_zeros()) }
}

/// Per-device processing budgets and deferral policy.
#[derive(Debug)]
pub struct Tunables {
    rx_intr_process_limit: AtomicU32,
    tx_intr_process_limit: AtomicU32,
    rx_process_limit: AtomicU32,
    tx_process_limit: AtomicU32,
    txrx_workqueue: AtomicBool,
}

impl Tunables {
    pub fn from_config(config: &VmxConfig) -> Self {
        Tunables {
            rx_intr_process_limit: AtomicU32::new(
                config
                    .rx_intr_process_limit
                    .unwrap_or(DEF_RX_INTR_PROCESS_LIMIT),
            ),
            tx_intr_process_limit: AtomicU32::new(
                config
                    .tx_intr_process_limit
                    .unwrap_or(DEF_TX_INTR_PROCESS_LIMIT),
            ),
            rx_process_limit: AtomicU32::new(
                config.rx_process_limit.unwrap_or(DEF_RX_PROCESS_LIMIT),
            ),
            tx_process_limit: AtomicU32::new(
                config.tx_process_limit.unwrap_or(DEF_TX_PROCESS_LIMIT),
            ),
            txrx_workqueue: AtomicBool::new(config.txrx_workqueue.unwrap_or(false)),
        }
    }

    pub fn rx_intr_process_limit(&self) -> u32 {
        self.rx_intr_process_limit.load(Ordering::Relaxed)
    }

    pub fn set_rx_intr_process_limit(&self, limit: u32) {
        self.rx_intr_process_limit.store(limit, Ordering::Relaxed);
    }

    pub fn tx_intr_process_limit(&self) -> u32 {
        self.tx_intr_process_limit.load(Ordering::Relaxed)
    }

    pub fn set_tx_intr_process_limit(&self, limit: u32) {
        self.tx_intr_process_limit.store(limit, Ordering::Relaxed);
    }

    pub fn rx_process_limit(&self) -> u32 {
        self.rx_process_limit.load(Ordering::Relaxed)
    }

    pub fn set_rx_process_limit(&self, limit: u32) {
        self.rx_process_limit.store(limit, Ordering::Relaxed);
    }

    pub fn tx_process_limit(&self) -> u32 {
        self.tx_process_limit.load(Ordering::Relaxed)
    }

    pub fn set_tx_process_limit(&self, limit: u32) {
        self.tx_process_limit.store(limit, Ordering::Relaxed);
    }

    pub fn txrx_workqueue(&self) -> bool {
        self.txrx_workqueue.load(Ordering::Relaxed)
    }

    pub fn set_txrx_workqueue(&self, enabled: bool) {
        self.txrx_workqueue.store(enabled, Ordering::Relaxed);
    }
}
