//! # Shared Device Context
//!
//! State every queue needs from its device: register access, DMA, the upstream
//! stack, counters and the running/link flags. Queues hold an `Arc<Context>`
//! as their back-reference to the device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Tunables;
use crate::dma::BusDma;
use crate::packet::Packet;
use crate::regs::ControlPlane;
use crate::stats::IfStats;

/// The network stack the engine delivers frames to.
pub trait NetStack: Send + Sync {
    /// Takes ownership of a received, validated frame.
    fn input(&self, pkt: Packet);

    /// Link went up (`true`, with speed in Mbit/s) or down.
    fn link_state_changed(&self, _up: bool, _speed_mbps: u32) {}

    /// The send path may have room again; the stack should call `Device::start`.
    fn start_deferred(&self) {}
}

pub struct Context {
    pub name: String,
    pub regs: ControlPlane,
    pub dma: Arc<dyn BusDma>,
    pub stack: Arc<dyn NetStack>,
    pub tunables: Tunables,
    pub stats: IfStats,
    pub ntxqueues: u32,
    pub nrxqueues: u32,
    running: AtomicBool,
    link_active: AtomicBool,
}

impl Context {
    pub fn new(
        name: String,
        regs: ControlPlane,
        dma: Arc<dyn BusDma>,
        stack: Arc<dyn NetStack>,
        tunables: Tunables,
        ntxqueues: u32,
        nrxqueues: u32,
    ) -> Self {
        Context {
            name,
            regs,
            dma,
            stack,
            tunables,
            stats: IfStats::default(),
            ntxqueues,
            nrxqueues,
            running: AtomicBool::new(false),
            link_active: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn link_active(&self) -> bool {
        self.link_active.load(Ordering::Acquire)
    }

    pub fn set_link_active(&self, active: bool) {
        self.link_active.store(active, Ordering::Release);
    }
}
