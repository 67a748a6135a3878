//! # vmxsim
//!
//! A software model of the vmxnet3 device for driving the ring engine without
//! a hypervisor, plus a capturing network stack to receive what it delivers.

pub mod backend;
pub mod stack;

pub use backend::{RxMeta, SimConfig, SimDevice, TxFrame};
pub use stack::CaptureStack;

use vmxnet3::{Device, IntrType};

/// Invokes the device handler for every vector the simulator raised.
/// Returns how many handlers ran.
pub fn deliver_interrupts(sim: &SimDevice, dev: &Device) -> usize {
    let raised = sim.take_interrupts();
    if raised.is_empty() {
        return 0;
    }
    if dev.intr_type() != IntrType::Msix {
        dev.legacy_intr();
        return 1;
    }
    let nqueues = dev.nqueues() as u32;
    for &irq in &raised {
        if irq < nqueues {
            dev.queue_intr(irq as usize);
        } else {
            dev.event_intr();
        }
    }
    raised.len()
}
