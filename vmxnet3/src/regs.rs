//! # Device Control Plane
//!
//! ## Purpose
//!
//! The device exposes two register windows. BAR0 holds the per-queue doorbells
//! and the interrupt mask registers; BAR1 holds version negotiation, the shared
//! area address, the MAC address, the command register and the event
//! acknowledgement.
//!
//! ## How it works
//!
//! `Registers` is the raw 32-bit access the platform provides. `ControlPlane`
//! layers the command protocol on top: a command is written to `BAR1_CMD`, and
//! commands that return a value are read back from the same register.
//!
//! ## Main components
//!
//! - `Registers`: BAR access supplied by the platform (or the simulator).
//! - `Command`: command codes understood by the device.
//! - `ControlPlane`: doorbells, interrupt masking, link, MAC and version helpers.

use std::sync::Arc;

use eui48::MacAddress;

use crate::error::Error;

pub const BAR0_IMASK_BASE: u32 = 0x000;
pub const BAR0_TXH_BASE: u32 = 0x600;
pub const BAR0_RXH1_BASE: u32 = 0x800;
pub const BAR0_RXH2_BASE: u32 = 0xa00;

pub const BAR1_VRRS: u32 = 0x000;
pub const BAR1_UVRS: u32 = 0x008;
pub const BAR1_DSL: u32 = 0x010;
pub const BAR1_DSH: u32 = 0x018;
pub const BAR1_CMD: u32 = 0x020;
pub const BAR1_MACL: u32 = 0x028;
pub const BAR1_MACH: u32 = 0x030;
pub const BAR1_INTR: u32 = 0x038;
pub const BAR1_EVENT: u32 = 0x040;

pub const fn bar0_imask(irq: u32) -> u32 {
    BAR0_IMASK_BASE + irq * 8
}

pub const fn bar0_txh(q: u32) -> u32 {
    BAR0_TXH_BASE + q * 8
}

pub const fn bar0_rxh1(q: u32) -> u32 {
    BAR0_RXH1_BASE + q * 8
}

pub const fn bar0_rxh2(q: u32) -> u32 {
    BAR0_RXH2_BASE + q * 8
}

/// Command codes written to `BAR1_CMD`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enable = 0xcafe_0000,
    Disable = 0xcafe_0001,
    Reset = 0xcafe_0002,
    SetRxMode = 0xcafe_0003,
    SetFilter = 0xcafe_0004,
    VlanFilter = 0xcafe_0005,
    GetStatus = 0xf00d_0000,
    GetStats = 0xf00d_0001,
    GetLink = 0xf00d_0002,
    GetMacL = 0xf00d_0003,
    GetMacH = 0xf00d_0004,
    GetIntrCfg = 0xf00d_0008,
}

impl Command {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use Command::*;
        [
            Enable, Disable, Reset, SetRxMode, SetFilter, VlanFilter, GetStatus, GetStats,
            GetLink, GetMacL, GetMacH, GetIntrCfg,
        ]
        .into_iter()
        .find(|c| *c as u32 == raw)
    }
}

/// Interrupt delivery method the device is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrType {
    Auto,
    Legacy,
    Msi,
    Msix,
}

/// Who masks a vector while it is being serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrMaskMode {
    /// The device masks automatically.
    Auto,
    /// The driver masks and unmasks explicitly.
    Active,
}

/// Raw 32-bit register access to the two device windows.
pub trait Registers: Send + Sync {
    fn read_bar0(&self, reg: u32) -> u32;
    fn write_bar0(&self, reg: u32, value: u32);
    fn read_bar1(&self, reg: u32) -> u32;
    fn write_bar1(&self, reg: u32, value: u32);
}

/// Command and register helpers over a `Registers` implementation.
#[derive(Clone)]
pub struct ControlPlane {
    regs: Arc<dyn Registers>,
}

impl ControlPlane {
    pub fn new(regs: Arc<dyn Registers>) -> Self {
        ControlPlane { regs }
    }

    pub fn write_bar0(&self, reg: u32, value: u32) {
        self.regs.write_bar0(reg, value);
    }

    pub fn read_bar1(&self, reg: u32) -> u32 {
        self.regs.read_bar1(reg)
    }

    pub fn write_bar1(&self, reg: u32, value: u32) {
        self.regs.write_bar1(reg, value);
    }

    pub fn write_cmd(&self, cmd: Command) {
        self.regs.write_bar1(BAR1_CMD, cmd as u32);
    }

    /// Issues `cmd` and returns the device's answer.
    pub fn read_cmd(&self, cmd: Command) -> u32 {
        self.write_cmd(cmd);
        self.regs.read_bar1(BAR1_CMD)
    }

    pub fn enable_intr(&self, irq: u32) {
        self.regs.write_bar0(bar0_imask(irq), 0);
    }

    pub fn disable_intr(&self, irq: u32) {
        self.regs.write_bar0(bar0_imask(irq), 1);
    }

    /// Publishes a new transmit head to the device.
    pub fn tx_doorbell(&self, qid: u32, head: u32) {
        self.regs.write_bar0(bar0_txh(qid), head);
    }

    /// Acknowledges receive progress on ring 0 or ring 1 of a queue.
    pub fn rx_head(&self, qid: u32, ring: usize, idx: u32) {
        let reg = if ring == 0 { bar0_rxh1(qid) } else { bar0_rxh2(qid) };
        self.regs.write_bar0(reg, idx);
    }

    /// Negotiates device and UPT revision 1.
    ///
    /// # Errors
    ///
    /// Fails when the device does not advertise revision 1 in `VRRS` or `UVRS`.
    pub fn check_version(&self) -> Result<(), Error> {
        let version = self.regs.read_bar1(BAR1_VRRS);
        if version & 0x01 == 0 {
            return Err(Error::UnsupportedVersion(version));
        }
        self.regs.write_bar1(BAR1_VRRS, 1);

        let version = self.regs.read_bar1(BAR1_UVRS);
        if version & 0x01 == 0 {
            return Err(Error::UnsupportedUptVersion(version));
        }
        self.regs.write_bar1(BAR1_UVRS, 1);
        Ok(())
    }

    /// Reads the interrupt type and mask mode the device was configured with.
    pub fn intr_config(&self) -> (IntrType, IntrMaskMode) {
        let config = self.read_cmd(Command::GetIntrCfg);
        let kind = match config & 0x03 {
            1 => IntrType::Legacy,
            2 => IntrType::Msi,
            3 => IntrType::Msix,
            _ => IntrType::Auto,
        };
        let mask = match (config >> 2) & 0x03 {
            1 => IntrMaskMode::Active,
            _ => IntrMaskMode::Auto,
        };
        (kind, mask)
    }

    /// Returns the link speed in Mbit/s, or `None` while the link is down.
    pub fn link_status(&self) -> Option<u32> {
        let status = self.read_cmd(Command::GetLink);
        (status & 0x01 != 0).then_some(status >> 16)
    }

    pub fn set_lladdr(&self, mac: &MacAddress) {
        let b = mac.as_bytes();
        let ml = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let mh = u32::from_le_bytes([b[4], b[5], 0, 0]);
        self.regs.write_bar1(BAR1_MACL, ml);
        self.regs.write_bar1(BAR1_MACH, mh);
    }

    pub fn get_lladdr(&self) -> MacAddress {
        let ml = self.read_cmd(Command::GetMacL).to_le_bytes();
        let mh = self.read_cmd(Command::GetMacH).to_le_bytes();
        MacAddress::new([ml[0], ml[1], ml[2], ml[3], mh[0], mh[1]])
    }

    /// Points the device at the driver shared area.
    pub fn set_shared_addr(&self, addr: u64) {
        self.regs.write_bar1(BAR1_DSL, addr as u32);
        self.regs.write_bar1(BAR1_DSH, (addr >> 32) as u32);
    }
}
