mod ring;
mod tx;

use std::sync::{Arc, Mutex};

use etherparse::PacketBuilder;

use crate::config::{Tunables, VmxConfig};
use crate::context::{Context, NetStack};
use crate::dma::{BusDma, HostDma};
use crate::packet::Packet;
use crate::regs::{ControlPlane, Registers};

/// Records every register write; reads return zero.
#[derive(Default)]
pub(crate) struct RecordingRegs {
    pub bar0: Mutex<Vec<(u32, u32)>>,
    pub bar1: Mutex<Vec<(u32, u32)>>,
}

impl Registers for RecordingRegs {
    fn read_bar0(&self, _reg: u32) -> u32 {
        0
    }

    fn write_bar0(&self, reg: u32, value: u32) {
        self.bar0.lock().unwrap().push((reg, value));
    }

    fn read_bar1(&self, _reg: u32) -> u32 {
        0
    }

    fn write_bar1(&self, reg: u32, value: u32) {
        self.bar1.lock().unwrap().push((reg, value));
    }
}

#[derive(Default)]
pub(crate) struct Capture {
    pub frames: Mutex<Vec<Packet>>,
}

impl NetStack for Capture {
    fn input(&self, pkt: Packet) {
        self.frames.lock().unwrap().push(pkt);
    }
}

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn context(regs: &Arc<RecordingRegs>, stack: &Arc<Capture>) -> Context {
    context_with(regs, stack, Arc::new(HostDma))
}

pub(crate) fn context_with(
    regs: &Arc<RecordingRegs>,
    stack: &Arc<Capture>,
    dma: Arc<dyn BusDma>,
) -> Context {
    Context::new(
        "test0".to_string(),
        ControlPlane::new(regs.clone()),
        dma,
        stack.clone(),
        Tunables::from_config(&VmxConfig::default()),
        1,
        1,
    )
}

/// Writes `value` as the device would, at slot `idx` of the ring at `bus`.
/// Bus addresses are host addresses under `HostDma`.
pub(crate) unsafe fn device_write<T>(bus: u64, idx: u32, value: T) {
    unsafe { (bus as *mut T).add(idx as usize).write_volatile(value) }
}

pub(crate) fn tcp4_frame(payload: usize) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(40000, 80, 1, 65535);
    let data = vec![0xa5; payload];
    let mut buf = Vec::with_capacity(builder.size(payload));
    builder.write(&mut buf, &data).unwrap();
    buf
}

pub(crate) fn udp6_frame(payload: usize) -> Vec<u8> {
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src[0] = 0xfe;
    src[15] = 1;
    dst[0] = 0xfe;
    dst[15] = 2;
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv6(src, dst, 64)
        .udp(5000, 5001);
    let data = vec![0x5a; payload];
    let mut buf = Vec::with_capacity(builder.size(payload));
    builder.write(&mut buf, &data).unwrap();
    buf
}

/// Inserts an 802.1Q tag with `vid` after the MAC addresses.
pub(crate) fn vlan_tagged(frame: &[u8], vid: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 4);
    out.extend_from_slice(&frame[..12]);
    out.extend_from_slice(&[0x81, 0x00]);
    out.extend_from_slice(&vid.to_be_bytes());
    out.extend_from_slice(&frame[12..]);
    out
}
