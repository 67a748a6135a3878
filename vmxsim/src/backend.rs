//! # Simulated Device Backend
//!
//! ## Purpose
//!
//! Plays the device side of the ring protocol against the shared memory the
//! driver publishes, so the whole engine can run without hardware.
//!
//! ## How it works
//!
//! The driver's `BusDma` is `HostDma`, so every bus address is a host address
//! and the backend reads and writes rings directly. Register writes are
//! decoded into commands, doorbells and interrupt masks. Frames are consumed
//! from the Tx rings by [`SimDevice::process_tx`] and delivered into the Rx
//! rings by [`SimDevice::inject_rx`]; both post completions with the device's
//! generation bit and raise the queue's interrupt if it is unmasked.
//!
//! Interrupts are not delivered by the backend: callers read
//! [`SimDevice::take_interrupts`] and invoke the driver's handlers, which
//! keeps the interleaving in the test's hands.

use std::collections::BTreeSet;
use std::sync::Mutex;

use eui48::MacAddress;
use vmxnet3::desc::{
    DriverShared, Event, INIT_GEN, RxCompDesc, RxDesc, RxMode, RxQueueShared, TxCompDesc, TxDesc,
    TxQueueShared,
};
use vmxnet3::regs::{
    BAR0_IMASK_BASE, BAR0_RXH2_BASE, BAR0_TXH_BASE, BAR1_CMD, BAR1_DSH, BAR1_DSL, BAR1_EVENT,
    BAR1_INTR, BAR1_MACH, BAR1_MACL, BAR1_UVRS, BAR1_VRRS, bar0_rxh1, bar0_txh,
};
use vmxnet3::{Command, Registers, lock, shared_read, shared_write};

/// Interrupt configuration word returned by `GET_INTRCFG`.
pub const INTRCFG_AUTO: u32 = 0;
pub const INTRCFG_LEGACY: u32 = 1;
pub const INTRCFG_MSI: u32 = 2;
pub const INTRCFG_MSIX: u32 = 3;
/// Driver-masked vectors.
pub const INTRCFG_MASK_ACTIVE: u32 = 1 << 2;

/// Knobs fixed when the backend is created.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub version: u32,
    pub upt_version: u32,
    pub intr_config: u32,
    pub mac: MacAddress,
    /// Link speed in Mbit/s, `None` while down.
    pub link: Option<u32>,
    /// `npending` threshold handed to the driver on enable.
    pub intr_threshold: u32,
    /// Ask the driver to report Rx progress through `RXH1`/`RXH2`.
    pub update_rxhead: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            version: 1,
            upt_version: 1,
            intr_config: INTRCFG_MSIX,
            mac: MacAddress::new([0x00, 0x0c, 0x29, 0x12, 0x34, 0x56]),
            link: Some(10000),
            intr_threshold: 1,
            update_rxhead: false,
        }
    }
}

/// One frame taken off a Tx ring with the offload fields of its first
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub data: Vec<u8>,
    pub ndesc: u32,
    pub offload_mode: u32,
    pub hlen: u32,
    pub offload_pos: u32,
    pub vlan: Option<u16>,
}

/// Completion metadata for an injected Rx frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxMeta {
    pub vlan: Option<u16>,
    pub error: bool,
    pub ipv4: bool,
    pub ipv6: bool,
    pub tcp: bool,
    pub udp: bool,
    pub csum_ok: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    idx: u32,
    generation: u32,
}

impl Cursor {
    fn reset() -> Self {
        Cursor {
            idx: 0,
            generation: INIT_GEN,
        }
    }

    fn advance(&mut self, len: u32) {
        self.idx += 1;
        if self.idx == len {
            self.idx = 0;
            self.generation ^= 1;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct QueueState {
    tx: Cursor,
    tx_comp: Cursor,
    rx: Cursor,
    rx_comp: Cursor,
    tx_packets: u64,
    tx_bytes: u64,
    rx_packets: u64,
    rx_bytes: u64,
    tx_error: Option<u32>,
    rx_error: Option<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    config: SimConfig,
    ds: u64,
    response: u32,
    enabled: bool,
    fail_enable: bool,
    queues: Vec<QueueState>,
    masked: BTreeSet<u32>,
    latched: BTreeSet<u32>,
    pending: BTreeSet<u32>,
    legacy_pending: bool,
    bar0_log: Vec<(u32, u32)>,
    commands: Vec<Command>,
    rxmode: RxMode,
    mcast: Vec<MacAddress>,
}

/// The simulated device.
#[derive(Debug, Default)]
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        SimDevice {
            state: Mutex::new(SimState {
                config,
                ..Default::default()
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    /// Makes the next `ENABLE` commands answer with failure.
    pub fn set_fail_enable(&self, fail: bool) {
        lock(&self.state).fail_enable = fail;
    }

    pub fn set_link(&self, link: Option<u32>) {
        lock(&self.state).config.link = link;
    }

    /// Takes effect on the next `ENABLE`.
    pub fn set_intr_threshold(&self, threshold: u32) {
        lock(&self.state).config.intr_threshold = threshold;
    }

    /// Takes effect on the next `ENABLE`.
    pub fn set_update_rxhead(&self, enabled: bool) {
        lock(&self.state).config.update_rxhead = enabled;
    }

    /// Marks a queue as stopped with `error`; reported on `GET_STATUS`.
    pub fn fail_tx_queue(&self, qid: usize, error: u32) {
        let mut st = lock(&self.state);
        if let Some(q) = st.queues.get_mut(qid) {
            q.tx_error = Some(error);
        }
    }

    pub fn fail_rx_queue(&self, qid: usize, error: u32) {
        let mut st = lock(&self.state);
        if let Some(q) = st.queues.get_mut(qid) {
            q.rx_error = Some(error);
        }
    }

    /// Posts `event` in the shared area and raises the event vector.
    pub fn raise_event(&self, bits: Event) {
        let mut st = lock(&self.state);
        let Some(ds) = st.ds_ptr() else {
            return;
        };
        let evintr = unsafe {
            let cur = shared_read!(ds, event);
            shared_write!(ds, event, cur | bits.bits());
            shared_read!(ds, evintr)
        };
        st.raise(evintr as u32);
    }

    /// Vectors raised since the last call.
    pub fn take_interrupts(&self) -> Vec<u32> {
        let mut st = lock(&self.state);
        std::mem::take(&mut st.pending).into_iter().collect()
    }

    pub fn is_masked(&self, irq: u32) -> bool {
        lock(&self.state).masked.contains(&irq)
    }

    /// Every BAR0 write, in order.
    pub fn bar0_log(&self) -> Vec<(u32, u32)> {
        lock(&self.state).bar0_log.clone()
    }

    /// Values written to the Tx doorbell of `qid`.
    pub fn doorbells(&self, qid: u32) -> Vec<u32> {
        let reg = bar0_txh(qid);
        lock(&self.state)
            .bar0_log
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Values written to `RXH1(qid)`.
    pub fn rx_heads(&self, qid: u32) -> Vec<u32> {
        let reg = bar0_rxh1(qid);
        lock(&self.state)
            .bar0_log
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_log(&self) {
        lock(&self.state).bar0_log.clear();
    }

    pub fn command_count(&self, cmd: Command) -> usize {
        lock(&self.state)
            .commands
            .iter()
            .filter(|c| **c == cmd)
            .count()
    }

    pub fn rxmode(&self) -> RxMode {
        lock(&self.state).rxmode
    }

    pub fn multicast(&self) -> Vec<MacAddress> {
        lock(&self.state).mcast.clone()
    }

    pub fn mac(&self) -> MacAddress {
        lock(&self.state).config.mac
    }

    /// Consumes every published frame on Tx queue `qid`, posting one
    /// completion per frame.
    pub fn process_tx(&self, qid: usize) -> Vec<TxFrame> {
        let mut st = lock(&self.state);
        let Some(ts) = st.txq_ptr(qid) else {
            return Vec::new();
        };
        let (ring, ring_len, comp, comp_len, intr) = unsafe {
            (
                shared_read!(ts, cmd_ring) as *const TxDesc,
                shared_read!(ts, cmd_ring_len),
                shared_read!(ts, comp_ring) as *mut TxCompDesc,
                shared_read!(ts, comp_ring_len),
                shared_read!(ts, intr_idx),
            )
        };

        let mut frames = Vec::new();
        loop {
            let mut cur = st.queues[qid].tx;
            let mut descs = Vec::new();
            let mut complete = false;
            while descs.len() < ring_len as usize {
                let txd = unsafe { ring.add(cur.idx as usize).read_volatile() };
                if txd.generation() != cur.generation {
                    break;
                }
                descs.push((cur.idx, txd));
                cur.advance(ring_len);
                if txd.eop() != 0 {
                    complete = true;
                    break;
                }
            }
            if !complete {
                break;
            }
            std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);

            let (_, sop) = descs[0];
            let mut data = Vec::new();
            for (_, txd) in &descs {
                let src = txd.addr as *const u8;
                let len = txd.seg_len() as usize;
                data.extend_from_slice(unsafe { std::slice::from_raw_parts(src, len) });
            }
            let eop_idx = descs[descs.len() - 1].0;

            let q = &mut st.queues[qid];
            q.tx = cur;
            q.tx_packets += 1;
            q.tx_bytes += data.len() as u64;

            let mut cd = TxCompDesc::default();
            cd.set_eop_idx(eop_idx);
            cd.set_generation(q.tx_comp.generation);
            unsafe { comp.add(q.tx_comp.idx as usize).write_volatile(cd) };
            q.tx_comp.advance(comp_len);

            frames.push(TxFrame {
                data,
                ndesc: descs.len() as u32,
                offload_mode: sop.offload_mode(),
                hlen: sop.hlen(),
                offload_pos: sop.offload_pos(),
                vlan: (sop.vtag_mode() != 0).then_some(sop.vtag() as u16),
            });
        }

        if !frames.is_empty() {
            st.raise(intr as u32);
        }
        frames
    }

    /// Delivers `frame` into Rx queue `qid`, spread over as many head-ring
    /// buffers as it needs. Returns `false` when the driver has not posted
    /// enough buffers.
    pub fn inject_rx(&self, qid: usize, frame: &[u8], meta: RxMeta) -> bool {
        let mut st = lock(&self.state);
        let Some(rs) = st.rxq_ptr(qid) else {
            return false;
        };
        let (ring, ring_len, comp, comp_len, intr) = unsafe {
            (
                shared_read!(rs, cmd_ring[0]) as *const RxDesc,
                shared_read!(rs, cmd_ring_len[0]),
                shared_read!(rs, comp_ring) as *mut RxCompDesc,
                shared_read!(rs, comp_ring_len),
                shared_read!(rs, intr_idx),
            )
        };

        // Reserve the buffers first so a short ring leaves nothing behind.
        let mut cur = st.queues[qid].rx;
        let mut slots = Vec::new();
        let mut left = frame.len().max(1);
        while left > 0 {
            if slots.len() == ring_len as usize {
                return false;
            }
            let rxd = unsafe { ring.add(cur.idx as usize).read_volatile() };
            if rxd.generation() != cur.generation {
                return false;
            }
            let take = left.min(rxd.buf_len() as usize);
            slots.push((cur.idx, rxd, take));
            cur.advance(ring_len);
            left -= take;
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);

        let q = &mut st.queues[qid];
        q.rx = cur;
        q.rx_packets += 1;
        q.rx_bytes += frame.len() as u64;

        let mut off = 0;
        let last = slots.len() - 1;
        for (i, (idx, rxd, take)) in slots.into_iter().enumerate() {
            let take = take.min(frame.len() - off);
            unsafe {
                std::ptr::copy_nonoverlapping(frame[off..].as_ptr(), rxd.addr as *mut u8, take)
            };
            off += take;

            let mut cd = RxCompDesc::default();
            cd.set_rxd_idx(idx);
            cd.set_qid(qid as u32);
            cd.set_len(take as u32);
            cd.set_sop(u32::from(i == 0));
            cd.set_eop(u32::from(i == last));
            if i == last {
                apply_meta(&mut cd, &meta);
            }
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
            cd.set_generation(q.rx_comp.generation);
            unsafe { comp.add(q.rx_comp.idx as usize).write_volatile(cd) };
            q.rx_comp.advance(comp_len);
        }

        st.raise(intr as u32);
        true
    }

    /// Posts `cd` on the Rx completion ring of `qid` as is, with only the
    /// generation bit filled in.
    pub fn inject_rx_completion(&self, qid: usize, mut cd: RxCompDesc) -> bool {
        let mut st = lock(&self.state);
        let Some(rs) = st.rxq_ptr(qid) else {
            return false;
        };
        let (comp, comp_len, intr) = unsafe {
            (
                shared_read!(rs, comp_ring) as *mut RxCompDesc,
                shared_read!(rs, comp_ring_len),
                shared_read!(rs, intr_idx),
            )
        };
        let q = &mut st.queues[qid];
        cd.set_generation(q.rx_comp.generation);
        unsafe { comp.add(q.rx_comp.idx as usize).write_volatile(cd) };
        q.rx_comp.advance(comp_len);
        st.raise(intr as u32);
        true
    }

    /// Skips `n` posted Rx buffers as if the device had dropped into them.
    pub fn skip_rx(&self, qid: usize, n: u32) {
        let mut st = lock(&self.state);
        let Some(rs) = st.rxq_ptr(qid) else {
            return;
        };
        let len = unsafe { shared_read!(rs, cmd_ring_len[0]) };
        for _ in 0..n {
            st.queues[qid].rx.advance(len);
        }
    }
}

fn apply_meta(cd: &mut RxCompDesc, meta: &RxMeta) {
    if let Some(tag) = meta.vlan {
        cd.set_vlan(1);
        cd.set_vtag(tag as u32);
    }
    cd.set_error(u32::from(meta.error));
    cd.set_ipv4(u32::from(meta.ipv4));
    cd.set_ipv6(u32::from(meta.ipv6));
    cd.set_tcp(u32::from(meta.tcp));
    cd.set_udp(u32::from(meta.udp));
    cd.set_csum_ok(u32::from(meta.csum_ok));
    cd.set_ipcsum_ok(u32::from(meta.ipv4 && meta.csum_ok));
    if !(meta.ipv4 || meta.ipv6) {
        cd.set_no_csum(1);
    }
}

impl SimState {
    fn ds_ptr(&self) -> Option<*mut DriverShared> {
        (self.ds != 0).then_some(self.ds as *mut DriverShared)
    }

    fn nqueues(&self) -> usize {
        match self.ds_ptr() {
            Some(ds) => unsafe { shared_read!(ds, ntxqueue) as usize },
            None => 0,
        }
    }

    fn txq_ptr(&self, qid: usize) -> Option<*mut TxQueueShared> {
        if !self.enabled || qid >= self.queues.len() {
            return None;
        }
        let ds = self.ds_ptr()?;
        let base = unsafe { shared_read!(ds, queue_shared) } as *mut TxQueueShared;
        Some(unsafe { base.add(qid) })
    }

    fn rxq_ptr(&self, qid: usize) -> Option<*mut RxQueueShared> {
        if !self.enabled || qid >= self.queues.len() {
            return None;
        }
        let ds = self.ds_ptr()?;
        let base = unsafe { shared_read!(ds, queue_shared) } as *mut u8;
        let rx = unsafe { base.add(self.queues.len() * size_of::<TxQueueShared>()) };
        Some(unsafe { (rx as *mut RxQueueShared).add(qid) })
    }

    fn raise(&mut self, irq: u32) {
        self.legacy_pending = true;
        if self.masked.contains(&irq) {
            self.latched.insert(irq);
        } else {
            self.pending.insert(irq);
        }
    }

    fn command(&mut self, raw: u32) {
        let Some(cmd) = Command::from_raw(raw) else {
            log::warn!("sim: unknown command {raw:#x}");
            self.response = u32::MAX;
            return;
        };
        self.commands.push(cmd);
        self.response = match cmd {
            Command::Enable => self.enable(),
            Command::Disable => {
                self.enabled = false;
                0
            }
            Command::Reset => {
                self.enabled = false;
                self.queues.clear();
                0
            }
            Command::GetStatus => {
                self.publish_status();
                0
            }
            Command::GetStats => {
                self.publish_stats();
                0
            }
            Command::GetLink => match self.config.link {
                Some(speed) => (speed << 16) | 1,
                None => 0,
            },
            Command::GetMacL => {
                let b = self.config.mac.as_bytes();
                u32::from_le_bytes([b[0], b[1], b[2], b[3]])
            }
            Command::GetMacH => {
                let b = self.config.mac.as_bytes();
                u32::from_le_bytes([b[4], b[5], 0, 0])
            }
            Command::GetIntrCfg => self.config.intr_config,
            Command::SetRxMode => {
                if let Some(ds) = self.ds_ptr() {
                    self.rxmode = RxMode::from_bits_retain(unsafe { shared_read!(ds, rxmode) });
                }
                0
            }
            Command::SetFilter => {
                self.read_mcast();
                0
            }
            Command::VlanFilter => 0,
        };
    }

    fn enable(&mut self) -> u32 {
        if self.fail_enable || self.ds_ptr().is_none() {
            return 1;
        }
        let n = self.nqueues();
        self.queues = vec![
            QueueState {
                tx: Cursor::reset(),
                tx_comp: Cursor::reset(),
                rx: Cursor::reset(),
                rx_comp: Cursor::reset(),
                ..Default::default()
            };
            n
        ];
        self.enabled = true;
        for qid in 0..n {
            if let Some(ts) = self.txq_ptr(qid) {
                unsafe {
                    shared_write!(ts, intr_threshold, self.config.intr_threshold);
                    shared_write!(ts, stopped, 0);
                    shared_write!(ts, error, 0);
                }
            }
            if let Some(rs) = self.rxq_ptr(qid) {
                unsafe {
                    shared_write!(rs, update_rxhead, u8::from(self.config.update_rxhead));
                    shared_write!(rs, stopped, 0);
                    shared_write!(rs, error, 0);
                }
            }
        }
        0
    }

    fn publish_status(&mut self) {
        for qid in 0..self.queues.len() {
            let q = self.queues[qid];
            if let (Some(ts), Some(err)) = (self.txq_ptr(qid), q.tx_error) {
                unsafe {
                    shared_write!(ts, stopped, 1);
                    shared_write!(ts, error, err);
                }
            }
            if let (Some(rs), Some(err)) = (self.rxq_ptr(qid), q.rx_error) {
                unsafe {
                    shared_write!(rs, stopped, 1);
                    shared_write!(rs, error, err);
                }
            }
        }
    }

    fn publish_stats(&mut self) {
        for qid in 0..self.queues.len() {
            let q = self.queues[qid];
            if let Some(ts) = self.txq_ptr(qid) {
                unsafe {
                    let mut stats = shared_read!(ts, stats);
                    stats.ucast_packets = q.tx_packets;
                    stats.ucast_bytes = q.tx_bytes;
                    shared_write!(ts, stats, stats);
                }
            }
            if let Some(rs) = self.rxq_ptr(qid) {
                unsafe {
                    let mut stats = shared_read!(rs, stats);
                    stats.ucast_packets = q.rx_packets;
                    stats.ucast_bytes = q.rx_bytes;
                    shared_write!(rs, stats, stats);
                }
            }
        }
    }

    fn read_mcast(&mut self) {
        self.mcast.clear();
        let Some(ds) = self.ds_ptr() else {
            return;
        };
        let (table, len) = unsafe {
            (
                shared_read!(ds, mcast_table) as *const u8,
                shared_read!(ds, mcast_tablelen) as usize,
            )
        };
        for off in (0..len).step_by(6) {
            let mut b = [0u8; 6];
            unsafe { std::ptr::copy_nonoverlapping(table.add(off), b.as_mut_ptr(), 6) };
            self.mcast.push(MacAddress::new(b));
        }
    }

    fn ack_events(&mut self, bits: u32) {
        if let Some(ds) = self.ds_ptr() {
            unsafe {
                let cur = shared_read!(ds, event);
                shared_write!(ds, event, cur & !bits);
            }
        }
    }
}

impl Registers for SimDevice {
    fn read_bar0(&self, _reg: u32) -> u32 {
        0
    }

    fn write_bar0(&self, reg: u32, value: u32) {
        let mut st = lock(&self.state);
        st.bar0_log.push((reg, value));
        if reg < BAR0_TXH_BASE {
            let irq = (reg - BAR0_IMASK_BASE) / 8;
            if value == 0 {
                st.masked.remove(&irq);
                if st.latched.remove(&irq) {
                    st.pending.insert(irq);
                }
            } else {
                st.masked.insert(irq);
            }
        } else if reg >= BAR0_RXH2_BASE {
            log::trace!("sim: RXH2 write {value}");
        }
    }

    fn read_bar1(&self, reg: u32) -> u32 {
        let mut st = lock(&self.state);
        match reg {
            BAR1_VRRS => st.config.version,
            BAR1_UVRS => st.config.upt_version,
            BAR1_CMD => st.response,
            BAR1_INTR => u32::from(std::mem::take(&mut st.legacy_pending)),
            _ => 0,
        }
    }

    fn write_bar1(&self, reg: u32, value: u32) {
        let mut st = lock(&self.state);
        match reg {
            BAR1_DSL => st.ds = (st.ds & !0xffff_ffff) | value as u64,
            BAR1_DSH => st.ds = (st.ds & 0xffff_ffff) | ((value as u64) << 32),
            BAR1_CMD => st.command(value),
            BAR1_MACL => {
                let mut b = [0u8; 6];
                b.copy_from_slice(st.config.mac.as_bytes());
                b[..4].copy_from_slice(&value.to_le_bytes());
                st.config.mac = MacAddress::new(b);
            }
            BAR1_MACH => {
                let mut b = [0u8; 6];
                b.copy_from_slice(st.config.mac.as_bytes());
                b[4..].copy_from_slice(&value.to_le_bytes()[..2]);
                st.config.mac = MacAddress::new(b);
            }
            BAR1_EVENT => st.ack_events(value),
            _ => {}
        }
    }
}
