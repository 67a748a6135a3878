//! # Transmit Path
//!
//! ## Purpose
//!
//! Turns outgoing frames into transmit descriptor chains and reclaims them once
//! the device reports completion.
//!
//! ## How it works
//!
//! A frame is bound for bus access (defragmented once if it needs too many
//! segments), checked against the free descriptor count, and written as one
//! descriptor per segment. Every descriptor but the first is written already
//! device-owned; the first one keeps the driver's generation until a release
//! fence has ordered the rest of the chain, and its flip publishes the whole
//! frame. The doorbell is rung only once enough descriptors are pending to
//! reach the device-provided threshold.
//!
//! Reclaim walks the completion ring: every completion frees the frame whose
//! first descriptor sits at `next` and moves `next` past the completion's
//! end-of-packet index.
//!
//! ## Main components
//!
//! - `TxRing`: descriptor ring plus per-slot mapping and frame ownership.
//! - `TxQueue`: ring, completion ring, shared record, backlog and counters.
//! - `offload_context()`: header parsing for checksum and TSO offload.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use etherparse::{
    EtherType, Ethernet2Header, Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6Header,
    Ipv6HeaderSlice, SingleVlanHeader,
};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::desc::{INIT_GEN, OM_CSUM, OM_TSO, TxCompDesc, TxDesc, TxQueueShared};
use crate::dma::{BusDma, DmaMap, HostSpan, SharedRecord};
use crate::error::{EncapError, LoadError, OffloadError};
use crate::packet::{CsumFlags, Packet};
use crate::ring::{Barrier, CompRing, Ring, barrier};
use crate::rx::MCLBYTES;
use crate::stats::{self, TxStats};
use crate::{lock, shared_read, shared_write};

pub const TX_MAXSEGS: usize = 32;
pub const TX_MAXSEGSIZE: usize = 1 << 14;
pub const TX_MAXSIZE: usize = TX_MAXSEGS * MCLBYTES;

/// Ticks a queue may hold unacknowledged frames before it is declared hung.
pub const WATCHDOG_TIMEOUT: u32 = 5;

/// Enough to cover a VLAN header, IPv4 with options and TCP with options.
const OFFLOAD_HDR_MAX: usize = Ethernet2Header::LEN + SingleVlanHeader::LEN + 60 + 60;

struct TxBuf {
    map: DmaMap,
    pkt: Option<Packet>,
}

pub struct TxRing {
    bufs: Vec<TxBuf>,
    desc: Ring<TxDesc>,
    head: u32,
    next: u32,
    generation: u32,
}

impl TxRing {
    pub fn alloc(dma: &dyn BusDma, ndesc: u32) -> Result<Self, io::Error> {
        let desc = Ring::alloc(dma, ndesc)?;
        let bufs = (0..ndesc)
            .map(|_| TxBuf {
                map: DmaMap::new(TX_MAXSIZE, TX_MAXSEGS, TX_MAXSEGSIZE),
                pkt: None,
            })
            .collect();
        Ok(TxRing {
            bufs,
            desc,
            head: 0,
            next: 0,
            generation: INIT_GEN,
        })
    }

    pub fn init(&mut self) {
        self.head = 0;
        self.next = 0;
        self.generation = INIT_GEN;
        self.desc.zero();
    }

    /// Free descriptors, keeping one slot empty to tell full from empty.
    pub fn avail(&self) -> u32 {
        let avail = self.next as i64 - self.head as i64 - 1;
        if avail < 0 {
            (avail + self.desc.len() as i64) as u32
        } else {
            avail as u32
        }
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn next(&self) -> u32 {
        self.next
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn len(&self) -> u32 {
        self.desc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desc.is_empty()
    }

    pub fn desc_at(&self, idx: u32) -> TxDesc {
        self.desc.desc_at(idx)
    }

    pub fn bus_addr(&self) -> u64 {
        self.desc.bus_addr()
    }
}

/// Descriptor fields derived from the frame headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadCtx {
    pub mode: u32,
    pub hlen: u32,
    pub pos: u32,
}

/// Locates the L3/L4 headers of an offload-requesting frame.
///
/// For TSO the TCP checksum field is seeded with the pseudo-header sum
/// (addresses and protocol, no length) and `hlen` covers the TCP header. For
/// checksum offload `pos` is where the device stores the checksum.
///
/// # Errors
///
/// `UnsupportedProtocol` for a non-IP, non-VLAN ethertype; `Malformed` when the
/// headers do not fit in the first segment or fail to parse.
pub fn offload_context(pkt: &mut Packet) -> Result<OffloadCtx, OffloadError> {
    let flags = pkt.csum_flags;
    let segsz = pkt.segsz as u32;
    let hdr = pkt
        .first_segment_mut()
        .ok_or(OffloadError::Malformed)?
        .as_mut_slice();

    let ether_type = Ethernet2HeaderSlice::from_slice(hdr)
        .map_err(|_| OffloadError::Malformed)?
        .ether_type();
    let offset = if ether_type == EtherType::IPV4 || ether_type == EtherType::IPV6 {
        Ethernet2Header::LEN
    } else if ether_type == EtherType::VLAN_TAGGED_FRAME {
        Ethernet2Header::LEN + SingleVlanHeader::LEN
    } else {
        return Err(OffloadError::UnsupportedProtocol(ether_type.0));
    };

    let v4 = flags.intersects(CsumFlags::V4);
    let l3 = hdr.get(offset..).ok_or(OffloadError::Malformed)?;
    let (iphl, seed) = if v4 {
        let ip = Ipv4HeaderSlice::from_slice(l3).map_err(|_| OffloadError::Malformed)?;
        (
            ip.ihl() as usize * 4,
            pseudo_header_seed(&ip.source(), &ip.destination()),
        )
    } else {
        let ip = Ipv6HeaderSlice::from_slice(l3).map_err(|_| OffloadError::Malformed)?;
        (
            Ipv6Header::LEN,
            pseudo_header_seed(&ip.source(), &ip.destination()),
        )
    };

    let start = offset + iphl;
    let csum_start = start + if flags.intersects(CsumFlags::TCP) { 16 } else { 6 };
    if hdr.len() < csum_start + 2 {
        return Err(OffloadError::Malformed);
    }

    if flags.intersects(CsumFlags::TSO) {
        hdr[csum_start..csum_start + 2].copy_from_slice(&seed.to_be_bytes());
        let thl = (hdr[start + 12] >> 4) as usize * 4;
        Ok(OffloadCtx {
            mode: OM_TSO,
            hlen: (start + thl) as u32,
            pos: segsz,
        })
    } else {
        Ok(OffloadCtx {
            mode: OM_CSUM,
            hlen: start as u32,
            pos: csum_start as u32,
        })
    }
}

/// Folded, uncomplemented sum of the TCP pseudo-header without length.
fn pseudo_header_seed(src: &[u8], dst: &[u8]) -> u16 {
    const IPPROTO_TCP: u32 = 6;
    let mut sum = src
        .chunks(2)
        .chain(dst.chunks(2))
        .map(|w| u16::from_be_bytes([w[0], w[1]]) as u32)
        .sum::<u32>()
        + IPPROTO_TCP;
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

fn load_packet(dma: &dyn BusDma, map: &mut DmaMap, pkt: &Packet) -> Result<(), LoadError> {
    let spans: Vec<HostSpan> = pkt
        .segments()
        .iter()
        .map(|seg| HostSpan::of(seg.as_slice()))
        .collect();
    dma.load(map, &spans)
}

/// Where a transmit pass takes its frames from.
#[derive(Clone, Copy)]
pub enum TxSource<'a> {
    /// The interface send queue (direct path, queue 0).
    Snd(&'a Mutex<VecDeque<Packet>>),
    /// This queue's interqueue backlog.
    Interq,
}

pub struct TxQueue {
    id: u16,
    ring: TxRing,
    comp: CompRing<TxCompDesc>,
    shared: SharedRecord<TxQueueShared>,
    interq: mpsc::Receiver<Packet>,
    peeked: Option<Packet>,
    watchdog: u32,
    pub stats: TxStats,
}

impl TxQueue {
    pub fn new(
        id: u16,
        dma: &dyn BusDma,
        ndesc: u32,
        shared: SharedRecord<TxQueueShared>,
        interq: mpsc::Receiver<Packet>,
    ) -> Result<Self, io::Error> {
        Ok(TxQueue {
            id,
            ring: TxRing::alloc(dma, ndesc)?,
            comp: CompRing::alloc(dma, ndesc)?,
            shared,
            interq,
            peeked: None,
            watchdog: 0,
            stats: TxStats::default(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn ring(&self) -> &TxRing {
        &self.ring
    }

    pub fn watchdog_counter(&self) -> u32 {
        self.watchdog
    }

    /// Fills this queue's shared record with ring addresses and sizes.
    pub fn publish_shared(&self, intr_idx: u32) {
        let ts = self.shared.ptr();
        unsafe {
            shared_write!(ts, npending, 0);
            shared_write!(ts, cmd_ring, self.ring.bus_addr());
            shared_write!(ts, cmd_ring_len, self.ring.len());
            shared_write!(ts, data_ring, 0);
            shared_write!(ts, data_ring_len, 0);
            shared_write!(ts, comp_ring, self.comp.bus_addr());
            shared_write!(ts, comp_ring_len, self.comp.len());
            shared_write!(ts, driver_data, 0);
            shared_write!(ts, driver_data_len, 0);
            shared_write!(ts, intr_idx, intr_idx as u8);
        }
    }

    /// Device-reported `(stopped, error)` state of this queue.
    pub fn device_status(&self) -> (bool, u32) {
        let ts = self.shared.ptr();
        unsafe { (shared_read!(ts, stopped) != 0, shared_read!(ts, error)) }
    }

    pub fn host_stats(&self) -> crate::desc::UptTxStats {
        let ts = self.shared.ptr();
        unsafe { shared_read!(ts, stats) }
    }

    /// Resets both rings to their initial, driver-owned state.
    pub fn init(&mut self) {
        self.ring.init();
        self.comp.reset();
    }

    /// Maps `pkt` onto descriptors and publishes it to the device.
    ///
    /// # Errors
    ///
    /// `NoSpace` returns the frame when fewer descriptors are free than it
    /// needs. Every other error drops the frame after counting it.
    pub fn encap(&mut self, ctx: &Context, mut pkt: Packet) -> Result<(), EncapError> {
        if pkt.is_empty() {
            return Err(EncapError::Empty);
        }
        let dma = ctx.dma.as_ref();
        let offload = pkt.csum_flags.intersects(CsumFlags::TX_OFFLOAD);
        if offload {
            let n = OFFLOAD_HDR_MAX.min(pkt.len());
            pkt.pullup(n);
        }

        let sop = self.ring.head;
        let map = &mut self.ring.bufs[sop as usize].map;
        if let Err(LoadError::TooBig) = load_packet(dma, map, &pkt) {
            pkt.defrag();
            if let Err(e) = load_packet(dma, map, &pkt) {
                log::debug!("{}: txq{}: defrag failed: {e}", ctx.name, self.id);
                self.stats.defrag_failed += 1;
                return Err(EncapError::DefragFailed);
            }
            self.stats.defragged += 1;
        }

        let nsegs = map.segments().len() as u32;
        if self.ring.avail() < nsegs {
            self.stats.full += 1;
            dma.unload(&mut self.ring.bufs[sop as usize].map);
            return Err(EncapError::NoSpace(pkt));
        }

        let octx = if offload {
            match offload_context(&mut pkt) {
                Ok(octx) => {
                    if octx.mode == OM_TSO {
                        self.stats.tso += 1;
                    } else {
                        self.stats.csum += 1;
                    }
                    Some(octx)
                }
                Err(e) => {
                    self.stats.offload_failed += 1;
                    dma.unload(&mut self.ring.bufs[sop as usize].map);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let ring = &mut self.ring;
        let mut generation = ring.generation ^ 1;
        let mut last = sop;
        for seg in ring.bufs[sop as usize].map.segments() {
            let mut txd = TxDesc {
                addr: seg.addr,
                ..Default::default()
            };
            txd.set_buf_len(seg.len);
            txd.set_generation(generation);
            last = ring.head;
            ring.desc.set_desc(ring.head, txd);
            if ring.desc.increment(&mut ring.head) {
                ring.generation ^= 1;
            }
            generation = ring.generation;
        }
        ring.desc.update(last, |txd| {
            txd.set_eop(1);
            txd.set_compreq(1);
        });
        ring.desc.update(sop, |txd| {
            if let Some(tag) = pkt.vlan_tag {
                txd.set_vtag_mode(1);
                txd.set_vtag(tag as u32);
            }
            if let Some(octx) = octx {
                txd.set_offload_mode(octx.mode);
                txd.set_hlen(octx.hlen);
                txd.set_offload_pos(octx.pos);
            }
        });
        ring.bufs[sop as usize].pkt = Some(pkt);

        barrier(Barrier::Write);
        ring.desc.update(sop, |txd| txd.set_generation(txd.generation() ^ 1));

        let head = ring.head;
        let ts = self.shared.ptr();
        unsafe {
            let npending = shared_read!(ts, npending) + nsegs;
            if npending >= shared_read!(ts, intr_threshold) {
                shared_write!(ts, npending, 0);
                ctx.regs.tx_doorbell(self.id as u32, head);
            } else {
                shared_write!(ts, npending, npending);
            }
        }
        Ok(())
    }

    /// Reclaims completed frames, at most `limit` completions.
    /// Returns `true` when the budget ran out with work left.
    pub fn txq_eof(&mut self, ctx: &Context, mut limit: u32) -> bool {
        let mut more = false;
        loop {
            if limit == 0 {
                more = true;
                break;
            }
            limit -= 1;

            let Some(txcd) = self.comp.peek() else {
                break;
            };
            self.comp.advance();

            let txb = &mut self.ring.bufs[self.ring.next as usize];
            if let Some(pkt) = txb.pkt.take() {
                ctx.dma.unload(&mut txb.map);
                stats::inc(&ctx.stats.opackets);
                stats::add(&ctx.stats.obytes, pkt.len() as u64);
                if pkt.multicast {
                    stats::inc(&ctx.stats.omcasts);
                }
            }
            self.ring.next = (txcd.eop_idx() + 1) % self.ring.len();
        }

        if self.ring.head == self.ring.next {
            self.watchdog = 0;
        }
        more
    }

    /// Frees every frame still owned by the ring.
    pub fn txstop(&mut self, ctx: &Context) {
        for txb in &mut self.ring.bufs {
            if txb.pkt.take().is_some() {
                ctx.dma.unload(&mut txb.map);
            }
        }
    }

    fn peek_interq(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.interq.try_recv().ok();
        }
        self.peeked.is_some()
    }

    pub fn has_backlog(&mut self) -> bool {
        self.peek_interq()
    }

    /// Drops everything waiting in the interqueue.
    pub fn purge_backlog(&mut self) -> usize {
        let mut n = usize::from(self.peeked.take().is_some());
        while self.interq.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    /// Encapsulates queued frames while descriptors last.
    pub fn tx_common(&mut self, ctx: &Context, src: TxSource<'_>) {
        if !ctx.is_running() || !ctx.link_active() {
            return;
        }

        let mut sent = 0;
        loop {
            let pending = match src {
                TxSource::Snd(snd) => !lock(snd).is_empty(),
                TxSource::Interq => self.peek_interq(),
            };
            if !pending || (self.ring.avail() as usize) < TX_MAXSEGS {
                break;
            }
            let pkt = match src {
                TxSource::Snd(snd) => lock(snd).pop_front(),
                TxSource::Interq => self.peeked.take(),
            };
            let Some(pkt) = pkt else {
                break;
            };
            if let Err(e) = self.encap(ctx, pkt) {
                log::debug!("{}: txq{}: dropped frame: {e}", ctx.name, self.id);
                stats::inc(&ctx.stats.oerrors);
                break;
            }
            sent += 1;
        }

        if sent > 0 {
            self.watchdog = WATCHDOG_TIMEOUT;
        }
    }

    /// Counts down an armed watchdog. Returns `true` once it expires.
    pub fn watchdog(&mut self, ctx: &Context) -> bool {
        if self.watchdog == 0 {
            return false;
        }
        self.watchdog -= 1;
        if self.watchdog != 0 {
            return false;
        }
        self.stats.watchdogto += 1;
        log::error!("{}: watchdog timeout on queue {}", ctx.name, self.id);
        true
    }

    #[cfg(test)]
    pub(crate) fn arm_watchdog(&mut self) {
        self.watchdog = WATCHDOG_TIMEOUT;
    }
}
