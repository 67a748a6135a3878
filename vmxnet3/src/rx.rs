//! # Receive Path
//!
//! ## Purpose
//!
//! Keeps the receive ring stocked with buffers and turns receive completions
//! back into frames for the network stack.
//!
//! ## How it works
//!
//! Each queue owns two command rings. Ring 0 holds head buffers and is fully
//! populated at init; ring 1 (body buffers for scatter-gather receive) is set up
//! but never populated. Replenishing a slot maps a fresh buffer into the ring's
//! spare map, swaps the maps, posts the descriptor with the ring generation and
//! hands the evicted buffer to the caller.
//!
//! Completion processing replenishes the slot of every completed descriptor
//! before the old buffer joins the frame under reassembly. If a replacement
//! cannot be had, the completed buffer is re-armed in place and the frame is
//! dropped. A frame still incomplete when the completion ring runs dry is kept
//! for the next pass.
//!
//! ## Main components
//!
//! - `RxRing`: command ring with fill index, generation and buffer slots.
//! - `RxQueue`: both rings, the completion ring, the in-flight chain.
//! - `rx_csum()`: checksum validation flags from a completion.

use std::io;

use crate::context::Context;
use crate::desc::{BTYPE_HEAD, INIT_GEN, RxCompDesc, RxDesc, RxQueueShared, UptRxStats};
use crate::dma::{BusDma, DmaMap, HostSpan, SharedRecord};
use crate::error::{BufError, Error};
use crate::packet::{CsumFlags, Packet, Segment};
use crate::ring::{CompRing, Ring};
use crate::stats::{self, RxStats};
use crate::{shared_read, shared_write};

pub const MCLBYTES: usize = 2048;
pub const ETHER_ALIGN: usize = 2;
pub const RX_JUMBO_LEN: usize = MCLBYTES - ETHER_ALIGN;
/// Bytes posted per receive buffer after reserving alignment room.
pub const RX_BUF_LEN: usize = RX_JUMBO_LEN - ETHER_ALIGN;
pub const RXRINGS_PERQ: usize = 2;

struct RxBuf {
    map: DmaMap,
    buf: Option<Vec<u8>>,
}

pub struct RxRing {
    rid: usize,
    bufs: Vec<RxBuf>,
    desc: Ring<RxDesc>,
    fill: u32,
    generation: u32,
    spare: DmaMap,
}

impl RxRing {
    pub fn alloc(dma: &dyn BusDma, rid: usize, ndesc: u32) -> Result<Self, io::Error> {
        let desc = Ring::alloc(dma, ndesc)?;
        let bufs = (0..ndesc)
            .map(|_| RxBuf {
                map: DmaMap::new(MCLBYTES, 1, MCLBYTES),
                buf: None,
            })
            .collect();
        Ok(RxRing {
            rid,
            bufs,
            desc,
            fill: 0,
            generation: INIT_GEN,
            spare: DmaMap::new(MCLBYTES, 1, MCLBYTES),
        })
    }

    fn reset(&mut self, generation: u32) {
        self.fill = 0;
        self.generation = generation;
        self.desc.zero();
    }

    pub fn fill(&self) -> u32 {
        self.fill
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

    pub fn bus_addr(&self) -> u64 {
        self.desc.bus_addr()
    }

    pub fn desc_at(&self, idx: u32) -> RxDesc {
        self.desc.desc_at(idx)
    }

    /// Address of the buffer posted at `idx`, if any.
    pub fn buffer_ptr(&self, idx: u32) -> Option<*const u8> {
        self.bufs[idx as usize].buf.as_ref().map(|b| b.as_ptr())
    }

    fn increment_fill(&mut self) {
        if self.desc.increment(&mut self.fill) {
            self.generation ^= 1;
        }
    }

    /// Posts a fresh buffer at the fill index.
    ///
    /// On success returns the buffer previously posted there, now owned by the
    /// caller. On failure the slot is left as it was.
    pub fn newbuf(
        &mut self,
        dma: &dyn BusDma,
        stats: &mut RxStats,
    ) -> Result<Option<Vec<u8>>, BufError> {
        if self.rid != 0 {
            return Err(BufError::Unsupported);
        }

        let buf = match dma.alloc_buffer(MCLBYTES) {
            Some(buf) if buf.len() >= ETHER_ALIGN + RX_BUF_LEN => buf,
            _ => {
                stats.mgetcl_failed += 1;
                return Err(BufError::NoBuffers);
            }
        };
        let span = HostSpan::of(&buf[ETHER_ALIGN..ETHER_ALIGN + RX_BUF_LEN]);
        if let Err(e) = dma.load(&mut self.spare, &[span]) {
            stats.mbuf_load_failed += 1;
            return Err(BufError::Map(e));
        }

        let idx = self.fill;
        let rxb = &mut self.bufs[idx as usize];
        if rxb.buf.is_some() {
            dma.unload(&mut rxb.map);
        }
        std::mem::swap(&mut self.spare, &mut rxb.map);
        let old = rxb.buf.replace(buf);

        let mut rxd = RxDesc {
            addr: rxb.map.segments()[0].addr,
            ..Default::default()
        };
        rxd.set_buf_len(RX_BUF_LEN as u32);
        rxd.set_btype(BTYPE_HEAD);
        rxd.set_generation(self.generation);
        self.desc.set_desc(idx, rxd);
        self.increment_fill();
        Ok(old)
    }

    /// Hands descriptor `idx` back to the device with its current buffer.
    pub fn eof_discard(&mut self, idx: u32) {
        let generation = self.generation;
        self.desc.update(idx, |rxd| rxd.set_generation(generation));
        self.increment_fill();
    }

    fn take_buffer(&mut self, idx: u32, dma: &dyn BusDma) -> Option<Vec<u8>> {
        let rxb = &mut self.bufs[idx as usize];
        let buf = rxb.buf.take();
        if buf.is_some() {
            dma.unload(&mut rxb.map);
        }
        buf
    }
}

/// Checksum validation flags for a received frame.
pub fn rx_csum(rxcd: &RxCompDesc, pkt: &mut Packet) {
    if rxcd.no_csum() != 0 {
        return;
    }

    if rxcd.ipv4() != 0 {
        pkt.csum_flags |= CsumFlags::IPV4;
        if rxcd.ipcsum_ok() == 0 {
            pkt.csum_flags |= CsumFlags::IPV4_BAD;
        }
    }

    if rxcd.fragment() != 0 {
        return;
    }

    if rxcd.tcp() != 0 {
        pkt.csum_flags |= if rxcd.ipv4() != 0 {
            CsumFlags::TCPV4
        } else {
            CsumFlags::TCPV6
        };
    } else if rxcd.udp() != 0 {
        pkt.csum_flags |= if rxcd.ipv4() != 0 {
            CsumFlags::UDPV4
        } else {
            CsumFlags::UDPV6
        };
    }

    if (rxcd.tcp() != 0 || rxcd.udp() != 0) && rxcd.csum_ok() == 0 {
        pkt.csum_flags |= CsumFlags::TCP_UDP_BAD;
    }
}

pub struct RxQueue {
    id: u16,
    rings: [RxRing; RXRINGS_PERQ],
    comp: CompRing<RxCompDesc>,
    shared: SharedRecord<RxQueueShared>,
    head: Option<Packet>,
    pub stats: RxStats,
}

impl RxQueue {
    pub fn new(
        id: u16,
        dma: &dyn BusDma,
        ndesc: u32,
        shared: SharedRecord<RxQueueShared>,
    ) -> Result<Self, io::Error> {
        Ok(RxQueue {
            id,
            rings: [
                RxRing::alloc(dma, 0, ndesc)?,
                RxRing::alloc(dma, 1, ndesc)?,
            ],
            comp: CompRing::alloc(dma, ndesc * RXRINGS_PERQ as u32)?,
            shared,
            head: None,
            stats: RxStats::default(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn ring(&self, rid: usize) -> &RxRing {
        &self.rings[rid]
    }

    /// Length of the frame under reassembly, if any.
    pub fn pending_chain_len(&self) -> Option<usize> {
        self.head.as_ref().map(Packet::len)
    }

    pub fn publish_shared(&self, intr_idx: u32) {
        let rs = self.shared.ptr();
        unsafe {
            for (i, ring) in self.rings.iter().enumerate() {
                shared_write!(rs, cmd_ring[i], ring.bus_addr());
                shared_write!(rs, cmd_ring_len[i], ring.len());
            }
            shared_write!(rs, comp_ring, self.comp.bus_addr());
            shared_write!(rs, comp_ring_len, self.comp.len());
            shared_write!(rs, driver_data, 0);
            shared_write!(rs, driver_data_len, 0);
            shared_write!(rs, intr_idx, intr_idx as u8);
        }
    }

    pub fn device_status(&self) -> (bool, u32) {
        let rs = self.shared.ptr();
        unsafe { (shared_read!(rs, stopped) != 0, shared_read!(rs, error)) }
    }

    pub fn host_stats(&self) -> UptRxStats {
        let rs = self.shared.ptr();
        unsafe { shared_read!(rs, stats) }
    }

    /// Resets the rings and posts a buffer in every head-ring slot.
    ///
    /// # Errors
    ///
    /// `RxPopulate` when a slot cannot be filled.
    pub fn init(&mut self, ctx: &Context) -> Result<(), Error> {
        let dma = ctx.dma.as_ref();
        let ring = &mut self.rings[0];
        ring.reset(INIT_GEN);
        for _ in 0..ring.len() {
            if let Err(e) = ring.newbuf(dma, &mut self.stats) {
                log::error!("{}: rxq{}: cannot populate ring: {e}", ctx.name, self.id);
                return Err(Error::RxPopulate(self.id));
            }
        }

        // Body ring: zeroed, never populated.
        self.rings[1].reset(0);

        self.comp.reset();
        Ok(())
    }

    /// Frees the partial chain and every posted buffer.
    pub fn rxstop(&mut self, ctx: &Context) {
        self.head = None;
        for ring in &mut self.rings {
            for idx in 0..ring.len() {
                ring.take_buffer(idx, ctx.dma.as_ref());
            }
        }
    }

    fn ring_of(&self, ctx: &Context, rxcd: &RxCompDesc) -> usize {
        if rxcd.qid() < ctx.nrxqueues { 0 } else { 1 }
    }

    /// Re-arms the remaining descriptors of a frame up to its end-of-packet.
    fn discard_chain(&mut self, ctx: &Context) {
        loop {
            let Some(rxcd) = self.comp.peek() else {
                break;
            };
            self.comp.advance();

            let rid = self.ring_of(ctx, &rxcd);
            let idx = rxcd.rxd_idx();
            if idx < self.rings[rid].len() {
                self.rings[rid].eof_discard(idx);
            }
            if rxcd.eop() != 0 {
                break;
            }
        }
    }

    fn input(&self, ctx: &Context, rxcd: &RxCompDesc, mut pkt: Packet) {
        if rxcd.error() != 0 {
            stats::inc(&ctx.stats.ierrors);
            return;
        }

        rx_csum(rxcd, &mut pkt);
        if rxcd.vlan() != 0 {
            pkt.vlan_tag = Some(rxcd.vtag() as u16);
        }
        pkt.rcvif = Some(self.id);

        stats::inc(&ctx.stats.ipackets);
        stats::add(&ctx.stats.ibytes, pkt.len() as u64);
        ctx.stack.input(pkt);
    }

    /// Processes up to `limit` receive completions.
    /// Returns `true` when the budget ran out with work left.
    pub fn rxq_eof(&mut self, ctx: &Context, mut limit: u32) -> bool {
        if !ctx.is_running() {
            return false;
        }

        let dma = ctx.dma.as_ref();
        let mut head = self.head.take();
        let mut more = false;

        loop {
            if limit == 0 {
                more = true;
                break;
            }
            limit -= 1;

            let Some(rxcd) = self.comp.peek() else {
                break;
            };
            self.comp.advance();

            let rid = self.ring_of(ctx, &rxcd);
            let idx = rxcd.rxd_idx();
            let eop = rxcd.eop() != 0;
            let length = rxcd.len() as usize;

            'desc: {
                if idx >= self.rings[rid].len() {
                    log::warn!(
                        "{}: rxq{}: completion for bad descriptor {idx} on ring {rid}",
                        ctx.name,
                        self.id
                    );
                    stats::inc(&ctx.stats.ierrors);
                    break 'desc;
                }

                let rxr = &mut self.rings[rid];
                // The device may skip descriptors; hand them back as they are.
                while rxr.fill != idx {
                    let fill = rxr.fill;
                    rxr.eof_discard(fill);
                }

                'frame: {
                    if rxcd.sop() != 0 {
                        if rid != 0 || head.is_some() {
                            log::warn!(
                                "{}: rxq{}: unexpected start of frame at {idx} on ring {rid}",
                                ctx.name,
                                self.id
                            );
                            stats::inc(&ctx.stats.ierrors);
                            head = None;
                        }
                        if length == 0 || rid != 0 {
                            rxr.eof_discard(idx);
                            break 'frame;
                        }
                        match rxr.newbuf(dma, &mut self.stats) {
                            Ok(Some(buf)) => {
                                let mut pkt = Packet::from_segments([Segment::new(
                                    buf,
                                    ETHER_ALIGN,
                                    length.min(RX_BUF_LEN),
                                )]);
                                pkt.csum_flags = CsumFlags::empty();
                                head = Some(pkt);
                            }
                            Ok(None) => {
                                // Slot was already empty: nothing to deliver.
                                stats::inc(&ctx.stats.ierrors);
                                if !eop {
                                    self.discard_chain(ctx);
                                }
                                break 'frame;
                            }
                            Err(_) => {
                                stats::inc(&ctx.stats.iqdrops);
                                rxr.eof_discard(idx);
                                if !eop {
                                    self.discard_chain(ctx);
                                }
                                break 'frame;
                            }
                        }
                    } else {
                        let Some(chain) = head.as_mut() else {
                            log::warn!(
                                "{}: rxq{}: continuation at {idx} without a frame",
                                ctx.name,
                                self.id
                            );
                            stats::inc(&ctx.stats.ierrors);
                            rxr.eof_discard(idx);
                            break 'frame;
                        };
                        match rxr.newbuf(dma, &mut self.stats) {
                            Ok(Some(buf)) => {
                                chain.push_segment(Segment::new(
                                    buf,
                                    ETHER_ALIGN,
                                    length.min(RX_BUF_LEN),
                                ));
                            }
                            Ok(None) => {
                                stats::inc(&ctx.stats.ierrors);
                                if !eop {
                                    self.discard_chain(ctx);
                                }
                                head = None;
                                break 'frame;
                            }
                            Err(_) => {
                                stats::inc(&ctx.stats.iqdrops);
                                rxr.eof_discard(idx);
                                if !eop {
                                    self.discard_chain(ctx);
                                }
                                head = None;
                                break 'frame;
                            }
                        }
                    }

                    if eop {
                        if let Some(pkt) = head.take() {
                            self.input(ctx, &rxcd, pkt);
                        }
                        if !ctx.is_running() {
                            self.head = head;
                            return more;
                        }
                    }
                }
            }

            if shared_flag(&self.shared) {
                let rxr = &self.rings[rid];
                let next = (idx + 1) % rxr.len();
                let qid = if rid == 0 {
                    rxcd.qid()
                } else {
                    rxcd.qid() - ctx.nrxqueues
                };
                ctx.regs.rx_head(qid, rid, next);
            }
        }

        self.head = head;
        more
    }
}

fn shared_flag(shared: &SharedRecord<RxQueueShared>) -> bool {
    let rs = shared.ptr();
    unsafe { shared_read!(rs, update_rxhead) != 0 }
}
