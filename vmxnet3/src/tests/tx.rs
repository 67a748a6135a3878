#![cfg(test)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::context::Context;
use crate::desc::{INIT_GEN, OM_CSUM, OM_TSO, TxCompDesc, TxQueueShared};
use crate::dma::{DmaRegion, HostDma, SharedRecord};
use crate::error::{EncapError, OffloadError};
use crate::packet::{CsumFlags, Packet, Segment};
use crate::regs::bar0_txh;
use crate::tests::{
    Capture, RecordingRegs, context, device_write, tcp4_frame, udp6_frame, vlan_tagged,
};
use crate::tx::{TxQueue, TxSource, WATCHDOG_TIMEOUT, offload_context};
use crate::{shared_read, shared_write};

struct Fixture {
    regs: Arc<RecordingRegs>,
    ctx: Context,
    txq: TxQueue,
    ts: *mut TxQueueShared,
    comp_cursor: (u32, u32),
    _qs: Arc<DmaRegion>,
    _backlog: mpsc::Sender<Packet>,
}

fn fixture(ndesc: u32, intr_threshold: u32) -> Fixture {
    let regs = Arc::new(RecordingRegs::default());
    let ctx = context(&regs, &Arc::new(Capture::default()));
    ctx.set_running(true);
    ctx.set_link_active(true);

    let qs = Arc::new(DmaRegion::alloc(size_of::<TxQueueShared>(), 128).unwrap());
    let shared = SharedRecord::<TxQueueShared>::new(qs.clone(), 0, 0);
    let ts = shared.ptr();
    let (backlog, interq) = mpsc::channel(ndesc as usize);
    let mut txq = TxQueue::new(0, &HostDma, ndesc, shared, interq).unwrap();
    txq.init();
    txq.publish_shared(0);
    unsafe { shared_write!(ts, intr_threshold, intr_threshold) };
    Fixture {
        regs,
        ctx,
        txq,
        ts,
        comp_cursor: (0, INIT_GEN),
        _qs: qs,
        _backlog: backlog,
    }
}

impl Fixture {
    fn send(&mut self, pkt: Packet) -> Result<(), EncapError> {
        self.txq.encap(&self.ctx, pkt)
    }

    /// Posts one completion per entry of `eops`, as the device would.
    fn complete(&mut self, eops: &[u32]) {
        let comp = unsafe { shared_read!(self.ts, comp_ring) };
        let len = unsafe { shared_read!(self.ts, comp_ring_len) };
        for &eop in eops {
            let (idx, generation) = self.comp_cursor;
            let mut cd = TxCompDesc::default();
            cd.set_eop_idx(eop);
            cd.set_generation(generation);
            unsafe { device_write(comp, idx, cd) };
            self.comp_cursor = if idx + 1 == len {
                (0, generation ^ 1)
            } else {
                (idx + 1, generation)
            };
        }
    }

    fn npending(&self) -> u32 {
        unsafe { shared_read!(self.ts, npending) }
    }
}

fn frame() -> Packet {
    Packet::from_bytes(vec![0u8; 60])
}

#[test]
fn test_avail_keeps_one_slot_free() {
    let mut f = fixture(8, u32::MAX);
    assert_eq!(f.txq.ring().avail(), 7);

    for _ in 0..5 {
        f.send(frame()).unwrap();
    }
    assert_eq!(f.txq.ring().head(), 5);
    assert_eq!(f.txq.ring().avail(), 2);

    f.complete(&[0, 1, 2]);
    assert!(!f.txq.txq_eof(&f.ctx, 256));
    assert_eq!(f.txq.ring().next(), 3);
    assert_eq!(f.txq.ring().avail(), 5);

    let stats = f.ctx.stats.snapshot();
    assert_eq!(stats.opackets, 3);
    assert_eq!(stats.obytes, 180);
}

#[test]
fn test_chain_layout() {
    let mut f = fixture(8, u32::MAX);
    let pkt = Packet::from_segments([
        Segment::from(vec![1u8; 100]),
        Segment::from(vec![2u8; 200]),
        Segment::from(vec![3u8; 300]),
    ]);
    f.send(pkt).unwrap();

    let ring = f.txq.ring();
    assert_eq!(ring.head(), 3);
    let lens: Vec<u32> = (0..3).map(|i| ring.desc_at(i).buf_len()).collect();
    assert_eq!(lens, [100, 200, 300]);
    for i in 0..3 {
        let txd = ring.desc_at(i);
        assert_eq!(txd.generation(), INIT_GEN);
        assert_eq!(txd.eop(), u32::from(i == 2));
        assert_eq!(txd.compreq(), u32::from(i == 2));
    }
    // Untouched slot stays driver-owned.
    assert_eq!(ring.desc_at(3).generation(), 0);
}

#[test]
fn test_generation_flips_on_wrap() {
    let mut f = fixture(4, u32::MAX);
    for _ in 0..3 {
        f.send(frame()).unwrap();
    }
    f.complete(&[0, 1, 2]);
    f.txq.txq_eof(&f.ctx, 256);

    f.send(frame()).unwrap();
    f.send(frame()).unwrap();
    let ring = f.txq.ring();
    assert_eq!(ring.head(), 1);
    assert_eq!(ring.generation(), INIT_GEN ^ 1);
    assert_eq!(ring.desc_at(3).generation(), INIT_GEN);
    assert_eq!(ring.desc_at(0).generation(), INIT_GEN ^ 1);
}

#[test]
fn test_doorbell_coalescing() {
    let mut f = fixture(16, 3);
    f.send(frame()).unwrap();
    f.send(frame()).unwrap();
    assert!(f.regs.bar0.lock().unwrap().is_empty());
    assert_eq!(f.npending(), 2);

    f.send(frame()).unwrap();
    assert_eq!(*f.regs.bar0.lock().unwrap(), [(bar0_txh(0), 3)]);
    assert_eq!(f.npending(), 0);

    f.send(frame()).unwrap();
    assert_eq!(f.npending(), 1);
    assert_eq!(f.regs.bar0.lock().unwrap().len(), 1);
}

#[test]
fn test_full_ring_returns_frame() {
    let mut f = fixture(4, u32::MAX);
    for _ in 0..3 {
        f.send(frame()).unwrap();
    }
    match f.send(Packet::from_bytes(vec![7u8; 77])) {
        Err(EncapError::NoSpace(pkt)) => assert_eq!(pkt.len(), 77),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(f.txq.stats.full, 1);
    assert_eq!(f.txq.ring().head(), 3);
}

fn chain(nsegs: usize) -> Packet {
    Packet::from_segments((0..nsegs).map(|i| Segment::from(vec![i as u8; 64])))
}

#[test]
fn test_chain_accepted_only_when_it_fits() {
    let mut f = fixture(8, u32::MAX);
    f.send(chain(5)).unwrap();
    assert_eq!(f.txq.ring().avail(), 2);

    match f.send(chain(3)) {
        Err(EncapError::NoSpace(pkt)) => assert_eq!(pkt.segments().len(), 3),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(f.txq.ring().head(), 5);
    assert_eq!(f.txq.stats.full, 1);

    f.send(chain(2)).unwrap();
    assert_eq!(f.txq.ring().head(), 7);
    assert_eq!(f.txq.ring().avail(), 0);
}

#[test]
fn test_defrag_when_too_many_segments() {
    let mut f = fixture(8, u32::MAX);
    let pkt = Packet::from_segments((0..40).map(|_| Segment::from(vec![9u8; 10])));
    f.send(pkt).unwrap();
    assert_eq!(f.txq.stats.defragged, 1);
    assert_eq!(f.txq.ring().head(), 1);
    let txd = f.txq.ring().desc_at(0);
    assert_eq!(txd.buf_len(), 400);
    assert_eq!(txd.eop(), 1);
}

#[test]
fn test_empty_frame_rejected() {
    let mut f = fixture(8, u32::MAX);
    assert!(matches!(f.send(Packet::default()), Err(EncapError::Empty)));
    assert_eq!(f.txq.ring().head(), 0);
}

#[test]
fn test_txq_eof_budget() {
    let mut f = fixture(8, u32::MAX);
    for _ in 0..3 {
        f.send(frame()).unwrap();
    }
    f.complete(&[0, 1, 2]);
    assert!(f.txq.txq_eof(&f.ctx, 2));
    assert_eq!(f.txq.ring().next(), 2);
    assert!(!f.txq.txq_eof(&f.ctx, 256));
    assert_eq!(f.txq.ring().next(), 3);
}

#[test]
fn test_multi_descriptor_completion() {
    let mut f = fixture(8, u32::MAX);
    let pkt = Packet::from_segments([Segment::from(vec![1u8; 64]), Segment::from(vec![2u8; 64])]);
    f.send(pkt).unwrap();
    f.send(frame()).unwrap();
    f.complete(&[1, 2]);
    f.txq.txq_eof(&f.ctx, 256);
    assert_eq!(f.txq.ring().next(), 3);
    assert_eq!(f.ctx.stats.snapshot().opackets, 2);
}

#[test]
fn test_watchdog_expires_after_timeout() {
    let mut f = fixture(64, u32::MAX);
    let snd = Mutex::new(VecDeque::from([frame()]));
    f.txq.tx_common(&f.ctx, TxSource::Snd(&snd));
    assert!(snd.lock().unwrap().is_empty());
    assert_eq!(f.txq.watchdog_counter(), WATCHDOG_TIMEOUT);

    for _ in 0..WATCHDOG_TIMEOUT - 1 {
        assert!(!f.txq.watchdog(&f.ctx));
    }
    assert!(f.txq.watchdog(&f.ctx));
    assert_eq!(f.txq.stats.watchdogto, 1);
    // Disarmed after firing.
    assert!(!f.txq.watchdog(&f.ctx));
}

#[test]
fn test_watchdog_disarmed_when_drained() {
    let mut f = fixture(8, u32::MAX);
    f.txq.arm_watchdog();
    f.send(frame()).unwrap();
    f.complete(&[0]);
    f.txq.txq_eof(&f.ctx, 256);
    assert_eq!(f.txq.watchdog_counter(), 0);
    assert!(!f.txq.watchdog(&f.ctx));
}

#[test]
fn test_tx_common_needs_link() {
    let mut f = fixture(8, u32::MAX);
    f.ctx.set_link_active(false);
    let snd = Mutex::new(VecDeque::from([frame()]));
    f.txq.tx_common(&f.ctx, TxSource::Snd(&snd));
    assert_eq!(snd.lock().unwrap().len(), 1);
    assert_eq!(f.txq.ring().head(), 0);
}

#[test]
fn test_tx_common_waits_for_worst_case_room() {
    // Fewer than TX_MAXSEGS free descriptors: nothing is taken off the queue.
    let mut f = fixture(16, u32::MAX);
    let snd = Mutex::new(VecDeque::from([frame(), frame()]));
    f.txq.tx_common(&f.ctx, TxSource::Snd(&snd));
    assert_eq!(snd.lock().unwrap().len(), 2);
}

#[test]
fn test_offload_tso_ipv4() {
    let mut pkt = Packet::from_bytes(tcp4_frame(100)).with_offload(CsumFlags::TSOV4, 1448);
    let octx = offload_context(&mut pkt).unwrap();
    assert_eq!(octx.mode, OM_TSO);
    assert_eq!(octx.hlen, 14 + 20 + 20);
    assert_eq!(octx.pos, 1448);

    // 10.0.0.1 + 10.0.0.2 + IPPROTO_TCP, folded.
    let th_sum = &pkt.segments()[0].as_slice()[14 + 20 + 16..14 + 20 + 18];
    assert_eq!(th_sum, &0x1409u16.to_be_bytes());
}

#[test]
fn test_offload_udp_ipv6_checksum() {
    let mut pkt = Packet::from_bytes(udp6_frame(32)).with_offload(CsumFlags::UDPV6, 0);
    let octx = offload_context(&mut pkt).unwrap();
    assert_eq!(octx.mode, OM_CSUM);
    assert_eq!(octx.hlen, 14 + 40);
    assert_eq!(octx.pos, 14 + 40 + 6);
}

#[test]
fn test_offload_vlan_tagged() {
    let bytes = vlan_tagged(&tcp4_frame(20), 10);
    let mut pkt = Packet::from_bytes(bytes).with_offload(CsumFlags::TCPV4, 0);
    let octx = offload_context(&mut pkt).unwrap();
    assert_eq!(octx.mode, OM_CSUM);
    assert_eq!(octx.hlen, 18 + 20);
    assert_eq!(octx.pos, 18 + 20 + 16);
}

#[test]
fn test_offload_rejects_non_ip() {
    let mut bytes = vec![0u8; 60];
    bytes[12..14].copy_from_slice(&[0x08, 0x06]);
    let mut pkt = Packet::from_bytes(bytes).with_offload(CsumFlags::TCPV4, 0);
    assert_eq!(
        offload_context(&mut pkt),
        Err(OffloadError::UnsupportedProtocol(0x0806))
    );
}

#[test]
fn test_encap_drops_unsupported_offload() {
    let mut f = fixture(8, u32::MAX);
    let mut bytes = vec![0u8; 60];
    bytes[12..14].copy_from_slice(&[0x08, 0x06]);
    let pkt = Packet::from_bytes(bytes).with_offload(CsumFlags::TCPV4, 0);
    assert!(matches!(
        f.send(pkt),
        Err(EncapError::Offload(OffloadError::UnsupportedProtocol(0x0806)))
    ));
    assert_eq!(f.txq.stats.offload_failed, 1);
    assert_eq!(f.txq.ring().head(), 0);
    assert_eq!(f.txq.ring().avail(), 7);
}

#[test]
fn test_encap_offload_and_vlan_fields() {
    let mut f = fixture(8, u32::MAX);
    let pkt = Packet::from_bytes(tcp4_frame(1000))
        .with_offload(CsumFlags::TSOV4, 536)
        .with_vlan(42);
    f.send(pkt).unwrap();
    let txd = f.txq.ring().desc_at(0);
    assert_eq!(txd.offload_mode(), OM_TSO);
    assert_eq!(txd.hlen(), 54);
    assert_eq!(txd.offload_pos(), 536);
    assert_eq!(txd.vtag_mode(), 1);
    assert_eq!(txd.vtag(), 42);
    assert_eq!(f.txq.stats.tso, 1);
}

#[test]
fn test_txstop_releases_frames() {
    let mut f = fixture(8, u32::MAX);
    f.send(frame()).unwrap();
    f.txq.txstop(&f.ctx);
    f.complete(&[0]);
    f.txq.txq_eof(&f.ctx, 256);
    // Nothing left to account for.
    assert_eq!(f.ctx.stats.snapshot().opackets, 0);
}
