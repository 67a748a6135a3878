#![cfg(test)]

use crate::desc::{INIT_GEN, TxCompDesc, TxDesc};
use crate::dma::HostDma;
use crate::ring::{CompRing, Ring};
use crate::tests::device_write;

#[test]
fn test_increment_wraps_at_capacity() {
    let ring = Ring::<TxDesc>::alloc(&HostDma, 4).unwrap();
    let mut idx = 0;
    let wraps: Vec<bool> = (0..8).map(|_| ring.increment(&mut idx)).collect();
    assert_eq!(
        wraps,
        [false, false, false, true, false, false, false, true]
    );
    assert_eq!(idx, 0);
}

#[test]
fn test_empty_ring_is_rejected() {
    assert!(Ring::<TxDesc>::alloc(&HostDma, 0).is_err());
}

#[test]
fn test_fresh_ring_is_zeroed_and_aligned() {
    let ring = Ring::<TxDesc>::alloc(&HostDma, 16).unwrap();
    assert_eq!(ring.bus_addr() % crate::ring::RING_ALIGN as u64, 0);
    for i in 0..16 {
        let d = ring.desc_at(i);
        assert_eq!((d.addr, d.word2, d.word3), (0, 0, 0));
    }
}

fn completion(eop_idx: u32, generation: u32) -> TxCompDesc {
    let mut cd = TxCompDesc::default();
    cd.set_eop_idx(eop_idx);
    cd.set_generation(generation);
    cd
}

#[test]
fn test_completion_generation_toggles_per_lap() {
    let mut comp = CompRing::<TxCompDesc>::alloc(&HostDma, 4).unwrap();
    assert!(comp.peek().is_none());

    let mut generation = INIT_GEN;
    for _lap in 0..2 {
        for i in 0..4 {
            unsafe { device_write(comp.bus_addr(), i, completion(i, generation)) };
            let cd = comp.peek().expect("completion ready");
            assert_eq!(cd.eop_idx(), i);
            comp.advance();
        }
        generation ^= 1;
        assert_eq!(comp.next(), 0);
        assert_eq!(comp.generation(), generation);
        // Slot 0 still holds last lap's entry.
        assert!(comp.peek().is_none());
    }
    assert_eq!(comp.generation(), INIT_GEN);
}

#[test]
fn test_completion_reset() {
    let mut comp = CompRing::<TxCompDesc>::alloc(&HostDma, 4).unwrap();
    unsafe { device_write(comp.bus_addr(), 0, completion(0, INIT_GEN)) };
    comp.advance();
    comp.reset();
    assert_eq!(comp.next(), 0);
    assert_eq!(comp.generation(), INIT_GEN);
    assert!(comp.peek().is_none());
}
