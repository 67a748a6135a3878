//
// datapath.rs - receive and transmit paths against the simulated device
//
// Every test brings one queue up on a `SimDevice` with a `PollScheduler`, so
// interrupts and deferred work run only when `Rig::settle` is called.
//

mod suite;

use eui48::MacAddress;
use suite::Rig;
use suite::frames::{tcp4, udp4, udp_dst_port};
use vmxnet3::{CsumFlags, Packet, Segment, TxError, VmxConfig};
use vmxsim::{RxMeta, SimConfig};

fn udp_meta() -> RxMeta {
    RxMeta {
        ipv4: true,
        udp: true,
        csum_ok: true,
        ..Default::default()
    }
}

#[test]
fn test_rx_single_frame_delivered() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let frame = udp4(9001, b"hello");
    assert!(rig.sim.inject_rx(0, &frame, udp_meta()));
    rig.settle();

    let frames = rig.stack.take_frames();
    assert_eq!(frames.len(), 1);
    let pkt = &frames[0];
    assert_eq!(pkt.to_vec(), frame);
    assert_eq!(pkt.rcvif, Some(0));
    assert!(pkt.csum_flags.contains(CsumFlags::IPV4 | CsumFlags::UDPV4));
    assert!(!pkt.csum_flags.intersects(CsumFlags::IPV4_BAD | CsumFlags::TCP_UDP_BAD));

    let stats = rig.dev.stats();
    assert_eq!(stats.ipackets, 1);
    assert_eq!(stats.ibytes, frame.len() as u64);
    Ok(())
}

#[test]
fn test_rx_vlan_and_bad_checksum_reported() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let frame = tcp4(b"payload");
    let meta = RxMeta {
        vlan: Some(42),
        ipv4: true,
        tcp: true,
        csum_ok: false,
        ..Default::default()
    };
    assert!(rig.sim.inject_rx(0, &frame, meta));
    rig.settle();

    let frames = rig.stack.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].vlan_tag, Some(42));
    assert!(frames[0].csum_flags.contains(CsumFlags::TCPV4 | CsumFlags::TCP_UDP_BAD));
    Ok(())
}

#[test]
fn test_rx_jumbo_frame_spans_buffers() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let frame: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    assert!(rig.sim.inject_rx(0, &frame, RxMeta::default()));
    rig.settle();

    let frames = rig.stack.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].segments().len(), 3);
    assert_eq!(frames[0].to_vec(), frame);
    Ok(())
}

#[test]
fn test_rx_error_frame_dropped() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let meta = RxMeta {
        error: true,
        ..udp_meta()
    };
    assert!(rig.sim.inject_rx(0, &udp4(9001, b"bad"), meta));
    assert!(rig.sim.inject_rx(0, &udp4(9002, b"good"), udp_meta()));
    rig.settle();

    let frames = rig.stack.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(udp_dst_port(&frames[0].to_vec()), Some(9002));
    assert_eq!(rig.dev.stats().ierrors, 1);
    Ok(())
}

#[test]
fn test_rx_ring_refilled_across_laps() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let mut port = 10000;
    for _ in 0..10 {
        for _ in 0..10 {
            assert!(rig.sim.inject_rx(0, &udp4(port, b"x"), udp_meta()));
            port += 1;
        }
        rig.settle();
    }

    let ports: Vec<_> = rig
        .stack
        .take_frames()
        .iter()
        .filter_map(|p| udp_dst_port(&p.to_vec()))
        .collect();
    assert_eq!(ports, (10000..10100).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_rx_ring_exhausted_until_refilled() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    for i in 0..32 {
        assert!(rig.sim.inject_rx(0, &udp4(9000 + i, b"x"), udp_meta()));
    }
    assert!(!rig.sim.inject_rx(0, &udp4(9999, b"x"), udp_meta()));

    rig.settle();
    assert_eq!(rig.stack.frame_count(), 32);
    assert!(rig.sim.inject_rx(0, &udp4(9999, b"x"), udp_meta()));
    Ok(())
}

#[test]
fn test_rx_skipped_descriptors_reposted() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    rig.sim.skip_rx(0, 3);
    assert!(rig.sim.inject_rx(0, &udp4(9001, b"after skip"), udp_meta()));
    rig.settle();
    assert_eq!(rig.stack.frame_count(), 1);

    // The skipped slots come around again on the next lap.
    for i in 0..40 {
        assert!(rig.sim.inject_rx(0, &udp4(9100 + i, b"x"), udp_meta()));
        rig.settle();
    }
    assert_eq!(rig.stack.frame_count(), 41);
    Ok(())
}

#[test]
fn test_rx_budget_defers_to_softint() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    rig.dev.tunables().set_rx_process_limit(4);
    for i in 0..10 {
        assert!(rig.sim.inject_rx(0, &udp4(9000 + i, b"x"), udp_meta()));
    }

    assert_eq!(vmxsim::deliver_interrupts(&rig.sim, &rig.dev), 1);
    assert_eq!(rig.stack.frame_count(), 0);
    assert_eq!(rig.sched.pending_softints(), 1);

    rig.settle();
    assert_eq!(rig.stack.frame_count(), 10);
    let rx = rig.dev.rx_stats(0).expect("queue 0");
    assert_eq!(rx.intr, 1);
    assert_eq!(rx.defer, 3);
    assert_eq!(rx.deferreq, 2);
    Ok(())
}

#[test]
fn test_rx_intr_budget_processes_inline() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    rig.dev.tunables().set_rx_intr_process_limit(16);
    for i in 0..3 {
        assert!(rig.sim.inject_rx(0, &udp4(9000 + i, b"x"), udp_meta()));
    }

    vmxsim::deliver_interrupts(&rig.sim, &rig.dev);
    assert_eq!(rig.stack.frame_count(), 3);
    assert_eq!(rig.sched.pending_work(), 0);
    assert!(rig.stack.start_deferred_count() >= 1);
    Ok(())
}

#[test]
fn test_tx_send_reaches_device() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let frame = udp4(9001, b"PING");
    rig.dev.send(Packet::from_bytes(frame.clone()))?;
    assert_eq!(rig.sim.doorbells(0), vec![1]);

    let sent = rig.complete_tx(0);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data, frame);
    assert_eq!(sent[0].ndesc, 1);
    assert_eq!(sent[0].vlan, None);

    let stats = rig.dev.stats();
    assert_eq!(stats.opackets, 1);
    assert_eq!(stats.obytes, frame.len() as u64);
    Ok(())
}

#[test]
fn test_tx_doorbell_coalesced() -> anyhow::Result<()> {
    let sim = SimConfig {
        intr_threshold: 4,
        ..Default::default()
    };
    let rig = Rig::up_with(sim, suite::single_queue())?;
    for i in 0..6 {
        rig.dev.send(Packet::from_bytes(udp4(9000 + i, b"x")))?;
    }
    assert_eq!(rig.sim.doorbells(0), vec![4]);
    assert_eq!(rig.complete_tx(0).len(), 6);
    Ok(())
}

#[test]
fn test_tx_segment_chain() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let frame = udp4(9001, &[0x5a; 300]);
    let segs = [&frame[..14], &frame[14..100], &frame[100..]]
        .map(|s| Segment::from(s.to_vec()));
    rig.dev.send(Packet::from_segments(segs))?;

    let sent = rig.complete_tx(0);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ndesc, 3);
    assert_eq!(sent[0].data, frame);
    Ok(())
}

#[test]
fn test_tx_checksum_offload_and_vlan() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let pkt = Packet::from_bytes(tcp4(&[1; 100]))
        .with_offload(CsumFlags::TCPV4, 0)
        .with_vlan(100);
    rig.dev.send(pkt)?;

    let sent = rig.complete_tx(0);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].offload_mode, vmxnet3::desc::OM_CSUM);
    assert_eq!(sent[0].hlen, 34);
    assert_eq!(sent[0].offload_pos, 50);
    assert_eq!(sent[0].vlan, Some(100));
    assert_eq!(rig.dev.tx_stats(0).expect("queue 0").csum, 1);
    Ok(())
}

#[test]
fn test_tx_ring_wraps() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let mut ports = Vec::new();
    for batch in 0..10u16 {
        for i in 0..20 {
            rig.dev.send(Packet::from_bytes(udp4(batch * 100 + i, b"x")))?;
        }
        ports.extend(
            rig.complete_tx(0)
                .iter()
                .filter_map(|f| udp_dst_port(&f.data)),
        );
    }
    let expected: Vec<u16> = (0..10u16)
        .flat_map(|b| (0..20).map(move |i| b * 100 + i))
        .collect();
    assert_eq!(ports, expected);
    assert_eq!(rig.dev.stats().opackets, 200);
    Ok(())
}

#[test]
fn test_tx_send_queue_limits() -> anyhow::Result<()> {
    let sim = SimConfig {
        link: None,
        ..Default::default()
    };
    let rig = Rig::up_with(sim, suite::single_queue())?;
    assert!(!rig.dev.link_active());

    for i in 0..63 {
        rig.dev.send(Packet::from_bytes(udp4(9000 + i, b"x")))?;
    }
    assert_eq!(
        rig.dev.send(Packet::from_bytes(udp4(1, b"x"))).err(),
        Some(TxError::QueueFull)
    );
    assert_eq!(rig.dev.stats().oqdrops, 1);
    assert_eq!(rig.dev.snd_len(), 63);

    rig.sim.set_link(Some(1000));
    rig.sim.raise_event(vmxnet3::desc::Event::LINK);
    rig.settle();
    assert!(rig.dev.link_active());
    assert_eq!(rig.stack.link_events(), vec![(true, 1000)]);
    assert!(rig.stack.start_deferred_count() >= 1);

    // Room for one maximally fragmented frame is kept in reserve.
    rig.dev.start();
    assert_eq!(rig.dev.snd_len(), 31);
    assert_eq!(rig.complete_tx(0).len(), 32);
    rig.dev.start();
    assert_eq!(rig.dev.snd_len(), 0);
    assert_eq!(rig.complete_tx(0).len(), 31);
    Ok(())
}

#[test]
fn test_transmit_backlog_overflow() -> anyhow::Result<()> {
    let sim = SimConfig {
        link: None,
        ..Default::default()
    };
    let rig = Rig::up_with(sim, suite::single_queue())?;
    for i in 0..64 {
        rig.dev.transmit_on(0, Packet::from_bytes(udp4(9000 + i, b"x")))?;
    }
    assert_eq!(
        rig.dev.transmit_on(0, Packet::from_bytes(udp4(1, b"x"))).err(),
        Some(TxError::NoBufs)
    );
    assert_eq!(rig.dev.tx_stats(0).expect("queue 0").pcqdrop, 1);
    Ok(())
}

#[test]
fn test_transmit_drains_backlog() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    for i in 0..5 {
        rig.dev.transmit(Packet::from_bytes(udp4(9000 + i, b"x")))?;
    }
    let sent = rig.complete_tx(0);
    assert_eq!(sent.len(), 5);

    // Work scheduled after completion finds an empty backlog.
    rig.dev.deferred_transmit(0);
    assert!(rig.sim.process_tx(0).is_empty());
    assert!(rig.dev.tx_stats(0).expect("queue 0").transmitdef >= 1);
    Ok(())
}

#[test]
fn test_tx_spread_across_queues() -> anyhow::Result<()> {
    let config = VmxConfig {
        ncpu: Some(2),
        ..suite::single_queue()
    };
    let rig = Rig::up_with(SimConfig::default(), config)?;
    assert_eq!(rig.dev.nqueues(), 2);

    rig.dev.transmit_on(0, Packet::from_bytes(udp4(1, b"q0")))?;
    rig.dev.transmit_on(3, Packet::from_bytes(udp4(2, b"q1")))?;
    let q0 = rig.complete_tx(0);
    let q1 = rig.complete_tx(1);
    assert_eq!(q0.len(), 1);
    assert_eq!(q1.len(), 1);
    assert_eq!(udp_dst_port(&q1[0].data), Some(2));

    // Both queues receive on their own vector.
    assert!(rig.sim.inject_rx(1, &udp4(7, b"rx1"), udp_meta()));
    rig.settle();
    let frames = rig.stack.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].rcvif, Some(1));
    Ok(())
}

#[test]
fn test_multicast_filter_programmed() -> anyhow::Result<()> {
    let rig = Rig::up()?;
    let groups = [
        MacAddress::new([0x01, 0x00, 0x5e, 0, 0, 1]),
        MacAddress::new([0x01, 0x00, 0x5e, 0, 0, 2]),
    ];
    rig.dev.set_multicast(&groups);
    assert_eq!(rig.sim.multicast(), groups.to_vec());
    Ok(())
}

#[test]
fn test_rx_head_reported_on_request() -> anyhow::Result<()> {
    let sim = SimConfig {
        update_rxhead: true,
        ..Default::default()
    };
    let rig = Rig::up_with(sim, suite::single_queue())?;
    rig.sim.clear_log();
    for i in 0..2 {
        assert!(rig.sim.inject_rx(0, &udp4(9000 + i, b"x"), udp_meta()));
    }
    rig.settle();
    assert_eq!(rig.sim.rx_heads(0), vec![1, 2]);
    Ok(())
}
