//
// main.rs - vmxnet3 loopback demo
//
// Attaches the ring engine to the simulated device, sends a burst of UDP
// frames, loops every transmitted frame back into the receive ring and waits
// until the capturing stack has seen all of them.
//
// Usage: vmxsim [count] [payload]
//

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use etherparse::PacketBuilder;
use tokio_util::sync::CancellationToken;
use vmxnet3::{Device, HostDma, Packet, TokioScheduler, VmxConfig};
use vmxsim::{CaptureStack, RxMeta, SimConfig, SimDevice, deliver_interrupts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let count: usize = match args.get(1) {
        Some(s) => s.parse().context("count must be a number")?,
        None => 16,
    };
    let payload = args.get(2).map_or("PING", String::as_str).as_bytes().to_vec();

    let sim = Arc::new(SimDevice::new(SimConfig::default()));
    let stack = Arc::new(CaptureStack::new());
    let dev = Device::attach(
        sim.clone(),
        Arc::new(HostDma),
        stack.clone(),
        Arc::new(TokioScheduler::current()),
        VmxConfig {
            name: Some("vmx0".into()),
            ncpu: Some(1),
            ..Default::default()
        },
    )?;
    dev.init()?;
    log::info!("{}: up, link {}", dev.name(), dev.link_active());

    let src = dev.lladdr().to_array();
    for i in 0..count {
        let mut frame = Vec::new();
        PacketBuilder::ethernet2(src, [0xff; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(9000, 9001 + i as u16)
            .write(&mut frame, &payload)
            .map_err(|e| anyhow!("cannot build frame: {e}"))?;
        dev.send(Packet::from_bytes(frame))?;
    }

    let shutdown = CancellationToken::new();
    let pump = {
        let sim = sim.clone();
        let dev = dev.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                for f in sim.process_tx(0) {
                    let meta = RxMeta {
                        ipv4: true,
                        udp: true,
                        csum_ok: true,
                        ..Default::default()
                    };
                    if !sim.inject_rx(0, &f.data, meta) {
                        log::warn!("receive ring full, dropping looped frame");
                    }
                }
                deliver_interrupts(&sim, &dev);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                }
            }
        })
    };

    let waited = tokio::time::timeout(Duration::from_secs(5), stack.wait_frames(count)).await;
    shutdown.cancel();
    pump.await?;
    waited.map_err(|_| anyhow!("timed out with {} of {count} frames", stack.frame_count()))?;

    let frames = stack.take_frames();
    for pkt in frames.iter().take(4) {
        log::info!("received {pkt:?}");
    }
    let stats = dev.stats();
    log::info!(
        "opackets {} obytes {} ipackets {} ibytes {}",
        stats.opackets,
        stats.obytes,
        stats.ipackets,
        stats.ibytes
    );
    dev.detach();
    Ok(())
}
