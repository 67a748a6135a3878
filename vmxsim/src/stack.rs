use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use vmxnet3::{NetStack, Packet, lock};

/// A network stack that keeps everything the device hands up.
#[derive(Debug, Default)]
pub struct CaptureStack {
    frames: Mutex<Vec<Packet>>,
    links: Mutex<Vec<(bool, u32)>>,
    start_deferred: AtomicUsize,
    arrived: Notify,
}

impl CaptureStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames received so far, oldest first. The capture is emptied.
    pub fn take_frames(&self) -> Vec<Packet> {
        std::mem::take(&mut *lock(&self.frames))
    }

    pub fn frame_count(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn link_events(&self) -> Vec<(bool, u32)> {
        lock(&self.links).clone()
    }

    pub fn start_deferred_count(&self) -> usize {
        self.start_deferred.load(Ordering::Relaxed)
    }

    /// Waits until at least `n` frames have been captured.
    pub async fn wait_frames(&self, n: usize) {
        loop {
            let notified = self.arrived.notified();
            if self.frame_count() >= n {
                return;
            }
            notified.await;
        }
    }
}

impl NetStack for CaptureStack {
    fn input(&self, pkt: Packet) {
        log::trace!("stack: input {} bytes", pkt.len());
        lock(&self.frames).push(pkt);
        self.arrived.notify_waiters();
    }

    fn link_state_changed(&self, up: bool, speed_mbps: u32) {
        lock(&self.links).push((up, speed_mbps));
    }

    fn start_deferred(&self) {
        self.start_deferred.fetch_add(1, Ordering::Relaxed);
    }
}
