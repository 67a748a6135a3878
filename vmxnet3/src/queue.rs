//! # Queue Pair
//!
//! One transmit and one receive side sharing an interrupt vector. Each side
//! has its own lock; the transmit backlog producer end and the workqueue
//! guard live outside both locks.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::context::Context;
use crate::desc::{RxQueueShared, TxQueueShared};
use crate::dma::{DmaRegion, SharedRecord};
use crate::error::TxError;
use crate::lock;
use crate::packet::Packet;
use crate::rx::RxQueue;
use crate::tx::TxQueue;

pub struct Queue {
    id: u16,
    pub tx: Mutex<TxQueue>,
    pub rx: Mutex<RxQueue>,
    interq: mpsc::Sender<Packet>,
    intr_idx: AtomicU32,
    use_workqueue: AtomicBool,
    wq_enqueued: AtomicBool,
    wq_epoch: AtomicU32,
    wq_active: Mutex<u32>,
    wq_idle: Condvar,
}

impl Queue {
    /// Allocates both sides of queue `id`; shared records are taken from
    /// `qs`, Tx records first.
    pub fn new(
        id: u16,
        ctx: &Context,
        qs: &Arc<DmaRegion>,
        ntxqueues: usize,
        ntxdescs: u32,
        nrxdescs: u32,
    ) -> Result<Self, io::Error> {
        let dma = ctx.dma.as_ref();
        let (interq_tx, interq_rx) = mpsc::channel(ntxdescs as usize);
        let ts = SharedRecord::<TxQueueShared>::new(qs.clone(), 0, id as usize);
        let rs = SharedRecord::<RxQueueShared>::new(
            qs.clone(),
            ntxqueues * size_of::<TxQueueShared>(),
            id as usize,
        );
        let tx = TxQueue::new(id, dma, ntxdescs, ts, interq_rx)?;
        let rx = RxQueue::new(id, dma, nrxdescs, rs)?;
        Ok(Queue {
            id,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            interq: interq_tx,
            intr_idx: AtomicU32::new(0),
            use_workqueue: AtomicBool::new(false),
            wq_enqueued: AtomicBool::new(false),
            wq_epoch: AtomicU32::new(0),
            wq_active: Mutex::new(0),
            wq_idle: Condvar::new(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn intr_idx(&self) -> u32 {
        self.intr_idx.load(Ordering::Relaxed)
    }

    pub fn set_intr_idx(&self, idx: u32) {
        self.intr_idx.store(idx, Ordering::Relaxed);
    }

    pub fn use_workqueue(&self) -> bool {
        self.use_workqueue.load(Ordering::Relaxed)
    }

    pub fn set_use_workqueue(&self, enabled: bool) {
        self.use_workqueue.store(enabled, Ordering::Relaxed);
    }

    /// Claims the workqueue slot and returns the ticket the item presents
    /// when it runs. `None` when an item is already queued.
    pub fn try_enqueue_work(&self) -> Option<u32> {
        if self.wq_enqueued.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.wq_epoch.load(Ordering::Acquire))
    }

    pub fn work_enqueued(&self) -> bool {
        self.wq_enqueued.load(Ordering::Acquire)
    }

    /// Marks the item holding `ticket` as running and releases the slot.
    /// Returns `false` for an item revoked by [`Queue::drain_work`].
    pub(crate) fn begin_work(&self, ticket: u32) -> bool {
        let mut active = lock(&self.wq_active);
        if self.wq_epoch.load(Ordering::Acquire) != ticket {
            return false;
        }
        *active += 1;
        self.wq_enqueued.store(false, Ordering::Release);
        true
    }

    pub(crate) fn end_work(&self) {
        let mut active = lock(&self.wq_active);
        *active -= 1;
        if *active == 0 {
            self.wq_idle.notify_all();
        }
    }

    /// Revokes the queued item, if any, and blocks until no item of this
    /// queue is running. A revoked item does nothing when it finally runs.
    pub(crate) fn drain_work(&self) {
        let mut active = lock(&self.wq_active);
        self.wq_epoch.fetch_add(1, Ordering::AcqRel);
        self.wq_enqueued.store(false, Ordering::Release);
        while *active != 0 {
            active = self
                .wq_idle
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Adds `pkt` to the transmit backlog.
    ///
    /// # Errors
    ///
    /// `NoBufs` when the backlog is full; the frame is dropped and counted.
    pub fn enqueue(&self, pkt: Packet) -> Result<(), TxError> {
        if self.interq.try_send(pkt).is_err() {
            lock(&self.tx).stats.pcqdrop += 1;
            return Err(TxError::NoBufs);
        }
        Ok(())
    }
}
