//! # Device
//!
//! ## Purpose
//!
//! Ties the queues to the control plane: attach-time negotiation, the
//! init/stop lifecycle, the interrupt entry points, deferred completion work,
//! the 1 s tick and both transmit submission paths.
//!
//! ## How it works
//!
//! Interrupt handlers drain each direction of a queue with the interrupt
//! budgets. When work remains they hand the queue to a softint or, if the
//! workqueue policy is on, to a workqueue item; otherwise they unmask the
//! vector. Deferred handlers drain again with the deferred budgets and
//! reschedule themselves until the rings are empty.
//!
//! Scheduled tasks hold a `Weak<Device>`, so work still queued after the
//! device is gone finds nothing to run against.
//!
//! Lock order is the device state lock, then a queue's Rx lock, then its Tx
//! lock, then the interface send queue. `NetStack` callbacks made from the
//! receive path run under the Rx lock; callbacks made from event handling run
//! under the device lock and must not call back into the configuration
//! methods.
//!
//! ## Main components
//!
//! - `Device::attach()`: version check, interrupt selection, shared area.
//! - `Device::init()` / `Device::stop()`: lifecycle.
//! - `queue_intr()`, `legacy_intr()`, `event_intr()`: interrupt entry points.
//! - `send()` / `start()` and `transmit()`: direct and concurrent submission.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::time::Duration;

use eui48::MacAddress;
use tokio_util::sync::CancellationToken;

use crate::config::{
    IntrResources, MAX_MTU, MAX_TX_QUEUES, MIN_MTU, Tunables, VmxConfig, calc_queue_size,
};
use crate::context::{Context, NetStack};
use crate::desc::{
    DRIVER_VERSION, DriverShared, Event, GOS_64BIT, GOS_LINUX, ICTRL_DISABLE_ALL, IMOD_ADAPTIVE,
    REV1_MAGIC, RxMode, RxQueueShared, TxQueueShared, UPT_VERSION, UPT1_F_CSUM, UPT1_F_VLAN,
    UptRxStats, UptTxStats, VLAN_FILTER_WORDS,
};
use crate::dispatch::Scheduler;
use crate::dma::{BusDma, DmaRegion};
use crate::error::{Error, TxError};
use crate::packet::Packet;
use crate::queue::Queue;
use crate::regs::{BAR1_EVENT, BAR1_INTR, Command, ControlPlane, IntrMaskMode, IntrType, Registers};
use crate::rx::RXRINGS_PERQ;
use crate::stats::{self, EventStats, EventStatsSnapshot, IfStatsSnapshot, RxStats, TxStats};
use crate::tx::TxSource;
use crate::{lock, shared_read, shared_write};

/// Period of the watchdog and statistics tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Multicast table entries before the filter falls back to all-multicast.
pub const MULTICAST_MAX: usize = 32;

const ETHER_ADDR_LEN: usize = 6;

struct DeviceState {
    lladdr: MacAddress,
    mtu: u32,
    tick: Option<CancellationToken>,
    promisc: bool,
    allmulti: bool,
    mcast: Vec<MacAddress>,
}

pub struct Device {
    this: Weak<Device>,
    ctx: Arc<Context>,
    sched: Arc<dyn Scheduler>,
    queues: Vec<Arc<Queue>>,
    state: Mutex<DeviceState>,
    snd: Mutex<VecDeque<Packet>>,
    snd_maxlen: usize,
    ds: DmaRegion,
    mcast: DmaRegion,
    qs: Arc<DmaRegion>,
    intr_type: IntrType,
    intr_mask_mode: IntrMaskMode,
    nintrs: u32,
    event_intr_idx: u32,
    events: EventStats,
}

/// Picks the interrupt method and the number of active queue pairs.
/// Returns `(type, nqueues, nintrs)`.
fn select_interrupts(
    configured: IntrType,
    res: IntrResources,
    max_queues: u32,
) -> Result<(IntrType, u32, u32), Error> {
    let required = max_queues + 1;
    if matches!(configured, IntrType::Auto | IntrType::Msix) && res.msix_vectors >= required {
        return Ok((IntrType::Msix, max_queues, required));
    }
    if configured != IntrType::Legacy && res.msi_vectors >= 1 {
        return Ok((IntrType::Msi, 1, 1));
    }
    if res.legacy {
        return Ok((IntrType::Legacy, 1, 1));
    }
    Err(Error::NoInterrupts)
}

impl Device {
    /// Negotiates with the device behind `regs` and allocates its queues.
    /// The device is left stopped; call [`Device::init`] to bring it up.
    ///
    /// Only the queues the interrupt method can serve are allocated, not the
    /// per-CPU maximum; the count never changes after attach.
    ///
    /// # Errors
    ///
    /// Version mismatch, no usable interrupt method, or DMA allocation failure.
    pub fn attach(
        regs: Arc<dyn Registers>,
        dma: Arc<dyn BusDma>,
        stack: Arc<dyn NetStack>,
        sched: Arc<dyn Scheduler>,
        config: VmxConfig,
    ) -> Result<Arc<Device>, Error> {
        let name = config.name();
        let regs = ControlPlane::new(regs);
        regs.check_version()?;

        let mtu = config.mtu();
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::InvalidMtu(mtu));
        }

        let max_queues = calc_queue_size(MAX_TX_QUEUES.min(config.ncpu()));
        let (configured, intr_mask_mode) = regs.intr_config();
        let (intr_type, nqueues, nintrs) =
            select_interrupts(configured, config.intr(), max_queues)?;
        let event_intr_idx = if intr_type == IntrType::Msix { nqueues } else { 0 };

        let ntxdescs = config.ntxdescs();
        let nrxdescs = config.nrxdescs();
        let ctx = Arc::new(Context::new(
            name,
            regs,
            dma.clone(),
            stack,
            Tunables::from_config(&config),
            nqueues,
            nqueues,
        ));

        let ds = dma.alloc_region(size_of::<DriverShared>(), 8)?;
        let qs_len =
            nqueues as usize * (size_of::<TxQueueShared>() + size_of::<RxQueueShared>());
        let qs = Arc::new(dma.alloc_region(qs_len, 128)?);
        let mcast = dma.alloc_region(MULTICAST_MAX * ETHER_ADDR_LEN, 32)?;

        let mut queues = Vec::with_capacity(nqueues as usize);
        for id in 0..nqueues {
            let q = Queue::new(
                id as u16,
                &ctx,
                &qs,
                nqueues as usize,
                ntxdescs,
                nrxdescs,
            )?;
            q.set_intr_idx(if intr_type == IntrType::Msix { id } else { 0 });
            queues.push(Arc::new(q));
        }

        let lladdr = ctx.regs.get_lladdr();
        let device = Arc::new_cyclic(|this| Device {
            this: this.clone(),
            ctx,
            sched,
            queues,
            state: Mutex::new(DeviceState {
                lladdr,
                mtu,
                tick: None,
                promisc: false,
                allmulti: false,
                mcast: Vec::new(),
            }),
            snd: Mutex::new(VecDeque::new()),
            snd_maxlen: ntxdescs as usize - 1,
            ds,
            mcast,
            qs,
            intr_type,
            intr_mask_mode,
            nintrs,
            event_intr_idx,
            events: EventStats::default(),
        });
        device.init_shared_data();

        log::info!(
            "{}: attached, {} queue(s), {:?} interrupts ({:?} mask), address {lladdr}",
            device.ctx.name,
            nqueues,
            intr_type,
            intr_mask_mode,
        );
        Ok(device)
    }

    fn ds(&self) -> *mut DriverShared {
        self.ds.as_ptr::<DriverShared>()
    }

    /// Fills the parts of the shared area that stay fixed across reinits.
    fn init_shared_data(&self) {
        let ds = self.ds();
        unsafe {
            shared_write!(ds, magic, REV1_MAGIC);
            shared_write!(ds, version, DRIVER_VERSION);
            shared_write!(ds, guest, GOS_LINUX | GOS_64BIT);
            shared_write!(ds, vmxnet3_revision, 1);
            shared_write!(ds, upt_version, UPT_VERSION);
            shared_write!(ds, driver_data, 0);
            shared_write!(ds, driver_data_len, 0);
            shared_write!(ds, queue_shared, self.qs.bus_addr());
            shared_write!(ds, queue_shared_len, self.qs.len() as u32);
            shared_write!(ds, nrxsg_max, RXRINGS_PERQ as u16);

            shared_write!(ds, automask, u8::from(self.intr_mask_mode == IntrMaskMode::Auto));
            shared_write!(ds, nintr, self.nintrs as u8);
            shared_write!(ds, evintr, self.event_intr_idx as u8);
            shared_write!(ds, ictrl, ICTRL_DISABLE_ALL);
            for i in 0..self.nintrs as usize {
                shared_write!(ds, modlevel[i], IMOD_ADAPTIVE);
            }

            shared_write!(ds, mcast_table, self.mcast.bus_addr());
            shared_write!(ds, mcast_tablelen, 0);
        }
        for q in &self.queues {
            lock(&q.tx).publish_shared(q.intr_idx());
            lock(&q.rx).publish_shared(q.intr_idx());
        }
    }

    fn reinit_shared_data(&self, st: &DeviceState) {
        let ds = self.ds();
        unsafe {
            shared_write!(ds, mtu, st.mtu);
            shared_write!(ds, ntxqueue, self.ctx.ntxqueues as u8);
            shared_write!(ds, nrxqueue, self.ctx.nrxqueues as u8);
            shared_write!(ds, upt_features, UPT1_F_CSUM | UPT1_F_VLAN);
        }
        self.ctx.regs.set_shared_addr(self.ds.bus_addr());
    }

    /// Brings the device up, stopping it first if it was running.
    ///
    /// # Errors
    ///
    /// Rx population or the enable command failed; the device is left stopped.
    pub fn init(&self) -> Result<(), Error> {
        let mut st = lock(&self.state);
        self.init_locked(&mut st)
    }

    fn init_locked(&self, st: &mut DeviceState) -> Result<(), Error> {
        self.stop_locked(st);

        if let Err(e) = self.reinit(st) {
            log::error!("{}: init failed: {e}", self.ctx.name);
            self.stop_locked(st);
            return Err(e);
        }

        self.ctx.set_running(true);
        stats::inc(&self.events.reinit);
        self.if_link_status();
        self.enable_all_intrs();
        self.schedule_tick(st);
        Ok(())
    }

    fn reinit(&self, st: &DeviceState) -> Result<(), Error> {
        self.ctx.regs.set_lladdr(&st.lladdr);
        self.reinit_shared_data(st);
        self.reinit_queues()?;
        self.enable_device()?;
        self.reinit_rxfilters(st);
        Ok(())
    }

    fn reinit_queues(&self) -> Result<(), Error> {
        for q in &self.queues {
            lock(&q.tx).init();
        }
        for q in &self.queues {
            lock(&q.rx).init(&self.ctx)?;
        }
        Ok(())
    }

    fn enable_device(&self) -> Result<(), Error> {
        if self.ctx.regs.read_cmd(Command::Enable) != 0 {
            log::error!("{}: device enable command failed", self.ctx.name);
            return Err(Error::EnableFailed);
        }
        for q in &self.queues {
            for ring in 0..RXRINGS_PERQ {
                self.ctx.regs.rx_head(q.id() as u32, ring, 0);
            }
        }
        Ok(())
    }

    /// Quiesces every queue and resets the device.
    pub fn stop(&self) {
        let mut st = lock(&self.state);
        self.stop_locked(&mut st);
    }

    fn stop_locked(&self, st: &mut DeviceState) {
        self.ctx.set_running(false);
        self.ctx.set_link_active(false);
        if let Some(tick) = st.tick.take() {
            tick.cancel();
        }

        self.disable_all_intrs();
        self.ctx.regs.write_cmd(Command::Disable);

        self.stop_rendezvous();

        for q in &self.queues {
            lock(&q.tx).txstop(&self.ctx);
        }
        for q in &self.queues {
            lock(&q.rx).rxstop(&self.ctx);
        }

        self.ctx.regs.write_cmd(Command::Reset);
    }

    /// Waits until no completion processor holds a queue lock, and drains
    /// the workqueue of every queue.
    fn stop_rendezvous(&self) {
        for q in &self.queues {
            drop(lock(&q.rx));
        }
        for q in &self.queues {
            drop(lock(&q.tx));
        }
        for q in &self.queues {
            q.drain_work();
        }
    }

    /// Stops the device and drops every frame still waiting to be sent.
    pub fn detach(&self) {
        self.stop();
        let mut dropped = lock(&self.snd).drain(..).count();
        for q in &self.queues {
            dropped += lock(&q.tx).purge_backlog();
        }
        if dropped > 0 {
            log::debug!("{}: detach dropped {dropped} queued frame(s)", self.ctx.name);
        }
        log::info!("{}: detached", self.ctx.name);
    }

    fn enable_all_intrs(&self) {
        let ds = self.ds();
        unsafe {
            let ictrl = shared_read!(ds, ictrl);
            shared_write!(ds, ictrl, ictrl & !ICTRL_DISABLE_ALL);
        }
        for irq in 0..self.nintrs {
            self.ctx.regs.enable_intr(irq);
        }
    }

    fn disable_all_intrs(&self) {
        let ds = self.ds();
        unsafe {
            let ictrl = shared_read!(ds, ictrl);
            shared_write!(ds, ictrl, ictrl | ICTRL_DISABLE_ALL);
        }
        for irq in 0..self.nintrs {
            self.ctx.regs.disable_intr(irq);
        }
    }

    /// Refreshes link state from the device. Returns whether the link is up.
    fn if_link_status(&self) -> bool {
        let speed = self.ctx.regs.link_status();
        let up = speed.is_some();
        if up != self.ctx.link_active() {
            self.ctx.set_link_active(up);
            match speed {
                Some(mbps) => log::info!("{}: link up, {mbps} Mbps", self.ctx.name),
                None => log::info!("{}: link down", self.ctx.name),
            }
            self.ctx.stack.link_state_changed(up, speed.unwrap_or(0));
        }
        up
    }

    fn event_pending(&self) -> bool {
        let ds = self.ds();
        unsafe { shared_read!(ds, event) != 0 }
    }

    /// Reads, acknowledges and services pending device events.
    fn evintr(&self) {
        let mut st = lock(&self.state);
        let name = &self.ctx.name;

        let ds = self.ds();
        let raw = unsafe { shared_read!(ds, event) };
        self.ctx.regs.write_bar1(BAR1_EVENT, raw);
        let event = Event::from_bits_retain(raw);

        if event.contains(Event::LINK) {
            stats::inc(&self.events.link);
            if self.if_link_status() {
                self.ctx.stack.start_deferred();
            }
        }

        let mut reset = false;
        if event.intersects(Event::TQERROR | Event::RQERROR) {
            if event.contains(Event::TQERROR) {
                stats::inc(&self.events.txqerror);
            }
            if event.contains(Event::RQERROR) {
                stats::inc(&self.events.rxqerror);
            }
            reset = true;
            self.ctx.regs.read_cmd(Command::GetStatus);
            for q in &self.queues {
                let (stopped, error) = lock(&q.tx).device_status();
                if stopped {
                    log::error!("{name}: Tx queue {} error {error:#x}", q.id());
                }
            }
            for q in &self.queues {
                let (stopped, error) = lock(&q.rx).device_status();
                if stopped {
                    log::error!("{name}: Rx queue {} error {error:#x}", q.id());
                }
            }
            log::error!("{name}: Rx/Tx queue error event, resetting");
        }

        if event.contains(Event::DIC) {
            stats::inc(&self.events.dic);
            log::info!("{name}: device implementation change event");
        }
        if event.contains(Event::DEBUG) {
            stats::inc(&self.events.debug);
            log::info!("{name}: debug event");
        }

        if reset {
            if let Err(e) = self.init_locked(&mut st) {
                log::error!("{name}: reinit after queue error failed: {e}");
            }
        }
    }

    /// Per-queue vector handler (MSI-X). Returns `false` for an unknown queue.
    pub fn queue_intr(&self, qid: usize) -> bool {
        let Some(q) = self.queues.get(qid) else {
            return false;
        };
        let tun = &self.ctx.tunables;
        q.set_use_workqueue(tun.txrx_workqueue());

        if self.intr_mask_mode == IntrMaskMode::Active {
            self.ctx.regs.disable_intr(q.intr_idx());
        }

        let txmore = {
            let mut tx = lock(&q.tx);
            tx.stats.intr += 1;
            tx.txq_eof(&self.ctx, tun.tx_intr_process_limit())
        };
        let rxmore = {
            let mut rx = lock(&q.rx);
            rx.stats.intr += 1;
            rx.rxq_eof(&self.ctx, tun.rx_intr_process_limit())
        };

        if txmore || rxmore {
            self.sched_handle_queue(q);
        } else {
            if qid == 0 {
                self.ctx.stack.start_deferred();
            }
            self.sched_deferred_transmit(qid);
            self.ctx.regs.enable_intr(q.intr_idx());
        }
        true
    }

    /// Shared vector handler (INTx and MSI). Returns `false` when the
    /// interrupt was not raised by this device.
    pub fn legacy_intr(&self) -> bool {
        if self.intr_type == IntrType::Legacy && self.ctx.regs.read_bar1(BAR1_INTR) == 0 {
            return false;
        }
        if self.intr_mask_mode == IntrMaskMode::Active {
            self.disable_all_intrs();
        }

        if self.event_pending() {
            self.evintr();
        }

        let Some(q) = self.queues.first() else {
            return true;
        };
        let tun = &self.ctx.tunables;
        let rxmore = lock(&q.rx).rxq_eof(&self.ctx, tun.rx_intr_process_limit());
        let txmore = lock(&q.tx).txq_eof(&self.ctx, tun.tx_intr_process_limit());

        if txmore || rxmore {
            self.sched_handle_queue(q);
        } else {
            self.ctx.stack.start_deferred();
            self.enable_all_intrs();
        }
        true
    }

    /// Event vector handler (MSI-X).
    pub fn event_intr(&self) -> bool {
        if self.intr_mask_mode == IntrMaskMode::Active {
            self.ctx.regs.disable_intr(self.event_intr_idx);
        }

        stats::inc(&self.events.intr);
        if self.event_pending() {
            self.evintr();
        }

        self.ctx.regs.enable_intr(self.event_intr_idx);
        true
    }

    /// Deferred completion processing for one queue.
    fn handle_queue(&self, qid: usize) {
        let Some(q) = self.queues.get(qid) else {
            return;
        };
        // Stale after a stop: the vector stays masked until the next init.
        if !self.ctx.is_running() {
            return;
        }
        let tun = &self.ctx.tunables;

        let txmore = {
            let mut tx = lock(&q.tx);
            tx.stats.defer += 1;
            let more = tx.txq_eof(&self.ctx, tun.tx_process_limit());
            if more {
                tx.stats.deferreq += 1;
            }
            more
        };
        if qid == 0 {
            self.ctx.stack.start_deferred();
        }
        self.sched_deferred_transmit(qid);

        let rxmore = {
            let mut rx = lock(&q.rx);
            rx.stats.defer += 1;
            let more = rx.rxq_eof(&self.ctx, tun.rx_process_limit());
            if more {
                rx.stats.deferreq += 1;
            }
            more
        };

        if txmore || rxmore {
            self.sched_handle_queue(q);
        } else {
            self.ctx.regs.enable_intr(q.intr_idx());
        }
    }

    fn handle_queue_work(&self, qid: usize, ticket: u32) {
        let Some(q) = self.queues.get(qid) else {
            return;
        };
        if !q.begin_work(ticket) {
            log::debug!("{}: queue {qid}: revoked work item skipped", self.ctx.name);
            return;
        }
        self.handle_queue(qid);
        q.end_work();
    }

    fn sched_handle_queue(&self, q: &Queue) {
        let qid = q.id() as usize;
        let this = self.this.clone();
        if q.use_workqueue() {
            if let Some(ticket) = q.try_enqueue_work() {
                self.sched.workqueue(Box::new(move || {
                    if let Some(dev) = this.upgrade() {
                        dev.handle_queue_work(qid, ticket);
                    }
                }));
            }
        } else {
            self.sched.softint(Box::new(move || {
                if let Some(dev) = this.upgrade() {
                    dev.handle_queue(qid);
                }
            }));
        }
    }

    fn sched_deferred_transmit(&self, qid: usize) {
        let this = self.this.clone();
        self.sched.softint(Box::new(move || {
            if let Some(dev) = this.upgrade() {
                dev.deferred_transmit(qid);
            }
        }));
    }

    fn schedule_tick(&self, st: &mut DeviceState) {
        let token = CancellationToken::new();
        if let Some(old) = st.tick.replace(token.clone()) {
            old.cancel();
        }
        let this = self.this.clone();
        self.sched.callout(
            TICK_INTERVAL,
            token,
            Box::new(move || {
                if let Some(dev) = this.upgrade() {
                    dev.tick();
                }
            }),
        );
    }

    /// Refreshes device counters and runs the transmit watchdogs.
    fn tick(&self) {
        let mut st = lock(&self.state);
        if !self.ctx.is_running() {
            return;
        }

        self.refresh_host_stats();

        let mut timedout = false;
        for q in &self.queues {
            timedout |= lock(&q.tx).watchdog(&self.ctx);
        }

        if timedout {
            if let Err(e) = self.init_locked(&mut st) {
                log::error!("{}: reinit after watchdog timeout failed: {e}", self.ctx.name);
            }
        } else {
            self.schedule_tick(&mut st);
        }
    }

    /// Asks the device to refresh the counters in the queue shared records.
    pub fn refresh_host_stats(&self) {
        self.ctx.regs.write_cmd(Command::GetStats);
    }

    /// Queues `pkt` on the interface send queue and starts transmission.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the send queue is at its limit; the frame is dropped.
    pub fn send(&self, pkt: Packet) -> Result<(), TxError> {
        {
            let mut snd = lock(&self.snd);
            if snd.len() >= self.snd_maxlen {
                stats::inc(&self.ctx.stats.oqdrops);
                return Err(TxError::QueueFull);
            }
            snd.push_back(pkt);
        }
        self.start();
        Ok(())
    }

    /// Moves frames from the interface send queue onto queue 0.
    pub fn start(&self) {
        if let Some(q) = self.queues.first() {
            lock(&q.tx).tx_common(&self.ctx, TxSource::Snd(&self.snd));
        }
    }

    /// Submits `pkt` on the queue of the current CPU.
    ///
    /// # Errors
    ///
    /// `NoBufs` when that queue's backlog is full.
    pub fn transmit(&self, pkt: Packet) -> Result<(), TxError> {
        self.transmit_on(self.select_txqueue(), pkt)
    }

    /// Submits `pkt` on queue `qid` (taken modulo the active queue count).
    ///
    /// The frame goes through the queue's backlog. If the Tx lock is free the
    /// backlog is drained right away, otherwise a softint drains it.
    pub fn transmit_on(&self, qid: usize, pkt: Packet) -> Result<(), TxError> {
        let qid = qid % self.queues.len().max(1);
        let Some(q) = self.queues.get(qid) else {
            return Err(TxError::NoBufs);
        };
        q.enqueue(pkt)?;

        let guard = match q.tx.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        match guard {
            Some(mut tx) => tx.tx_common(&self.ctx, TxSource::Interq),
            None => self.sched_deferred_transmit(qid),
        }
        Ok(())
    }

    fn select_txqueue(&self) -> usize {
        let cpu = unsafe { libc::sched_getcpu() };
        usize::try_from(cpu).unwrap_or(0) % self.queues.len().max(1)
    }

    /// Drains the backlog of queue `qid`.
    pub fn deferred_transmit(&self, qid: usize) {
        let Some(q) = self.queues.get(qid) else {
            return;
        };
        let mut tx = lock(&q.tx);
        tx.stats.transmitdef += 1;
        if tx.has_backlog() {
            tx.tx_common(&self.ctx, TxSource::Interq);
        }
    }

    /// Runs one deferred pass over queue `qid` from poll context.
    pub fn poll_queue(&self, qid: usize) {
        self.handle_queue(qid);
    }

    /// Changes the MTU, reinitializing a running device.
    ///
    /// # Errors
    ///
    /// `InvalidMtu` outside 60..=9000, or a failed reinit.
    pub fn set_mtu(&self, mtu: u32) -> Result<(), Error> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::InvalidMtu(mtu));
        }
        let mut st = lock(&self.state);
        if st.mtu == mtu {
            return Ok(());
        }
        st.mtu = mtu;
        if self.ctx.is_running() {
            self.init_locked(&mut st)?;
        }
        Ok(())
    }

    pub fn mtu(&self) -> u32 {
        lock(&self.state).mtu
    }

    pub fn lladdr(&self) -> MacAddress {
        lock(&self.state).lladdr
    }

    /// Programs a new station address.
    pub fn set_lladdr(&self, mac: MacAddress) {
        let mut st = lock(&self.state);
        st.lladdr = mac;
        self.ctx.regs.set_lladdr(&mac);
    }

    pub fn set_promisc(&self, enabled: bool) {
        self.update_rxfilter(|st| st.promisc = enabled);
    }

    pub fn set_allmulti(&self, enabled: bool) {
        self.update_rxfilter(|st| st.allmulti = enabled);
    }

    /// Replaces the multicast group list.
    pub fn set_multicast(&self, groups: &[MacAddress]) {
        self.update_rxfilter(|st| st.mcast = groups.to_vec());
    }

    fn update_rxfilter(&self, f: impl FnOnce(&mut DeviceState)) {
        let mut st = lock(&self.state);
        f(&mut st);
        if self.ctx.is_running() {
            self.set_rxfilter(&st);
        }
    }

    fn set_rxfilter(&self, st: &DeviceState) {
        let ds = self.ds();
        let mut mode = RxMode::BCAST | RxMode::UCAST;
        let mut tablelen = 0;

        if st.promisc || st.allmulti || st.mcast.len() > MULTICAST_MAX {
            mode |= RxMode::ALLMULTI | RxMode::MCAST;
            if st.promisc {
                mode |= RxMode::PROMISC;
            }
        } else if !st.mcast.is_empty() {
            let table = self.mcast.as_ptr::<u8>();
            for (i, addr) in st.mcast.iter().enumerate() {
                for (j, b) in addr.as_bytes().iter().enumerate() {
                    unsafe { table.add(i * ETHER_ADDR_LEN + j).write_volatile(*b) };
                }
            }
            mode |= RxMode::MCAST;
            tablelen = st.mcast.len() * ETHER_ADDR_LEN;
        }

        unsafe { shared_write!(ds, mcast_tablelen, tablelen as u16) };
        self.ctx.regs.write_cmd(Command::SetFilter);
        unsafe { shared_write!(ds, rxmode, mode.bits()) };
        self.ctx.regs.write_cmd(Command::SetRxMode);
    }

    fn reinit_rxfilters(&self, st: &DeviceState) {
        self.set_rxfilter(st);

        let ds = self.ds();
        for i in 0..VLAN_FILTER_WORDS {
            unsafe { shared_write!(ds, vlan_filter[i], 0) };
        }
        self.ctx.regs.write_cmd(Command::VlanFilter);
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    pub fn link_active(&self) -> bool {
        self.ctx.link_active()
    }

    pub fn intr_type(&self) -> IntrType {
        self.intr_type
    }

    pub fn intr_mask_mode(&self) -> IntrMaskMode {
        self.intr_mask_mode
    }

    pub fn nqueues(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, qid: usize) -> Option<&Arc<Queue>> {
        self.queues.get(qid)
    }

    pub fn tunables(&self) -> &Tunables {
        &self.ctx.tunables
    }

    pub fn stats(&self) -> IfStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn event_stats(&self) -> EventStatsSnapshot {
        self.events.snapshot()
    }

    pub fn tx_stats(&self, qid: usize) -> Option<TxStats> {
        self.queues.get(qid).map(|q| lock(&q.tx).stats)
    }

    pub fn rx_stats(&self, qid: usize) -> Option<RxStats> {
        self.queues.get(qid).map(|q| lock(&q.rx).stats)
    }

    /// Device-maintained counters of queue `qid`, as of the last refresh.
    pub fn host_stats(&self, qid: usize) -> Option<(UptTxStats, UptRxStats)> {
        let q = self.queues.get(qid)?;
        let rx = lock(&q.rx).host_stats();
        let tx = lock(&q.tx).host_stats();
        Some((tx, rx))
    }

    /// Frames waiting in the interface send queue.
    pub fn snd_len(&self) -> usize {
        lock(&self.snd).len()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.ctx.is_running() {
            let mut st = lock(&self.state);
            self.stop_locked(&mut st);
        }
    }
}
