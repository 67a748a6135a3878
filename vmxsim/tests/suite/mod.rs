#![allow(dead_code)]

pub mod frames;

use std::sync::Arc;

use vmxnet3::{Device, HostDma, PollScheduler, VmxConfig};
use vmxsim::{CaptureStack, SimConfig, SimDevice, deliver_interrupts};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A device attached to the simulator with caller-driven deferred work.
pub struct Rig {
    pub sim: Arc<SimDevice>,
    pub stack: Arc<CaptureStack>,
    pub sched: Arc<PollScheduler>,
    pub dev: Arc<Device>,
}

impl Rig {
    pub fn attach(sim: SimConfig, config: VmxConfig) -> anyhow::Result<Rig> {
        init_logger();
        let sim = Arc::new(SimDevice::new(sim));
        let stack = Arc::new(CaptureStack::new());
        let sched = Arc::new(PollScheduler::new());
        let dev = Device::attach(
            sim.clone(),
            Arc::new(HostDma),
            stack.clone(),
            sched.clone(),
            config,
        )?;
        Ok(Rig {
            sim,
            stack,
            sched,
            dev,
        })
    }

    /// One queue, default sizes, brought up.
    pub fn up() -> anyhow::Result<Rig> {
        Rig::up_with(SimConfig::default(), single_queue())
    }

    pub fn up_with(sim: SimConfig, config: VmxConfig) -> anyhow::Result<Rig> {
        let rig = Rig::attach(sim, config)?;
        rig.dev.init()?;
        Ok(rig)
    }

    /// Delivers interrupts and runs deferred work until both go quiet.
    pub fn settle(&self) -> usize {
        let mut total = 0;
        loop {
            let n = deliver_interrupts(&self.sim, &self.dev) + self.sched.run_pending();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Lets the device consume queue `qid` and settles the completions.
    pub fn complete_tx(&self, qid: usize) -> Vec<vmxsim::TxFrame> {
        let frames = self.sim.process_tx(qid);
        self.settle();
        frames
    }
}

pub fn single_queue() -> VmxConfig {
    VmxConfig {
        name: Some("vmx0".into()),
        ncpu: Some(1),
        ntxdescs: Some(64),
        nrxdescs: Some(32),
        ..Default::default()
    }
}
