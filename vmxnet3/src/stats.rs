//! # Counters
//!
//! Interface-wide counters are lock-free atomics updated from every queue; the
//! per-queue event counters live with their queue under its lock.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($(#[$meta:meta])* $name:ident / $snap:ident { $($field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)+
        }

        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $snap {
            $(pub $field: u64,)+
        }

        impl $name {
            pub fn snapshot(&self) -> $snap {
                $snap {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

counters! {
    /// Interface statistics.
    IfStats / IfStatsSnapshot {
        ipackets,
        ibytes,
        iqdrops,
        ierrors,
        opackets,
        obytes,
        omcasts,
        oerrors,
        oqdrops,
    }
}

counters! {
    /// Device event and lifecycle counters.
    EventStats / EventStatsSnapshot {
        intr,
        link,
        txqerror,
        rxqerror,
        dic,
        debug,
        reinit,
    }
}

#[inline]
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

/// Transmit queue counters, guarded by the queue's Tx lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub csum: u64,
    pub tso: u64,
    pub full: u64,
    pub offload_failed: u64,
    pub defragged: u64,
    pub defrag_failed: u64,
    pub intr: u64,
    pub defer: u64,
    pub deferreq: u64,
    pub pcqdrop: u64,
    pub transmitdef: u64,
    pub watchdogto: u64,
}

/// Receive queue counters, guarded by the queue's Rx lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStats {
    pub intr: u64,
    pub defer: u64,
    pub deferreq: u64,
    pub mgetcl_failed: u64,
    pub mbuf_load_failed: u64,
}
