//! # Device Memory Layouts
//!
//! ## Purpose
//!
//! Bit-exact layouts of the records the driver and the device exchange through
//! shared memory: the four descriptor kinds and the shared configuration area.
//!
//! ## How it works
//!
//! Descriptors are `repr(C)` structs of 32/64-bit words. Packed bitfields are
//! reached through accessor pairs built on `field`/`set_field`, so a descriptor
//! can be assembled in a local copy and stored to the ring with one volatile
//! write.
//!
//! ## Main components
//!
//! - `TxDesc`, `TxCompDesc`, `RxDesc`, `RxCompDesc`: ring records.
//! - `DriverShared`, `TxQueueShared`, `RxQueueShared`: shared area records.
//! - Offload mode, buffer type, feature, rx mode and event constants.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Generation value a freshly initialized ring starts with.
pub const INIT_GEN: u32 = 1;

pub const OM_NONE: u32 = 0;
pub const OM_CSUM: u32 = 2;
pub const OM_TSO: u32 = 3;

pub const BTYPE_HEAD: u32 = 0;
pub const BTYPE_BODY: u32 = 1;

pub const REV1_MAGIC: u32 = 0xbabe_fee1;
pub const DRIVER_VERSION: u32 = 0x0001_0000;
pub const GOS_64BIT: u32 = 0x02;
pub const GOS_LINUX: u32 = 0x04;
pub const UPT_VERSION: u32 = 1;

pub const UPT1_F_CSUM: u64 = 0x0001;
pub const UPT1_F_RSS: u64 = 0x0002;
pub const UPT1_F_VLAN: u64 = 0x0004;
pub const UPT1_F_LRO: u64 = 0x0008;

pub const ICTRL_DISABLE_ALL: u32 = 0x01;
pub const IMOD_ADAPTIVE: u8 = 8;
pub const VLAN_FILTER_WORDS: usize = 4096 / 32;

bitflags! {
    /// Receive filter mode programmed into `DriverShared::rxmode`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RxMode: u32 {
        const UCAST = 0x01;
        const MCAST = 0x02;
        const BCAST = 0x04;
        const ALLMULTI = 0x08;
        const PROMISC = 0x10;
    }
}

bitflags! {
    /// Event bits reported in `DriverShared::event`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Event: u32 {
        const RQERROR = 0x01;
        const TQERROR = 0x02;
        const LINK = 0x04;
        const DIC = 0x08;
        const DEBUG = 0x10;
    }
}

#[inline]
fn field(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1u32 << width) - 1)
}

#[inline]
fn set_field(word: &mut u32, shift: u32, width: u32, value: u32) {
    let mask = ((1u32 << width) - 1) << shift;
    *word = (*word & !mask) | ((value << shift) & mask);
}

macro_rules! bits {
    ($get:ident, $set:ident, $word:ident, $shift:expr, $width:expr) => {
        #[inline]
        pub fn $get(&self) -> u32 {
            field(self.$word, $shift, $width)
        }
        #[inline]
        pub fn $set(&mut self, value: u32) {
            set_field(&mut self.$word, $shift, $width, value)
        }
    };
}

/// Transmit command descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDesc {
    pub addr: u64,
    pub word2: u32,
    pub word3: u32,
}

impl TxDesc {
    bits!(buf_len, set_buf_len, word2, 0, 14);
    bits!(generation, set_generation, word2, 14, 1);
    bits!(dtype, set_dtype, word2, 16, 1);
    bits!(offload_pos, set_offload_pos, word2, 18, 14);
    bits!(hlen, set_hlen, word3, 0, 10);
    bits!(offload_mode, set_offload_mode, word3, 10, 2);
    bits!(eop, set_eop, word3, 12, 1);
    bits!(compreq, set_compreq, word3, 13, 1);
    bits!(vtag_mode, set_vtag_mode, word3, 15, 1);
    bits!(vtag, set_vtag, word3, 16, 16);

    /// Segment length; the 14-bit field encodes 16384 as zero.
    pub fn seg_len(&self) -> u32 {
        match self.buf_len() {
            0 => 1 << 14,
            n => n,
        }
    }
}

/// Transmit completion descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxCompDesc {
    pub word0: u32,
    pub reserved: [u32; 2],
    pub word3: u32,
}

impl TxCompDesc {
    bits!(eop_idx, set_eop_idx, word0, 0, 12);
    bits!(comp_type, set_comp_type, word3, 24, 7);
    bits!(generation, set_generation, word3, 31, 1);
}

/// Receive command descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxDesc {
    pub addr: u64,
    pub word2: u32,
    pub word3: u32,
}

impl RxDesc {
    bits!(buf_len, set_buf_len, word2, 0, 14);
    bits!(btype, set_btype, word2, 14, 1);
    bits!(dtype, set_dtype, word2, 15, 1);
    bits!(generation, set_generation, word2, 31, 1);
}

/// Receive completion descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxCompDesc {
    pub word0: u32,
    pub rss_hash: u32,
    pub word2: u32,
    pub word3: u32,
}

impl RxCompDesc {
    bits!(rxd_idx, set_rxd_idx, word0, 0, 12);
    bits!(eop, set_eop, word0, 14, 1);
    bits!(sop, set_sop, word0, 15, 1);
    bits!(qid, set_qid, word0, 16, 10);
    bits!(rss_type, set_rss_type, word0, 26, 4);
    bits!(no_csum, set_no_csum, word0, 30, 1);
    bits!(len, set_len, word2, 0, 14);
    bits!(error, set_error, word2, 14, 1);
    bits!(vlan, set_vlan, word2, 15, 1);
    bits!(vtag, set_vtag, word2, 16, 16);
    bits!(csum, set_csum, word3, 0, 16);
    bits!(csum_ok, set_csum_ok, word3, 16, 1);
    bits!(udp, set_udp, word3, 17, 1);
    bits!(tcp, set_tcp, word3, 18, 1);
    bits!(ipcsum_ok, set_ipcsum_ok, word3, 19, 1);
    bits!(ipv6, set_ipv6, word3, 20, 1);
    bits!(ipv4, set_ipv4, word3, 21, 1);
    bits!(fragment, set_fragment, word3, 22, 1);
    bits!(fcs, set_fcs, word3, 23, 1);
    bits!(comp_type, set_comp_type, word3, 24, 7);
    bits!(generation, set_generation, word3, 31, 1);
}

const_assert_eq!(size_of::<TxDesc>(), 16);
const_assert_eq!(size_of::<TxCompDesc>(), 16);
const_assert_eq!(size_of::<RxDesc>(), 16);
const_assert_eq!(size_of::<RxCompDesc>(), 16);

/// Top-level shared configuration area, located through BAR1 `DSL`/`DSH`.
#[repr(C)]
pub struct DriverShared {
    pub magic: u32,
    pub pad0: u32,
    pub version: u32,
    pub guest: u32,
    pub vmxnet3_revision: u32,
    pub upt_version: u32,
    pub upt_features: u64,
    pub driver_data: u64,
    pub queue_shared: u64,
    pub driver_data_len: u32,
    pub queue_shared_len: u32,
    pub mtu: u32,
    pub nrxsg_max: u16,
    pub ntxqueue: u8,
    pub nrxqueue: u8,
    pub automask: u8,
    pub nintr: u8,
    pub evintr: u8,
    pub pad1: [u8; 5],
    pub modlevel: [u8; 32],
    pub ictrl: u32,
    pub rxmode: u32,
    pub mcast_tablelen: u16,
    pub pad2: [u8; 6],
    pub mcast_table: u64,
    pub vlan_filter: [u32; VLAN_FILTER_WORDS],
    pub event: u32,
    pub pad3: u32,
}

/// Device-maintained transmit counters, refreshed by `GET_STATS`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UptTxStats {
    pub tso_packets: u64,
    pub tso_bytes: u64,
    pub ucast_packets: u64,
    pub ucast_bytes: u64,
    pub mcast_packets: u64,
    pub mcast_bytes: u64,
    pub bcast_packets: u64,
    pub bcast_bytes: u64,
    pub error: u64,
    pub discard: u64,
}

/// Device-maintained receive counters, refreshed by `GET_STATS`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UptRxStats {
    pub lro_packets: u64,
    pub lro_bytes: u64,
    pub ucast_packets: u64,
    pub ucast_bytes: u64,
    pub mcast_packets: u64,
    pub mcast_bytes: u64,
    pub bcast_packets: u64,
    pub bcast_bytes: u64,
    pub nobuffer: u64,
    pub error: u64,
}

#[repr(C)]
pub struct TxQueueShared {
    pub npending: u32,
    pub intr_threshold: u32,
    pub reserved0: u64,
    pub cmd_ring: u64,
    pub data_ring: u64,
    pub comp_ring: u64,
    pub driver_data: u64,
    pub reserved1: u64,
    pub cmd_ring_len: u32,
    pub data_ring_len: u32,
    pub comp_ring_len: u32,
    pub driver_data_len: u32,
    pub intr_idx: u8,
    pub pad0: [u8; 7],
    pub stopped: u8,
    pub pad1: [u8; 3],
    pub error: u32,
    pub stats: UptTxStats,
}

#[repr(C)]
pub struct RxQueueShared {
    pub update_rxhead: u8,
    pub pad0: [u8; 7],
    pub reserved0: u64,
    pub cmd_ring: [u64; 2],
    pub comp_ring: u64,
    pub driver_data: u64,
    pub reserved1: u64,
    pub cmd_ring_len: [u32; 2],
    pub comp_ring_len: u32,
    pub driver_data_len: u32,
    pub intr_idx: u8,
    pub pad1: [u8; 7],
    pub stopped: u8,
    pub pad2: [u8; 3],
    pub error: u32,
    pub stats: UptRxStats,
}

/// Volatile read of one field behind a raw pointer into shared memory.
///
/// Must be used inside `unsafe`: the pointer has to reference a live record.
#[macro_export]
macro_rules! shared_read {
    ($ptr:expr, $field:ident $([$idx:expr])?) => {
        ::core::ptr::addr_of!((*$ptr).$field $([$idx])?).read_volatile()
    };
}

/// Volatile write of one field behind a raw pointer into shared memory.
///
/// Must be used inside `unsafe`: the pointer has to reference a live record.
#[macro_export]
macro_rules! shared_write {
    ($ptr:expr, $field:ident $([$idx:expr])?, $value:expr) => {
        ::core::ptr::addr_of_mut!((*$ptr).$field $([$idx])?).write_volatile($value)
    };
}
