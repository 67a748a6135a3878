//! # Network Frames
//!
//! `Packet` is the frame object handed across the engine boundary in both
//! directions: a chain of byte segments plus offload request flags (transmit)
//! or checksum validation results (receive).

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Checksum offload requests and receive validation results.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CsumFlags: u32 {
        const TCPV4 = 0x0001;
        const UDPV4 = 0x0002;
        const TCPV6 = 0x0004;
        const UDPV6 = 0x0008;
        const TSOV4 = 0x0010;
        const TSOV6 = 0x0020;
        const IPV4 = 0x0040;
        const IPV4_BAD = 0x0080;
        const TCP_UDP_BAD = 0x0100;
    }
}

impl CsumFlags {
    pub const TSO: Self = Self::TSOV4.union(Self::TSOV6);
    pub const TX_CSUM: Self = Self::TCPV4
        .union(Self::UDPV4)
        .union(Self::TCPV6)
        .union(Self::UDPV6);
    pub const TX_OFFLOAD: Self = Self::TSO.union(Self::TX_CSUM);
    pub const V4: Self = Self::TCPV4.union(Self::UDPV4).union(Self::TSOV4);
    pub const TCP: Self = Self::TCPV4
        .union(Self::TCPV6)
        .union(Self::TSOV4)
        .union(Self::TSOV6);
}

/// One piece of a frame: `len` bytes of `buf` starting at `off`.
pub struct Segment {
    buf: Vec<u8>,
    off: usize,
    len: usize,
}

impl Segment {
    pub fn new(buf: Vec<u8>, off: usize, len: usize) -> Self {
        debug_assert!(off + len <= buf.len());
        Segment { buf, off, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.off..self.off + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }
}

impl From<Vec<u8>> for Segment {
    fn from(buf: Vec<u8>) -> Self {
        let len = buf.len();
        Segment { buf, off: 0, len }
    }
}

#[derive(Default)]
pub struct Packet {
    segs: Vec<Segment>,
    len: usize,
    /// Requested offloads on transmit, validation results on receive.
    pub csum_flags: CsumFlags,
    /// TSO segment size.
    pub segsz: u16,
    pub vlan_tag: Option<u16>,
    pub multicast: bool,
    /// Receiving queue.
    pub rcvif: Option<u16>,
}

impl Packet {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Packet::from_segments([Segment::from(bytes.into())])
    }

    pub fn from_segments(segs: impl IntoIterator<Item = Segment>) -> Self {
        let segs: Vec<Segment> = segs.into_iter().collect();
        let len = segs.iter().map(Segment::len).sum();
        Packet {
            segs,
            len,
            ..Default::default()
        }
    }

    pub fn with_offload(mut self, flags: CsumFlags, segsz: u16) -> Self {
        self.csum_flags = flags;
        self.segsz = segsz;
        self
    }

    pub fn with_vlan(mut self, tag: u16) -> Self {
        self.vlan_tag = Some(tag);
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }

    pub fn push_segment(&mut self, seg: Segment) {
        self.len += seg.len();
        self.segs.push(seg);
    }

    pub fn first_segment_mut(&mut self) -> Option<&mut Segment> {
        self.segs.first_mut()
    }

    /// Copies the whole chain into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segs {
            out.extend_from_slice(seg.as_slice());
        }
        out
    }

    /// Collapses the chain into a single segment.
    pub fn defrag(&mut self) {
        if self.segs.len() > 1 {
            let data = self.to_vec();
            self.segs = vec![Segment::from(data)];
        }
    }

    /// Makes the first `n` bytes contiguous in the first segment.
    /// Returns `false` when the frame is shorter than `n`.
    pub fn pullup(&mut self, n: usize) -> bool {
        if n > self.len {
            return false;
        }
        match self.segs.first() {
            Some(first) if first.len() >= n => return true,
            None => return n == 0,
            _ => {}
        }
        let mut head = Vec::with_capacity(n);
        let mut rest = Vec::with_capacity(self.segs.len());
        for seg in self.segs.drain(..) {
            let need = n - head.len();
            if need == 0 {
                rest.push(seg);
            } else if seg.len() <= need {
                head.extend_from_slice(seg.as_slice());
            } else {
                head.extend_from_slice(&seg.as_slice()[..need]);
                let Segment { buf, off, len } = seg;
                rest.push(Segment::new(buf, off + need, len - need));
            }
        }
        self.segs.push(Segment::from(head));
        self.segs.extend(rest);
        true
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("segs", &self.segs.len())
            .field("csum_flags", &self.csum_flags)
            .field("segsz", &self.segsz)
            .field("vlan_tag", &self.vlan_tag)
            .finish()
    }
}
