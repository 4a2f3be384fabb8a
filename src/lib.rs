//! frag6: stateful IPv6 datagram reassembly
//!
//! A packet-processing pipeline that wants to inspect whole datagrams has
//! to undo fragmentation first. This crate buffers individual IPv6
//! fragments by `(source, destination, identification)`, resolves overlaps
//! with the classic BSD rules, and hands back the reconstructed datagram
//! the moment the last hole is filled, with the fragment header elided and
//! the payload-length field rewritten.
//!
//! Partial state is garbage-collected under three kinds of pressure:
//! a per-source memory cap (so one address cannot starve the rest), a
//! global memory cap, and a fixed reassembly timeout. Byte accounting is
//! exact at both granularities, which is what makes the caps meaningful.
//!
//! The engine is a library component: no I/O, no clock (the caller supplies
//! a monotonic second counter), no parsing beyond the handful of IPv6
//! header fields it must read and rewrite. One mutex guards the whole
//! state; calls from any thread serialize and run to completion.

pub mod engine;
pub mod fragment;
pub mod ipv6;
pub mod source;
pub mod timer;

// Re-export engine types
pub use engine::{
    DefragError, DefragStats, Ipv6Defrag, DEFAULT_PER_SOURCE_MEMORY_LIMIT,
    DEFAULT_REASSEMBLY_TIMEOUT_SECS, DEFAULT_TOTAL_MEMORY_LIMIT,
};

// Re-export fragment-list types
pub use fragment::{Fragment, FragmentList};

// Re-export flow identity and timer types
pub use source::FlowKey;
pub use timer::{TimerHandle, TimerQueue};

// Re-export IPv6 wire constants
pub use ipv6::{FRAGMENT_HEADER_LEN, IPV6_HEADER_LEN, MAX_DATAGRAM_SIZE, MINIMUM_MTU};
