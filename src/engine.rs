//! The reassembly engine: eviction policy and the fragment entry point.
//!
//! `Ipv6Defrag` is the public handle. One mutex guards the entire state and
//! `manage_fragment` holds it for its whole body, including the payload
//! copy. Concurrent callers serialize; each call does bounded work (one
//! bucket scan, one short flow list, one short fragment list), and
//! fragmented traffic is a minority of packets in practice, so
//! coarse-grained locking is the right trade. Callers that need
//! byte-deterministic reassembly under retransmission must serialize
//! per-flow themselves: the engine observes lock-acquisition order.
//!
//! Every failure collapses to `None` with the lock released: undersize or
//! oversize fragments, malformed inputs, memory pressure. Reassembly is
//! best effort; the upstream network retransmits. The [`DefragStats`]
//! counters record which category a drop fell into.
//!
//! Memory caps are soft in one direction only: a single insertion may push
//! the accounting past `total_memory_limit`, and the next call reclaims.

use std::net::Ipv6Addr;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, trace};

use crate::fragment::FragmentList;
use crate::ipv6::{
    self, FRAGMENT_HEADER_LEN, IPV6_HEADER_LEN, MAX_DATAGRAM_SIZE, MINIMUM_MTU,
};
use crate::source::{flow_overhead, source_overhead, Flow, FlowKey, SourceTable};
use crate::timer::TimerQueue;

/// Default cap on bytes buffered for any one source address (8 KiB).
pub const DEFAULT_PER_SOURCE_MEMORY_LIMIT: u32 = 8 * 1024;

/// Default cap on bytes buffered across all sources (32 MiB).
pub const DEFAULT_TOTAL_MEMORY_LIMIT: u32 = 32 * 1024 * 1024;

/// Default lifetime of an in-progress datagram, in seconds.
pub const DEFAULT_REASSEMBLY_TIMEOUT_SECS: u8 = 30;

/// Errors raised when constructing the engine.
#[derive(Debug, Error)]
pub enum DefragError {
    #[error("table size must be nonzero")]
    ZeroTableSize,
}

/// Running counters over everything the engine has seen.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefragStats {
    /// Fragments handed to `manage_fragment`.
    pub received: u64,
    /// Complete datagrams returned to the caller.
    pub reassembled: u64,
    /// Fragments dropped because the packet was below the 1280-byte MTU.
    pub dropped_undersize: u64,
    /// Fragments dropped because they would exceed 65535 bytes.
    pub dropped_oversize: u64,
    /// Fragments dropped as malformed: short header, empty payload, offset
    /// past the known datagram length, or a duplicate terminal fragment.
    pub dropped_malformed: u64,
    /// Datagrams discarded at assembly time because the fragment train did
    /// not match the announced length.
    pub dropped_inconsistent: u64,
    /// Flows evicted because one source exceeded its memory cap.
    pub evicted_source_pressure: u64,
    /// Flows evicted because the engine exceeded its global memory cap.
    pub evicted_global_pressure: u64,
    /// Flows evicted because their reassembly timer expired.
    pub evicted_expired: u64,
}

/// Everything guarded by the engine mutex.
#[derive(Debug)]
struct DefragState {
    table: SourceTable,
    timers: TimerQueue,
    total_used_mem: u32,
    per_source_memory_limit: u32,
    total_memory_limit: u32,
    timeout_secs: u8,
    enforce_minimum_mtu: bool,
    stats: DefragStats,
}

impl DefragState {
    fn new(table_size: u16) -> Self {
        Self {
            table: SourceTable::new(table_size),
            timers: TimerQueue::new(),
            total_used_mem: 0,
            per_source_memory_limit: DEFAULT_PER_SOURCE_MEMORY_LIMIT,
            total_memory_limit: DEFAULT_TOTAL_MEMORY_LIMIT,
            timeout_secs: DEFAULT_REASSEMBLY_TIMEOUT_SECS,
            enforce_minimum_mtu: true,
            stats: DefragStats::default(),
        }
    }

    /// Destroy the flow at `pos` in `src`'s flow list: uncharge its bytes
    /// at both granularities and unlink its timer. The source itself is
    /// left in place even if this was its last flow; callers decide.
    fn delete_flow_at(&mut self, src: &Ipv6Addr, pos: usize) {
        let Some(source) = self.table.get_mut(src) else {
            return;
        };
        let flow = source.flows.remove(pos);
        let bytes = flow_overhead() + flow.payload_bytes();
        source.used_mem -= bytes;
        self.total_used_mem -= bytes;
        self.timers.remove(flow.timer);
    }

    /// Destroy a source: cascade all its remaining flows, uncharge its
    /// overhead, unlink it from its bucket. Returns how many flows the
    /// cascade destroyed.
    fn delete_source(&mut self, addr: &Ipv6Addr) -> usize {
        let Some(mut source) = self.table.remove(addr) else {
            return 0;
        };
        let cascaded = source.flows.len();
        for flow in source.flows.drain(..) {
            let bytes = flow_overhead() + flow.payload_bytes();
            self.total_used_mem -= bytes;
            self.timers.remove(flow.timer);
        }
        self.total_used_mem -= source_overhead();
        cascaded
    }

    /// Per-source pressure: while this source is over its cap, evict its
    /// head flow. Returns true if the source emptied and was deleted, in
    /// which case the current fragment is abandoned.
    fn apply_source_pressure(&mut self, src: &Ipv6Addr) -> bool {
        loop {
            let Some(source) = self.table.get(src) else {
                return false;
            };
            if source.flows.is_empty() || source.used_mem <= self.per_source_memory_limit {
                return false;
            }
            debug!(
                source = %src,
                used = source.used_mem,
                limit = self.per_source_memory_limit,
                "source memory limit exceeded, evicting"
            );
            self.delete_flow_at(src, 0);
            self.stats.evicted_source_pressure += 1;

            if self.table.get(src).is_some_and(|s| s.flows.is_empty()) {
                self.delete_source(src);
                return true;
            }
        }
    }

    /// Global pressure and expiry: while the queue head has expired or the
    /// engine is over its total cap, evict the head flow. Timers are in
    /// expiry order, so the head is always the right victim.
    ///
    /// Returns true if the current call must be abandoned. Quirk: the
    /// emptiness test is made against the *current* source, but the
    /// deletion targets the *head flow's* source. A non-current source
    /// emptied here lingers, still charged for its own overhead, until it
    /// gains a flow again.
    fn apply_global_pressure(&mut self, src: &Ipv6Addr, current_time: u64) -> bool {
        while let Some((expiration, key)) = self.timers.peek() {
            let expired = expiration < current_time;
            if !expired && self.total_used_mem < self.total_memory_limit {
                break;
            }

            let Some(pos) = self
                .table
                .get(&key.src)
                .and_then(|s| s.find_flow(key.id, &key.dst))
            else {
                debug_assert!(false, "timer entry without a live flow");
                break;
            };
            debug!(
                source = %key.src,
                id = key.id,
                expired,
                total_used = self.total_used_mem,
                "evicting flow at timer head"
            );
            self.delete_flow_at(&key.src, pos);
            if expired {
                self.stats.evicted_expired += 1;
            } else {
                self.stats.evicted_global_pressure += 1;
            }

            if self.table.get(src).is_some_and(|s| s.flows.is_empty()) {
                let cascaded = self.delete_source(&key.src);
                self.stats.evicted_global_pressure += cascaded as u64;
                return true;
            }
        }
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn manage_fragment(
        &mut self,
        unfragmentable: &[u8],
        fragmentable: &[u8],
        offset: u16,
        more_fragments: bool,
        identification: u32,
        next_header: u8,
        current_time: u64,
    ) -> Option<Vec<u8>> {
        self.stats.received += 1;

        // Hosts must not fragment datagrams that fit the minimum MTU; a
        // smaller fragment packet is either forged or broken.
        if self.enforce_minimum_mtu
            && unfragmentable.len() + FRAGMENT_HEADER_LEN + fragmentable.len() < MINIMUM_MTU
        {
            trace!(
                size = unfragmentable.len() + FRAGMENT_HEADER_LEN + fragmentable.len(),
                "fragment packet below minimum MTU, dropping"
            );
            self.stats.dropped_undersize += 1;
            return None;
        }

        // (end - 1) is the last byte position of this fragment.
        let end = usize::from(offset) + fragmentable.len();
        if end > MAX_DATAGRAM_SIZE {
            debug!(offset, size = fragmentable.len(), "attempt to build an oversized datagram");
            self.stats.dropped_oversize += 1;
            return None;
        }
        let end = end as u16;

        if unfragmentable.len() < IPV6_HEADER_LEN || fragmentable.is_empty() {
            self.stats.dropped_malformed += 1;
            return None;
        }

        let src = ipv6::source_address(unfragmentable);
        let dst = ipv6::destination_address(unfragmentable);

        let (source, created) = self.table.find_or_create(&src);
        let source_used = source.used_mem;
        if created {
            self.total_used_mem += source_overhead();
        }
        trace!(
            source = %src,
            total_used = self.total_used_mem,
            source_used,
            "source found or created"
        );

        if self.apply_source_pressure(&src) {
            return None;
        }
        if self.apply_global_pressure(&src, current_time) {
            return None;
        }

        // Find the flow, creating it with a fresh timer on miss.
        let timeout = u64::from(self.timeout_secs);
        let source = self.table.get_mut(&src)?;
        let pos = match source.find_flow(identification, &dst) {
            Some(pos) => pos,
            None => {
                let timer = self.timers.push(
                    current_time + timeout,
                    FlowKey {
                        src,
                        dst,
                        id: identification,
                    },
                );
                source.flows.insert(
                    0,
                    Flow {
                        id: identification,
                        dst,
                        unfragmentable: None,
                        fragments: FragmentList::new(),
                        len: 0,
                        timer,
                    },
                );
                source.used_mem += flow_overhead();
                self.total_used_mem += flow_overhead();
                0
            }
        };

        // Malformed: a fragment starting past the known end of the datagram.
        if source.flows[pos].len != 0 && offset > source.flows[pos].len {
            self.stats.dropped_malformed += 1;
            return None;
        }

        // The unfragmentable part is identical across fragments, so it is
        // stashed from whichever fragment arrives first. The next-header
        // field is patched now so the reassembled datagram carries no trace
        // of the fragment header.
        let stashed = {
            let flow = &mut source.flows[pos];
            if flow.unfragmentable.is_none() {
                let mut stash = unfragmentable.to_vec();
                ipv6::set_next_header(&mut stash, next_header);
                let len = stash.len() as u32;
                flow.unfragmentable = Some(stash);
                len
            } else {
                0
            }
        };
        source.used_mem += stashed;
        self.total_used_mem += stashed;

        let flow = &mut source.flows[pos];

        // The terminal fragment pins the datagram's total payload length.
        if !more_fragments {
            if flow.len != 0 {
                // A second terminal fragment is redundant at best.
                self.stats.dropped_malformed += 1;
                return None;
            }
            flow.len = end;
        }

        let (removed, inserted) = flow.fragments.insert(fragmentable, offset, end);
        let complete = flow.len != 0 && flow.fragments.is_contiguous_from_zero();
        source.used_mem = source.used_mem + inserted - removed;
        self.total_used_mem = self.total_used_mem + inserted - removed;

        // Eviction deliberately does not run again here: one insertion may
        // push the accounting past the cap, reclaimed on the next call.
        if complete {
            self.build_complete_datagram(&src, identification, &dst, pos)
        } else {
            None
        }
    }

    /// Assemble the finished datagram: unfragmentable part first, then the
    /// compacted payload, with the IPv6 payload-length field patched. The
    /// flow is destroyed (and its source, if that was the last flow);
    /// ownership of the buffer moves to the caller.
    fn build_complete_datagram(
        &mut self,
        src: &Ipv6Addr,
        id: u32,
        dst: &Ipv6Addr,
        pos: usize,
    ) -> Option<Vec<u8>> {
        let source = self.table.get(src)?;
        let flow = source.flows.get(pos)?;
        let unfragmentable = flow.unfragmentable.as_deref()?;
        let unfragmentable_len = unfragmentable.len();
        let len = flow.len;

        let total = unfragmentable_len + usize::from(len);
        if total > MAX_DATAGRAM_SIZE {
            debug!(total, "reassembled datagram would be oversized, dropping flow");
            self.stats.dropped_oversize += 1;
            self.delete_flow_at(src, pos);
            if self.table.get(src).is_some_and(|s| s.flows.is_empty()) {
                self.delete_source(src);
            }
            return None;
        }

        let mut datagram = vec![0u8; total];
        datagram[..unfragmentable_len].copy_from_slice(unfragmentable);

        let Some(count) = flow
            .fragments
            .compact_into(&mut datagram[unfragmentable_len..], len)
        else {
            // Misbehaving datagram: the train does not match the length
            // announced by the terminal fragment. The buffer is discarded;
            // the flow stays until pressure or expiry collects it.
            debug!(source = %src, id, "fragment train inconsistent with datagram length");
            self.stats.dropped_inconsistent += 1;
            return None;
        };

        ipv6::set_payload_length(
            &mut datagram,
            (usize::from(count) + unfragmentable_len - IPV6_HEADER_LEN) as u16,
        );

        self.delete_flow_at(src, pos);
        if self.table.get(src).is_some_and(|s| s.flows.is_empty()) {
            self.delete_source(src);
        }
        self.stats.reassembled += 1;
        debug!(source = %src, id, dst = %dst, size = total, "datagram reassembled");
        Some(datagram)
    }

    #[cfg(test)]
    fn audit_accounting(&self) {
        let mut total = 0u32;
        let mut flows = 0usize;
        for source in self.table.iter() {
            let mut expected = source_overhead();
            for flow in &source.flows {
                expected += flow_overhead() + flow.payload_bytes();
                flows += 1;
            }
            assert_eq!(
                source.used_mem, expected,
                "per-source accounting drifted for {}",
                source.src
            );
            total += source.used_mem;
        }
        assert_eq!(self.total_used_mem, total, "global accounting drifted");
        assert_eq!(self.timers.len(), flows, "timer queue out of sync with live flows");
    }
}

/// Stateful IPv6 datagram reassembly.
///
/// Fragments are buffered by `(source, destination, identification)` until
/// the datagram is complete, then handed back as one owned buffer with the
/// fragment header elided and the payload-length field rewritten. Partial
/// state is garbage-collected under per-source pressure, global pressure,
/// and a fixed reassembly timeout.
///
/// Time is supplied by the caller as a monotonic second counter; the engine
/// owns no clock.
///
/// # Example
///
/// ```
/// use frag6::Ipv6Defrag;
///
/// let defrag = Ipv6Defrag::new(4096).unwrap();
/// defrag.set_reassembly_timeout(15);
/// ```
#[derive(Debug)]
pub struct Ipv6Defrag {
    state: Mutex<DefragState>,
}

impl Ipv6Defrag {
    /// Create an engine with `table_size` source-table buckets and default
    /// limits: 8 KiB per source, 32 MiB total, 30-second timeout, minimum-
    /// MTU check enabled.
    pub fn new(table_size: u16) -> Result<Self, DefragError> {
        if table_size == 0 {
            return Err(DefragError::ZeroTableSize);
        }
        Ok(Self {
            state: Mutex::new(DefragState::new(table_size)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DefragState> {
        // Drop-and-continue engine: a panic in some other holder is no
        // reason to refuse service, so poisoning is shrugged off.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Cap the bytes buffered on behalf of any one source address.
    pub fn set_per_source_memory_limit(&self, limit: u32) {
        self.lock().per_source_memory_limit = limit;
    }

    /// Cap the bytes buffered across all sources.
    pub fn set_total_memory_limit(&self, limit: u32) {
        self.lock().total_memory_limit = limit;
    }

    /// Set the lifetime of an in-progress datagram, in seconds.
    pub fn set_reassembly_timeout(&self, timeout_secs: u8) {
        self.lock().timeout_secs = timeout_secs;
    }

    /// Enable or disable the 1280-byte minimum-MTU check. On by default;
    /// disabling it admits the small hand-built fragments that test
    /// traffic and some tunnels produce.
    pub fn set_enforce_minimum_mtu(&self, enforce: bool) {
        self.lock().enforce_minimum_mtu = enforce;
    }

    /// Handle one IPv6 fragment.
    ///
    /// `unfragmentable` is the pre-fragmentation header part (fixed IPv6
    /// header plus any extension headers up to, but not including, the
    /// fragment header); source and destination addresses are read from
    /// it. `fragmentable` is this fragment's payload. `offset`,
    /// `more_fragments`, `identification`, and `next_header` come from the
    /// caller's parse of the fragment header. `current_time` is a
    /// monotonic second counter.
    ///
    /// Returns the fully reassembled datagram once the last hole is
    /// filled; the caller owns the buffer and the engine retains nothing
    /// for that flow. Returns `None` when the fragment was buffered, and
    /// also on every silent drop: undersize and oversize fragments,
    /// malformed inputs, and memory pressure all look the same.
    #[allow(clippy::too_many_arguments)]
    pub fn manage_fragment(
        &self,
        unfragmentable: &[u8],
        fragmentable: &[u8],
        offset: u16,
        more_fragments: bool,
        identification: u32,
        next_header: u8,
        current_time: u64,
    ) -> Option<Vec<u8>> {
        self.lock().manage_fragment(
            unfragmentable,
            fragmentable,
            offset,
            more_fragments,
            identification,
            next_header,
            current_time,
        )
    }

    /// Bytes currently buffered across all sources.
    pub fn used_memory(&self) -> u32 {
        self.lock().total_used_mem
    }

    /// Number of live sources.
    pub fn source_count(&self) -> usize {
        self.lock().table.len()
    }

    /// Number of in-progress datagrams.
    pub fn flow_count(&self) -> usize {
        self.lock().timers.len()
    }

    /// Snapshot of the engine's counters.
    pub fn stats(&self) -> DefragStats {
        self.lock().stats
    }

    #[cfg(test)]
    fn audit(&self) {
        self.lock().audit_accounting();
    }
}
