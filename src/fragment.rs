//! Ordered fragment lists with hole tracking.
//!
//! A `FragmentList` holds the received slices of one in-progress datagram,
//! sorted by offset and pairwise non-overlapping. Overlaps are resolved at
//! insert time with the classic BSD rules: where data already exists, the
//! earlier fragment is authoritative for the new fragment's leading edge,
//! while the new fragment overwrites everything it covers further right.
//!
//! Every insert reports how many payload bytes were physically freed from
//! prior fragments and how many were freshly copied in, so the caller can
//! keep its byte accounting exact at both the per-source and the global
//! granularity.

/// One received slice of a datagram, owned by the list.
#[derive(Debug, Clone)]
pub struct Fragment {
    offset: u16,
    end: u16,
    data: Vec<u8>,
}

impl Fragment {
    /// First byte position this fragment covers in the datagram.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// One past the last byte position this fragment covers.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Payload bytes held for this fragment.
    pub fn len(&self) -> u16 {
        self.end - self.offset
    }
}

/// Ordered, non-overlapping sequence of fragments for one datagram.
///
/// Sequences are short in practice, so position lookups are linear scans;
/// no balanced structure is warranted.
#[derive(Debug, Default)]
pub struct FragmentList {
    fragments: Vec<Fragment>,
}

impl FragmentList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            fragments: Vec::new(),
        }
    }

    /// Number of fragments currently held.
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Check if no fragments are held.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Total payload bytes held across all fragments.
    pub fn total_bytes(&self) -> u32 {
        self.fragments.iter().map(|f| u32::from(f.len())).sum()
    }

    /// Iterate fragments in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    /// Insert a fragment covering `[offset, end)`, copying `payload` into
    /// list-owned storage. Returns `(bytes_removed, bytes_inserted)`:
    /// payload bytes freed from prior fragments and payload bytes newly
    /// allocated for this one.
    ///
    /// Overlap resolution:
    /// - a predecessor ending past `offset` trims the new fragment's head
    ///   (earlier data wins on the leading edge); a fragment trimmed to
    ///   nothing is discarded entirely;
    /// - successors fully covered by the new fragment are removed;
    /// - a successor overlapping only the new fragment's tail keeps its
    ///   non-overlapping suffix.
    ///
    /// The caller must guarantee `offset < end` and
    /// `payload.len() == (end - offset) as usize`.
    pub fn insert(&mut self, payload: &[u8], offset: u16, end: u16) -> (u32, u32) {
        debug_assert!(offset < end);
        debug_assert_eq!(payload.len(), usize::from(end - offset));

        let mut removed: u32 = 0;
        let mut offset = offset;
        let mut skip = 0usize;

        // Position of the first fragment at or after the new offset.
        let mut idx = self
            .fragments
            .iter()
            .position(|f| f.offset >= offset)
            .unwrap_or(self.fragments.len());

        // Leading overlap with the predecessor: the bytes it already holds
        // are kept, the new fragment starts where it ends.
        if idx > 0 {
            let prev_end = self.fragments[idx - 1].end;
            if prev_end > offset {
                let trimmed = prev_end - offset;
                if prev_end >= end {
                    // Fully contained in existing data, nothing to do.
                    return (0, 0);
                }
                offset = prev_end;
                skip = usize::from(trimmed);
            }
        }

        // Trailing overlaps: swallow fully covered successors, trim the
        // head of a partially covered one.
        while idx < self.fragments.len() && self.fragments[idx].offset < end {
            let next = &mut self.fragments[idx];
            if next.end <= end {
                removed += u32::from(next.len());
                self.fragments.remove(idx);
            } else {
                let trimmed = end - next.offset;
                next.data.drain(..usize::from(trimmed));
                next.offset = end;
                removed += u32::from(trimmed);
                break;
            }
        }

        let inserted = u32::from(end - offset);
        self.fragments.insert(
            idx,
            Fragment {
                offset,
                end,
                data: payload[skip..].to_vec(),
            },
        );

        (removed, inserted)
    }

    /// Check whether the fragments form a gap-free train starting at
    /// offset 0. An empty list is not contiguous.
    pub fn is_contiguous_from_zero(&self) -> bool {
        let Some(first) = self.fragments.first() else {
            return false;
        };
        if first.offset != 0 {
            return false;
        }
        self.fragments
            .windows(2)
            .all(|pair| pair[0].end == pair[1].offset)
    }

    /// Copy all payload bytes in order into `out`. Returns the end position
    /// of the last fragment on success, or `None` if the list fails to
    /// cover `[0, expected_len)` contiguously, which the caller treats as
    /// a protocol error.
    ///
    /// `out` must be at least `expected_len` bytes long.
    pub fn compact_into(&self, out: &mut [u8], expected_len: u16) -> Option<u16> {
        let mut count: u16 = 0;
        for frag in &self.fragments {
            if frag.offset != count || frag.end > expected_len {
                return None;
            }
            out[usize::from(frag.offset)..usize::from(frag.end)].copy_from_slice(&frag.data);
            count = frag.end;
        }
        if count != expected_len {
            return None;
        }
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_bytes(list: &mut FragmentList, payload: &[u8], offset: u16) -> (u32, u32) {
        list.insert(payload, offset, offset + payload.len() as u16)
    }

    fn ranges(list: &FragmentList) -> Vec<(u16, u16)> {
        list.iter().map(|f| (f.offset(), f.end())).collect()
    }

    fn compact(list: &FragmentList, expected_len: u16) -> Option<Vec<u8>> {
        let mut out = vec![0u8; usize::from(expected_len)];
        list.compact_into(&mut out, expected_len).map(|_| out)
    }

    // ===== Insert Tests =====

    #[test]
    fn test_insert_keeps_offset_order() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"CCCC", 8);
        insert_bytes(&mut list, b"AAAA", 0);
        insert_bytes(&mut list, b"BBBB", 4);

        assert_eq!(ranges(&list), vec![(0, 4), (4, 8), (8, 12)]);
        assert_eq!(list.total_bytes(), 12);
    }

    #[test]
    fn test_insert_reports_inserted_bytes() {
        let mut list = FragmentList::new();
        let (removed, inserted) = insert_bytes(&mut list, b"AAAA", 0);
        assert_eq!((removed, inserted), (0, 4));
    }

    #[test]
    fn test_leading_overlap_keeps_earlier_data() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAA", 0);
        // [2, 6) overlaps [0, 4): the first two bytes are discarded.
        let (removed, inserted) = insert_bytes(&mut list, b"XXXX", 2);

        assert_eq!((removed, inserted), (0, 2));
        assert_eq!(ranges(&list), vec![(0, 4), (4, 6)]);
        assert_eq!(compact(&list, 6).unwrap(), b"AAAAXX");
    }

    #[test]
    fn test_fully_contained_fragment_is_discarded() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAAAAAA", 0);
        let (removed, inserted) = insert_bytes(&mut list, b"XX", 2);

        assert_eq!((removed, inserted), (0, 0));
        assert_eq!(ranges(&list), vec![(0, 8)]);
        assert_eq!(compact(&list, 8).unwrap(), b"AAAAAAAA");
    }

    #[test]
    fn test_new_fragment_swallows_covered_successors() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"BB", 4);
        insert_bytes(&mut list, b"CC", 6);
        let (removed, inserted) = insert_bytes(&mut list, b"XXXXXXXX", 2);

        assert_eq!((removed, inserted), (4, 8));
        assert_eq!(ranges(&list), vec![(2, 10)]);
    }

    #[test]
    fn test_new_fragment_trims_partially_covered_successor() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"BBBB", 4);
        // [2, 6) covers the first half of [4, 8).
        let (removed, inserted) = insert_bytes(&mut list, b"XXXX", 2);

        assert_eq!((removed, inserted), (2, 4));
        assert_eq!(ranges(&list), vec![(2, 6), (6, 8)]);
        let mut out = vec![0u8; 8];
        // Cover the hole at [0, 2) to allow compaction.
        insert_bytes(&mut list, b"AA", 0);
        assert_eq!(list.compact_into(&mut out, 8), Some(8));
        assert_eq!(&out, b"AAXXXXBB");
    }

    #[test]
    fn test_exact_duplicate_replaces_in_place() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAA", 4);
        let (removed, inserted) = insert_bytes(&mut list, b"AAAA", 4);

        // The duplicate removes the old copy and inserts its own: no net
        // change in held bytes.
        assert_eq!((removed, inserted), (4, 4));
        assert_eq!(ranges(&list), vec![(4, 8)]);
        assert_eq!(list.total_bytes(), 4);
    }

    #[test]
    fn test_overlap_both_sides() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAA", 0);
        insert_bytes(&mut list, b"DDDD", 8);
        // [2, 10) loses its head to [0, 4) and trims the head of [8, 12).
        let (removed, inserted) = insert_bytes(&mut list, b"XXXXXXXX", 2);

        assert_eq!((removed, inserted), (2, 6));
        assert_eq!(ranges(&list), vec![(0, 4), (4, 10), (10, 12)]);
        assert_eq!(compact(&list, 12).unwrap(), b"AAAAXXXXXXDD");
    }

    // ===== Contiguity Tests =====

    #[test]
    fn test_empty_list_is_not_contiguous() {
        let list = FragmentList::new();
        assert!(!list.is_contiguous_from_zero());
    }

    #[test]
    fn test_contiguous_train_from_zero() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAA", 0);
        insert_bytes(&mut list, b"BBBB", 4);
        assert!(list.is_contiguous_from_zero());
    }

    #[test]
    fn test_train_not_starting_at_zero() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"BBBB", 4);
        insert_bytes(&mut list, b"CCCC", 8);
        assert!(!list.is_contiguous_from_zero());
    }

    #[test]
    fn test_train_with_hole() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAA", 0);
        insert_bytes(&mut list, b"CCCC", 8);
        assert!(!list.is_contiguous_from_zero());
    }

    // ===== Compaction Tests =====

    #[test]
    fn test_compact_complete_train() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"BBBB", 4);
        insert_bytes(&mut list, b"AAAA", 0);
        assert_eq!(compact(&list, 8).unwrap(), b"AAAABBBB");
    }

    #[test]
    fn test_compact_detects_hole() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAA", 0);
        insert_bytes(&mut list, b"CCCC", 8);
        assert_eq!(compact(&list, 12), None);
    }

    #[test]
    fn test_compact_detects_overrun() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAA", 0);
        insert_bytes(&mut list, b"BBBB", 4);
        // Train ends at 8 but the datagram claims to end at 6.
        assert_eq!(compact(&list, 6), None);
    }

    #[test]
    fn test_compact_detects_short_train() {
        let mut list = FragmentList::new();
        insert_bytes(&mut list, b"AAAA", 0);
        assert_eq!(compact(&list, 8), None);
    }
}
