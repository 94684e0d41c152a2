//! Per-transport allocation state: consumer MIDs and SCTP stream ids.

use tracing::error;

const MAX_MID: u32 = 100_000_000;

/// Hands out consumer MIDs as decimal strings, wrapping to zero after
/// [`MAX_MID`] values.
#[derive(Debug, Default)]
pub(crate) struct MidAllocator {
    next: u32,
}

impl MidAllocator {
    /// Next MID that `in_use` does not claim.
    pub(crate) fn next(&mut self, in_use: impl Fn(&str) -> bool) -> String {
        // Every value in use is skipped at most once per full cycle.
        for _ in 0..=MAX_MID {
            let mid = self.next;
            self.next += 1;
            if self.next == MAX_MID {
                error!("consumer MID counter reached {MAX_MID}, wrapping to 0");
                self.next = 0;
            }

            let mid = mid.to_string();
            if !in_use(&mid) {
                return mid;
            }
        }
        // Unreachable in practice: it would take MAX_MID live consumers.
        self.next.to_string()
    }

    #[cfg(test)]
    fn starting_at(next: u32) -> Self {
        Self { next }
    }
}

/// Bitmap of SCTP stream ids in use, sized to the transport's MIS.
///
/// Allocation scans from a rotating cursor so a freed id is not reused
/// right away.
#[derive(Debug)]
pub(crate) struct SctpStreamIds {
    words: Vec<u64>,
    len: u16,
    cursor: u16,
}

impl SctpStreamIds {
    pub(crate) fn new(len: u16) -> Self {
        Self {
            words: vec![0; usize::from(len).div_ceil(64)],
            len,
            cursor: 0,
        }
    }

    /// Reserve a free id, or `None` when all `len` ids are taken.
    pub(crate) fn allocate(&mut self) -> Option<u16> {
        for offset in 0..self.len {
            let id = ((u32::from(self.cursor) + u32::from(offset)) % u32::from(self.len)) as u16;
            let (word, bit) = Self::slot(id);
            if self.words[word] & bit == 0 {
                self.words[word] |= bit;
                self.cursor = ((u32::from(id) + 1) % u32::from(self.len)) as u16;
                return Some(id);
            }
        }
        None
    }

    /// Return an id to the pool. Releasing a free or out-of-range id is a
    /// no-op.
    pub(crate) fn release(&mut self, id: u16) {
        if id >= self.len {
            return;
        }
        let (word, bit) = Self::slot(id);
        self.words[word] &= !bit;
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    fn slot(id: u16) -> (usize, u64) {
        (usize::from(id / 64), 1u64 << (id % 64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mids_count_up_from_zero() {
        let mut mids = MidAllocator::default();
        assert_eq!(mids.next(|_| false), "0");
        assert_eq!(mids.next(|_| false), "1");
        assert_eq!(mids.next(|_| false), "2");
    }

    #[test]
    fn mid_counter_wraps() {
        let mut mids = MidAllocator::starting_at(MAX_MID - 1);
        assert_eq!(mids.next(|_| false), "99999999");
        assert_eq!(mids.next(|_| false), "0");
    }

    #[test]
    fn mid_skips_live_values_after_wrap() {
        let mut mids = MidAllocator::starting_at(MAX_MID - 1);
        assert_eq!(mids.next(|_| false), "99999999");
        assert_eq!(mids.next(|mid| mid == "0" || mid == "1"), "2");
    }

    #[test]
    fn stream_ids_exhaust_at_len() {
        let mut ids = SctpStreamIds::new(4);
        let mut got: Vec<u16> = (0..4).filter_map(|_| ids.allocate()).collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(ids.allocate(), None);
    }

    #[test]
    fn released_id_is_reused_once_the_cursor_comes_back() {
        let mut ids = SctpStreamIds::new(4);
        for _ in 0..4 {
            ids.allocate();
        }
        ids.release(1);
        assert_eq!(ids.in_use(), 3);
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), None);
    }

    #[test]
    fn cursor_rotates_past_freed_ids() {
        let mut ids = SctpStreamIds::new(8);
        assert_eq!(ids.allocate(), Some(0));
        assert_eq!(ids.allocate(), Some(1));
        ids.release(0);
        assert_eq!(ids.allocate(), Some(2));
    }

    #[test]
    fn bitmap_spans_words() {
        let mut ids = SctpStreamIds::new(130);
        for _ in 0..130 {
            assert!(ids.allocate().is_some());
        }
        assert_eq!(ids.allocate(), None);
        ids.release(129);
        assert_eq!(ids.allocate(), Some(129));
        ids.release(500);
    }

    #[test]
    fn empty_pool_never_allocates() {
        let mut ids = SctpStreamIds::new(0);
        assert_eq!(ids.allocate(), None);
    }
}
