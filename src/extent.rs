//! Per-file tracking of the byte ranges whose authoritative contents still
//! live only in the source layer.
//!
//! The list is an ordered set of disjoint half-open ranges. It is owned by
//! the file handle and every access goes through the handle's extent lock,
//! so nothing here synchronizes.

use smallvec::SmallVec;

use crate::Error;
use crate::Result;

/// A contiguous byte range `[off, off + len)` not yet present in the
/// destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    /// Offset of the first missing byte.
    pub(crate) off: u64,
    /// Number of missing bytes. Always non-zero.
    pub(crate) len: u64,
}

impl Extent {
    /// One past the last missing byte.
    pub(crate) fn end(&self) -> u64 {
        self.off + self.len
    }
}

/// Where the bytes for a read must come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadPlan {
    /// No hole overlaps the range: the destination has all of it.
    Destination,
    /// The range lies entirely inside one hole: the source has all of it.
    Source,
    /// The range begins in migrated territory and ends inside the returned
    /// hole. The prefix comes from the destination, the rest from the
    /// source.
    Partial(Extent),
}

/// An ordered list of disjoint holes, lowest offset first.
#[derive(Debug, Default)]
pub(crate) struct ExtentList {
    holes: SmallVec<[Extent; 4]>,
}

impl ExtentList {
    /// Initialize the list with the single hole `[0, len)` covering a fresh
    /// destination file backed by a source of `len` bytes.
    pub(crate) fn insert_full(&mut self, len: u64) {
        debug_assert!(self.holes.is_empty());
        if len > 0 {
            self.holes.push(Extent { off: 0, len });
        }
    }

    /// Append a hole at the tail during metadata import. The hole must lie
    /// strictly after every existing hole.
    pub(crate) fn push(&mut self, off: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidArgument(
                "length zero extent found, this is an error".to_string(),
            ));
        }
        if let Some(last) = self.holes.last() {
            if off < last.end() {
                return Err(Error::InvalidArgument(format!(
                    "extent at offset {off} overlaps the previous extent ending at {}",
                    last.end()
                )));
            }
        }
        self.holes.push(Extent { off, len });
        Ok(())
    }

    /// Track that `[off, off + len)` is now present in the destination by
    /// subtracting it from every overlapping hole. A write fully covering a
    /// hole deletes it, an interior write splits one hole into two, and an
    /// edge overlap shrinks the hole. Ranges that only touch a hole boundary
    /// leave it untouched.
    pub(crate) fn remove_range(&mut self, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = off + len;
        let mut remaining: SmallVec<[Extent; 4]> = SmallVec::new();
        for hole in &self.holes {
            if hole.end() <= off || hole.off >= end {
                remaining.push(*hole);
                continue;
            }
            if hole.off < off {
                remaining.push(Extent {
                    off: hole.off,
                    len: off - hole.off,
                });
            }
            if hole.end() > end {
                remaining.push(Extent {
                    off: end,
                    len: hole.end() - end,
                });
            }
        }
        self.holes = remaining;
    }

    /// Decide how a read of `[off, off + len)` must be serviced.
    ///
    /// The background copier fills each file in ascending offset order and
    /// foreground writers write whole blocks, so a read can begin outside a
    /// hole and end inside one, but never the reverse, and it can never
    /// straddle an entire hole. Either impossible shape is reported as
    /// corruption.
    pub(crate) fn classify(&self, off: u64, len: u64) -> Result<ReadPlan> {
        if len == 0 {
            return Ok(ReadPlan::Destination);
        }
        let end = off + len;
        // The holes are sorted, so the only candidate is the first hole
        // ending past the read's start.
        let hole = match self.holes.iter().find(|hole| hole.end() > off) {
            Some(hole) if hole.off < end => *hole,
            _ => return Ok(ReadPlan::Destination),
        };
        if off >= hole.off {
            if end <= hole.end() {
                return Ok(ReadPlan::Source);
            }
            return Err(Error::Corrupt(format!(
                "read {off}-{end} begins in the hole {}-{} but does not end in it",
                hole.off,
                hole.end()
            )));
        }
        if end <= hole.end() {
            return Ok(ReadPlan::Partial(hole));
        }
        Err(Error::Corrupt(format!(
            "read {off}-{end} encompasses the hole {}-{}",
            hole.off,
            hole.end()
        )))
    }

    /// The lowest-offset hole, if any.
    pub(crate) fn first(&self) -> Option<Extent> {
        self.holes.first().copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.holes.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.holes.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.holes.clear();
    }

    /// Offset one past the final hole, used to validate imported metadata
    /// against the source file size.
    pub(crate) fn last_end(&self) -> Option<u64> {
        self.holes.last().map(Extent::end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holes(list: &ExtentList) -> Vec<(u64, u64)> {
        list.iter().map(|hole| (hole.off, hole.len)).collect()
    }

    fn full(len: u64) -> ExtentList {
        let mut list = ExtentList::default();
        list.insert_full(len);
        list
    }

    #[test]
    fn insert_full_seeds_one_hole() {
        let list = full(4096);
        assert_eq!(holes(&list), vec![(0, 4096)]);
        assert_eq!(list.first(), Some(Extent { off: 0, len: 4096 }));
    }

    #[test]
    fn insert_full_of_zero_is_empty() {
        let list = full(0);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_fully_contained_hole() {
        let mut list = ExtentList::default();
        list.push(100, 50).unwrap();
        list.push(300, 50).unwrap();
        list.remove_range(100, 50);
        assert_eq!(holes(&list), vec![(300, 50)]);
    }

    #[test]
    fn remove_interior_range_splits_the_hole() {
        let mut list = full(10_000);
        list.remove_range(5000, 100);
        assert_eq!(holes(&list), vec![(0, 5000), (5100, 4900)]);
    }

    #[test]
    fn remove_left_overlap_shrinks_the_hole() {
        let mut list = ExtentList::default();
        list.push(1000, 1000).unwrap();
        list.remove_range(500, 700);
        assert_eq!(holes(&list), vec![(1200, 800)]);
    }

    #[test]
    fn remove_right_overlap_shrinks_the_hole() {
        let mut list = ExtentList::default();
        list.push(1000, 1000).unwrap();
        list.remove_range(1500, 1000);
        assert_eq!(holes(&list), vec![(1000, 500)]);
    }

    #[test]
    fn remove_spanning_multiple_holes() {
        let mut list = ExtentList::default();
        list.push(0, 100).unwrap();
        list.push(200, 100).unwrap();
        list.push(400, 100).unwrap();
        list.remove_range(50, 400);
        assert_eq!(holes(&list), vec![(0, 50), (450, 50)]);
    }

    #[test]
    fn remove_touching_a_boundary_is_a_no_op() {
        let mut list = ExtentList::default();
        list.push(1000, 1000).unwrap();
        // Ends exactly where the hole starts.
        list.remove_range(0, 1000);
        assert_eq!(holes(&list), vec![(1000, 1000)]);
        // Starts exactly where the hole ends.
        list.remove_range(2000, 1000);
        assert_eq!(holes(&list), vec![(1000, 1000)]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut list = full(10_000);
        list.remove_range(2000, 500);
        let first = holes(&list);
        list.remove_range(2000, 500);
        assert_eq!(holes(&list), first);
    }

    #[test]
    fn zero_length_remove_does_not_mutate() {
        let mut list = full(10_000);
        list.remove_range(5000, 0);
        assert_eq!(holes(&list), vec![(0, 10_000)]);
    }

    #[test]
    fn classify_outside_all_holes() {
        let mut list = ExtentList::default();
        list.push(4096, 4096).unwrap();
        assert_eq!(list.classify(0, 4096).unwrap(), ReadPlan::Destination);
        assert_eq!(list.classify(8192, 100).unwrap(), ReadPlan::Destination);
        assert_eq!(list.classify(0, 0).unwrap(), ReadPlan::Destination);
    }

    #[test]
    fn classify_inside_a_hole() {
        let mut list = ExtentList::default();
        list.push(4096, 4096).unwrap();
        assert_eq!(list.classify(4096, 4096).unwrap(), ReadPlan::Source);
        assert_eq!(list.classify(5000, 100).unwrap(), ReadPlan::Source);
    }

    #[test]
    fn classify_partial_from_the_left() {
        let mut list = ExtentList::default();
        list.push(4096, 4096).unwrap();
        assert_eq!(
            list.classify(4000, 200).unwrap(),
            ReadPlan::Partial(Extent { off: 4096, len: 4096 })
        );
    }

    #[test]
    fn classify_rejects_a_read_beginning_in_a_hole() {
        let mut list = ExtentList::default();
        list.push(0, 4096).unwrap();
        assert!(matches!(list.classify(4000, 200), Err(Error::Corrupt(_))));
    }

    #[test]
    fn classify_rejects_a_read_encompassing_a_hole() {
        let mut list = ExtentList::default();
        list.push(1000, 100).unwrap();
        assert!(matches!(list.classify(0, 4096), Err(Error::Corrupt(_))));
    }

    #[test]
    fn push_rejects_zero_length_and_overlap() {
        let mut list = ExtentList::default();
        assert!(list.push(0, 0).is_err());
        list.push(0, 100).unwrap();
        assert!(list.push(50, 10).is_err());
        // Exactly adjacent is allowed; the holes stay disjoint.
        list.push(100, 10).unwrap();
        assert_eq!(list.last_end(), Some(110));
    }
}
