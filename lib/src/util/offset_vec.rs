use std::fmt::{Debug, Error, Formatter};
use std::iter::Enumerate;
use std::result::Result;
use std::slice::Iter;

/// Elements with a width (eg. when used in an `OffsetVec`)
pub trait Width {
    fn width(&self) -> usize;
}

/// A vector of elements of different logical "widths", where offsets into the vector are given in
/// terms of the sum of the widths of the previous elements (as opposed to the number of preceding
/// elements).
///
/// The constant pool is the main user: most entries have width 1, but `long` and `double`
/// constants take up two indices and the index after them is unusable.
#[derive(Clone)]
pub struct OffsetVec<T: Sized> {
    /// Entries, along with their offset
    entries: Vec<(Offset, T)>,

    /// Offset of the next element to be added
    offset_len: Offset,

    /// Offset for the first element (usually 0, but sometimes 1)
    initial_offset: Offset,
}

/// Offset into an `OffsetVec`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub usize);

impl<T: Sized + Width> OffsetVec<T> {
    /// New empty offset vector, with a custom starting offset
    pub fn new_starting_at(initial_offset: Offset) -> OffsetVec<T> {
        OffsetVec {
            entries: vec![],
            offset_len: initial_offset,
            initial_offset,
        }
    }

    /// Length of the `OffsetVec` (aka. number of entries)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current offset size of the `OffsetVec` (aka. offset of the next element
    /// to be added)
    pub fn offset_len(&self) -> Offset {
        self.offset_len
    }

    /// Add an entry to the back
    pub fn push(&mut self, slot: T) -> Offset {
        let offset = self.offset_len;
        self.offset_len.0 += slot.width();
        self.entries.push((offset, slot));

        offset
    }

    /// Empty the vector
    pub fn clear(&mut self) {
        self.entries.clear();
        self.offset_len = self.initial_offset;
    }

    /// Get an entry by its offset in the vector
    ///
    /// Offsets falling in the middle of a wide element or past the end are `None`. This uses
    /// binary search to find the offset.
    pub fn get_offset(&self, offset: Offset) -> Option<&T> {
        self.entries
            .binary_search_by_key(&offset, |(off, _)| *off)
            .ok()
            .map(|found_idx| &self.entries[found_idx].1)
    }

    pub fn iter(&self) -> OffsetVecIter<'_, T> {
        self.into_iter()
    }
}

impl<A: PartialEq> PartialEq for OffsetVec<A> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<A: Eq> Eq for OffsetVec<A> {}

/// Iterator for borrowed `OffsetVec`
pub struct OffsetVecIter<'a, T>(Enumerate<Iter<'a, (Offset, T)>>);

impl<'a, T> Iterator for OffsetVecIter<'a, T> {
    type Item = (Offset, usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(idx, (off, elem))| (*off, idx, elem))
    }
}

impl<'a, T> IntoIterator for &'a OffsetVec<T> {
    type Item = (Offset, usize, &'a T);
    type IntoIter = OffsetVecIter<'a, T>;

    fn into_iter(self) -> OffsetVecIter<'a, T> {
        OffsetVecIter(self.entries.iter().enumerate())
    }
}

impl<T: Debug> Debug for OffsetVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let mut list = f.debug_list();
        for (off, elem) in &self.entries {
            list.entry(&format_args!("#{} = {:?}", off.0, elem));
        }
        list.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    enum Slot {
        Narrow(u8),
        Wide(u8),
    }

    impl Width for Slot {
        fn width(&self) -> usize {
            match self {
                Slot::Narrow(_) => 1,
                Slot::Wide(_) => 2,
            }
        }
    }

    #[test]
    fn pool_like_offsets_start_at_one() {
        let mut slots = OffsetVec::new_starting_at(Offset(1));
        assert_eq!(slots.push(Slot::Narrow(1)), Offset(1));
        assert_eq!(slots.push(Slot::Wide(2)), Offset(2));
        assert_eq!(slots.push(Slot::Narrow(3)), Offset(4));
        assert_eq!(slots.offset_len(), Offset(5));
        assert_eq!(slots.len(), 3);

        assert_eq!(
            slots.iter().map(|(off, idx, s)| (off, idx, *s)).collect::<Vec<_>>(),
            vec![
                (Offset(1), 0, Slot::Narrow(1)),
                (Offset(2), 1, Slot::Wide(2)),
                (Offset(4), 2, Slot::Narrow(3)),
            ]
        );
    }

    #[test]
    fn lookups_inside_wide_entries_miss() {
        let mut slots = OffsetVec::new_starting_at(Offset(1));
        slots.push(Slot::Wide(7));
        slots.push(Slot::Narrow(8));

        assert_eq!(slots.get_offset(Offset(0)), None);
        assert_eq!(slots.get_offset(Offset(1)), Some(&Slot::Wide(7)));
        assert_eq!(slots.get_offset(Offset(2)), None);
        assert_eq!(slots.get_offset(Offset(3)), Some(&Slot::Narrow(8)));
        assert_eq!(slots.get_offset(Offset(4)), None);

        slots.clear();
        assert!(slots.is_empty());
        assert_eq!(slots.offset_len(), Offset(1));
    }
}
