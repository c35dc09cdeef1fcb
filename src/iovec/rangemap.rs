//! A thin, inclusive-range wrapper around [`rangemap::RangeMap`].
//!
//! The wire format and the original tool both describe ranges as `[key_min, key_max]`
//! (both ends inclusive); `rangemap` itself works in terms of half-open `Range<T>`. This
//! module is the single place that does the `+1` dance so the rest of the crate can stay
//! in inclusive-range terms, matching `VG_(indexRangeMap)`/`VG_(bindRangeMap)`.

use rangemap::RangeMap as HalfOpenRangeMap;

/// An address-keyed range map with inclusive `[min, max]` bounds and `Clone + Eq` values,
/// standing in for `VG_(newRangeMap)`/`VG_(bindRangeMap)`/`VG_(indexRangeMap)`.
#[derive(Clone, Debug, Default)]
pub struct AddrRangeMap<V> {
    inner: HalfOpenRangeMap<u64, V>,
}

impl<V: Clone + Eq> AddrRangeMap<V> {
    pub fn new() -> Self {
        Self { inner: HalfOpenRangeMap::new() }
    }

    /// Binds `[min, max]` (inclusive) to `value`, overwriting any overlap. Mirrors
    /// `VG_(bindRangeMap)`.
    pub fn insert(&mut self, min: u64, max: u64, value: V) {
        debug_assert!(min <= max);
        // max is inclusive; half-open upper bound is max + 1. Saturate so a max of u64::MAX
        // doesn't wrap to an empty range.
        let end = max.saturating_add(1);
        self.inner.insert(min..end, value);
    }

    /// Returns the `[min, max, value]` triple covering `addr`, if any. Mirrors
    /// `VG_(lookupRangeMap)`.
    pub fn lookup(&self, addr: u64) -> Option<(u64, u64, &V)> {
        self.inner.get_key_value(&addr).map(|(range, v)| (range.start, range.end - 1, v))
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.inner.get(&addr).is_some()
    }

    /// Number of disjoint ranges currently bound. Mirrors `VG_(sizeRangeMap)`.
    pub fn len(&self) -> usize {
        self.inner.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.iter().next().is_none()
    }

    /// Iterates ranges in ascending key order as `(min, max, value)` triples, equivalent to
    /// repeated `VG_(indexRangeMap)` calls.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &V)> {
        self.inner.iter().map(|(range, v)| (range.start, range.end - 1, v))
    }

    /// Replaces the contents of `self` with a copy of `other`. Mirrors `VG_(copyRangeMap)`.
    pub fn copy_from(&mut self, other: &Self) {
        self.inner = HalfOpenRangeMap::new();
        for (min, max, v) in other.iter() {
            self.insert(min, max, v.clone());
        }
    }
}

impl<V: Clone + Eq> FromIterator<(u64, u64, V)> for AddrRangeMap<V> {
    fn from_iter<I: IntoIterator<Item = (u64, u64, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (min, max, v) in iter {
            map.insert(min, max, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup_inclusive_bounds() {
        let mut map: AddrRangeMap<u8> = AddrRangeMap::new();
        map.insert(0x1000, 0x100f, 7);

        assert_eq!(map.lookup(0x1000), Some((0x1000, 0x100f, &7)));
        assert_eq!(map.lookup(0x100f), Some((0x1000, 0x100f, &7)));
        assert_eq!(map.lookup(0x1010), None);
    }

    #[test]
    fn test_overlap_overwrites() {
        let mut map: AddrRangeMap<u8> = AddrRangeMap::new();
        map.insert(0, 15, 1);
        map.insert(8, 23, 2);

        assert_eq!(map.lookup(4), Some((0, 7, &1)));
        assert_eq!(map.lookup(8), Some((8, 23, &2)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_copy_from() {
        let mut src: AddrRangeMap<u8> = AddrRangeMap::new();
        src.insert(0, 7, 1);
        src.insert(8, 15, 2);

        let mut dst: AddrRangeMap<u8> = AddrRangeMap::new();
        dst.insert(100, 200, 9);
        dst.copy_from(&src);

        assert_eq!(dst.len(), 2);
        assert_eq!(dst.lookup(10), Some((8, 15, &2)));
        assert_eq!(dst.lookup(150), None);
    }
}
