// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Fixed-capacity rings addressed by typed indices.
//!
//! Both the request table and the raw buffer ring are small arrays walked
//! with wrapping cursors. [`Ring`] owns the storage and is the only place
//! where wraparound and bounds are computed; callers hold [`Index`] values
//! that cannot be confused between rings of different element types.

use std::{fmt, marker::PhantomData};

/// Position of an element inside a [`Ring<T>`].
///
/// The type parameter ties the index to the ring's element type so a
/// request slot index can never be used to address a raw buffer.
pub struct Index<T> {
    raw: usize,
    _ring: PhantomData<fn() -> T>,
}

impl<T> Index<T> {
    pub(crate) const fn new(raw: usize) -> Self {
        Index {
            raw,
            _ring: PhantomData,
        }
    }

    /// The plain array position, as used by hardware queue indices.
    pub const fn get(self) -> usize {
        self.raw
    }
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Index<T> {}

impl<T> PartialEq for Index<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Index<T> {}

impl<T> fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.raw)
    }
}

impl<T> fmt::Display for Index<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Fixed-capacity circular storage.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    items: Vec<T>,
}

impl<T> Ring<T> {
    /// Build a ring of `capacity` elements produced by `init`.
    ///
    /// A zero capacity is bumped to one so cursor arithmetic stays defined.
    pub fn from_fn(capacity: usize, init: impl FnMut(usize) -> T) -> Self {
        Ring {
            items: (0..capacity.max(1)).map(init).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Index of the first element.
    pub fn first(&self) -> Index<T> {
        Index::new(0)
    }

    /// Index following `index`, wrapping at capacity.
    pub fn next(&self, index: Index<T>) -> Index<T> {
        Index::new((index.raw + 1) % self.items.len())
    }

    /// Index preceding `index`, wrapping at zero.
    pub fn prev(&self, index: Index<T>) -> Index<T> {
        let len = self.items.len();
        Index::new((index.raw + len - 1) % len)
    }

    /// Convert a raw hardware index, rejecting anything out of range.
    pub fn index(&self, raw: usize) -> Option<Index<T>> {
        (raw < self.items.len()).then(|| Index::new(raw))
    }

    pub fn get(&self, index: Index<T>) -> &T {
        &self.items[index.raw]
    }

    pub fn get_mut(&mut self, index: Index<T>) -> &mut T {
        &mut self.items[index.raw]
    }

    /// Iterate elements together with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (Index<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Index::new(i), item))
    }

    /// Find the first element satisfying `pred`, scanning from index 0.
    pub fn position(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Index<T>> {
        self.items.iter().position(|item| pred(item)).map(Index::new)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound() {
        let ring = Ring::from_fn(3, |i| i * 10);
        let a = ring.first();
        let b = ring.next(a);
        let c = ring.next(b);
        assert_eq!(ring.next(c), a);
        assert_eq!(ring.prev(a), c);
        assert_eq!(*ring.get(c), 20);
    }

    #[test]
    fn test_index_bounds() {
        let ring = Ring::from_fn(4, |_| ());
        assert!(ring.index(3).is_some());
        assert!(ring.index(4).is_none());
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let ring: Ring<u8> = Ring::from_fn(0, |_| 0);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.next(ring.first()), ring.first());
    }

    #[test]
    fn test_position() {
        let ring = Ring::from_fn(5, |i| i as u32);
        assert_eq!(ring.position(|v| *v == 3).map(Index::get), Some(3));
        assert!(ring.position(|v| *v == 9).is_none());
    }
}
