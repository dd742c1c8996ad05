//! # pma-rs
//!
//! A cache-friendly sorted set using a Packed-Memory Array (PMA).
//!
//! A PMA keeps a dynamic multiset of ordered keys physically sorted in one
//! contiguous array interspersed with controlled gaps, so range scans touch
//! the minimal number of cache lines while single-key insertion and deletion
//! stay sub-linear on average. The array is divided into fixed-size segments,
//! and contiguous runs of segments form the windows of an implicit binary
//! tree. Per-height density thresholds decide when a local redistribution or
//! a whole-structure resize is needed.
//!
//! Based on "An Adaptive Packed-Memory Array" (Bender & Hu, TODS 2007).
//!
//! ## Example
//!
//! ```rust
//! use pma_rs::PackedMemoryArray;
//!
//! let mut pma: PackedMemoryArray<i64> = PackedMemoryArray::new();
//! pma.insert(5);
//! pma.insert(3);
//! pma.insert(8);
//! pma.insert(1);
//!
//! let keys: Vec<i64> = pma.iter().collect();
//! assert_eq!(keys, vec![1, 3, 5, 8]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::error::Error;
use std::fmt;

// =============================================================================
// Configuration
// =============================================================================

/// Capacity of a freshly constructed array (power of two).
const INITIAL_CAPACITY: usize = 4;

/// Smallest capacity the structure will ever allocate.
const MIN_CAPACITY: usize = 2;

/// Growth/shrink factor applied on resize. Must keep capacity a power of two.
const SCALE_FACTOR: usize = 2;

// Density thresholds. Windows at height h accept occupancy ratios in
// (lower(h), upper(h)); the bounds interpolate linearly between the leaf and
// root constants. The root is kept sparser than the leaves so that local
// violations can usually be absorbed by a small ancestor window instead of
// forcing a full resize:
//
//     LEAF_LOWER <= lower(h) <= ROOT_LOWER < ROOT_UPPER <= upper(h) <= LEAF_UPPER
const LEAF_LOWER_DENSITY: f64 = 0.1;
const ROOT_LOWER_DENSITY: f64 = 0.2;
const ROOT_UPPER_DENSITY: f64 = 0.5;
const LEAF_UPPER_DENSITY: f64 = 1.0;

// =============================================================================
// Errors
// =============================================================================

/// Errors from direct slot reads and threshold queries.
///
/// These cover contract violations by the caller. Internal invariant
/// violations (inconsistent geometry, a non-total search) are bugs in the
/// rebalance/resize logic and panic instead of being reported here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessError {
    /// A slot index at or past the end of the allocated storage.
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Current capacity of the array.
        capacity: usize,
    },
    /// A window height above the root of the implicit tree.
    HeightOutOfRange {
        /// The offending height.
        height: usize,
        /// Height of the root, the largest valid value.
        tree_height: usize,
    },
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfBounds { index, capacity } => {
                write!(f, "slot index {index} out of bounds (capacity {capacity})")
            }
            Self::HeightOutOfRange { height, tree_height } => {
                write!(f, "height {height} above tree root (tree height {tree_height})")
            }
        }
    }
}

impl Error for AccessError {}

// =============================================================================
// Occupancy map
// =============================================================================

/// One bit per slot: set means the slot holds a live key.
#[derive(Clone, Debug)]
struct OccupancyMap {
    words: Vec<u64>,
}

impl OccupancyMap {
    fn new(capacity: usize) -> Self {
        Self {
            words: vec![0u64; capacity.div_ceil(64)],
        }
    }

    #[inline]
    fn is_occupied(&self, index: usize) -> bool {
        (self.words[index >> 6] >> (index & 63)) & 1 != 0
    }

    #[inline]
    fn set(&mut self, index: usize) {
        self.words[index >> 6] |= 1u64 << (index & 63);
    }

    #[inline]
    fn clear(&mut self, index: usize) {
        self.words[index >> 6] &= !(1u64 << (index & 63));
    }

    /// Number of occupied slots in `[start, end)`, by masked popcounts.
    fn count_range(&self, start: usize, end: usize) -> usize {
        if start >= end {
            return 0;
        }
        let first = start >> 6;
        let last = (end - 1) >> 6;
        let head_mask = !0u64 << (start & 63);
        let tail_mask = !0u64 >> (63 - ((end - 1) & 63));

        if first == last {
            return (self.words[first] & head_mask & tail_mask).count_ones() as usize;
        }
        let mut total = (self.words[first] & head_mask).count_ones() as usize;
        for word in &self.words[first + 1..last] {
            total += word.count_ones() as usize;
        }
        total + (self.words[last] & tail_mask).count_ones() as usize
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Derives `(segment_size, tree_height)` from a capacity.
///
/// Both quantities come from this one function so they can never drift apart
/// after a resize: `segment_size = next_power_of_two(log2(capacity))` and
/// `tree_height = log2(capacity / segment_size)`. For every power-of-two
/// capacity >= 2 this yields at least two segments, so the tree height is at
/// least 1 and threshold interpolation never divides by zero.
fn derive_geometry(capacity: usize) -> (usize, usize) {
    assert!(
        capacity.is_power_of_two() && capacity >= MIN_CAPACITY,
        "capacity must be a power of two >= {MIN_CAPACITY}, got {capacity}"
    );
    let log2 = capacity.trailing_zeros() as usize;
    let segment_size = log2.next_power_of_two();
    let height = (capacity / segment_size).trailing_zeros() as usize;
    assert_eq!(
        segment_size << height,
        capacity,
        "segment size {segment_size} and height {height} inconsistent with capacity {capacity}"
    );
    (segment_size, height)
}

// =============================================================================
// Packed-memory array
// =============================================================================

/// A sorted multiset of scalar keys stored in a packed-memory array.
///
/// Reading all occupied slots left to right always yields the keys in
/// non-decreasing order; free slots carry no value and may appear anywhere
/// between occupied runs. Capacity is always a power of two and only changes
/// through the resize path.
///
/// All operations are single-threaded and run to completion; wrap the whole
/// structure in a lock if concurrent access is needed.
#[derive(Clone, Debug)]
pub struct PackedMemoryArray<K> {
    slots: Vec<K>,
    occupancy: OccupancyMap,
    len: usize,
    segment_size: usize,
    height: usize,
    /// Shrink never goes below the construction capacity.
    floor_capacity: usize,
}

impl<K: Ord + Copy + Default> PackedMemoryArray<K> {
    /// Create an empty array with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Create an empty array with at least `capacity` slots.
    ///
    /// The requested capacity is rounded up to a power of two, minimum 2,
    /// and becomes the floor below which the structure never shrinks.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        let (segment_size, height) = derive_geometry(capacity);
        Self {
            slots: vec![K::default(); capacity],
            occupancy: OccupancyMap::new(capacity),
            len: 0,
            segment_size,
            height,
            floor_capacity: capacity,
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Number of keys currently stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no keys.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total number of slots, occupied or free. Always a power of two.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots in a leaf segment.
    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Number of leaf segments. `capacity() / segment_size()`.
    #[inline]
    pub fn number_of_segments(&self) -> usize {
        self.capacity() / self.segment_size
    }

    /// Height of the implicit window tree; leaves are height 0.
    #[inline]
    pub fn tree_height(&self) -> usize {
        self.height
    }

    /// Read the slot at `index`. `Ok(None)` means the slot is free.
    pub fn get(&self, index: usize) -> Result<Option<K>, AccessError> {
        if index >= self.capacity() {
            return Err(AccessError::IndexOutOfBounds {
                index,
                capacity: self.capacity(),
            });
        }
        Ok(self.occupancy.is_occupied(index).then(|| self.slots[index]))
    }

    /// Whether the slot at `index` holds a live key.
    pub fn is_occupied(&self, index: usize) -> Result<bool, AccessError> {
        if index >= self.capacity() {
            return Err(AccessError::IndexOutOfBounds {
                index,
                capacity: self.capacity(),
            });
        }
        Ok(self.occupancy.is_occupied(index))
    }

    /// Upper density threshold for windows at `height`.
    ///
    /// Interpolates from `1.0` at the leaves down to the root constant.
    /// `upper_density_threshold(0)` is exactly `1.0`.
    pub fn upper_density_threshold(&self, height: usize) -> Result<f64, AccessError> {
        if height > self.height {
            return Err(AccessError::HeightOutOfRange {
                height,
                tree_height: self.height,
            });
        }
        Ok(self.udt(height))
    }

    /// Lower density threshold for windows at `height`.
    ///
    /// Interpolates from the leaf constant up to the root constant.
    pub fn lower_density_threshold(&self, height: usize) -> Result<f64, AccessError> {
        if height > self.height {
            return Err(AccessError::HeightOutOfRange {
                height,
                tree_height: self.height,
            });
        }
        Ok(self.ldt(height))
    }

    /// Whether every window at every height currently sits within both of its
    /// density thresholds.
    ///
    /// Diagnostic predicate, O(capacity); not on the insert/erase hot path.
    /// A sparsely filled array honestly reports `false`, since small windows
    /// sit below their lower thresholds.
    pub fn within_balance(&self) -> bool {
        for h in 0..=self.height {
            let length = self.segment_size << h;
            let mut start = 0;
            while start < self.capacity() {
                let occupied = self.occupancy.count_range(start, start + length);
                let density = occupied as f64 / length as f64;
                if density > self.udt(h) || density < self.ldt(h) {
                    return false;
                }
                start += length;
            }
        }
        true
    }

    /// Ascending iterator over all stored keys.
    pub fn iter(&self) -> Iter<'_, K> {
        Iter { pma: self, index: 0 }
    }

    /// Whether at least one copy of `key` is stored.
    pub fn contains(&self, key: K) -> bool {
        self.find(key).is_some()
    }

    /// Index of the slot holding the immediate predecessor of `key`, i.e. the
    /// largest stored key strictly less than `key`. `None` when no stored key
    /// is smaller.
    pub fn predecessor(&self, key: K) -> Option<usize> {
        let mut best = None;
        for i in 0..self.capacity() {
            if !self.occupancy.is_occupied(i) {
                continue;
            }
            if self.slots[i] >= key {
                break;
            }
            best = Some(i);
        }
        best
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Insert `key`, keeping all occupied slots globally sorted.
    ///
    /// Duplicates are permitted; a new equal key lands immediately after the
    /// existing run of equal keys. If the write pushes the target segment to
    /// its upper density threshold, the rebalance cascade runs, possibly
    /// growing the whole structure.
    pub fn insert(&mut self, key: K) {
        let mut rebalanced = false;
        let (segment, pos) = loop {
            let segment = self.segment_for(key);
            let occupied = self
                .occupancy
                .count_range(segment, segment + self.segment_size);
            if occupied < self.segment_size {
                break (segment, self.slot_in_segment(segment, key));
            }
            // A fully packed leaf cannot absorb the key; open space first,
            // then locate again against the new layout.
            if rebalanced {
                self.grow();
            } else {
                self.rebalance_overflow(segment);
                rebalanced = true;
            }
        };

        self.place(segment, pos, key);
        self.len += 1;

        let occupied = self
            .occupancy
            .count_range(segment, segment + self.segment_size);
        if occupied as f64 / self.segment_size as f64 >= self.udt(0) {
            self.rebalance_overflow(segment);
        }
    }

    /// Remove one copy of `key`. Returns `false` if the key is not stored.
    ///
    /// Removes the first occupied slot in sorted order comparing equal. If
    /// the removal drops the segment to its lower density threshold, the
    /// shrink-side rebalance cascade runs.
    pub fn erase(&mut self, key: K) -> bool {
        let Some(index) = self.find(key) else {
            return false;
        };
        self.occupancy.clear(index);
        self.slots[index] = K::default();
        self.len -= 1;

        let segment = index - index % self.segment_size;
        let occupied = self
            .occupancy
            .count_range(segment, segment + self.segment_size);
        if occupied as f64 / self.segment_size as f64 <= self.ldt(0) {
            self.rebalance_underflow(segment);
        }
        true
    }

    /// Remove all keys, keeping the current capacity.
    pub fn clear(&mut self) {
        let capacity = self.capacity();
        self.clear_window(0, capacity);
        self.len = 0;
    }

    // -------------------------------------------------------------------------
    // Insertion-point locator
    // -------------------------------------------------------------------------

    /// Start index of the leaf segment `key` belongs in: the last segment
    /// whose smallest occupied key is <= `key`, or the first segment when
    /// every stored key is greater (or the array is empty).
    fn segment_for(&self, key: K) -> usize {
        let mut target = 0;
        let mut seg = 0;
        while seg < self.capacity() {
            match self.first_occupied(seg, seg + self.segment_size) {
                Some(i) if self.slots[i] <= key => target = seg,
                Some(_) => break,
                None => {}
            }
            seg += self.segment_size;
        }
        target
    }

    /// Slot index within `segment` at which `key` preserves sortedness:
    /// every occupied slot before it is <= `key` and every occupied slot at
    /// or after it is > `key`. May return the one-past-the-end index of the
    /// segment when `key` is greater than everything scanned; `place` resolves
    /// that by shifting left into the last slot.
    fn slot_in_segment(&self, segment: usize, key: K) -> usize {
        let mut pos = segment;
        for i in segment..segment + self.segment_size {
            if !self.occupancy.is_occupied(i) {
                continue;
            }
            if self.slots[i] <= key {
                pos = i + 1;
            } else {
                break;
            }
        }
        pos
    }

    fn first_occupied(&self, start: usize, end: usize) -> Option<usize> {
        (start..end).find(|&i| self.occupancy.is_occupied(i))
    }

    /// First occupied slot in sorted order holding exactly `key`.
    fn find(&self, key: K) -> Option<usize> {
        for i in 0..self.capacity() {
            if !self.occupancy.is_occupied(i) {
                continue;
            }
            if self.slots[i] == key {
                return Some(i);
            }
            if self.slots[i] > key {
                // Sorted: nothing equal can follow.
                return None;
            }
        }
        None
    }

    /// Write `key` at `pos` inside `segment`, shifting within the segment to
    /// open a free slot when `pos` is occupied. The shift direction is toward
    /// whichever side has the nearer free slot.
    ///
    /// Precondition: the segment has at least one free slot (`insert`
    /// guarantees this before calling).
    fn place(&mut self, segment: usize, pos: usize, key: K) {
        let seg_end = segment + self.segment_size;
        debug_assert!(segment % self.segment_size == 0 && pos >= segment && pos <= seg_end);

        if pos < seg_end && !self.occupancy.is_occupied(pos) {
            self.slots[pos] = key;
            self.occupancy.set(pos);
            return;
        }

        let right = (pos..seg_end).find(|&i| !self.occupancy.is_occupied(i));
        let left = (segment..pos).rev().find(|&i| !self.occupancy.is_occupied(i));
        match (left, right) {
            (None, Some(r)) => self.shift_right(pos, r, key),
            (Some(l), None) => self.shift_left(l, pos, key),
            (Some(l), Some(r)) => {
                if r - pos <= pos - l {
                    self.shift_right(pos, r, key);
                } else {
                    self.shift_left(l, pos, key);
                }
            }
            (None, None) => unreachable!("insert target segment has no free slot"),
        }
    }

    /// Shift the occupied run `[pos, free)` one slot right, then write `key`
    /// at `pos`.
    fn shift_right(&mut self, pos: usize, free: usize, key: K) {
        debug_assert!(free > pos && !self.occupancy.is_occupied(free));
        for i in (pos + 1..=free).rev() {
            self.slots[i] = self.slots[i - 1];
        }
        self.occupancy.set(free);
        self.slots[pos] = key;
    }

    /// Shift the occupied run `(free, pos)` one slot left, then write `key`
    /// at `pos - 1`.
    fn shift_left(&mut self, free: usize, pos: usize, key: K) {
        debug_assert!(free < pos && !self.occupancy.is_occupied(free));
        for i in free..pos - 1 {
            self.slots[i] = self.slots[i + 1];
        }
        self.occupancy.set(free);
        self.slots[pos - 1] = key;
    }

    // -------------------------------------------------------------------------
    // Rebalancer
    // -------------------------------------------------------------------------

    /// Walk up from the height-1 window containing `segment` until a window
    /// strictly below its upper threshold absorbs the violation; grow the
    /// whole structure when even the root is at or above its threshold.
    fn rebalance_overflow(&mut self, segment: usize) {
        for h in 1..=self.height {
            let length = self.segment_size << h;
            let start = segment - segment % length;
            let occupied = self.occupancy.count_range(start, start + length);
            if (occupied as f64 / length as f64) < self.udt(h) {
                self.redistribute(start, length);
                return;
            }
        }
        self.grow();
    }

    /// Shrink-side walk: find the smallest ancestor window strictly above its
    /// lower threshold and redistribute it; shrink the whole structure when
    /// even the root is at or below its threshold.
    fn rebalance_underflow(&mut self, segment: usize) {
        for h in 1..=self.height {
            let length = self.segment_size << h;
            let start = segment - segment % length;
            let occupied = self.occupancy.count_range(start, start + length);
            if (occupied as f64 / length as f64) > self.ldt(h) {
                self.redistribute(start, length);
                return;
            }
        }
        self.shrink();
    }

    /// Two-phase redistribution: compact all occupied slots to the left end
    /// of the window, then re-space them evenly from right to left. Both
    /// phases are O(window length) and fully in place.
    fn redistribute(&mut self, start: usize, length: usize) {
        let occupied = self.compact_left(start, length);
        self.spread(start, length, occupied);
    }

    /// Phase 1: move every occupied slot in `[start, start+length)` to the
    /// left end of the window, preserving relative order. Returns the number
    /// of occupied slots.
    fn compact_left(&mut self, start: usize, length: usize) -> usize {
        let mut next = start;
        for i in start..start + length {
            if !self.occupancy.is_occupied(i) {
                continue;
            }
            if i != next {
                self.slots[next] = self.slots[i];
                self.occupancy.set(next);
                self.slots[i] = K::default();
                self.occupancy.clear(i);
            }
            next += 1;
        }
        next - start
    }

    /// Phase 2: space `occupied` left-compacted elements evenly across the
    /// window. Element `k` lands at `start + (k * length) / occupied`;
    /// destinations are strictly increasing and never left of their sources,
    /// so moving right to left never clobbers an unmoved element.
    fn spread(&mut self, start: usize, length: usize, occupied: usize) {
        if occupied == 0 {
            return;
        }
        debug_assert!(occupied <= length);
        for k in (0..occupied).rev() {
            let src = start + k;
            let dst = start + (k * length) / occupied;
            if dst != src {
                self.slots[dst] = self.slots[src];
                self.occupancy.set(dst);
                self.slots[src] = K::default();
                self.occupancy.clear(src);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Resizer
    // -------------------------------------------------------------------------

    fn grow(&mut self) {
        self.rebuild(self.capacity() * SCALE_FACTOR);
    }

    /// Halve the capacity, never going below the construction floor. At the
    /// floor the root window is redistributed in place instead.
    fn shrink(&mut self) {
        let new_capacity = (self.capacity() / SCALE_FACTOR).max(self.floor_capacity);
        if new_capacity == self.capacity() {
            let capacity = self.capacity();
            self.redistribute(0, capacity);
        } else {
            self.rebuild(new_capacity);
        }
    }

    /// Replace the storage with a fresh allocation of `new_capacity` slots,
    /// rederive the geometry, and spread all elements evenly across the whole
    /// array. The only path that changes capacity.
    fn rebuild(&mut self, new_capacity: usize) {
        assert!(
            new_capacity >= self.len,
            "resize to {new_capacity} would drop elements ({} stored)",
            self.len
        );
        let (segment_size, height) = derive_geometry(new_capacity);
        let mut slots = vec![K::default(); new_capacity];
        let mut occupancy = OccupancyMap::new(new_capacity);

        let mut next = 0;
        for i in 0..self.capacity() {
            if self.occupancy.is_occupied(i) {
                slots[next] = self.slots[i];
                occupancy.set(next);
                next += 1;
            }
        }
        debug_assert_eq!(next, self.len);

        self.slots = slots;
        self.occupancy = occupancy;
        self.segment_size = segment_size;
        self.height = height;
        self.spread(0, new_capacity, next);
    }

    // -------------------------------------------------------------------------
    // Storage primitives
    // -------------------------------------------------------------------------

    /// Zero the values and clear the occupancy of every slot in
    /// `[start, start+length)`.
    fn clear_window(&mut self, start: usize, length: usize) {
        for i in start..start + length {
            self.slots[i] = K::default();
            self.occupancy.clear(i);
        }
    }

    // -------------------------------------------------------------------------
    // Thresholds (internal, height already validated)
    // -------------------------------------------------------------------------

    #[inline]
    fn udt(&self, height: usize) -> f64 {
        debug_assert!(self.height >= 1 && height <= self.height);
        ROOT_UPPER_DENSITY
            + (LEAF_UPPER_DENSITY - ROOT_UPPER_DENSITY) * ((self.height - height) as f64)
                / self.height as f64
    }

    #[inline]
    fn ldt(&self, height: usize) -> f64 {
        debug_assert!(self.height >= 1 && height <= self.height);
        ROOT_LOWER_DENSITY
            - (ROOT_LOWER_DENSITY - LEAF_LOWER_DENSITY) * ((self.height - height) as f64)
                / self.height as f64
    }
}

impl<K: Ord + Copy + Default> Default for PackedMemoryArray<K> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Ascending iterator over the occupied slots of a [`PackedMemoryArray`].
pub struct Iter<'a, K> {
    pma: &'a PackedMemoryArray<K>,
    index: usize,
}

impl<K: Ord + Copy + Default> Iterator for Iter<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        while self.index < self.pma.capacity() {
            let i = self.index;
            self.index += 1;
            if self.pma.occupancy.is_occupied(i) {
                return Some(self.pma.slots[i]);
            }
        }
        None
    }
}


#[cfg(test)]
mod proptests;
