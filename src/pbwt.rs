//! Positional Burrows-Wheeler permutation applied to integer FORMAT
//! vectors before serialization. Consecutive records of a block share one
//! permutation per (field, length) pair; sorting each column by the
//! previous permutation clusters runs of equal values for zstd.

use std::collections::HashMap;

/// Permutation state for one (FORMAT key, vector length) pair.
#[derive(Debug, Default, Clone)]
pub struct PbwtState {
    sort_map: Vec<usize>,
}

impl PbwtState {
    fn mapping(&mut self, len: usize) -> &mut Vec<usize> {
        if self.sort_map.len() != len {
            self.sort_map.clear();
            self.sort_map.extend(0..len);
        }
        &mut self.sort_map
    }
}

/// All per-field states of a reader or writer, keyed by FORMAT key and
/// vector length. Reset at block boundaries and on contig change.
#[derive(Debug, Default)]
pub struct PbwtContext {
    states: HashMap<(String, usize), PbwtState>,
}

impl PbwtContext {
    pub fn state(&mut self, key: &str, len: usize) -> &mut PbwtState {
        self.states
            .entry((key.to_string(), len))
            .or_insert_with(PbwtState::default)
    }

    /// Restores every permutation to identity.
    pub fn reset(&mut self) {
        for state in self.states.values_mut() {
            for (i, slot) in state.sort_map.iter_mut().enumerate() {
                *slot = i;
            }
        }
    }
}

/// Element types eligible for the transform (8- and 16-bit signed only).
pub trait PbwtElem: Copy {
    fn bucket(self) -> usize;
    const BUCKETS: usize;
}

impl PbwtElem for i8 {
    fn bucket(self) -> usize {
        self as u8 as usize
    }
    const BUCKETS: usize = 1 << 8;
}

impl PbwtElem for i16 {
    fn bucket(self) -> usize {
        self as u16 as usize
    }
    const BUCKETS: usize = 1 << 16;
}

/// Emits `values` permuted by the current sort map and advances the map by
/// counting-sorting element positions on their unsigned value.
pub fn sort<T: PbwtElem>(values: &[T], state: &mut PbwtState) -> Vec<T> {
    let prev = state.mapping(values.len()).clone();

    let mut counts = vec![0usize; T::BUCKETS + 1];
    for &v in values {
        counts[v.bucket() + 1] += 1;
    }
    for i in 1..counts.len() {
        counts[i] += counts[i - 1];
    }

    let next = state.mapping(values.len());
    for &unsorted_index in &prev {
        let bucket = values[unsorted_index].bucket();
        next[counts[bucket]] = unsorted_index;
        counts[bucket] += 1;
    }

    prev.iter().map(|&i| values[i]).collect()
}

/// Inverse transform: scatters permuted `values` back to their original
/// slots and advances the map with the same counting rule as `sort`.
pub fn unsort<T: PbwtElem>(values: &[T], state: &mut PbwtState) -> Vec<T> {
    if values.is_empty() {
        return Vec::new();
    }
    let prev = state.mapping(values.len()).clone();

    let mut restored = vec![values[0]; values.len()];
    let mut counts = vec![0usize; T::BUCKETS + 1];
    for &v in values {
        counts[v.bucket() + 1] += 1;
    }
    for i in 1..counts.len() {
        counts[i] += counts[i - 1];
    }

    let next = state.mapping(values.len());
    for (i, &unsorted_index) in prev.iter().enumerate() {
        restored[unsorted_index] = values[i];
        let bucket = values[i].bucket();
        next[counts[bucket]] = unsorted_index;
        counts[bucket] += 1;
    }

    restored
}
