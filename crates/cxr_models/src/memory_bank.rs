//! Rarity-gated memory bank.
//!
//! A fixed arena of `capacity × dim` values plus a write cursor. Slots are
//! written in ring order; a slot that was never written is not a valid
//! neighbour. Retrieval scans all occupied slots, which is cheap for the
//! few hundred entries the bank holds.

use std::cmp::Ordering;

use burn::prelude::*;
use tracing::debug;

use crate::state::{StateEntry, StateKind};

const NORM_EPS: f32 = 1e-12;

/// Fixed-capacity ring of pooled feature vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryBank {
    capacity: usize,
    dim: usize,
    rarity_threshold: f32,
    memory: Vec<f32>,
    occupied: Vec<bool>,
    cursor: usize,
}

impl MemoryBank {
    /// Create an empty bank.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `dim` is zero.
    pub fn new(capacity: usize, dim: usize, rarity_threshold: f32) -> Self {
        assert!(capacity > 0 && dim > 0, "memory bank must be non-empty");
        Self {
            capacity,
            dim,
            rarity_threshold,
            memory: vec![0.0; capacity * dim],
            occupied: vec![false; capacity],
            cursor: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Next slot to be written, always in `[0, capacity)`.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of written slots.
    pub fn len(&self) -> usize {
        self.occupied.iter().filter(|o| **o).count()
    }

    /// Whether no slot has been written.
    pub fn is_empty(&self) -> bool {
        !self.occupied.iter().any(|o| *o)
    }

    /// Rarity score below which vectors are stored.
    pub fn rarity_threshold(&self) -> f32 {
        self.rarity_threshold
    }

    /// Contents of a written slot.
    pub fn slot(&self, index: usize) -> Option<&[f32]> {
        self.occupied
            .get(index)
            .filter(|o| **o)
            .map(|_| &self.memory[index * self.dim..(index + 1) * self.dim])
    }

    /// Write vectors at the cursor.
    ///
    /// At most the slots between the cursor and the end of the arena are
    /// written; surplus vectors are dropped. The cursor then advances modulo
    /// capacity. Returns the number of vectors written.
    pub fn insert(&mut self, vectors: &[&[f32]]) -> usize {
        let count = vectors.len().min(self.capacity - self.cursor);
        for (offset, vector) in vectors.iter().take(count).enumerate() {
            let slot = self.cursor + offset;
            let row = &mut self.memory[slot * self.dim..(slot + 1) * self.dim];
            let n = vector.len().min(self.dim);
            row[..n].copy_from_slice(&vector[..n]);
            row[n..].fill(0.0);
            self.occupied[slot] = true;
        }
        if count > 0 {
            self.cursor = (self.cursor + count) % self.capacity;
        }
        count
    }

    /// Store the rows of `features` whose rarity score is below the threshold.
    ///
    /// `features` should be detached; it is only read.
    pub fn insert_rare<B: Backend>(&mut self, features: Tensor<B, 2>, rarity: &[f32]) -> usize {
        let [rows, dim] = features.dims();
        let values: Vec<f32> = features.into_data().iter::<f32>().collect();
        let candidates: Vec<&[f32]> = (0..rows)
            .filter(|i| rarity.get(*i).is_some_and(|r| *r < self.rarity_threshold))
            .map(|i| &values[i * dim..(i + 1) * dim])
            .collect();

        let written = self.insert(&candidates);
        debug!(
            candidates = candidates.len(),
            written,
            cursor = self.cursor,
            "memory bank update"
        );
        written
    }

    /// Occupied slots ranked by cosine similarity to `query`.
    ///
    /// Entries with similarity exactly 1.0 are skipped. Ties keep slot order.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let q_norm = l2_norm(query).max(NORM_EPS);
        let mut scored: Vec<(usize, f32)> = (0..self.capacity)
            .filter(|slot| self.occupied[*slot])
            .filter_map(|slot| {
                let row = &self.memory[slot * self.dim..(slot + 1) * self.dim];
                let m_norm = l2_norm(row).max(NORM_EPS);
                let dot: f32 = row
                    .iter()
                    .zip(query)
                    .map(|(m, q)| (m / m_norm) * (q / q_norm))
                    .sum();
                (dot != 1.0).then_some((slot, dot))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Similarity-weighted sum of the `k` nearest entries for each query row.
    ///
    /// Rows without a valid neighbour yield zeros. Weights are computed with
    /// tensor operations on `query`, so gradients reach the query.
    pub fn retrieve<B: Backend>(&self, query: Tensor<B, 2>, k: usize) -> Tensor<B, 2> {
        let device = query.device();
        let [rows, dim] = query.dims();
        if self.is_empty() || k == 0 {
            return Tensor::zeros([rows, dim], &device);
        }

        let normalized = l2_normalize(query);
        let host: Vec<f32> = normalized.to_data().iter::<f32>().collect();

        let retrieved = (0..rows)
            .map(|i| {
                let neighbours = self.nearest(&host[i * dim..(i + 1) * dim], k);
                if neighbours.is_empty() {
                    return Tensor::zeros([1, dim], &device);
                }

                let values: Vec<f32> = neighbours
                    .iter()
                    .flat_map(|(slot, _)| self.memory[slot * dim..(slot + 1) * dim].iter().copied())
                    .collect();
                let entries =
                    Tensor::<B, 2>::from_data(TensorData::new(values, [neighbours.len(), dim]), &device);

                let row = normalized.clone().slice([i..i + 1, 0..dim]);
                let weights = row.matmul(l2_normalize(entries.clone()).transpose());
                weights.matmul(entries)
            })
            .collect();

        Tensor::cat(retrieved, 0)
    }

    /// Reset every slot and the cursor.
    pub fn clear(&mut self) {
        self.memory.fill(0.0);
        self.occupied.fill(false);
        self.cursor = 0;
    }

    /// Named buffers `memory` and `index` for checkpoints.
    pub fn state_entries(&self) -> [(&'static str, StateEntry); 2] {
        [
            (
                "memory",
                StateEntry {
                    kind: StateKind::Buffer,
                    shape: vec![self.capacity, self.dim],
                    values: self.memory.clone(),
                },
            ),
            (
                "index",
                StateEntry {
                    kind: StateKind::Buffer,
                    shape: vec![],
                    values: vec![self.cursor as f32],
                },
            ),
        ]
    }

    /// Restore the arena from a checkpoint buffer.
    ///
    /// Non-zero rows are treated as written. Returns `false` when the shape
    /// does not match.
    pub fn load_memory(&mut self, entry: &StateEntry) -> bool {
        if entry.shape != [self.capacity, self.dim] || entry.values.len() != self.memory.len() {
            return false;
        }
        self.memory.copy_from_slice(&entry.values);
        for slot in 0..self.capacity {
            let row = &self.memory[slot * self.dim..(slot + 1) * self.dim];
            self.occupied[slot] = row.iter().any(|v| *v != 0.0);
        }
        true
    }

    /// Restore the cursor from a checkpoint scalar.
    ///
    /// Returns `false` for anything other than a single in-range integer.
    pub fn load_cursor(&mut self, entry: &StateEntry) -> bool {
        match entry.values.as_slice() {
            [value] if *value >= 0.0 && value.fract() == 0.0 => {
                self.cursor = (*value as usize) % self.capacity;
                true
            }
            _ => false,
        }
    }
}

/// Rarity of each row: distance of its norm from the batch-mean norm,
/// relative to that mean.
///
/// A low score means the vector's norm is close to the batch mean; those are
/// the vectors the bank stores. A batch whose norms are all zero gets
/// infinite scores so nothing is stored.
pub fn rarity_scores<B: Backend>(features: Tensor<B, 2>) -> Vec<f32> {
    let [rows, dim] = features.dims();
    let values: Vec<f32> = features.into_data().iter::<f32>().collect();
    let norms: Vec<f32> = (0..rows)
        .map(|i| l2_norm(&values[i * dim..(i + 1) * dim]))
        .collect();

    let mean = norms.iter().sum::<f32>() / rows.max(1) as f32;
    if mean <= 0.0 {
        return vec![f32::INFINITY; rows];
    }
    norms.iter().map(|n| (n - mean).abs() / mean).collect()
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxr_core::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;

    fn rows(t: Tensor<TestBackend, 2>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    #[test]
    fn test_empty_bank_returns_zeros() {
        let device = Default::default();
        let bank = MemoryBank::new(8, 4, 0.2);
        let query = Tensor::<TestBackend, 2>::ones([3, 4], &device);

        let out = bank.retrieve(query, 3);
        assert_eq!(out.dims(), [3, 4]);
        assert!(rows(out).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_cursor_wraps_after_capacity_plus_five() {
        let capacity = 8;
        let mut bank = MemoryBank::new(capacity, 2, 0.2);
        for i in 0..capacity + 5 {
            let v = [i as f32 + 1.0, 0.5];
            assert_eq!(bank.insert(&[&v]), 1);
        }

        assert_eq!(bank.cursor(), 5);
        assert_eq!(bank.len(), capacity);
        for slot in 0..5 {
            let expected = (capacity + slot) as f32 + 1.0;
            assert_eq!(bank.slot(slot).unwrap()[0], expected);
        }
        for slot in 5..capacity {
            assert_eq!(bank.slot(slot).unwrap()[0], slot as f32 + 1.0);
        }
    }

    #[test]
    fn test_batch_insert_truncates_at_arena_end() {
        let mut bank = MemoryBank::new(4, 1, 0.2);
        assert_eq!(bank.insert(&[&[1.0], &[2.0], &[3.0]]), 3);
        assert_eq!(bank.insert(&[&[4.0], &[5.0], &[6.0]]), 1);
        assert_eq!(bank.cursor(), 0);
        assert_eq!(bank.slot(3), Some(&[4.0][..]));
        assert_eq!(bank.slot(0), Some(&[1.0][..]));
    }

    #[test]
    fn test_retrieval_excludes_identical_entry() {
        let device = Default::default();
        let mut bank = MemoryBank::new(4, 2, 0.2);
        bank.insert(&[&[1.0, 0.0], &[0.0, 2.0]]);

        // The first entry has similarity exactly 1 with the query.
        let query = Tensor::<TestBackend, 2>::from_floats([[3.0, 0.0]], &device);
        let out = rows(bank.retrieve(query, 3));
        assert_eq!(out, vec![0.0, 0.0]);

        let query = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0]], &device);
        let out = rows(bank.retrieve(query, 1));
        // Both entries score 1/sqrt(2); the earlier slot wins the tie.
        let w = std::f32::consts::FRAC_1_SQRT_2;
        assert!((out[0] - w).abs() < 1e-5);
        assert!(out[1].abs() < 1e-6);
    }

    #[test]
    fn test_retrieval_weights_by_similarity() {
        let device = Default::default();
        let mut bank = MemoryBank::new(4, 2, 0.2);
        bank.insert(&[&[2.0, 0.0], &[0.0, 4.0], &[-1.0, 0.0]]);

        let query = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0]], &device);
        let out = rows(bank.retrieve(query, 2));

        let norm = 5.0_f32.sqrt();
        let expected = [2.0 * (1.0 / norm), 4.0 * (2.0 / norm)];
        assert!((out[0] - expected[0]).abs() < 1e-4);
        assert!((out[1] - expected[1]).abs() < 1e-4);
    }

    #[test]
    fn test_retrieval_is_differentiable_in_query() {
        type B = Autodiff<NdArray>;
        let device = Default::default();
        let mut bank = MemoryBank::new(4, 2, 0.2);
        bank.insert(&[&[1.0, 0.0], &[0.0, 1.0]]);

        let query = Tensor::<B, 2>::from_floats([[1.0, 2.0]], &device).require_grad();
        let grads = bank.retrieve(query.clone(), 2).sum().backward();
        let grad = query.grad(&grads).expect("query gradient");
        let values: Vec<f32> = grad.into_data().iter::<f32>().collect();
        assert!(values.iter().any(|v| v.abs() > 1e-6));
    }

    #[test]
    fn test_insert_rare_uses_threshold() {
        let device = Default::default();
        let mut bank = MemoryBank::new(4, 2, 0.2);
        let features = Tensor::<TestBackend, 2>::from_floats(
            [[1.0, 0.0], [0.0, 1.0], [9.0, 9.0]],
            &device,
        );
        let written = bank.insert_rare(features, &[0.1, 0.19, 0.5]);
        assert_eq!(written, 2);
        assert_eq!(bank.cursor(), 2);
        assert_eq!(bank.slot(1), Some(&[0.0, 1.0][..]));
    }

    #[test]
    fn test_rarity_scores() {
        let device = Default::default();
        let features =
            Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0], [0.0, 1.0], [6.0, 8.0]], &device);
        let scores = rarity_scores(features);
        // Norms 5, 1, 10; mean 16/3.
        let mean = 16.0 / 3.0;
        assert!((scores[0] - (5.0_f32 - mean).abs() / mean).abs() < 1e-5);
        assert!((scores[2] - (10.0 - mean) / mean).abs() < 1e-5);

        let zeros = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        assert!(rarity_scores(zeros).iter().all(|s| s.is_infinite()));
    }

    #[test]
    fn test_state_roundtrip_restores_occupancy() {
        let mut bank = MemoryBank::new(3, 2, 0.2);
        bank.insert(&[&[1.0, 2.0]]);
        let [(_, memory), (_, index)] = bank.state_entries();
        assert!(index.shape.is_empty());

        let mut restored = MemoryBank::new(3, 2, 0.2);
        assert!(restored.load_memory(&memory));
        assert!(restored.load_cursor(&index));
        assert_eq!(restored, bank);
    }
}
