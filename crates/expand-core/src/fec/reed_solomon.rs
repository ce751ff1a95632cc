//! Systematic Reed–Solomon erasure code over GF(256).
//!
//! # How it works (for beginners)
//!
//! Think of the `k` data shards as `k` unknowns.  Each parity shard is a
//! different weighted sum of those unknowns.  Any `k` independent equations
//! are enough to solve for `k` unknowns, so as long as *any* `k` of the
//! `k + m` shards survive, the rest can be rebuilt.
//!
//! The weights come from the generator matrix `G` (`(k+m) × k`):
//!
//! 1. Start from a Vandermonde matrix `V`; any `k` of its rows are linearly
//!    independent.
//! 2. Multiply by the inverse of its top `k × k` block:
//!    `G = V × (V_top)⁻¹`.  The top block of `G` becomes the identity, so the
//!    first `k` shards are the data itself (the code is *systematic*), and
//!    the "any `k` rows are independent" property survives the
//!    multiplication.
//!
//! Decoding picks `k` present rows of `G`, inverts that square matrix, and
//! multiplies it with the surviving shards to get the data back.

use crate::fec::gf256;
use crate::fec::matrix::Matrix;
use crate::fec::FecError;

/// Largest total shard count the field supports (one evaluation point per
/// element of GF(256)).
pub const MAX_TOTAL_SHARDS: usize = 256;

/// A `(k, m)` shard codec.  Parameters are fixed at construction.
#[derive(Debug, Clone)]
pub struct ReedSolomon {
    data_shards: usize,
    parity_shards: usize,
    generator: Matrix,
}

impl ReedSolomon {
    /// # Errors
    ///
    /// [`FecError::InvalidParameters`] when either count is zero or
    /// `k + m` exceeds [`MAX_TOTAL_SHARDS`].
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, FecError> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(FecError::InvalidParameters(format!(
                "data and parity shard counts must be >= 1 (got k={data_shards}, m={parity_shards})"
            )));
        }
        let total = data_shards + parity_shards;
        if total > MAX_TOTAL_SHARDS {
            return Err(FecError::InvalidParameters(format!(
                "k + m = {total} exceeds {MAX_TOTAL_SHARDS}"
            )));
        }

        let vandermonde = Matrix::vandermonde(total, data_shards);
        let top: Vec<usize> = (0..data_shards).collect();
        let generator = vandermonde
            .select_rows(&top)
            .invert()
            .and_then(|top_inv| vandermonde.multiply(&top_inv))
            .ok_or_else(|| {
                FecError::InvalidParameters("generator matrix is not invertible".to_string())
            })?;

        Ok(Self {
            data_shards,
            parity_shards,
            generator,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Fills the last `m` buffers of `shards` with parity computed from the
    /// first `k`.
    ///
    /// # Errors
    ///
    /// - [`FecError::InvalidParameters`] if `shards.len() != k + m`.
    /// - [`FecError::ShardLengthMismatch`] if any buffer is not `shard_length`
    ///   bytes long.
    pub fn encode_parity(
        &self,
        shards: &mut [Vec<u8>],
        shard_length: usize,
    ) -> Result<(), FecError> {
        self.check_shard_count(shards.len())?;
        for (index, shard) in shards.iter().enumerate() {
            check_length(index, shard, shard_length)?;
        }

        let (data, parity) = shards.split_at_mut(self.data_shards);
        for (p, out) in parity.iter_mut().enumerate() {
            out.fill(0);
            let coefficients = self.generator.row(self.data_shards + p);
            for (d, input) in data.iter().enumerate() {
                gf256::mul_add_slice(out, input, coefficients[d]);
            }
        }
        Ok(())
    }

    /// Rebuilds every shard whose `present` flag is `false`.
    ///
    /// Returns the indices that were reconstructed, in ascending order.
    /// Present shards are never modified.
    ///
    /// # Errors
    ///
    /// - [`FecError::InsufficientShards`] when fewer than `k` shards are
    ///   present.  Nothing is written in that case.
    /// - [`FecError::InvalidParameters`] for a wrong shard or flag count.
    /// - [`FecError::ShardLengthMismatch`] if a present shard is not
    ///   `shard_length` bytes long.
    pub fn decode_missing(
        &self,
        shards: &mut [Vec<u8>],
        present: &[bool],
        shard_length: usize,
    ) -> Result<Vec<usize>, FecError> {
        self.check_shard_count(shards.len())?;
        self.check_shard_count(present.len())?;

        let present_count = present.iter().filter(|p| **p).count();
        if present_count < self.data_shards {
            return Err(FecError::InsufficientShards {
                present: present_count,
                required: self.data_shards,
            });
        }
        for (index, shard) in shards.iter().enumerate() {
            if present[index] {
                check_length(index, shard, shard_length)?;
            }
        }

        let missing: Vec<usize> = (0..shards.len()).filter(|&i| !present[i]).collect();
        if missing.is_empty() {
            return Ok(missing);
        }

        // Solve for the data shards from the first k survivors.
        let chosen: Vec<usize> = (0..shards.len())
            .filter(|&i| present[i])
            .take(self.data_shards)
            .collect();
        let decode_matrix = self
            .generator
            .select_rows(&chosen)
            .invert()
            .ok_or_else(|| {
                FecError::InvalidParameters("decode matrix is not invertible".to_string())
            })?;

        for &index in missing.iter().filter(|&&i| i < self.data_shards) {
            let mut rebuilt = vec![0u8; shard_length];
            for (col, &src) in chosen.iter().enumerate() {
                gf256::mul_add_slice(&mut rebuilt, &shards[src], decode_matrix.get(index, col));
            }
            shards[index] = rebuilt;
        }

        // All data is now available; missing parity is a plain re-encode.
        for &index in missing.iter().filter(|&&i| i >= self.data_shards) {
            let mut rebuilt = vec![0u8; shard_length];
            let coefficients = self.generator.row(index);
            for (d, &coefficient) in coefficients.iter().enumerate() {
                gf256::mul_add_slice(&mut rebuilt, &shards[d], coefficient);
            }
            shards[index] = rebuilt;
        }

        Ok(missing)
    }

    fn check_shard_count(&self, count: usize) -> Result<(), FecError> {
        if count != self.total_shards() {
            return Err(FecError::InvalidParameters(format!(
                "expected {} shards, got {count}",
                self.total_shards()
            )));
        }
        Ok(())
    }
}

fn check_length(index: usize, shard: &[u8], expected: usize) -> Result<(), FecError> {
    if shard.len() != expected {
        return Err(FecError::ShardLengthMismatch {
            index,
            expected,
            actual: shard.len(),
        });
    }
    Ok(())
}
