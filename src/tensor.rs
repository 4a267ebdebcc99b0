//! Tensor Operations for the Transformer
//!
//! A minimal tensor library sized for a decoder-only transformer. Tensors
//! store a flat `Vec<f32>` in row-major order together with their shape.
//!
//! ## Shapes used by the model
//!
//! - `[rows, cols]` for weight matrices and flattened activations
//! - `[batch, seq, features]` for the residual stream
//! - `[batch, seq, seq]` for attention score matrices
//!
//! ## Example
//!
//! ```rust
//! use fabula::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! ```
//!
//! ## Parallelism
//!
//! Matrix multiplication and elementwise operations are parallelized with
//! Rayon. Reductions (softmax row sums, per-row statistics) run sequentially
//! inside each independent row so that repeated runs produce bit-identical
//! results.

use rayon::prelude::*;

/// A multi-dimensional array of `f32` values in row-major layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape.
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Size of the last dimension.
    pub fn last_dim(&self) -> usize {
        *self.shape.last().expect("tensor has at least one dimension")
    }

    /// Reinterpret the data with a new shape. Element count must match.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} to {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Inner loop of matrix multiplication, written so LLVM can
    /// auto-vectorize it: `result[j] += a_val * b[j]` for all j.
    #[inline(always)]
    fn matmul_inner(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication.
    ///
    /// Supported shape combinations:
    ///
    /// - `[m, k] @ [k, n] -> [m, n]`
    /// - `[b, t, k] @ [k, n] -> [b, t, n]` (shared right-hand matrix,
    ///   computed by flattening the leading dimensions)
    /// - `[b, m, k] @ [b, k, n] -> [b, m, n]` (per-batch multiplication,
    ///   used for attention scores and weighted sums)
    ///
    /// Large 2D products use a cache-blocked algorithm parallelized over
    /// output row blocks; per-batch products run each batch element on its
    /// own Rayon task.
    ///
    /// # Panics
    ///
    /// Panics if the inner dimensions are incompatible or the rank
    /// combination is unsupported.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        if self.shape.len() == 2 && other.shape.len() == 2 {
            return self.matmul_2d(other);
        }

        // [b, t, k] @ [k, n]: flatten to [b*t, k], multiply, restore shape
        if self.shape.len() == 3 && other.shape.len() == 2 {
            let (b, t, k) = (self.shape[0], self.shape[1], self.shape[2]);
            let n = other.shape[1];
            let flat = self.reshape(&[b * t, k]).matmul_2d(other);
            return flat.reshape(&[b, t, n]);
        }

        // [b, m, k] @ [b, k, n]: independent 2D multiply per batch element
        if self.shape.len() == 3 && other.shape.len() == 3 {
            let (batch, m, k) = (self.shape[0], self.shape[1], self.shape[2]);
            assert_eq!(
                other.shape[0], batch,
                "Batch dimensions must match for batched matmul"
            );
            assert_eq!(
                other.shape[1], k,
                "Matrix dimensions incompatible: {:?} @ {:?}",
                self.shape, other.shape
            );
            let n = other.shape[2];

            let mut result = vec![0.0; batch * m * n];
            result
                .par_chunks_mut(m * n)
                .enumerate()
                .for_each(|(bi, chunk)| {
                    let a = &self.data[bi * m * k..(bi + 1) * m * k];
                    let b = &other.data[bi * k * n..(bi + 1) * k * n];
                    for i in 0..m {
                        for l in 0..k {
                            Self::matmul_inner(
                                a[i * k + l],
                                &b[l * n..(l + 1) * n],
                                &mut chunk[i * n..(i + 1) * n],
                            );
                        }
                    }
                });

            return Tensor::new(result, vec![batch, m, n]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    fn matmul_2d(&self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        // Work threshold below which parallel overhead dominates
        if m * n * k >= 1_000 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                Self::matmul_inner(
                    self.data[i * k + l],
                    &other.data[l * n..(l + 1) * n],
                    &mut result[i * n..(i + 1) * n],
                );
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Cache-blocked matrix multiplication parallelized over row blocks.
    ///
    /// 8x8 blocks keep the working set inside L1 while leaving enough row
    /// blocks to spread across cores.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];
        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);
                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                Self::matmul_inner(
                                    self.data[i * k + k_idx],
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Swap the last two dimensions.
    ///
    /// For 3D tensors each batch element is transposed independently.
    pub fn transpose_last(&self) -> Tensor {
        match self.shape.len() {
            2 => {
                let (rows, cols) = (self.shape[0], self.shape[1]);
                let mut result = vec![0.0; rows * cols];
                for i in 0..rows {
                    for j in 0..cols {
                        result[j * rows + i] = self.data[i * cols + j];
                    }
                }
                Tensor::new(result, vec![cols, rows])
            }
            3 => {
                let (batch, rows, cols) = (self.shape[0], self.shape[1], self.shape[2]);
                let mut result = vec![0.0; batch * rows * cols];
                result
                    .par_chunks_mut(rows * cols)
                    .enumerate()
                    .for_each(|(bi, chunk)| {
                        let src = &self.data[bi * rows * cols..(bi + 1) * rows * cols];
                        for i in 0..rows {
                            for j in 0..cols {
                                chunk[j * rows + i] = src[i * cols + j];
                            }
                        }
                    });
                Tensor::new(result, vec![batch, cols, rows])
            }
            _ => panic!("Unsupported transpose for shape {:?}", self.shape),
        }
    }

    /// Softmax along the last dimension.
    ///
    /// Each row is normalized independently with the numerically stable
    /// form: the row maximum is subtracted before exponentiation, so large
    /// positive scores cannot overflow `exp`. Entries of `-inf` map to
    /// exactly zero probability.
    ///
    /// ```rust
    /// use fabula::Tensor;
    ///
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0], vec![1, 3]);
    /// let p = t.softmax_last();
    /// let sum: f32 = p.data.iter().sum();
    /// assert!((sum - 1.0).abs() < 1e-6);
    /// ```
    pub fn softmax_last(&self) -> Tensor {
        let cols = self.last_dim();

        let mut result = vec![0.0; self.data.len()];
        result
            .par_chunks_mut(cols)
            .enumerate()
            .for_each(|(i, out_row)| {
                let row = &self.data[i * cols..(i + 1) * cols];
                let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let mut sum = 0.0;
                for (o, &x) in out_row.iter_mut().zip(row.iter()) {
                    let e = (x - max).exp();
                    *o = e;
                    sum += e;
                }
                for o in out_row.iter_mut() {
                    *o /= sum;
                }
            });

        Tensor::new(result, self.shape.clone())
    }

    /// Replace values where the mask is non-zero with the given value.
    ///
    /// The mask either matches the tensor shape exactly, or is a 2D mask
    /// broadcast over the leading batch dimension of a 3D tensor (the
    /// attention case: `[batch, seq, seq]` scores, `[seq, seq]` mask).
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        if self.shape == mask.shape {
            let result = self
                .data
                .par_iter()
                .zip(&mask.data)
                .map(|(&x, &m)| if m != 0.0 { value } else { x })
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() == 3 && mask.shape.len() == 2 {
            assert_eq!(
                &self.shape[1..],
                &mask.shape[..],
                "Mask shape must match the trailing dimensions"
            );
            let inner = mask.data.len();
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| if mask.data[i % inner] != 0.0 { value } else { x })
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported masked_fill: {:?} with mask {:?}",
            self.shape, mask.shape
        );
    }

    /// Element-wise addition with broadcasting.
    ///
    /// Supported patterns:
    ///
    /// 1. Exact shape match
    /// 2. `[batch, seq, dim] + [seq, dim]` (position embeddings)
    /// 3. `[*, n] + [n]` (bias addition)
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() == 3 && other.shape.len() == 2 {
            assert_eq!(
                &self.shape[1..],
                &other.shape[..],
                "Trailing dimensions must match for broadcast add"
            );
            let inner = other.data.len();
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % inner])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() > other.shape.len() && other.shape.len() == 1 {
            let last = self.last_dim();
            assert_eq!(
                other.data.len(),
                last,
                "Broadcast add expects a vector matching the last dimension"
            );
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % last])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// In-place element-wise addition. Shapes must match exactly.
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for add_assign");
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
    }

    /// Element-wise multiplication; the right-hand side may be a vector
    /// broadcast over the last dimension (LayerNorm gain).
    pub fn mul(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a * b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() > other.shape.len() && other.shape.len() == 1 {
            let last = self.last_dim();
            assert_eq!(
                other.data.len(),
                last,
                "Broadcast mul expects a vector matching the last dimension"
            );
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x * other.data[i % last])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for mul: {:?} * {:?}",
            self.shape, other.shape
        );
    }

    /// Multiply all elements by a scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Extract `len` columns of the last dimension starting at `start`.
    ///
    /// Used to split the concatenated multi-head output back into per-head
    /// slices during the backward pass.
    pub fn narrow_last(&self, start: usize, len: usize) -> Tensor {
        let cols = self.last_dim();
        assert!(
            start + len <= cols,
            "narrow_last out of range: {}..{} of {}",
            start,
            start + len,
            cols
        );
        let rows = self.data.len() / cols;
        let mut result = Vec::with_capacity(rows * len);
        for r in 0..rows {
            let base = r * cols + start;
            result.extend_from_slice(&self.data[base..base + len]);
        }
        let mut shape = self.shape.clone();
        *shape.last_mut().expect("tensor has at least one dimension") = len;
        Tensor::new(result, shape)
    }

    /// Concatenate tensors along the last dimension.
    ///
    /// All inputs must agree on every leading dimension. Used to join the
    /// per-head attention outputs in head order.
    pub fn cat_last(parts: &[&Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "cat_last needs at least one tensor");
        let lead = &parts[0].shape[..parts[0].shape.len() - 1];
        for p in parts {
            assert_eq!(
                &p.shape[..p.shape.len() - 1],
                lead,
                "Leading dimensions must match for cat_last"
            );
        }

        let rows: usize = lead.iter().product();
        let total_cols: usize = parts.iter().map(|p| p.last_dim()).sum();

        let mut result = Vec::with_capacity(rows * total_cols);
        for r in 0..rows {
            for p in parts {
                let cols = p.last_dim();
                result.extend_from_slice(&p.data[r * cols..(r + 1) * cols]);
            }
        }

        let mut shape = lead.to_vec();
        shape.push(total_cols);
        Tensor::new(result, shape)
    }
}
