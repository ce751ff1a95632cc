//! Small dense matrices over GF(256), just enough for the shard codec:
//! Vandermonde construction, multiplication, row selection, and
//! Gauss–Jordan inversion.

use crate::fec::gf256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zero(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut m = Self::zero(size, size);
        for i in 0..size {
            m.set(i, i, 1);
        }
        m
    }

    /// `rows × cols` Vandermonde matrix: `m[r][c] = r^c`.
    ///
    /// Rows are evaluated at distinct field points `0, 1, 2, …`, so any
    /// `cols` of the rows form an invertible square matrix as long as
    /// `rows <= 256`.
    pub fn vandermonde(rows: usize, cols: usize) -> Self {
        let mut m = Self::zero(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                m.set(r, c, gf256::pow(r as u8, c));
            }
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: u8) {
        self.data[r * self.cols + c] = value;
    }

    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Builds a new matrix from the given row indices, in order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut m = Self::zero(indices.len(), self.cols);
        for (dst, &src) in indices.iter().enumerate() {
            m.data[dst * self.cols..(dst + 1) * self.cols].copy_from_slice(self.row(src));
        }
        m
    }

    /// Matrix product `self × rhs`; `None` if the shapes do not line up.
    pub fn multiply(&self, rhs: &Matrix) -> Option<Matrix> {
        if self.cols != rhs.rows {
            return None;
        }
        let mut out = Matrix::zero(self.rows, rhs.cols);
        for r in 0..self.rows {
            for c in 0..rhs.cols {
                let mut acc = 0u8;
                for i in 0..self.cols {
                    acc = gf256::add(acc, gf256::mul(self.get(r, i), rhs.get(i, c)));
                }
                out.set(r, c, acc);
            }
        }
        Some(out)
    }

    /// Gauss–Jordan inverse; `None` for a non-square or singular matrix.
    pub fn invert(&self) -> Option<Matrix> {
        if self.rows != self.cols {
            return None;
        }
        let n = self.rows;
        let mut work = self.clone();
        let mut out = Matrix::identity(n);

        for col in 0..n {
            let pivot = (col..n).find(|&r| work.get(r, col) != 0)?;
            if pivot != col {
                work.swap_rows(pivot, col);
                out.swap_rows(pivot, col);
            }

            let scale = gf256::inv(work.get(col, col))?;
            work.scale_row(col, scale);
            out.scale_row(col, scale);

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor != 0 {
                    work.eliminate(r, col, factor);
                    out.eliminate(r, col, factor);
                }
            }
        }
        Some(out)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    fn scale_row(&mut self, r: usize, factor: u8) {
        for c in 0..self.cols {
            let v = self.get(r, c);
            self.set(r, c, gf256::mul(v, factor));
        }
    }

    /// `row[target] ^= factor * row[source]`
    fn eliminate(&mut self, target: usize, source: usize, factor: u8) {
        for c in 0..self.cols {
            let v = gf256::add(self.get(target, c), gf256::mul(factor, self.get(source, c)));
            self.set(target, c, v);
        }
    }
}
