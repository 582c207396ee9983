use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — shape + strides + offset
//
// Views (transpose, permute, narrow, expand) only rewrite the layout and share
// the storage of their source. Kernels that need dense row-major data call
// `Tensor::contiguous` first; everything else walks `strided_indices`.
//
// A stride of 0 means the dimension is broadcast: every index along it reads
// the same element. `broadcast_as` produces such layouts for binary ops and
// `expand`.

/// Mapping from logical indices to flat storage positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major layout starting at offset 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Reorder dimensions: output dim `i` is input dim `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if perm.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: perm.len(),
            });
        }
        let mut seen = vec![false; rank];
        for &p in perm {
            if p >= rank {
                return Err(Error::DimOutOfRange { dim: p, rank });
            }
            if seen[p] {
                return Err(Error::msg(format!("permute: repeated dim {p} in {perm:?}")));
            }
            seen[p] = true;
        }
        let dims = perm.iter().map(|&p| self.dims()[p]).collect();
        let strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = len;
        Ok(Layout::new(
            Shape::new(dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// View this layout as the broadcast `target`, keeping the real strides
    /// of matching dims and zeroing stretched or prepended ones.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        let rank = self.rank();
        if target.rank() < rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: target.rank(),
            });
        }
        let lead = target.rank() - rank;
        let mut strides = vec![0usize; target.rank()];
        for i in 0..rank {
            let src = self.dims()[i];
            let dst = target.dims()[lead + i];
            if src == dst {
                strides[lead + i] = self.strides[i];
            } else if src != 1 {
                return Err(Error::ShapeMismatch {
                    expected: target.clone(),
                    got: self.shape.clone(),
                });
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// `offset + Σ index[i]·stride[i]`.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        self.offset
            + index
                .iter()
                .zip(self.strides.iter())
                .map(|(i, s)| i * s)
                .sum::<usize>()
    }

    /// Storage positions of every element, in logical row-major order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Walks a layout in logical order and yields storage positions.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    next_flat: usize,
    remaining: usize,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            next_flat: layout.offset(),
            remaining: layout.elem_count(),
        }
    }

    // Odometer step on the multi-index, updating the flat position incrementally.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.next_flat += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.next_flat -= self.current[i] * self.strides[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let out = self.next_flat;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.advance();
        }
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
