use std::fmt;

// Shape — dimension sizes of a tensor
//
// Images flow through the network as [N, C, H, W]; window attention works on
// [B_, heads, N, d]; spectra carry a trailing real/imag axis of length 2.
// Shape only knows sizes. Strides and offsets live in Layout.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of all sizes; the scalar shape `[]` holds one element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Row-major strides, e.g. `[2, 3, 4] -> [12, 4, 1]`.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1usize;
        for (s, &d) in strides.iter_mut().zip(self.0.iter()).rev() {
            *s = acc;
            acc *= d;
        }
        strides
    }

    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// NumPy-style broadcast of two shapes.
    ///
    /// Shapes are aligned from the right; a size of 1 (or a missing leading
    /// dim) stretches to the other side. `[B, C, 1, 1]` against
    /// `[B, C, H, W]` gives `[B, C, H, W]`.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> crate::Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let rank = l.len().max(r.len());
        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            let d = match (ld, rd) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(crate::Error::msg(format!(
                        "shapes {} and {} are not broadcast-compatible",
                        lhs, rhs
                    )))
                }
            };
            out.push(d);
        }
        out.reverse();
        Ok(Shape::new(out))
    }

    /// Contiguous strides of `self` viewed as the broadcast `target`:
    /// stretched and missing dims get stride 0.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let dims = self.dims();
        let strides = self.stride_contiguous();
        let offset = target.rank() - dims.len();
        let mut out = vec![0usize; target.rank()];
        for i in 0..dims.len() {
            if dims[i] == target.dims()[i + offset] {
                out[i + offset] = strides[i];
            }
        }
        out
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<(usize, usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3, d4): (usize, usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3, d4])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert!(s.stride_contiguous().is_empty());
    }

    #[test]
    fn test_image_strides() {
        let s = Shape::from((2, 3, 4, 5));
        assert_eq!(s.stride_contiguous(), vec![60, 20, 5, 1]);
        assert_eq!(s.elem_count(), 120);
    }

    #[test]
    fn test_zero_sized_dim() {
        let s = Shape::from((3, 0));
        assert_eq!(s.elem_count(), 0);
    }

    #[test]
    fn test_broadcast_channel_gate() {
        let gate = Shape::from((1, 4, 1, 1));
        let x = Shape::from((2, 4, 8, 8));
        let out = Shape::broadcast_shape(&gate, &x).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8, 8]);
        assert_eq!(gate.broadcast_strides(&out), vec![0, 1, 0, 0]);
    }

    #[test]
    fn test_broadcast_incompatible() {
        assert!(Shape::broadcast_shape(&Shape::from(3), &Shape::from(4)).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
