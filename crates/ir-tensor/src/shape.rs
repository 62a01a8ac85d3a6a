use crate::error::{Result, TensorError};
use std::fmt;

/// A tensor shape: rank >= 1, every dimension positive, with row-major
/// strides derived at construction (last dimension contiguous).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
    strides: Vec<usize>,
}

impl Shape {
    /// Create a new shape from a vector of dimensions.
    ///
    /// # Panics
    /// Panics if `dims` is empty or contains a zero. Use [`Shape::try_new`]
    /// for dimensions that come from untrusted input.
    pub fn new(dims: Vec<usize>) -> Self {
        assert!(
            !dims.is_empty() && dims.iter().all(|&d| d > 0),
            "invalid shape {:?}: rank must be >= 1 and every dimension positive",
            dims
        );
        let strides = row_major_strides(&dims);
        Shape { dims, strides }
    }

    /// Create a shape, rejecting an empty rank or a zero dimension.
    pub fn try_new(dims: Vec<usize>) -> Result<Self> {
        if dims.is_empty() {
            return Err(TensorError::InvalidShape("rank must be >= 1".to_string()));
        }
        if let Some(axis) = dims.iter().position(|&d| d == 0) {
            return Err(TensorError::InvalidShape(format!(
                "dimension {} of {:?} is zero",
                axis, dims
            )));
        }
        let strides = row_major_strides(&dims);
        Ok(Shape { dims, strides })
    }

    /// Create a shape from a slice of dimensions.
    pub fn from_slice(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (product of all dimension sizes).
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the size of dimension `i`.
    ///
    /// # Panics
    /// Panics if `i >= ndim()`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Returns a reference to the underlying dimension sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Leading dimension.
    pub fn first(&self) -> usize {
        self.dims[0]
    }

    /// Innermost (contiguous) dimension.
    pub fn last(&self) -> usize {
        self.dims[self.dims.len() - 1]
    }

    /// Number of rows when the tensor is viewed as `[numel / last, last]`.
    pub fn rows(&self) -> usize {
        self.numel() / self.last()
    }

    /// Row-major contiguous strides for this shape.
    ///
    /// For a shape [d0, d1, d2], the strides are [d1*d2, d2, 1].
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Checks if the given strides correspond to a contiguous (row-major) layout
    /// for this shape.
    pub fn is_contiguous(&self, strides: &[usize]) -> bool {
        strides == self.strides.as_slice()
    }

    /// Linear element offset of `indices`: the dot product of indices and
    /// strides.
    pub fn offset_of(&self, indices: &[usize]) -> Result<usize> {
        offset_with_strides(&self.dims, &self.strides, indices)
    }

    /// Shape of the sub-tensor addressed by fixing the `n` leading
    /// dimensions.
    pub fn slice(&self, n: usize) -> Result<Shape> {
        if n >= self.ndim() {
            return Err(TensorError::InvalidShape(format!(
                "cannot fix {} leading dimensions of a rank-{} shape",
                n,
                self.ndim()
            )));
        }
        Ok(Shape::new(self.dims[n..].to_vec()))
    }

    /// Copy of this shape with dimension `dim` replaced by `value`.
    pub fn with_dim(&self, dim: usize, value: usize) -> Result<Shape> {
        if dim >= self.ndim() {
            return Err(TensorError::InvalidAxis {
                axis: dim,
                ndim: self.ndim(),
            });
        }
        let mut dims = self.dims.clone();
        dims[dim] = value;
        Shape::try_new(dims)
    }

    /// Validates `perm` as a permutation of `0..ndim()` and returns the
    /// permuted dimensions and the matching permuted strides.
    pub fn permute(&self, perm: &[usize]) -> Result<(Shape, Vec<usize>)> {
        if perm.len() != self.ndim() {
            return Err(TensorError::InvalidShape(format!(
                "permutation {:?} does not match rank {}",
                perm,
                self.ndim()
            )));
        }
        let mut seen = vec![false; perm.len()];
        for &axis in perm {
            if axis >= perm.len() || seen[axis] {
                return Err(TensorError::InvalidAxis {
                    axis,
                    ndim: self.ndim(),
                });
            }
            seen[axis] = true;
        }
        let dims = perm.iter().map(|&a| self.dims[a]).collect();
        let strides = perm.iter().map(|&a| self.strides[a]).collect();
        Ok((Shape::new(dims), strides))
    }

    /// Advances `cursor` to the next index in row-major order, innermost
    /// dimension first. Returns false once the cursor wraps past the end.
    pub fn advance(&self, cursor: &mut [usize]) -> bool {
        debug_assert_eq!(cursor.len(), self.ndim());
        for i in (0..cursor.len()).rev() {
            if cursor[i] + 1 < self.dims[i] {
                cursor[i] += 1;
                return true;
            }
            cursor[i] = 0;
        }
        false
    }
}

fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

/// Linear offset of `indices` under arbitrary `strides`, bounds-checked
/// against `dims`.
pub(crate) fn offset_with_strides(
    dims: &[usize],
    strides: &[usize],
    indices: &[usize],
) -> Result<usize> {
    if indices.len() != dims.len() {
        return Err(TensorError::InvalidShape(format!(
            "expected {} indices, got {}",
            dims.len(),
            indices.len()
        )));
    }
    let mut offset = 0;
    for (dim, (&index, (&size, &stride))) in indices
        .iter()
        .zip(dims.iter().zip(strides.iter()))
        .enumerate()
    {
        if index >= size {
            return Err(TensorError::IndexOutOfRange { index, dim, size });
        }
        offset += index * stride;
    }
    Ok(offset)
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_shape() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.dim(0), 2);
        assert_eq!(s.first(), 2);
        assert_eq!(s.last(), 4);
        assert_eq!(s.rows(), 6);
    }

    #[test]
    fn test_strides() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.strides(), &[12, 4, 1]);
        assert_eq!(Shape::new(vec![7]).strides(), &[1]);
    }

    #[test]
    fn test_is_contiguous() {
        let s = Shape::new(vec![2, 3, 4]);
        assert!(s.is_contiguous(&[12, 4, 1]));
        assert!(!s.is_contiguous(&[12, 1, 4]));
    }

    #[test]
    fn test_rank_zero_rejected() {
        assert!(Shape::try_new(vec![]).is_err());
        assert!(Shape::try_new(vec![3, 0]).is_err());
    }

    #[test]
    #[should_panic]
    fn test_new_zero_dim_panics() {
        let _ = Shape::new(vec![2, 0]);
    }

    #[test]
    fn test_offset_of() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.offset_of(&[0, 0, 0]).unwrap(), 0);
        assert_eq!(s.offset_of(&[1, 2, 3]).unwrap(), 23);
        assert!(matches!(
            s.offset_of(&[0, 3, 0]),
            Err(TensorError::IndexOutOfRange { index: 3, dim: 1, size: 3 })
        ));
        assert!(s.offset_of(&[0, 0]).is_err());
    }

    #[test]
    fn test_slice_and_with_dim() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.slice(1).unwrap().dims(), &[3, 4]);
        assert_eq!(s.slice(2).unwrap().dims(), &[4]);
        assert!(s.slice(3).is_err());
        assert_eq!(s.with_dim(2, 8).unwrap().dims(), &[2, 3, 8]);
        assert!(s.with_dim(3, 1).is_err());
    }

    #[test]
    fn test_permute() {
        let s = Shape::new(vec![2, 3, 4]);
        let (p, strides) = s.permute(&[2, 0, 1]).unwrap();
        assert_eq!(p.dims(), &[4, 2, 3]);
        assert_eq!(strides, vec![1, 12, 4]);
        assert!(s.permute(&[0, 0, 1]).is_err());
        assert!(s.permute(&[0, 1]).is_err());
    }

    #[test]
    fn test_advance_visits_every_index() {
        let s = Shape::new(vec![2, 3]);
        let mut cursor = vec![0, 0];
        let mut visited = vec![cursor.clone()];
        while s.advance(&mut cursor) {
            visited.push(cursor.clone());
        }
        assert_eq!(visited.len(), 6);
        assert_eq!(visited[3], vec![1, 0]);
        assert_eq!(cursor, vec![0, 0]);
    }
}
