use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Shape of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Dims {
    Scalar,
    Vector(usize),
    /// Row-major `rows x cols`.
    Matrix(usize, usize),
}

impl Dims {
    pub fn len(&self) -> usize {
        match *self {
            Dims::Scalar => 1,
            Dims::Vector(n) => n,
            Dims::Matrix(r, c) => r * c,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Dims::Scalar => write!(f, "scalar"),
            Dims::Vector(n) => write!(f, "[{n}]"),
            Dims::Matrix(r, c) => write!(f, "[{r}x{c}]"),
        }
    }
}

/// Dense numeric array carried along every edge of the graph.
///
/// Only scalars, vectors and matrices are needed: a mechanism's variable is a
/// list of these (one per InputState), which keeps ragged inputs natural.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Value {
    dims: Dims,
    data: Vec<f64>,
}

impl Default for Value {
    fn default() -> Self {
        Value::zeros(1)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::scalar(x)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::vector(v)
    }
}

impl From<&[f64]> for Value {
    fn from(v: &[f64]) -> Self {
        Value::vector(v.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for Value {
    fn from(v: [f64; N]) -> Self {
        Value::vector(v.to_vec())
    }
}

impl Value {
    pub fn scalar(x: f64) -> Self {
        Self {
            dims: Dims::Scalar,
            data: vec![x],
        }
    }

    pub fn vector(data: impl Into<Vec<f64>>) -> Self {
        let data = data.into();
        Self {
            dims: Dims::Vector(data.len()),
            data,
        }
    }

    pub fn zeros(n: usize) -> Self {
        Self::vector(vec![0.0; n])
    }

    pub fn filled(dims: Dims, x: f64) -> Self {
        Self {
            dims,
            data: vec![x; dims.len()],
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::filled(self.dims, 0.0)
    }

    pub fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::spec(format!(
                "matrix data has {} elements, expected {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self {
            dims: Dims::Matrix(rows, cols),
            data,
        })
    }

    /// Build a matrix from rows; all rows must have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(Error::spec("ragged rows in matrix literal"));
        }
        Self::matrix(rows.len(), cols, rows.concat())
    }

    pub fn identity(n: usize) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self {
            dims: Dims::Matrix(n, n),
            data,
        }
    }

    pub fn full(rows: usize, cols: usize, x: f64) -> Self {
        Self::filled(Dims::Matrix(rows, cols), x)
    }

    /// Square matrix with `x` everywhere except a zero diagonal.
    pub fn hollow(n: usize, x: f64) -> Self {
        let mut m = Self::full(n, n, x);
        for i in 0..n {
            m.data[i * n + i] = 0.0;
        }
        m
    }

    /// Square matrix with `self` placed on the diagonal.
    pub fn as_diagonal(&self) -> Self {
        let n = self.data.len();
        let mut m = Self::full(n, n, 0.0);
        for (i, x) in self.data.iter().enumerate() {
            m.data[i * n + i] = *x;
        }
        m
    }

    #[inline]
    pub fn dims(&self) -> Dims {
        self.dims
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.data.clone()
    }

    pub fn is_matrix(&self) -> bool {
        matches!(self.dims, Dims::Matrix(_, _))
    }

    /// Scalars and one-element vectors both broadcast.
    pub fn is_scalar_like(&self) -> bool {
        !self.is_matrix() && self.data.len() == 1
    }

    pub fn as_scalar(&self) -> Option<f64> {
        if self.is_scalar_like() {
            Some(self.data[0])
        } else {
            None
        }
    }

    pub fn rows(&self) -> usize {
        match self.dims {
            Dims::Matrix(r, _) => r,
            _ => 1,
        }
    }

    pub fn cols(&self) -> usize {
        match self.dims {
            Dims::Matrix(_, c) => c,
            _ => self.data.len(),
        }
    }

    pub fn at(&self, row: usize, col: usize) -> Option<f64> {
        match self.dims {
            Dims::Matrix(r, c) if row < r && col < c => Some(self.data[row * c + col]),
            _ => None,
        }
    }

    /// Same element count, and matrices must agree exactly.
    pub fn shape_compatible(&self, other: &Value) -> bool {
        match (self.dims, other.dims) {
            (Dims::Matrix(a, b), Dims::Matrix(c, d)) => a == c && b == d,
            (Dims::Matrix(_, _), _) | (_, Dims::Matrix(_, _)) => false,
            _ => self.data.len() == other.data.len(),
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Value {
        Value {
            dims: self.dims,
            data: self.data.iter().map(|x| f(*x)).collect(),
        }
    }

    /// Elementwise combination; scalar-like operands broadcast.
    pub fn zip_with(&self, other: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
        if let Some(b) = other.as_scalar() {
            return Ok(self.map(|a| f(a, b)));
        }
        if let Some(a) = self.as_scalar() {
            return Ok(other.map(|b| f(a, b)));
        }
        if !self.shape_compatible(other) {
            return Err(Error::execution(format!(
                "shape mismatch: {} vs {}",
                self.dims, other.dims
            )));
        }
        Ok(Value {
            dims: self.dims,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| f(*a, *b))
                .collect(),
        })
    }

    pub fn add(&self, other: &Value) -> Result<Value> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Value) -> Result<Value> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> Result<Value> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn scale(&self, k: f64) -> Value {
        self.map(|x| x * k)
    }

    pub fn powf(&self, e: f64) -> Value {
        if e == 1.0 {
            return self.clone();
        }
        self.map(|x| x.powf(e))
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f64
    }

    pub fn variance(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let m = self.mean();
        self.data.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / self.data.len() as f64
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, x) in self.data.iter().enumerate() {
            match best {
                Some((_, b)) if *x <= b => {}
                _ => best = Some((i, *x)),
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn max_abs_diff(&self, other: &Value) -> f64 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    pub fn transpose(&self) -> Value {
        match self.dims {
            Dims::Matrix(r, c) => {
                let mut data = vec![0.0; r * c];
                for i in 0..r {
                    for j in 0..c {
                        data[j * r + i] = self.data[i * c + j];
                    }
                }
                Value {
                    dims: Dims::Matrix(c, r),
                    data,
                }
            }
            _ => self.clone(),
        }
    }

    /// Row vector times matrix: `[rows] x [rows x cols] -> [cols]`.
    pub fn vecmat(&self, matrix: &Value) -> Result<Value> {
        let (r, c) = match matrix.dims {
            Dims::Matrix(r, c) => (r, c),
            _ => return Err(Error::execution("vecmat: right operand is not a matrix")),
        };
        if self.data.len() != r {
            return Err(Error::execution(format!(
                "vecmat: vector of length {} cannot multiply {}",
                self.data.len(),
                matrix.dims
            )));
        }
        let mut out = vec![0.0; c];
        for (i, x) in self.data.iter().enumerate() {
            if *x == 0.0 {
                continue;
            }
            let row = &matrix.data[i * c..(i + 1) * c];
            for (o, w) in out.iter_mut().zip(row) {
                *o += x * w;
            }
        }
        Ok(Value::vector(out))
    }

    /// Matrix times column vector: `[rows x cols] x [cols] -> [rows]`.
    pub fn matvec(&self, vector: &Value) -> Result<Value> {
        vector.vecmat(&self.transpose())
    }

    pub fn outer(a: &Value, b: &Value) -> Value {
        let (n, m) = (a.len(), b.len());
        let mut data = Vec::with_capacity(n * m);
        for x in &a.data {
            for y in &b.data {
                data.push(x * y);
            }
        }
        Value {
            dims: Dims::Matrix(n, m),
            data,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn row(f: &mut fmt::Formatter<'_>, xs: &[f64]) -> fmt::Result {
            write!(f, "[")?;
            for (i, x) in xs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{x}")?;
            }
            write!(f, "]")
        }
        match self.dims {
            Dims::Scalar => write!(f, "{}", self.data[0]),
            Dims::Vector(_) => row(f, &self.data),
            Dims::Matrix(_, c) => {
                write!(f, "[")?;
                for (i, chunk) in self.data.chunks(c.max(1)).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    row(f, chunk)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasting_scalar_operands() {
        let v = Value::vector([1.0, 2.0, 3.0]);
        assert_eq!(v.add(&Value::scalar(0.5)).unwrap().as_slice(), &[1.5, 2.5, 3.5]);
        assert_eq!(Value::vector([2.0]).mul(&v).unwrap().as_slice(), &[2.0, 4.0, 6.0]);
        assert!(v.add(&Value::zeros(2)).is_err());
    }

    #[test]
    fn vecmat_maps_rows_to_cols() {
        let m = Value::from_rows(&[vec![0.1], vec![0.1]]).unwrap();
        let out = Value::vector([1.0, 1.0]).vecmat(&m).unwrap();
        assert_eq!(out.dims(), Dims::Vector(1));
        assert!((out.as_slice()[0] - 0.2).abs() < 1e-12);
        assert!(Value::vector([1.0]).vecmat(&m).is_err());
    }

    #[test]
    fn matvec_is_transpose_of_vecmat() {
        let m = Value::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        let out = m.matvec(&Value::vector([1.0, 1.0])).unwrap();
        assert_eq!(out.as_slice(), &[3.0, 7.0, 11.0]);
    }

    #[test]
    fn structural_matrices() {
        assert_eq!(Value::identity(2).as_slice(), &[1.0, 0.0, 0.0, 1.0]);
        assert_eq!(Value::hollow(2, 3.0).as_slice(), &[0.0, 3.0, 3.0, 0.0]);
        assert_eq!(
            Value::vector([1.0, 2.0]).as_diagonal().as_slice(),
            &[1.0, 0.0, 0.0, 2.0]
        );
        let o = Value::outer(&Value::vector([1.0, 2.0]), &Value::vector([3.0]));
        assert_eq!(o.dims(), Dims::Matrix(2, 1));
        assert_eq!(o.as_slice(), &[3.0, 6.0]);
    }

    #[test]
    fn statistics() {
        let v = Value::vector([1.0, 3.0, 2.0]);
        assert_eq!(v.sum(), 6.0);
        assert_eq!(v.mean(), 2.0);
        assert_eq!(v.argmax(), Some(1));
        assert!((v.variance() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(format!("{v}"), "[1, 3, 2]");
    }
}
