// Seeded generator for random connectivity matrices.
//
// Not cryptographically secure. A model seeds one of these at construction
// and every `MatrixSpec::Random` draws from it in creation order, so the same
// seed and the same build sequence give the same weights.

use crate::error::Result;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// splitmix64; every seed, zero included, yields a full-period stream.
    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform weight in `[low, high)`.
    #[inline]
    pub fn weight(&mut self, low: f64, high: f64) -> f64 {
        let unit = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        low + (high - low) * unit
    }

    /// `rows x cols` matrix with entries drawn row-major from `[low, high)`.
    pub fn matrix(&mut self, rows: usize, cols: usize, low: f64, high: f64) -> Result<Value> {
        let data = (0..rows * cols).map(|_| self.weight(low, high)).collect();
        Value::matrix(rows, cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_weights() {
        let a = Prng::new(7).matrix(2, 3, -1.0, 1.0).unwrap();
        let b = Prng::new(7).matrix(2, 3, -1.0, 1.0).unwrap();
        assert_eq!(a, b);
        let c = Prng::new(8).matrix(2, 3, -1.0, 1.0).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn draws_continue_across_matrices() {
        let mut p = Prng::new(3);
        let first = p.matrix(1, 2, 0.0, 1.0).unwrap();
        let second = p.matrix(1, 2, 0.0, 1.0).unwrap();
        assert_ne!(first, second);

        let mut q = Prng::new(3);
        let both = q.matrix(1, 4, 0.0, 1.0).unwrap();
        assert_eq!(&both.as_slice()[..2], first.as_slice());
        assert_eq!(&both.as_slice()[2..], second.as_slice());
    }

    #[test]
    fn zero_seed_still_varies() {
        let mut p = Prng::new(0);
        assert_ne!(p.weight(0.0, 1.0), p.weight(0.0, 1.0));
    }

    #[test]
    fn matrix_entries_in_range() {
        let mut p = Prng::new(42);
        let m = p.matrix(3, 4, -0.5, 0.5).unwrap();
        assert_eq!(m.rows(), 3);
        assert_eq!(m.cols(), 4);
        assert!(m.as_slice().iter().all(|x| (-0.5..0.5).contains(x)));
    }
}
