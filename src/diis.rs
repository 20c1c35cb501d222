use crate::prelude::*;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
pub struct DIISFlags {
    /// Maximum number of vectors in the DIIS space. Default is 6.
    pub space: usize,

    /// Minimum number of vectors in the DIIS space for extrapolation. Default is 2.
    pub min_space: usize,
}

impl Default for DIISFlags {
    fn default() -> Self {
        Self { space: 6, min_space: 2 }
    }
}

/// In-core DIIS over flattened vectors with explicit error vectors.
///
/// The oldest vector is evicted once the space is full.
pub struct DIISIncore {
    pub flags: DIISFlags,

    /// `(vec, err)` pairs, oldest first.
    history: VecDeque<(Tsr, Tsr)>,
}

impl DIISIncore {
    pub fn new(flags: DIISFlags) -> Self {
        let history = VecDeque::with_capacity(flags.space);
        Self { flags, history }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn insert(&mut self, vec: Tsr, err: Tsr) {
        if self.history.len() >= self.flags.space {
            self.history.pop_front();
        }
        self.history.push_back((vec.into_shape(-1), err.into_shape(-1)));
    }

    /// Extrapolate from the stored vectors.
    ///
    /// Returns the latest vector unchanged while the space holds fewer than `min_space` entries.
    pub fn extrapolate(&self) -> Tsr {
        let num_space = self.history.len();
        assert!(num_space > 0, "No vectors in the DIIS space. This may be an internal error.");
        let (vec_last, _) = &self.history[num_space - 1];
        if num_space < self.flags.min_space {
            return vec_last.to_owned();
        }

        // ovlp: first row and column is auxiliary vector [0, 1, ..., 1]
        let device = vec_last.device().clone();
        let mut ovlp: Tsr = rt::zeros(([num_space + 1, num_space + 1], &device));
        ovlp.i_mut((0, 1..)).fill(1.0);
        ovlp.i_mut((1.., 0)).fill(1.0);
        for (i, (_, err_i)) in self.history.iter().enumerate() {
            for (j, (_, err_j)) in self.history.iter().enumerate().skip(i) {
                let val = (err_i % err_j).to_scalar();
                ovlp[[i + 1, j + 1]] = val;
                ovlp[[j + 1, i + 1]] = val;
            }
        }

        let (w, v) = rt::linalg::eigh(&ovlp).into();

        // small eigenvalues are dropped instead of inverted
        let eps = 30.0 * f64::EPSILON;
        let w = w.mapv(|x| if x.abs() < eps { 0.0 } else { 1.0 / x });

        // g: [1, 0, 0, ..., 0]
        let mut g: Tsr = rt::zeros(([num_space + 1], &device));
        g[[0]] = 1.0;

        let c = (v.view() * w) % v.t() % g;

        let mut vec = vec_last.zeros_like();
        for (idx, (vec_idx, _)) in self.history.iter().enumerate() {
            vec += vec_idx * c[[idx + 1]];
        }
        vec
    }

    /// Insert `(vec, err)`, then extrapolate.
    pub fn update(&mut self, vec: Tsr, err: Tsr) -> Tsr {
        self.insert(vec, err);
        self.extrapolate()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_diis_linear_fixed_point() {
        // x = b + A x with a contraction A; DIIS on the residual reaches the solution
        let device = DeviceTsr::default();
        let a = util::asarray_c(vec![0.5, 0.2, -0.1, 0.3, 0.4, 0.1, 0.0, -0.2, 0.6], &[3, 3], &device);
        let b = util::asarray_c(vec![1.0, -1.0, 0.5], &[3], &device);
        let mut diis = DIISIncore::new(DIISFlags::default());
        let mut x: Tsr = rt::zeros(([3], &device));
        for _ in 0..20 {
            let x_new = &b + &a % &x;
            let err = &x_new - &x;
            x = diis.update(x_new, err);
        }
        let residual = &b + &a % &x - &x;
        assert!(residual.abs().max_all() < 1e-10);
        assert!(diis.len() <= 6);
    }

    #[test]
    fn test_diis_below_min_space() {
        let device = DeviceTsr::default();
        let mut diis = DIISIncore::new(DIISFlags { space: 4, min_space: 3 });
        let v = util::asarray_c(vec![1.0, 2.0], &[2], &device);
        let out = diis.update(v.to_owned(), v.to_owned());
        assert!((out - v).abs().max_all() == 0.0);
    }
}
