//! Packed symmetric pair storage.
//!
//! A symmetric pair `(i, j)` with `j <= i` is stored at `i * (i + 1) / 2 + j`. All helpers act on
//! the trailing axes and keep leading axes untouched.

use crate::prelude::*;

#[inline]
pub fn npair(n: usize) -> usize {
    n * (n + 1) / 2
}

#[inline]
pub fn pair_index(i: usize, j: usize) -> usize {
    if i >= j { i * (i + 1) / 2 + j } else { j * (j + 1) / 2 + i }
}

/// Dimension `n` such that `n * (n + 1) / 2 == npair`.
pub fn n_from_npair(npair: usize) -> usize {
    let n = (((8 * npair + 1) as f64).sqrt() as usize).saturating_sub(1) / 2;
    // guard against rounding of the square root
    let n = (n.saturating_sub(1)..=n + 1).find(|&n| self::npair(n) == npair);
    n.unwrap_or_else(|| panic!("{npair} is not a triangular number"))
}

/// Packed offsets of the diagonal pairs `(i, i)` for `i < n`.
pub fn diag_indices(n: usize) -> Vec<usize> {
    (0..n).map(|i| i * (i + 1) / 2 + i).collect()
}

fn split_trailing(shape: &[usize], ntrail: usize) -> (Vec<usize>, usize) {
    assert!(shape.len() >= ntrail, "tensor of shape {shape:?} has fewer than {ntrail} axes");
    let lead = shape[..shape.len() - ntrail].to_vec();
    let nlead = lead.iter().product();
    (lead, nlead)
}

/// Apply `f(square, packed)` to each `(n, n)` matrix of the trailing axes.
fn square_to_packed(a: &TsrView, f: impl Fn(&[f64], &mut [f64]) + Sync) -> Tsr {
    let shape = a.shape().to_vec();
    let (mut lead, _) = split_trailing(&shape, 2);
    let n = shape[shape.len() - 1];
    assert_eq!(shape[shape.len() - 2], n, "trailing axes of {shape:?} are not square");
    let data = util::to_c_vec(a);
    let mut out = vec![0.0; data.len() / (n * n).max(1) * npair(n)];
    if n > 0 {
        out.par_chunks_mut(npair(n)).zip(data.par_chunks(n * n)).for_each(|(o, d)| f(d, o));
    }
    lead.push(npair(n));
    util::asarray_c(out, &lead, a.device())
}

/// `(..., n, n) -> (..., n(n+1)/2)`, keeping the lower triangle.
pub fn pack_tril(a: &TsrView) -> Tsr {
    let n = a.shape().last().copied().unwrap_or(0);
    square_to_packed(a, |d, o| {
        for i in 0..n {
            for j in 0..=i {
                o[i * (i + 1) / 2 + j] = d[i * n + j];
            }
        }
    })
}

/// `(..., n, n) -> (..., n(n+1)/2)` with off-diagonal pairs `a[i,j] + a[j,i]` and single diagonal.
pub fn precontract(a: &TsrView) -> Tsr {
    let n = a.shape().last().copied().unwrap_or(0);
    square_to_packed(a, |d, o| {
        for i in 0..n {
            for j in 0..i {
                o[i * (i + 1) / 2 + j] = d[i * n + j] + d[j * n + i];
            }
            o[i * (i + 1) / 2 + i] = d[i * n + i];
        }
    })
}

/// `(..., n(n+1)/2) -> (..., n, n)`, mirroring into a symmetric square.
pub fn unpack_tril(a: &TsrView) -> Tsr {
    let shape = a.shape().to_vec();
    let (mut lead, nlead) = split_trailing(&shape, 1);
    let np = shape[shape.len() - 1];
    let n = n_from_npair(np);
    let data = util::to_c_vec(a);
    let mut out = vec![0.0; nlead * n * n];
    if n > 0 {
        out.par_chunks_mut(n * n).zip(data.par_chunks(np)).for_each(|(o, d)| {
            for i in 0..n {
                for j in 0..=i {
                    let val = d[i * (i + 1) / 2 + j];
                    o[i * n + j] = val;
                    o[j * n + i] = val;
                }
            }
        });
    }
    lead.extend([n, n]);
    util::asarray_c(out, &lead, a.device())
}

/// `a + b` with `b` permuted by `axes`.
///
/// Every transpose-and-add of a density block that carries an unstored pair symmetry goes through
/// here.
pub fn symmetrize_pair<const N: usize>(a: &TsrView, b: &TsrView, axes: [isize; N]) -> Tsr {
    let b_t = b.transpose(axes);
    assert_eq!(a.shape(), b_t.shape(), "symmetrize_pair operands do not match after permutation");
    a.to_owned() + b_t
}

/// `a + a[..., j, i]` over the trailing pair of axes.
pub fn sum021(a: &TsrView) -> Tsr {
    let ndim = a.shape().len() as isize;
    assert!(ndim >= 2, "sum021 needs at least two axes");
    a.to_owned() + a.swapaxes(ndim - 1, ndim - 2)
}

/// `a + a.T` for a square matrix.
pub fn transpose_sum(a: &TsrView) -> Tsr {
    assert!(a.shape().len() == 2 && a.shape()[0] == a.shape()[1], "transpose_sum needs a square matrix");
    a.to_owned() + a.t()
}

/// Scale the listed local columns of a matrix in place.
pub fn scale_columns(tile: &mut TsrMut, cols: &[usize], factor: f64) {
    assert_eq!(tile.shape().len(), 2, "scale_columns needs a matrix");
    if cols.is_empty() {
        return;
    }
    let (m, k) = (tile.shape()[0], tile.shape()[1]);
    let mut data = util::to_c_vec(&tile.view());
    for &c in cols {
        assert!(c < k, "column {c} out of bounds for {k} columns");
        (0..m).for_each(|i| data[i * k + c] *= factor);
    }
    tile.assign(&util::asarray_c(data, &[m, k], tile.device()));
}

/// In-place `tile += tile.T`, then halve the columns listed in `diag_cols`.
///
/// `diag_cols` are local column indices of global diagonal pairs.
pub fn symmetrize_add(tile: &mut TsrMut, diag_cols: &[usize]) {
    let n = tile.shape()[0];
    assert!(tile.shape().len() == 2 && tile.shape()[1] == n, "symmetrize_add needs a square tile");
    let summed = tile.to_owned() + tile.t();
    tile.assign(&summed);
    scale_columns(tile, diag_cols, 0.5);
}

/// Off-diagonal half of [`symmetrize_add`] across two tiles.
///
/// `upper (m, k)` and `lower (k, m)` are mirror images. Afterwards both hold the sum, with
/// `diag_cols` (local columns of `upper`) halved in `upper` only; `lower` keeps the unhalved sum
/// since its own diagonal columns are handled by its block.
pub fn transpose_add_offdiag(upper: &mut TsrMut, lower: &mut TsrMut, diag_cols: &[usize]) {
    let (m, k) = (upper.shape()[0], upper.shape()[1]);
    assert!(lower.shape() == &[k, m], "tiles {:?} and {:?} are not mirror images", upper.shape(), lower.shape());
    let summed = upper.to_owned() + lower.t();
    lower.assign(&summed.t());
    upper.assign(&summed);
    scale_columns(upper, diag_cols, 0.5);
}
