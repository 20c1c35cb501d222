//! Back-transformation of the two-particle density from MO to packed AO pairs.
//!
//! Pass A transforms the last index pair of the occupied-led blocks, pass B the packed
//! virtual-virtual block; both scatter into a swap store. Pass C gathers AO-pair rows,
//! transforms the first index pair, and symmetrizes `dm2 + dm2.T` block by block.

use crate::blocking::prange;
use crate::prelude::*;
use crate::scratch::NpyTensor;
use std::ops::Range;

/// `pack_tril(C_i X C_j.T + (C_i X C_j.T).T)` for every leading row of `vin (nrow, ni, nj)`.
///
/// Returns `(nrow, nao_pair)`.
pub fn ao2mo_transform_sum(vin: &TsrView, mo_coeff: &TsrView, irange: Range<usize>, jrange: Range<usize>) -> Tsr {
    let (nrow, ni, nj) = (vin.shape()[0], vin.shape()[1], vin.shape()[2]);
    assert!(
        ni == irange.len() && nj == jrange.len(),
        "block {:?} does not match orbital ranges {irange:?} and {jrange:?}",
        vin.shape()
    );
    let nao = mo_coeff.shape()[0];
    let c_i = mo_coeff.i((.., irange));
    let c_j = mo_coeff.i((.., jrange));

    // half = np.einsum("rpq, uq -> pru", vin, c_j)
    let half = (vin.reshape((nrow * ni, nj)) % c_j.t()).into_shape([nrow, ni, nao]);
    let half = util::transpose_c(&half.view(), [1, 0, 2]);
    // full = np.einsum("tp, pru -> rtu", c_i, half)
    let full = (c_i % half.reshape((ni, nrow * nao))).into_shape([nao, nrow, nao]);
    let full = util::transpose_c(&full.view(), [1, 0, 2]);
    packed::pack_tril(&packed::sum021(&full.view()).view())
}

/// AO two-particle density, `(nao_pair, nao_pair)`, stored as column blocks `dm2/<ic>`.
#[derive(Debug)]
pub struct AODensity2 {
    pub nao: usize,
    /// `(c0, c1, dataset)` with dataset shape `(nao_pair, c1 - c0)`.
    pub blocks: Vec<(usize, usize, NpyTensor)>,
}

impl AODensity2 {
    pub fn nao_pair(&self) -> usize {
        packed::npair(self.nao)
    }

    pub fn to_dense(&self, device: &DeviceTsr) -> Result<Tsr> {
        let nao_pair = self.nao_pair();
        let mut out: Tsr = rt::zeros(([nao_pair, nao_pair], device));
        for (c0, c1, dset) in &self.blocks {
            out.i_mut((.., *c0..*c1)).assign(&dset.read_all(device)?);
        }
        Ok(out)
    }

    /// Expand AO rows `[row0, row1)` of the first pair index: `out[a, j, kl] = dm2[pair(a, j), kl]`.
    ///
    /// Returns `(row1 - row0, nao, nao_pair)`.
    pub fn load_block_tril(&self, row0: usize, row1: usize, device: &DeviceTsr) -> Result<Tsr> {
        let nao = self.nao;
        assert!(row0 <= row1 && row1 <= nao, "AO rows {row0}..{row1} out of bounds for nao {nao}");
        let nrow = row1 - row0;
        let mut out: Tsr = rt::zeros(([nrow, nao, self.nao_pair()], device));
        // pairs (i, j <= i) of rows inside the block are one contiguous run; later AO rows i
        // contribute the strided runs pair(i, row0)..pair(i, row1)
        let (tri0, tri1) = (packed::npair(row0), packed::npair(row1));
        let mut ranges = vec![(tri0, tri1)];
        ranges.extend((row1..nao).map(|i| (packed::npair(i) + row0, packed::npair(i) + row1)));
        for (c0, c1, dset) in &self.blocks {
            let rows = dset.read_row_ranges(&ranges, device)?;
            let mut blk: Tsr = rt::zeros(([nrow, nao, c1 - c0], device));
            for i in row0..row1 {
                let seg = rows.i(packed::npair(i) - tri0..packed::npair(i + 1) - tri0);
                blk.i_mut((i - row0, ..i + 1)).assign(&seg);
                for j in row0..i {
                    blk.i_mut((j - row0, i)).assign(&seg.i(j));
                }
            }
            for i in row1..nao {
                let off = tri1 - tri0 + (i - row1) * nrow;
                blk.i_mut((.., i)).assign(&rows.i(off..off + nrow));
            }
            out.i_mut((.., .., *c0..*c1)).assign(&blk);
        }
        Ok(out)
    }
}

/// Transform the MO two-particle density (plus the `dm1` cumulant correction) to AO pairs.
///
/// The result lives in `out` under `dm2/`; swap groups `o` and `v` use a scratch store of their
/// own that is gone when this returns.
pub fn rdm2_mo2ao(
    d2: &CCDensity2,
    dm1: &Tsr,
    mo_coeff: &Tsr,
    flags: &GradFlags,
    out: &ScratchStore,
) -> Result<AODensity2> {
    let (nao, nmo) = (mo_coeff.shape()[0], mo_coeff.shape()[1]);
    let nocc = d2.dovov.shape()[0];
    ensure!(nocc > 0 && nocc < nmo, "MO->AO transform needs occupied and virtual orbitals, nocc = {nocc}, nmo = {nmo}");
    let nvir = nmo - nocc;
    d2.check(nocc, nvir)?;
    ensure!(dm1.shape() == &[nmo, nmo], "dm1 shape {:?}, expected [{nmo}, {nmo}]", dm1.shape());

    let time = std::time::Instant::now();
    let dm2 = ScratchStore::scoped(flags.scratch_dir.as_deref(), "ccsd-grad-mo2ao", |swap| {
        rdm2_pass_ab(d2, dm1, mo_coeff, flags, swap)?;
        let dm2 = rdm2_pass_c(mo_coeff, nocc, flags, swap, out)?;
        swap.remove_group("o")?;
        swap.remove_group("v")?;
        Ok(dm2)
    })?;
    info!("Time elapsed (MO->AO transformation): {:.3?}", time.elapsed());
    debug!("AO density stored in {} column blocks, nao = {nao}", dm2.blocks.len());
    Ok(dm2)
}

fn rdm2_pass_ab(d2: &CCDensity2, dm1: &Tsr, mo_coeff: &Tsr, flags: &GradFlags, swap: &ScratchStore) -> Result<()> {
    let (nao, nmo) = (mo_coeff.shape()[0], mo_coeff.shape()[1]);
    let nocc = d2.dovov.shape()[0];
    let nvir = nmo - nocc;
    let (o, v) = (nocc, nvir);
    let nao_pair = packed::npair(nao);
    let nvir_pair = packed::npair(nvir);
    let device = mo_coeff.device().clone();

    let unit = (nmo * nao_pair + nmo.pow(3) + nvir.pow(3)) as f64;
    let blksize = blocking::resolve_blksize(flags, unit, 1);
    let iobuflen = flags.iobuflen.unwrap_or(((256e6 / 8.0 / (blksize * nmo) as f64) as usize).max(1));
    debug!("MO->AO pass A: block size = {blksize}, iobuflen = {iobuflen}");

    let dm1_half = 0.5 * dm1.to_owned();
    for (istep, (p0, p1)) in prange(0, nocc, blksize).enumerate() {
        let nb = p1 - p0;
        let mut buf1: Tsr = rt::zeros(([nb, nmo, nmo, nmo], &device));
        buf1.i_mut((.., ..o, ..o, ..o)).assign(&d2.doooo.rows(p0, p1)?);
        buf1.i_mut((.., ..o, ..o, o..)).assign(&d2.dooov.rows(p0, p1)?);
        buf1.i_mut((.., ..o, o.., o..)).assign(&d2.doovv.rows(p0, p1)?);
        buf1.i_mut((.., o.., ..o, o..)).assign(&d2.dovov.rows(p0, p1)?);
        buf1.i_mut((.., o.., o.., ..o)).assign(&d2.dovvo.rows(p0, p1)?);
        buf1.i_mut((.., o.., o.., o..)).assign(&d2.dovvv.rows(p0, p1)?);
        for i in p0..p1 {
            *&mut buf1.i_mut((i - p0, i)) += dm1;
            *&mut buf1.i_mut((i - p0, .., .., i)) -= &dm1_half;
        }
        let buf1 = buf1.into_shape([nb * nmo, nmo, nmo]);
        let buf2 = ao2mo_transform_sum(&buf1.view(), &mo_coeff.view(), 0..nmo, 0..nmo);
        swap.transpose_to_group("o", istep, &buf2.view(), iobuflen)?;
    }

    debug!("MO->AO pass B: {} rows of packed virtual pairs per block", blksize * v);
    for (istep, (q0, q1)) in prange(0, nvir_pair, blksize * v).enumerate() {
        let buf1 = packed::unpack_tril(&d2.dvvvv.rows(q0, q1)?.view());
        let buf2 = ao2mo_transform_sum(&buf1.view(), &mo_coeff.view(), o..nmo, o..nmo);
        swap.transpose_to_group("v", istep, &buf2.view(), iobuflen)?;
    }
    Ok(())
}

fn rdm2_pass_c(
    mo_coeff: &Tsr,
    nocc: usize,
    flags: &GradFlags,
    swap: &ScratchStore,
    out: &ScratchStore,
) -> Result<AODensity2> {
    let (nao, nmo) = (mo_coeff.shape()[0], mo_coeff.shape()[1]);
    let nao_pair = packed::npair(nao);
    let device = mo_coeff.device().clone();

    let blksize = blocking::resolve_blksize(flags, (nao_pair + nmo * nmo) as f64, nao);
    debug!("MO->AO pass C: block size = {blksize}, nao_pair = {nao_pair}");

    let ranges = prange(0, nao_pair, blksize).collect::<Vec<_>>();
    let blocks = ranges
        .iter()
        .enumerate()
        .map(|(ic, &(c0, c1))| Ok((c0, c1, out.create_dataset(&format!("dm2/{ic}"), &[nao_pair, c1 - c0])?)))
        .collect::<Result<Vec<_>>>()?;
    let diagidx = packed::diag_indices(nao);

    let (group_o, group_v) = (swap.group("o")?, swap.group("v")?);
    // blocks are finalized in order; block k reads the rows written by blocks 0..k
    for (istep, &(p0, p1)) in ranges.iter().enumerate() {
        let nb = p1 - p0;
        let mut buf1: Tsr = rt::zeros(([nb, nmo, nmo], &device));
        let buf_o = group_o.load_rows(p0, p1, &device)?.into_shape([nb, nocc, nmo]);
        buf1.i_mut((.., ..nocc)).assign(&buf_o);
        let buf_v = packed::unpack_tril(&group_v.load_rows(p0, p1, &device)?.view());
        buf1.i_mut((.., nocc.., nocc..)).assign(&buf_v);
        let mut buf2 = ao2mo_transform_sum(&buf1.view(), &mo_coeff.view(), 0..nmo, 0..nmo);

        let diag_lower = diagidx.iter().copied().filter(|&d| d < p0).collect::<Vec<_>>();
        let diag_tile = diagidx.iter().copied().filter(|&d| d >= p0 && d < p1).map(|d| d - p0).collect::<Vec<_>>();
        if p0 > 0 {
            let dset = &blocks[istep].2;
            let mut upper = dset.read_rows(0, p0, &device)?;
            packed::transpose_add_offdiag(&mut upper.view_mut(), &mut buf2.i_mut((.., ..p0)), &diag_tile);
            dset.write_rows(0, &upper.view())?;
            packed::scale_columns(&mut buf2.i_mut((.., ..p0)), &diag_lower, 0.5);
        }
        packed::symmetrize_add(&mut buf2.i_mut((.., p0..p1)), &diag_tile);

        for (c0, c1, dset) in &blocks {
            dset.write_rows(p0, &buf2.i((.., *c0..*c1)))?;
        }
    }
    Ok(AODensity2 { nao, blocks })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::*;

    /// Unblocked transform built from the same building blocks.
    fn dense_reference(d2: &CCDensity2, dm1: &Tsr, mo_coeff: &Tsr) -> Tsr {
        let (nao, nmo) = (mo_coeff.shape()[0], mo_coeff.shape()[1]);
        let nocc = d2.dovov.shape()[0];
        let nao_pair = packed::npair(nao);
        let o = nocc;
        let device = mo_coeff.device().clone();

        let mut gamma: Tsr = rt::zeros(([o, nmo, nmo, nmo], &device));
        gamma.i_mut((.., ..o, ..o, ..o)).assign(&d2.doooo.load().unwrap());
        gamma.i_mut((.., ..o, ..o, o..)).assign(&d2.dooov.load().unwrap());
        gamma.i_mut((.., ..o, o.., o..)).assign(&d2.doovv.load().unwrap());
        gamma.i_mut((.., o.., ..o, o..)).assign(&d2.dovov.load().unwrap());
        gamma.i_mut((.., o.., o.., ..o)).assign(&d2.dovvo.load().unwrap());
        gamma.i_mut((.., o.., o.., o..)).assign(&d2.dovvv.load().unwrap());
        for i in 0..o {
            for p in 0..nmo {
                for q in 0..nmo {
                    gamma[[i, i, p, q]] += dm1[[p, q]];
                    gamma[[i, p, q, i]] -= 0.5 * dm1[[p, q]];
                }
            }
        }
        let gamma = gamma.into_shape([o * nmo, nmo, nmo]);
        let t_o = ao2mo_transform_sum(&gamma.view(), &mo_coeff.view(), 0..nmo, 0..nmo);
        let dvvvv = packed::unpack_tril(&d2.dvvvv.load().unwrap().view());
        let t_v = ao2mo_transform_sum(&dvvvv.view(), &mo_coeff.view(), o..nmo, o..nmo);

        let mut x: Tsr = rt::zeros(([nao_pair, nmo, nmo], &device));
        x.i_mut((.., ..o)).assign(&t_o.t().into_shape([nao_pair, o, nmo]));
        x.i_mut((.., o.., o..)).assign(&packed::unpack_tril(&t_v.t()));
        let m = ao2mo_transform_sum(&x.view(), &mo_coeff.view(), 0..nmo, 0..nmo);

        let mut g = &m + m.t();
        packed::scale_columns(&mut g.view_mut(), &packed::diag_indices(nao), 0.5);
        g
    }

    #[test]
    fn test_ao2mo_transform_sum_explicit() {
        let device = DeviceTsr::default();
        let mut rng = seeded_rng(31);
        let c = rng.tensor(&[3, 4], &device);
        let x = rng.tensor(&[2, 2, 3], &device);
        let out = ao2mo_transform_sum(&x.view(), &c.view(), 1..3, 0..3);
        assert_eq!(out.shape(), &[2, 6]);
        for r in 0..2 {
            for (k, l) in [(0, 0), (2, 1), (1, 0), (2, 2)] {
                let mut val = 0.0;
                for p in 0..2 {
                    for q in 0..3 {
                        val += c[[k, 1 + p]] * x[[r, p, q]] * c[[l, q]] + c[[l, 1 + p]] * x[[r, p, q]] * c[[k, q]];
                    }
                }
                assert!((out[[r, packed::pair_index(k, l)]] - val).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_rdm2_mo2ao_matches_dense() {
        init_logger();
        let device = DeviceTsr::default();
        let (nocc, nvir, nao) = (2, 3, 4);
        let sys = synthetic_cc(nocc, nvir, 21, &device);
        let mo_coeff = synthetic_mo_coeff(nao, nocc + nvir, 22, &device);
        let dm1 = seeded_rng(23).tensor(&[5, 5], &device);
        let reference = dense_reference(&sys.d2, &dm1, &mo_coeff);

        let cases = [(None, None), (Some(1), Some(1)), (Some(2), None), (Some(3), Some(4)), (Some(100), Some(2))];
        for (blksize, iobuflen) in cases {
            let flags = GradFlagsBuilder::default().blksize(blksize).iobuflen(iobuflen).build().unwrap();
            ScratchStore::scoped(None, "test-mo2ao", |out| {
                let dm2 = rdm2_mo2ao(&sys.d2, &dm1, &mo_coeff, &flags, out)?;
                let dense = dm2.to_dense(&device)?;
                assert!((&dense - &reference).abs().max_all() < 1e-10, "blksize {blksize:?}");

                // packed-row expansion of the AO density
                for (row0, row1) in [(0, 4), (1, 3), (3, 4)] {
                    let blk = dm2.load_block_tril(row0, row1, &device)?;
                    assert_eq!(blk.shape(), &[row1 - row0, nao, packed::npair(nao)]);
                    for a in row0..row1 {
                        for j in 0..nao {
                            let expect = dense.i(packed::pair_index(a, j));
                            assert!((blk.i((a - row0, j)) - expect).abs().max_all() == 0.0);
                        }
                    }
                }
                Ok(())
            })
            .unwrap();
        }
    }

    #[test]
    fn test_rdm2_mo2ao_symmetric_input_gives_symmetric_output() {
        // with a pair-symmetric packed dvvvv only, the AO density is symmetric up to diagonal weights
        let device = DeviceTsr::default();
        let (nocc, nvir, nao) = (1, 2, 3);
        let mut sys = synthetic_cc(nocc, nvir, 2, &device);
        let zeros = |shape: &[usize]| BlockTensor::from(rt::zeros((shape.to_vec(), &device)));
        sys.d2.doooo = zeros(&[1, 1, 1, 1]);
        sys.d2.dooov = zeros(&[1, 1, 1, 2]);
        sys.d2.doovv = zeros(&[1, 1, 2, 2]);
        sys.d2.dovov = zeros(&[1, 2, 1, 2]);
        sys.d2.dovvo = zeros(&[1, 2, 2, 1]);
        sys.d2.dovvv = zeros(&[1, 2, 2, 2]);
        let dvvvv = sys.d2.dvvvv.load().unwrap();
        sys.d2.dvvvv = BlockTensor::from(packed::transpose_sum(&dvvvv.view()));
        let mo_coeff = synthetic_mo_coeff(nao, 3, 3, &device);
        let dm1: Tsr = rt::zeros(([3, 3], &device));
        let flags = GradFlagsBuilder::default().blksize(Some(2)).build().unwrap();
        let dense = ScratchStore::scoped(None, "test-mo2ao-sym", |out| {
            rdm2_mo2ao(&sys.d2, &dm1, &mo_coeff, &flags, out)?.to_dense(&device)
        })
        .unwrap();
        let mut unweighted = dense.to_owned();
        let diag = packed::diag_indices(nao);
        packed::scale_columns(&mut unweighted.view_mut(), &diag, 2.0);
        assert!((&unweighted - unweighted.t()).abs().max_all() < 1e-12);
    }
}
