//! Derivative integrals and molecular geometry seen by the gradient contractor.

use crate::prelude::*;

/// Geometry and AO derivative integrals.
///
/// Derivative matrices follow the sign convention of nuclear gradients: `ovlp_deriv` is
/// `-(nabla i|j)`, `hcore_deriv` is `-(nabla i|T + V|j)`, and `rinv_deriv(atm)` is
/// `-Z_atm (nabla i|1/r_atm|j)`.
pub trait GradIntegrals {
    fn natm(&self) -> usize;
    fn nao(&self) -> usize;
    fn atom_charges(&self) -> Vec<f64>;
    fn atom_coords(&self) -> Vec<[f64; 3]>;
    fn atom_symbol(&self, atm: usize) -> String;

    /// Shell offsets in AO functions, `nbas + 1` entries.
    fn ao_loc(&self) -> Vec<usize>;

    /// `[shl0, shl1, p0, p1]` for every atom.
    fn aoslice_by_atom(&self) -> Vec<[usize; 4]>;

    /// `(3, nao, nao)`
    fn ovlp_deriv(&self) -> Result<Tsr>;

    /// `(3, nao, nao)`
    fn hcore_deriv(&self) -> Result<Tsr>;

    /// `(3, nao, nao)`, operator origin at the nucleus of `atm`.
    fn rinv_deriv(&self, atm: usize) -> Result<Tsr>;

    /// RHF effective potential `J[dm] - K[dm] / 2`, `(nao, nao)`.
    fn veff(&self, dm: &TsrView) -> Result<Tsr>;

    /// `(nabla i j|kl)` for `i` in shells `[shl0, shl1)`, packed over `kl`: `(3, nf, nao, nao_pair)`.
    fn eri_ip1_s2kl(&self, shl0: usize, shl1: usize) -> Result<Tsr>;

    /// Nuclear repulsion gradient of the listed atoms, `(natm, 3)`.
    fn grad_nuc(&self, atmlst: &[usize]) -> Tsr {
        grad_nuc(&self.atom_charges(), &self.atom_coords(), atmlst)
    }
}

/// `g[j] = -sum_k Z_j Z_k (r_j - r_k) / |r_j - r_k|^3` for every listed atom `j`.
pub fn grad_nuc(charges: &[f64], coords: &[[f64; 3]], atmlst: &[usize]) -> Tsr {
    let device = DeviceTsr::default();
    let mut gs: Tsr = rt::zeros(([atmlst.len(), 3], &device));
    for (row, &j) in atmlst.iter().enumerate() {
        let (q1, r1) = (charges[j], coords[j]);
        for (k, (&q2, r2)) in charges.iter().zip(coords).enumerate() {
            if k == j {
                continue;
            }
            let dr = [r1[0] - r2[0], r1[1] - r2[1], r1[2] - r2[2]];
            let r = dr.iter().map(|x| x * x).sum::<f64>().sqrt();
            for x in 0..3 {
                gs[[row, x]] -= q1 * q2 * dr[x] / (r * r * r);
            }
        }
    }
    gs
}

const ELEMENTS: [&str; 37] = [
    "X", "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl", "Ar", "K", "Ca",
    "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As", "Se", "Br", "Kr",
];

/// Element symbol of a nuclear charge; ghost or unknown charges map to `X`.
pub fn element_symbol(z: usize) -> &'static str {
    ELEMENTS.get(z).copied().unwrap_or("X")
}

/* #region libcint */

/// [`GradIntegrals`] evaluated with libcint.
///
/// Two-electron tiles are computed on demand over a range of shells for the first index, with
/// the last pair packed (`s2kl`); nothing of size `nao^4` is held.
pub struct CIntGradIntegrals {
    pub cint_data: CInt,
    /// Memory budget (in MB) for the shell blocks of [`GradIntegrals::veff`].
    pub max_memory: f64,
}

impl CIntGradIntegrals {
    pub fn new(cint_data: CInt) -> Self {
        Self { cint_data, max_memory: GradFlags::default().max_memory }
    }

    pub fn from_json(path: &str) -> Self {
        Self::new(CInt::from_json(path))
    }

    pub fn with_max_memory(mut self, max_memory: f64) -> Self {
        self.max_memory = max_memory;
        self
    }

    fn nbas(&self) -> usize {
        self.cint_data.ao_loc().len() - 1
    }

    /// Row-major `intor` over shells `[shl0, shl1)` of the first index, packed over `kl`.
    fn int2e_s2kl(&self, intor: &str, ncomp: usize, shl0: usize, shl1: usize) -> Result<Tsr> {
        let (nbas, nao) = (self.nbas(), self.nao());
        ensure!(shl0 <= shl1 && shl1 <= nbas, "shell range {shl0}..{shl1} out of bounds for {nbas} shells");
        let ao_loc = self.cint_data.ao_loc();
        let nf = ao_loc[shl1] - ao_loc[shl0];
        let device = DeviceTsr::default();

        let shls_slice = [[shl0, shl1], [0, nbas], [0, nbas], [0, nbas]];
        let (out, shape) = self.cint_data.integrate_row_major(intor, "s2kl", shls_slice).into();
        let tile = rt::asarray((out, shape.c(), &device));
        Ok(tile.into_shape([ncomp, nf, nao, packed::npair(nao)]))
    }
}

impl GradIntegrals for CIntGradIntegrals {
    fn natm(&self) -> usize {
        self.cint_data.atom_charges().len()
    }

    fn nao(&self) -> usize {
        self.cint_data.nao()
    }

    fn atom_charges(&self) -> Vec<f64> {
        self.cint_data.atom_charges()
    }

    fn atom_coords(&self) -> Vec<[f64; 3]> {
        self.cint_data.atom_coords()
    }

    fn atom_symbol(&self, atm: usize) -> String {
        element_symbol(self.atom_charges()[atm].round() as usize).to_string()
    }

    fn ao_loc(&self) -> Vec<usize> {
        self.cint_data.ao_loc()
    }

    fn aoslice_by_atom(&self) -> Vec<[usize; 4]> {
        self.cint_data.aoslice_by_atom()
    }

    fn ovlp_deriv(&self) -> Result<Tsr> {
        Ok(-util::intor_row_major(&self.cint_data, "int1e_ipovlp"))
    }

    fn hcore_deriv(&self) -> Result<Tsr> {
        let ipkin = util::intor_row_major(&self.cint_data, "int1e_ipkin");
        let ipnuc = util::intor_row_major(&self.cint_data, "int1e_ipnuc");
        Ok(-(ipkin + ipnuc))
    }

    fn rinv_deriv(&self, atm: usize) -> Result<Tsr> {
        ensure!(atm < self.natm(), "atom {atm} out of range for {} atoms", self.natm());
        let charge = self.atom_charges()[atm];
        let mut cint_data = self.cint_data.clone();
        let iprinv = cint_data.with_rinv_at_nucleus(atm, |cint| util::intor_row_major(cint, "int1e_iprinv"));
        Ok(-charge * iprinv)
    }

    /// `dm` must be symmetric.
    fn veff(&self, dm: &TsrView) -> Result<Tsr> {
        let time = std::time::Instant::now();
        let nao = self.nao();
        ensure!(dm.shape() == &[nao, nao], "density shape {:?}, expected [{nao}, {nao}]", dm.shape());
        let ao_loc = self.ao_loc();
        let blksize = blocking::calc_blksize(self.max_memory, 2.5 * (nao as f64).powi(3), 1);

        let mut vj: Tsr = rt::zeros(([nao, nao], dm.device()));
        let mut vk: Tsr = rt::zeros(([nao, nao], dm.device()));
        let mut p0 = 0;
        for (shl0, shl1, nf) in blocking::shell_prange(&ao_loc, 0, self.nbas(), blksize) {
            let eri = self.int2e_s2kl("int2e", 1, shl0, shl1)?.into_shape([nf, nao, packed::npair(nao)]);
            let (vj_blk, vk_blk) = grad::hf_get_jk_incore(&eri.view(), dm);
            vj.i_mut(p0..p0 + nf).assign(&vj_blk);
            vk.i_mut(p0..p0 + nf).assign(&vk_blk);
            p0 += nf;
        }
        debug!("Time elapsed (veff, AO block size {blksize}): {:.3?}", time.elapsed());
        Ok(vj - 0.5 * vk)
    }

    fn eri_ip1_s2kl(&self, shl0: usize, shl1: usize) -> Result<Tsr> {
        self.int2e_s2kl("int2e_ip1", 3, shl0, shl1)
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;

    fn h2o() -> CIntGradIntegrals {
        CIntGradIntegrals::new(init_h2o_def2_tzvp())
    }

    /// Symmetric positive density from the lowest columns of a fixed matrix.
    fn model_density(nao: usize, device: &DeviceTsr) -> Tsr {
        let mut c: Tsr = rt::zeros(([nao, 5], device));
        for p in 0..nao {
            for i in 0..5 {
                c[[p, i]] = (0.3 * (p * 7 + i * 3) as f64).sin() / (1.0 + p as f64).sqrt();
            }
        }
        2.0 * (&c % c.t())
    }

    #[test]
    fn test_derivative_shapes_and_signs() {
        let mol = h2o();
        let nao = mol.nao();
        let ipovlp = util::intor_row_major(&mol.cint_data, "int1e_ipovlp");
        let s1 = mol.ovlp_deriv().unwrap();
        assert_eq!(s1.shape(), &[3, nao, nao]);
        assert!((&s1 + &ipovlp).abs().max_all() < 1e-14);
        assert_eq!(mol.hcore_deriv().unwrap().shape(), &[3, nao, nao]);
        assert_eq!(mol.rinv_deriv(0).unwrap().shape(), &[3, nao, nao]);
        assert!(mol.rinv_deriv(3).is_err());
        assert_eq!(mol.atom_symbol(0), "O");
    }

    #[test]
    fn test_translational_invariance() {
        // moving every atom together leaves one-electron integrals unchanged
        let mol = h2o();
        let s1 = mol.ovlp_deriv().unwrap();
        assert!((&s1 + s1.swapaxes(1, 2)).abs().max_all() < 1e-10);

        let h1 = mol.hcore_deriv().unwrap();
        let mut total = &h1 + h1.swapaxes(1, 2);
        for atm in 0..mol.natm() {
            let rinv = mol.rinv_deriv(atm).unwrap();
            total += &rinv + rinv.swapaxes(1, 2);
        }
        assert!((&total).abs().max_all() < 1e-7, "{}", total.abs().max_all());
    }

    #[test]
    fn test_eri_ip1_tiles_match_full_integrals() {
        let mol = h2o();
        let nao = mol.nao();
        let full = util::intor_row_major(&mol.cint_data, "int2e_ip1");
        assert_eq!(full.shape(), &[3, nao, nao, nao, nao]);
        let ao_loc = mol.ao_loc();
        for [shl0, shl1, p0, p1] in mol.aoslice_by_atom() {
            for (b0, b1, nf) in blocking::shell_prange(&ao_loc, shl0, shl1, 4) {
                let tile = mol.eri_ip1_s2kl(b0, b1).unwrap();
                assert_eq!(tile.shape(), &[3, nf, nao, packed::npair(nao)]);
                let (q0, q1) = (ao_loc[b0], ao_loc[b1]);
                assert!(p0 <= q0 && q1 <= p1);
                let expect = packed::pack_tril(&full.i((.., q0..q1)));
                assert!((&tile - expect).abs().max_all() < 1e-10);
            }
        }
    }

    #[test]
    fn test_veff_matches_dense_jk() {
        let device = DeviceTsr::default();
        let nao = h2o().nao();
        let dm = model_density(nao, &device);
        let int2e = util::intor_row_major(&h2o().cint_data, "int2e");
        let expect = ((1.0_f64 * &int2e - 0.5_f64 * int2e.swapaxes(1, 2)) * &dm).sum_axes([-1, -2]);

        // a tight budget forces one shell per block
        for max_memory in [-1.0, 2000.0] {
            let vhf = h2o().with_max_memory(max_memory).veff(&dm.view()).unwrap();
            assert!((&vhf - &expect).abs().max_all() < 1e-9, "max_memory {max_memory}");
            assert!((&vhf - vhf.t()).abs().max_all() < 1e-10);
        }
    }

    #[test]
    fn test_grad_nuc_sums_to_zero() {
        let charges = vec![8.0, 1.0, 1.0];
        let coords = vec![[0.0, 0.0, 0.0], [0.0, 1.43, -1.1], [0.0, -1.43, -1.1]];
        let gs = grad_nuc(&charges, &coords, &[0, 1, 2]);
        for x in 0..3 {
            let total: f64 = (0..3).map(|k| gs[[k, x]]).sum();
            assert!(total.abs() < 1e-12);
        }
        // repulsion pushes hydrogen 1 towards +y
        assert!(gs[[1, 1]] < 0.0);
        assert!((gs[[1, 1]] + gs[[2, 1]]).abs() < 1e-12);

        // subset keeps the row order of the request
        let sub = grad_nuc(&charges, &coords, &[2, 0]);
        assert!((sub.i(0) - gs.i(2)).abs().max_all() == 0.0);
        assert!((sub.i(1) - gs.i(0)).abs().max_all() == 0.0);
    }

    #[test]
    fn test_two_atom_analytic() {
        // F = Z1 Z2 / r^2 along the bond
        let gs = grad_nuc(&[1.0, 2.0], &[[0.0, 0.0, 0.0], [0.0, 0.0, 2.0]], &[0, 1]);
        assert!((gs[[0, 2]] - 0.5).abs() < 1e-14);
        assert!((gs[[1, 2]] + 0.5).abs() < 1e-14);
    }

    #[test]
    fn test_element_symbol() {
        assert_eq!(element_symbol(1), "H");
        assert_eq!(element_symbol(8), "O");
        assert_eq!(element_symbol(36), "Kr");
        assert_eq!(element_symbol(0), "X");
        assert_eq!(element_symbol(200), "X");
    }
}
