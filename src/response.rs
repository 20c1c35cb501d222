//! Orbital response of the CCSD gradient.
//!
//! The right-hand side is `Xvo`; the response operator is applied block by block over occupied
//! rows of `ovov`/`oovv` and handed to a [`CPHFSolver`].

use crate::blocking::{BLKMIN, prange};
use crate::diis::{DIISFlags, DIISIncore};
use crate::prelude::*;

/// Solution of the CPHF equations.
#[derive(Debug)]
pub struct CPHFOutput {
    /// Response amplitudes `(nvir, nocc)`.
    pub x: Tsr,
    pub converged: bool,
    pub niter: usize,
}

/// Solver for `x + fvind(x) / (e_a - e_i) = -h1 / (e_a - e_i)`.
pub trait CPHFSolver {
    fn solve(
        &self,
        fvind: &dyn Fn(&TsrView) -> Result<Tsr>,
        mo_energy: &TsrView,
        mo_occ: &TsrView,
        h1: &TsrView,
        max_cycle: usize,
    ) -> Result<CPHFOutput>;
}

/// Fixed-point iteration `x = -(h1 + fvind(x)) / (e_a - e_i)` with DIIS acceleration.
pub struct DIISCPHFSolver {
    pub conv_tol: f64,
    pub diis_flags: DIISFlags,
}

impl Default for DIISCPHFSolver {
    fn default() -> Self {
        Self { conv_tol: 1.0e-9, diis_flags: DIISFlags::default() }
    }
}

impl DIISCPHFSolver {
    pub fn new(conv_tol: f64) -> Self {
        Self { conv_tol, ..Default::default() }
    }
}

impl From<&GradFlags> for DIISCPHFSolver {
    fn from(flags: &GradFlags) -> Self {
        Self::new(flags.cphf_conv_tol)
    }
}

impl CPHFSolver for DIISCPHFSolver {
    fn solve(
        &self,
        fvind: &dyn Fn(&TsrView) -> Result<Tsr>,
        mo_energy: &TsrView,
        mo_occ: &TsrView,
        h1: &TsrView,
        max_cycle: usize,
    ) -> Result<CPHFOutput> {
        let nmo = mo_energy.shape()[0];
        let nocc = (0..nmo).filter(|&p| mo_occ[[p]] > 0.0).count();
        let nvir = nmo - nocc;
        ensure!(h1.shape() == &[nvir, nocc], "CPHF rhs shape {:?}, expected [{nvir}, {nocc}]", h1.shape());
        ensure!(
            (0..nmo).all(|p| (mo_occ[[p]] > 0.0) == (p < nocc)),
            "occupied orbitals must precede virtual orbitals"
        );

        // e_ai = 1 / (e_a - e_i)
        let e_i = mo_energy.i(..nocc);
        let e_a = mo_energy.i(nocc..);
        let e_ai = (e_a.i((.., None)) - e_i.i((None, ..))).mapv(|x| 1.0 / x);

        let mut diis = DIISIncore::new(self.diis_flags);
        let mut x = -(h1 * &e_ai);
        let mut converged = false;
        let mut niter = 0;
        for cycle in 0..max_cycle {
            niter = cycle + 1;
            let x_new = -((h1 + fvind(&x.view())?) * &e_ai);
            let err = &x_new - &x;
            let norm = err.l2_norm();
            debug!("CPHF cycle {niter}: |dx| = {norm:.3e}");
            if norm < self.conv_tol {
                x = x_new;
                converged = true;
                break;
            }
            x = diis.update(x_new, err).into_shape([nvir, nocc]);
        }
        if !converged {
            warn!("CPHF not converged after {niter} cycles");
        }
        Ok(CPHFOutput { x, converged, niter })
    }
}

/// Response operator over `x (nvir, nocc)`, streaming occupied rows of `ovov` and `oovv`.
///
/// `v[i,a] = 4 (ia|jb) x[b,j] - (ib|ja) x[b,j] - (ji|ab) x[b,j]`, returned as `v.T`.
pub fn fvind_ovov(eris: &CCERIs, x: &TsrView, blksize: usize) -> Result<Tsr> {
    let (nvir, nocc) = (x.shape()[0], x.shape()[1]);
    let (o, v) = (nocc, nvir);
    let mut vind: Tsr = rt::zeros(([o, v], x.device()));
    let x_jb = x.t().reshape(-1).to_owned();

    for (p0, p1) in prange(0, nocc, blksize) {
        let nb = p1 - p0;
        let eris_ovov = eris.ovov.rows(p0, p1)?;
        // v[p0:p1] += np.einsum("iajb, bj -> ia", eris_ovov, x) * 4
        // v[p0:p1] -= np.einsum("ibja, bj -> ia", eris_ovov, x)
        let eris_ovov_t = util::transpose_c(&eris_ovov.view(), [0, 3, 2, 1]);
        let scr_1 = (eris_ovov.reshape((nb * v, -1)) % &x_jb).into_shape([nb, v]);
        let scr_2 = (eris_ovov_t.reshape((nb * v, -1)) % &x_jb).into_shape([nb, v]);
        *&mut vind.i_mut(p0..p1) += 4.0 * scr_1 - scr_2;

        // v -= np.einsum("jiab, bj -> ia", eris_oovv[p0:p1], x[:, p0:p1])
        let eris_oovv = util::transpose_c(&eris.oovv.rows(p0, p1)?.view(), [1, 2, 0, 3]);
        let x_blk = x.i((.., p0..p1)).t().reshape(-1).to_owned();
        vind -= (eris_oovv.reshape((o * v, -1)) % x_blk).into_shape([o, v]);
    }
    Ok(util::transpose_c(&vind.view(), [1, 0]))
}

/// Orbital-response block of the relaxed one-particle density, `(nmo, nmo)`.
///
/// Only the `vo`/`ov` blocks are filled; `dm1[v, o] = x`, `dm1[o, v] = x.T`. Orbital energies
/// are the diagonal of `eris.fock`; `mo_occ` are the reference occupations.
pub fn response_dm1(
    eris: &CCERIs,
    ix: &IXIntermediates,
    mo_occ: &TsrView,
    cphf: &dyn CPHFSolver,
    flags: &GradFlags,
) -> Result<(Tsr, CPHFOutput)> {
    let (nvir, nocc) = (ix.x_vo.shape()[0], ix.x_vo.shape()[1]);
    let nmo = nocc + nvir;
    let time = std::time::Instant::now();

    let blksize = blocking::resolve_blksize(flags, (nocc * nvir * nvir) as f64, BLKMIN);
    debug!("CPHF response operator: block size = {blksize}");

    let mo_energy = eris.fock.diagonal(None).to_owned();
    ensure!(mo_occ.shape() == &[nmo], "mo_occ shape {:?}, expected [{nmo}]", mo_occ.shape());
    let output = cphf.solve(
        &|x: &TsrView| fvind_ovov(eris, x, blksize),
        &mo_energy.view(),
        mo_occ,
        &ix.x_vo.view(),
        flags.cphf_max_cycle,
    )?;

    let mut dm1: Tsr = rt::zeros(([nmo, nmo], ix.x_vo.device()));
    dm1.i_mut((nocc.., ..nocc)).assign(&output.x);
    dm1.i_mut((..nocc, nocc..)).assign(&output.x.t());
    info!("Time elapsed (response dm1): {:.3?}", time.elapsed());
    Ok((dm1, output))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_fvind_blocking_invariance() {
        let device = DeviceTsr::default();
        let sys = synthetic_cc(5, 3, 3, &device);
        let x = seeded_rng(8).tensor(&[3, 5], &device);
        let reference = fvind_ovov(&sys.eris, &x.view(), 100).unwrap();
        for blksize in [1, 2, 4] {
            let v = fvind_ovov(&sys.eris, &x.view(), blksize).unwrap();
            assert!((&v - &reference).abs().max_all() < 1e-12);
        }
        // explicit element
        let (a, j) = (1, 3);
        let ovov = sys.eris.ovov.load().unwrap();
        let oovv = sys.eris.oovv.load().unwrap();
        let mut val = 0.0;
        for k in 0..5 {
            for b in 0..3 {
                val += 4.0 * ovov[[j, a, k, b]] * x[[b, k]] - ovov[[j, b, k, a]] * x[[b, k]] - oovv[[k, j, a, b]] * x[[b, k]];
            }
        }
        assert!((reference[[a, j]] - val).abs() < 1e-12);
    }

    #[test]
    fn test_cphf_solution_satisfies_equation() {
        init_logger();
        let device = DeviceTsr::default();
        let sys = synthetic_problem(11);
        let ix = IXIntermediates { x_vo: seeded_rng(4).tensor(&[3, 2], &device), ..IXIntermediates::zeros(2, 3, &device) };
        let flags = GradFlags::default();
        let solver = DIISCPHFSolver::new(1e-11);
        let (dm1, out) = response_dm1(&sys.eris, &ix, &sys.info.mo_occ().view(), &solver, &flags).unwrap();
        assert!(out.converged);
        assert!(out.niter <= flags.cphf_max_cycle);

        // x (e_a - e_i) + fvind(x) + h1 == 0
        let e = sys.eris.fock.diagonal(None).to_owned();
        let e_ai = e.i((2.., None)) - e.i((None, ..2));
        let residual = &out.x * &e_ai + fvind_ovov(&sys.eris, &out.x.view(), 1).unwrap() + &ix.x_vo;
        assert!(residual.abs().max_all() < 1e-8);

        assert!((dm1.i((2.., ..2)) - &out.x).abs().max_all() == 0.0);
        assert!((dm1.i((..2, 2..)) - out.x.t()).abs().max_all() == 0.0);
        assert!(dm1.i((..2, ..2)).abs().max_all() == 0.0);
    }

    #[test]
    fn test_cphf_not_converged_is_reported() {
        let device = DeviceTsr::default();
        let sys = synthetic_problem(12);
        let ix = IXIntermediates { x_vo: seeded_rng(5).tensor(&[3, 2], &device), ..IXIntermediates::zeros(2, 3, &device) };
        let flags = GradFlagsBuilder::default().cphf_max_cycle(1).build().unwrap();
        let mo_occ = sys.info.mo_occ();
        let (_, out) = response_dm1(&sys.eris, &ix, &mo_occ.view(), &DIISCPHFSolver::from(&flags), &flags).unwrap();
        assert!(!out.converged);
        assert_eq!(out.niter, 1);
    }

    #[test]
    fn test_occupations_follow_reference() {
        let device = DeviceTsr::default();
        let sys = synthetic_problem(13);
        let mo_occ = sys.info.mo_occ();
        assert_eq!(mo_occ.shape(), &[5]);
        for p in 0..5 {
            let expect = if p < 2 { 2.0 } else { 0.0 };
            assert_eq!(mo_occ[[p]], expect);
        }

        let ix = IXIntermediates::zeros(2, 3, &device);
        let solver = DIISCPHFSolver::default();
        let flags = GradFlags::default();
        // occupations of another orbital count are refused
        let short: Tsr = rt::zeros(([4], &device));
        assert!(response_dm1(&sys.eris, &ix, &short.view(), &solver, &flags).is_err());
        // a virtual listed before an occupied orbital is refused by the solver
        let mut swapped = mo_occ.to_owned();
        swapped[[1]] = 0.0;
        swapped[[2]] = 2.0;
        assert!(response_dm1(&sys.eris, &ix, &swapped.view(), &solver, &flags).is_err());
    }
}
