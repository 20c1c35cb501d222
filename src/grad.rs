//! CCSD nuclear gradient.
//!
//! The kernel chains the IX intermediates, the orbital response, the MO->AO transformation of
//! the two-particle density and the atom-resolved contraction with derivative integrals.

use crate::blocking::shell_prange;
use crate::mo2ao::AODensity2;
use crate::prelude::*;
use std::time::Instant;

/// Coulomb and exchange-like contractions of a packed derivative integral block.
///
/// `eri (ni, nao, nao_pair)`, `dm (nao, nao)` symmetric:
/// `vj[i,j] = (ij|kl) dm[k,l]`, `vk[i,l] = (ij|kl) dm[j,k]`.
pub fn hf_get_jk_incore(eri: &TsrView, dm: &TsrView) -> (Tsr, Tsr) {
    let (ni, nj, nao_pair) = (eri.shape()[0], eri.shape()[1], eri.shape()[2]);
    let nao = dm.shape()[0];
    assert!(nj == nao && nao_pair == packed::npair(nao), "eri block {:?} incompatible with nao {nao}", eri.shape());

    // vj = np.einsum("ijkl, kl -> ij", eri, dm)
    let vj = (eri.reshape((ni * nj, nao_pair)) % packed::precontract(dm)).into_shape([ni, nj]);

    // vk = np.einsum("ijkl, jk -> il", eri, dm)
    let eri_full = packed::unpack_tril(eri).into_shape([ni, nj, nao, nao]);
    let eri_full = util::transpose_c(&eri_full.view(), [0, 3, 1, 2]);
    let dm_flat = dm.reshape(-1).to_owned();
    let vk = (eri_full.reshape((ni * nao, -1)) % dm_flat).into_shape([ni, nao]);
    (vj, vk)
}

/// One-particle AO matrices entering the per-atom contraction.
pub struct AOMatrices {
    /// Energy-weighted intermediate `C I C.T`, not symmetric.
    pub im1: Tsr,
    /// Relaxed one-particle density including the HF density.
    pub dm1ao: Tsr,
    /// Energy-weighted density including the HF part.
    pub zeta: Tsr,
    /// `P_occ veff(dm1 + dm1.T) P_occ`
    pub vhf4sij: Tsr,
    pub hf_dm1: Tsr,
}

/// Electronic gradient of the requested atoms, `(natm, 3)`.
pub fn contract_atoms(
    integrals: &dyn GradIntegrals,
    dm2: &AODensity2,
    mats: &AOMatrices,
    atmlst: &[usize],
    flags: &GradFlags,
) -> Result<Tsr> {
    let AOMatrices { im1, dm1ao, zeta, vhf4sij, hf_dm1 } = mats;
    let nao = integrals.nao();
    let nao_pair = packed::npair(nao);
    ensure!(dm2.nao == nao, "AO density has nao = {}, integrals have {nao}", dm2.nao);
    let device = dm1ao.device().clone();

    let s1 = integrals.ovlp_deriv()?;
    let h1 = integrals.hcore_deriv()?;
    let aoslices = integrals.aoslice_by_atom();
    let ao_loc = integrals.ao_loc();
    let dm1_sym = dm1ao + dm1ao.t();

    let blksize = blocking::resolve_blksize(flags, 2.5 * (nao as f64).powi(3), 1);
    debug!("gradient contraction: AO block size = {blksize}");

    let mut de: Tsr = rt::zeros(([atmlst.len(), 3], &device));
    for (k, &ia) in atmlst.iter().enumerate() {
        let time = Instant::now();
        let [shl0, shl1, p0, p1] = aoslices[ia];
        let vrinv = integrals.rinv_deriv(ia)?;
        for x in 0..3 {
            let s1x = s1.i((x, p0..p1));
            let h1x = h1.i((x, p0..p1));
            // s[1] dot I, im1 is not symmetric
            let mut val = (&s1x * im1.i(p0..p1)).sum_all() + (&s1x * im1.i((.., p0..p1)).t()).sum_all();
            // h[1] dot DM
            val += (&h1x * dm1ao.i(p0..p1)).sum_all() + (&h1x * dm1ao.i((.., p0..p1)).t()).sum_all();
            val += (vrinv.i(x) * &dm1_sym).sum_all();
            // -s[1] * e dot DM
            val -= (&s1x * zeta.i(p0..p1)).sum_all() + (&s1x * zeta.i((.., p0..p1)).t()).sum_all();
            // -vhf[s_ij[1]], twice for s1 + s1.T
            val -= 2.0 * (&s1x * vhf4sij.i(p0..p1)).sum_all();
            de[[k, x]] += val;
        }

        // 2e AO derivative integrals dot 2pdm
        let mut ip0 = p0;
        for (b0, b1, nf) in shell_prange(&ao_loc, shl0, shl1, blksize) {
            let eri1 = integrals.eri_ip1_s2kl(b0, b1)?;
            ensure!(eri1.shape() == &[3, nf, nao, nao_pair], "eri_ip1 block shape {:?}", eri1.shape());
            let dm2buf = dm2.load_block_tril(ip0, ip0 + nf, &device)?;
            let hf_blk = hf_dm1.i(ip0..ip0 + nf);
            for x in 0..3 {
                let eri1x = eri1.i(x);
                de[[k, x]] -= 2.0 * (&eri1x * &dm2buf).sum_all();
                let (vj, vk) = hf_get_jk_incore(&eri1x, &hf_dm1.view());
                de[[k, x]] -= 2.0 * ((&vj * &hf_blk).sum_all() - 0.5 * (&vk * &hf_blk).sum_all());
            }
            ip0 += nf;
        }
        debug!(
            "grad of atom {ia} {} = [{:.9}, {:.9}, {:.9}]",
            integrals.atom_symbol(ia),
            de[[k, 0]],
            de[[k, 1]],
            de[[k, 2]]
        );
        debug!("Time elapsed (grad of atom {ia}): {:.3?}", time.elapsed());
    }
    Ok(de)
}

fn check_canonical(fock: &Tsr) -> Result<()> {
    let nmo = fock.shape()[0];
    let mut offdiag = fock.to_owned();
    for p in 0..nmo {
        offdiag[[p, p]] = 0.0;
    }
    let max_offdiag = offdiag.abs().max_all();
    ensure!(max_offdiag < 1.0e-8, "CCSD gradient requires canonical orbitals, max off-diagonal Fock element {max_offdiag:.3e}");
    Ok(())
}

/// `zeta[p,q] = (e_p + e_q) / 2`, except `e_i` on both occupied-virtual blocks.
fn orbital_energy_weights(mo_energy: &Tsr, nocc: usize) -> Tsr {
    let nmo = mo_energy.shape()[0];
    let mut zeta = 0.5_f64 * (mo_energy.i((.., None)) + mo_energy.i((None, ..)));
    for i in 0..nocc {
        for a in nocc..nmo {
            zeta[[a, i]] = mo_energy[[i]];
            zeta[[i, a]] = mo_energy[[i]];
        }
    }
    zeta
}

fn log_summary(integrals: &dyn GradIntegrals, atmlst: &[usize], de: &Tsr) {
    info!("CCSD gradients");
    info!("==============");
    info!("           x                y                z");
    for (k, &ia) in atmlst.iter().enumerate() {
        info!(
            "{ia} {}  {:15.9}  {:15.9}  {:15.9}",
            integrals.atom_symbol(ia),
            de[[k, 0]],
            de[[k, 1]],
            de[[k, 2]]
        );
    }
}

/// Analytic CCSD gradient for a canonical RHF reference without frozen orbitals.
pub fn ccsd_grad_kernel(
    info: &CCSDGradInfo,
    amps: &CCAmplitudes,
    eris: &CCERIs,
    density: &dyn CCDensityProvider,
    integrals: &dyn GradIntegrals,
    cphf: &dyn CPHFSolver,
    flags: &GradFlags,
) -> Result<CCSDGradResults> {
    let time0 = Instant::now();
    if let Some(frozen) = &flags.frozen {
        bail!("frozen orbitals are not supported by the CCSD gradient (got {frozen:?})");
    }
    info.check()?;
    let (nao, nmo, nocc, nvir) = (info.nao(), info.nmo(), info.nocc(), info.nvir());
    ensure!(amps.t1.shape() == &[nocc, nvir], "t1 shape {:?}, expected [{nocc}, {nvir}]", amps.t1.shape());
    ensure!(integrals.nao() == nao, "integrals have nao = {}, mo_coeff has {nao}", integrals.nao());
    eris.check(nocc, nvir)?;
    check_canonical(&eris.fock)?;

    let natm = integrals.natm();
    let atmlst = flags.atmlst.clone().unwrap_or_else(|| (0..natm).collect());
    if let Some(&ia) = atmlst.iter().find(|&&ia| ia >= natm) {
        bail!("atom {ia} requested, molecule has {natm} atoms");
    }
    let max_memory = flags.max_memory;
    let mo_coeff = &info.mo_coeff;

    let (de, cphf_out) = ScratchStore::scoped(flags.scratch_dir.as_deref(), "ccsd-grad", |store| {
        debug!("Build ccsd rdm1 intermediates");
        let (doo, dvv) = density.gamma1(amps, max_memory)?;
        debug!("Build ccsd rdm2 intermediates");
        let d2 = density.gamma2(amps, store, max_memory)?;

        let ix = ix::ix_intermediates(eris, (&doo, &dvv), &d2, flags)?;
        let (mut dm1mo, cphf_out) = response::response_dm1(eris, &ix, &info.mo_occ().view(), cphf, flags)?;
        dm1mo.i_mut((..nocc, ..nocc)).assign(2.0 * &doo);
        dm1mo.i_mut((nocc.., nocc..)).assign(2.0 * &dvv);
        let mut dm1ao = mo_coeff % &dm1mo % mo_coeff.t();

        let mut im1: Tsr = rt::zeros(([nmo, nmo], mo_coeff.device()));
        im1.i_mut((..nocc, ..nocc)).assign(&ix.i_oo);
        im1.i_mut((nocc.., nocc..)).assign(&ix.i_vv);
        im1.i_mut((nocc.., ..nocc)).assign(&ix.i_vo);
        im1.i_mut((..nocc, nocc..)).assign(ix.i_vo.t());
        let im1 = mo_coeff % &im1 % mo_coeff.t();

        debug!("symmetrized rdm2 and MO->AO transformation");
        let dm2 = mo2ao::rdm2_mo2ao(&d2, &dm1mo, mo_coeff, flags, store)?;

        let time = Instant::now();
        let zeta = orbital_energy_weights(&info.mo_energy, nocc) * &dm1mo;
        let mut zeta = mo_coeff % &zeta % mo_coeff.t();
        let c_occ = mo_coeff.i((.., ..nocc));
        let p1 = &c_occ % c_occ.t();
        let vhf4sij = &p1 % integrals.veff(&(&dm1ao + dm1ao.t()).view())? % &p1;
        info!("Time elapsed (h1 and JK1): {:.3?}", time.elapsed());

        // Hartree-Fock part
        let hf_dm1 = 2.0 * (&c_occ % c_occ.t());
        dm1ao += &hf_dm1;
        let e_occ = 2.0_f64 * info.mo_energy.i(..nocc);
        zeta += (&c_occ * e_occ.i((None, ..))) % c_occ.t();

        let mats = AOMatrices { im1, dm1ao, zeta, vhf4sij, hf_dm1 };
        let time = Instant::now();
        let de = contract_atoms(integrals, &dm2, &mats, &atmlst, flags)?;
        info!("Time elapsed (gradient contraction): {:.3?}", time.elapsed());
        Ok((de, cphf_out))
    })?;

    log_summary(integrals, &atmlst, &de);
    info!("Time elapsed (CCSD gradients): {:.3?}", time0.elapsed());
    let de_nuc = integrals.grad_nuc(&atmlst);
    Ok(CCSDGradResults { atmlst, de, de_nuc, cphf_converged: cphf_out.converged, cphf_niter: cphf_out.niter })
}
