//! Seeded synthetic data for unit tests.

use crate::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Row-major tensors with entries uniform in `[-0.5, 0.5)`.
pub trait RandomTensor {
    fn tensor(&mut self, shape: &[usize], device: &DeviceTsr) -> Tsr;
}

impl<R: Rng> RandomTensor for R {
    fn tensor(&mut self, shape: &[usize], device: &DeviceTsr) -> Tsr {
        let data: Vec<f64> = (0..shape.iter().product::<usize>()).map(|_| self.gen_range(-0.5..0.5)).collect();
        util::asarray_c(data, shape, device)
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Canonical orbital energies with a clear occupied/virtual gap.
pub fn synthetic_mo_energy(nocc: usize, nvir: usize, device: &DeviceTsr) -> Tsr {
    let e = (0..nocc).map(|i| -2.0 + 0.5 * i as f64).chain((0..nvir).map(|a| 1.0 + 0.7 * a as f64)).collect();
    util::asarray_c(e, &[nocc + nvir], device)
}

pub fn diag_fock(mo_energy: &Tsr) -> Tsr {
    let nmo = mo_energy.shape()[0];
    let mut fock: Tsr = rt::zeros(([nmo, nmo], mo_energy.device()));
    for p in 0..nmo {
        fock[[p, p]] = mo_energy[[p]];
    }
    fock
}

pub struct SyntheticCC {
    pub eris: CCERIs,
    pub d2: CCDensity2,
    pub doo: Tsr,
    pub dvv: Tsr,
    /// Weights in MO basis `(nmo, nmo)` folding intermediates into scalars.
    pub h1: Tsr,
}

/// Random integrals and densities without any permutational symmetry.
///
pub fn synthetic_cc(nocc: usize, nvir: usize, seed: u64, device: &DeviceTsr) -> SyntheticCC {
    let (o, v) = (nocc, nvir);
    let vp = packed::npair(v);
    let mut rng = seeded_rng(seed);
    let mut draw = |shape: &[usize]| BlockTensor::InCore(rng.tensor(shape, device));

    let oooo = draw(&[o, o, o, o]);
    let ooov = draw(&[o, o, o, v]);
    let ovoo = draw(&[o, v, o, o]);
    let oovv = draw(&[o, o, v, v]);
    let ovov = draw(&[o, v, o, v]);
    let ovvv = draw(&[o, v, vp]);
    let vvvv = draw(&[vp, vp]);

    let dovov = draw(&[o, v, o, v]);
    let dvvvv = draw(&[vp, vp]);
    let doooo = draw(&[o, o, o, o]);
    let doovv = draw(&[o, o, v, v]);
    let dovvo = draw(&[o, v, v, o]);
    let dovvv = draw(&[o, v, v, v]);
    let dooov = draw(&[o, o, o, v]);

    let doo = rng.tensor(&[o, o], device);
    let dvv = rng.tensor(&[v, v], device);
    let h1 = rng.tensor(&[o + v, o + v], device);

    let fock = diag_fock(&synthetic_mo_energy(o, v, device));
    let eris = CCERIs { fock, oooo, ooov, ovoo, oovv, ovov, ovvv, vvvv };
    let d2 = CCDensity2 { dovov, dvvvv, doooo, doovv, dovvo, dovvv, dooov };
    SyntheticCC { eris, d2, doo, dvv, h1 }
}

/// Random orthonormal-ish coefficients; only linear algebra consistency matters in tests.
pub fn synthetic_mo_coeff(nao: usize, nmo: usize, seed: u64, device: &DeviceTsr) -> Tsr {
    let mut c = seeded_rng(seed).tensor(&[nao, nmo], device);
    for p in 0..nao.min(nmo) {
        c[[p, p]] += 1.0;
    }
    c
}

/// Complete gradient input on the five-function mock basis, nocc = 2 and nvir = 3.
pub struct SyntheticProblem {
    pub info: CCSDGradInfo,
    pub amps: CCAmplitudes,
    pub eris: CCERIs,
    pub doo: Tsr,
    pub dvv: Tsr,
    pub d2: CCDensity2,
    pub integrals: MockGradIntegrals,
}

/// `ovov` and `oovv` are damped so that the CPHF fixed-point map contracts.
pub fn synthetic_problem(seed: u64) -> SyntheticProblem {
    let device = DeviceTsr::default();
    let (nocc, nvir) = (2, 3);
    let SyntheticCC { mut eris, d2, doo, dvv, .. } = synthetic_cc(nocc, nvir, seed, &device);
    eris.ovov = BlockTensor::from(0.2 * eris.ovov.load().unwrap());
    eris.oovv = BlockTensor::from(0.2 * eris.oovv.load().unwrap());
    let info = CCSDGradInfo {
        mo_coeff: synthetic_mo_coeff(5, nocc + nvir, seed + 1, &device),
        mo_energy: synthetic_mo_energy(nocc, nvir, &device),
        nocc,
    };
    let amps = CCAmplitudes {
        t1: rt::zeros(([nocc, nvir], &device)),
        t2: rt::zeros(([nocc, nocc, nvir, nvir], &device)),
        l1: rt::zeros(([nocc, nvir], &device)),
        l2: rt::zeros(([nocc, nocc, nvir, nvir], &device)),
    };
    let integrals = MockGradIntegrals::new(seed + 2, &device);
    SyntheticProblem { info, amps, eris, doo, dvv, d2, integrals }
}

impl SyntheticProblem {
    pub fn density(&self) -> PrecomputedDensity {
        PrecomputedDensity::InCore { doo: self.doo.to_owned(), dvv: self.dvv.to_owned(), d2: self.d2.clone() }
    }
}

/* #region mock derivative integrals */

/// Derivative integrals filled with random values on a two-atom layout.
pub struct MockGradIntegrals {
    pub ao_loc: Vec<usize>,
    pub atom_of_shell: Vec<usize>,
    pub charges: Vec<f64>,
    pub coords: Vec<[f64; 3]>,
    pub s1: Tsr,
    pub h1: Tsr,
    pub rinv: Vec<Tsr>,
    /// `(3, nao, nao, nao_pair)`
    pub eri1: Tsr,
    /// Symmetric `(nao_pair, nao_pair)` used by `veff`.
    pub eri: Tsr,
}

impl MockGradIntegrals {
    /// Two atoms; shells of sizes 1, 1, 2 | 1.
    pub fn new(seed: u64, device: &DeviceTsr) -> Self {
        let ao_loc = vec![0, 1, 2, 4, 5];
        let atom_of_shell = vec![0, 0, 0, 1];
        let nao = 5;
        let np = packed::npair(nao);
        let mut rng = seeded_rng(seed);
        let s1 = rng.tensor(&[3, nao, nao], device);
        let h1 = rng.tensor(&[3, nao, nao], device);
        let rinv = (0..2).map(|_| rng.tensor(&[3, nao, nao], device)).collect();
        let eri1 = rng.tensor(&[3, nao, nao, np], device);
        let eri = packed::transpose_sum(&rng.tensor(&[np, np], device).view());
        Self {
            ao_loc,
            atom_of_shell,
            charges: vec![1.0, 2.0],
            coords: vec![[0.0, 0.0, 0.0], [0.0, 0.3, 1.4]],
            s1,
            h1,
            rinv,
            eri1,
            eri,
        }
    }
}

impl GradIntegrals for MockGradIntegrals {
    fn natm(&self) -> usize {
        self.charges.len()
    }

    fn nao(&self) -> usize {
        *self.ao_loc.last().unwrap()
    }

    fn atom_charges(&self) -> Vec<f64> {
        self.charges.clone()
    }

    fn atom_coords(&self) -> Vec<[f64; 3]> {
        self.coords.clone()
    }

    fn atom_symbol(&self, atm: usize) -> String {
        integrals::element_symbol(self.charges[atm] as usize).to_string()
    }

    fn ao_loc(&self) -> Vec<usize> {
        self.ao_loc.clone()
    }

    fn aoslice_by_atom(&self) -> Vec<[usize; 4]> {
        (0..self.natm())
            .map(|atm| {
                let shl0 = self.atom_of_shell.iter().position(|&a| a == atm).unwrap();
                let shl1 = self.atom_of_shell.iter().rposition(|&a| a == atm).unwrap() + 1;
                [shl0, shl1, self.ao_loc[shl0], self.ao_loc[shl1]]
            })
            .collect()
    }

    fn ovlp_deriv(&self) -> Result<Tsr> {
        Ok(self.s1.to_owned())
    }

    fn hcore_deriv(&self) -> Result<Tsr> {
        Ok(self.h1.to_owned())
    }

    fn rinv_deriv(&self, atm: usize) -> Result<Tsr> {
        Ok(self.rinv[atm].to_owned())
    }

    fn veff(&self, dm: &TsrView) -> Result<Tsr> {
        let v = &self.eri % packed::precontract(dm);
        Ok(packed::unpack_tril(&v.view()))
    }

    fn eri_ip1_s2kl(&self, shl0: usize, shl1: usize) -> Result<Tsr> {
        let (p0, p1) = (self.ao_loc[shl0], self.ao_loc[shl1]);
        Ok(self.eri1.i((.., p0..p1)).to_owned())
    }
}

/* #endregion */
