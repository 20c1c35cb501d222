use crate::prelude::*;
use std::path::PathBuf;

/* #region reference orbitals */

/// Canonical RHF reference the gradient is evaluated on.
#[derive(Debug)]
pub struct CCSDGradInfo {
    /// MO coefficients, `(nao, nmo)`.
    pub mo_coeff: Tsr,
    /// Orbital energies, `(nmo, )`.
    pub mo_energy: Tsr,
    pub nocc: usize,
}

impl CCSDGradInfo {
    pub fn nao(&self) -> usize {
        self.mo_coeff.shape()[0]
    }

    pub fn nmo(&self) -> usize {
        self.mo_coeff.shape()[1]
    }

    pub fn nocc(&self) -> usize {
        self.nocc
    }

    pub fn nvir(&self) -> usize {
        self.nmo() - self.nocc()
    }

    /// Reference whose occupied count is the leading dimension of `t1`.
    ///
    /// Nuclear charges do not enter, so charged molecules are handled.
    pub fn from_amplitudes(mo_coeff: Tsr, mo_energy: Tsr, amps: &CCAmplitudes) -> Result<Self> {
        ensure!(amps.t1.shape().len() == 2, "t1 must be a matrix, got shape {:?}", amps.t1.shape());
        let info = Self { mo_coeff, mo_energy, nocc: amps.t1.shape()[0] };
        info.check()?;
        ensure!(
            amps.t1.shape()[1] == info.nvir(),
            "t1 shape {:?} disagrees with {} orbitals",
            amps.t1.shape(),
            info.nmo()
        );
        Ok(info)
    }

    /// Occupation numbers of the closed-shell reference (2 for occupied, 0 for virtual).
    pub fn mo_occ(&self) -> Tsr {
        let mut mo_occ = self.mo_energy.zeros_like();
        mo_occ.i_mut(..self.nocc).fill(2.0);
        mo_occ
    }

    pub(crate) fn check(&self) -> Result<()> {
        ensure!(self.mo_coeff.shape().len() == 2, "mo_coeff must be a matrix, got shape {:?}", self.mo_coeff.shape());
        ensure!(self.mo_energy.shape() == &[self.nmo()], "mo_energy shape {:?} disagrees with nmo", self.mo_energy.shape());
        ensure!(self.nocc <= self.nmo(), "nocc {} exceeds nmo {}", self.nocc, self.nmo());
        Ok(())
    }
}

/* #endregion */

/* #region cluster amplitudes and multipliers */

/// Converged CCSD amplitudes and lambda multipliers.
///
/// `t2[i,j,a,b] == t2[j,i,b,a]`, likewise for `l2`.
#[derive(Debug)]
pub struct CCAmplitudes {
    pub t1: Tsr,
    pub t2: Tsr,
    pub l1: Tsr,
    pub l2: Tsr,
}

/* #endregion */

/* #region integrals and densities in MO basis */

/// MO electron repulsion integrals in chemist's notation.
///
/// `ovvv` is packed over its last virtual pair, `vvvv` over both pairs.
pub struct CCERIs {
    pub fock: Tsr,
    pub oooo: BlockTensor,
    pub ooov: BlockTensor,
    pub ovoo: BlockTensor,
    pub oovv: BlockTensor,
    pub ovov: BlockTensor,
    pub ovvv: BlockTensor,
    pub vvvv: BlockTensor,
}

impl CCERIs {
    pub(crate) fn check(&self, nocc: usize, nvir: usize) -> Result<()> {
        let (o, v, vp) = (nocc, nvir, nvir * (nvir + 1) / 2);
        let nmo = o + v;
        ensure!(self.fock.shape() == &[nmo, nmo], "fock shape {:?}, expected [{nmo}, {nmo}]", self.fock.shape());
        let expected = [
            ("oooo", &self.oooo, vec![o, o, o, o]),
            ("ooov", &self.ooov, vec![o, o, o, v]),
            ("ovoo", &self.ovoo, vec![o, v, o, o]),
            ("oovv", &self.oovv, vec![o, o, v, v]),
            ("ovov", &self.ovov, vec![o, v, o, v]),
            ("ovvv", &self.ovvv, vec![o, v, vp]),
            ("vvvv", &self.vvvv, vec![vp, vp]),
        ];
        for (name, blk, shape) in expected {
            ensure!(blk.shape() == shape, "eris.{name} has shape {:?}, expected {shape:?}", blk.shape());
        }
        Ok(())
    }
}

/// Two-particle density blocks of CCSD.
///
/// `dvvvv` is packed over both virtual pairs.
#[derive(Clone)]
pub struct CCDensity2 {
    pub dovov: BlockTensor,
    pub dvvvv: BlockTensor,
    pub doooo: BlockTensor,
    pub doovv: BlockTensor,
    pub dovvo: BlockTensor,
    pub dovvv: BlockTensor,
    pub dooov: BlockTensor,
}

impl CCDensity2 {
    pub(crate) fn check(&self, nocc: usize, nvir: usize) -> Result<()> {
        let (o, v, vp) = (nocc, nvir, nvir * (nvir + 1) / 2);
        let expected = [
            ("dovov", &self.dovov, vec![o, v, o, v]),
            ("dvvvv", &self.dvvvv, vec![vp, vp]),
            ("doooo", &self.doooo, vec![o, o, o, o]),
            ("doovv", &self.doovv, vec![o, o, v, v]),
            ("dovvo", &self.dovvo, vec![o, v, v, o]),
            ("dovvv", &self.dovvv, vec![o, v, v, v]),
            ("dooov", &self.dooov, vec![o, o, o, v]),
        ];
        for (name, blk, shape) in expected {
            ensure!(blk.shape() == shape, "{name} has shape {:?}, expected {shape:?}", blk.shape());
        }
        Ok(())
    }
}

/* #endregion */

/* #region IX intermediates */

/// Reduced intermediates of the CCSD gradient.
///
/// `i_oo` and `i_vv` are not symmetric in general.
#[derive(Debug, Clone)]
pub struct IXIntermediates {
    pub i_oo: Tsr,
    pub i_vv: Tsr,
    pub i_vo: Tsr,
    pub x_vo: Tsr,
}

impl IXIntermediates {
    pub fn zeros(nocc: usize, nvir: usize, device: &DeviceTsr) -> Self {
        Self {
            i_oo: rt::zeros(([nocc, nocc], device)),
            i_vv: rt::zeros(([nvir, nvir], device)),
            i_vo: rt::zeros(([nvir, nocc], device)),
            x_vo: rt::zeros(([nvir, nocc], device)),
        }
    }

    /// Flip signs of the accumulated values, then fold `i_vo` into `x_vo`.
    pub fn finalize(mut self) -> Self {
        self.i_oo *= -1.0;
        self.i_vv *= -1.0;
        self.i_vo *= -1.0;
        self.x_vo += &self.i_vo;
        self
    }
}

/* #endregion */

/* #region gradient flags and results */

/// Frozen-orbital request; neither form is supported by the gradient.
#[derive(Debug, Clone, PartialEq)]
pub enum Frozen {
    Count(usize),
    List(Vec<usize>),
}

#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(default)]
pub struct GradFlags {
    /// Memory available for calculation (in MB), including what the process already holds.
    pub max_memory: f64,

    /// Atoms to evaluate; all atoms if `None`.
    pub atmlst: Option<Vec<usize>>,

    /// Frozen orbitals; any value is rejected.
    pub frozen: Option<Frozen>,

    /// Force the block size of every pass (testing and tuning).
    pub blksize: Option<usize>,

    /// Force the column chunk width of scratch scatter-writes.
    pub iobuflen: Option<usize>,

    /// Maximum CPHF iterations.
    pub cphf_max_cycle: usize,

    /// CPHF convergence threshold on the update norm, for solvers built from these flags.
    pub cphf_conv_tol: f64,

    /// Parent directory for scratch files; system temp directory if `None`.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for GradFlags {
    fn default() -> Self {
        Self {
            max_memory: 2000.0,
            atmlst: None,
            frozen: None,
            blksize: None,
            iobuflen: None,
            cphf_max_cycle: 30,
            cphf_conv_tol: 1.0e-9,
            scratch_dir: None,
        }
    }
}

/// Output of the CCSD gradient kernel.
#[derive(Debug)]
pub struct CCSDGradResults {
    /// Atoms the rows of `de` refer to.
    pub atmlst: Vec<usize>,
    /// Electronic gradient, `(natm, 3)`.
    pub de: Tsr,
    /// Nuclear repulsion gradient for the same atoms, `(natm, 3)`.
    pub de_nuc: Tsr,
    pub cphf_converged: bool,
    pub cphf_niter: usize,
}

impl CCSDGradResults {
    pub fn de_total(&self) -> Tsr {
        &self.de + &self.de_nuc
    }
}

/* #endregion */
