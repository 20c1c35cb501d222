//! Reduced density matrices of CCSD handed to the gradient.

use crate::prelude::*;
use std::path::{Path, PathBuf};

/// One- and two-particle density intermediates built from amplitudes and multipliers.
pub trait CCDensityProvider {
    /// `(doo, dvv)` blocks, `(nocc, nocc)` and `(nvir, nvir)`.
    fn gamma1(&self, amps: &CCAmplitudes, max_memory: f64) -> Result<(Tsr, Tsr)>;

    /// Two-particle blocks; large blocks may be written under `scratch` and returned on disk.
    fn gamma2(&self, amps: &CCAmplitudes, scratch: &ScratchStore, max_memory: f64) -> Result<CCDensity2>;
}

/// Densities computed elsewhere, either held in memory or read from a directory of `.npy` files.
///
/// The directory layout is `doo.npy`, `dvv.npy` and one file per two-particle block
/// (`dovov.npy`, `dvvvv.npy`, ...). Two-particle blocks are never loaded as a whole.
pub enum PrecomputedDensity {
    InCore { doo: Tsr, dvv: Tsr, d2: CCDensity2 },
    NpyDir(PathBuf),
}

const D2_NAMES: [&str; 7] = ["dovov", "dvvvv", "doooo", "doovv", "dovvo", "dovvv", "dooov"];

impl PrecomputedDensity {
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        ensure!(dir.is_dir(), "density directory {} does not exist", dir.display());
        for name in ["doo", "dvv"].iter().chain(D2_NAMES.iter()) {
            let path = dir.join(format!("{name}.npy"));
            ensure!(path.is_file(), "missing density block {}", path.display());
        }
        Ok(Self::NpyDir(dir.to_path_buf()))
    }
}

fn amps_dims(amps: &CCAmplitudes) -> (usize, usize) {
    (amps.t1.shape()[0], amps.t1.shape()[1])
}

impl CCDensityProvider for PrecomputedDensity {
    fn gamma1(&self, amps: &CCAmplitudes, _max_memory: f64) -> Result<(Tsr, Tsr)> {
        let (nocc, nvir) = amps_dims(amps);
        let (doo, dvv) = match self {
            PrecomputedDensity::InCore { doo, dvv, .. } => (doo.to_owned(), dvv.to_owned()),
            PrecomputedDensity::NpyDir(dir) => {
                let device = amps.t1.device().clone();
                (util::tensor_from_npy(dir.join("doo.npy"), &device)?, util::tensor_from_npy(dir.join("dvv.npy"), &device)?)
            },
        };
        ensure!(doo.shape() == &[nocc, nocc], "doo shape {:?}, expected [{nocc}, {nocc}]", doo.shape());
        ensure!(dvv.shape() == &[nvir, nvir], "dvv shape {:?}, expected [{nvir}, {nvir}]", dvv.shape());
        Ok((doo, dvv))
    }

    fn gamma2(&self, amps: &CCAmplitudes, _scratch: &ScratchStore, _max_memory: f64) -> Result<CCDensity2> {
        let (nocc, nvir) = amps_dims(amps);
        let d2 = match self {
            PrecomputedDensity::InCore { d2, .. } => d2.clone(),
            PrecomputedDensity::NpyDir(dir) => {
                let [dovov, dvvvv, doooo, doovv, dovvo, dovvv, dooov] =
                    D2_NAMES.map(|name| BlockTensor::open_npy(dir.join(format!("{name}.npy"))));
                CCDensity2 {
                    dovov: dovov?,
                    dvvvv: dvvvv?,
                    doooo: doooo?,
                    doovv: doovv?,
                    dovvo: dovvo?,
                    dovvv: dovvv?,
                    dooov: dooov?,
                }
            },
        };
        d2.check(nocc, nvir)?;
        Ok(d2)
    }
}
