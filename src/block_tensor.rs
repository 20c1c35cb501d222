//! Integral and density blocks that live either in memory or in a `.npy` file.

use crate::prelude::*;
use crate::scratch::NpyTensor;

/// A read-only tensor accessed by leading-axis rows or second-axis columns.
#[derive(Debug, Clone)]
pub enum BlockTensor {
    InCore(Tsr),
    OnDisk(NpyTensor),
}

impl From<Tsr> for BlockTensor {
    fn from(tsr: Tsr) -> Self {
        BlockTensor::InCore(tsr)
    }
}

impl BlockTensor {
    pub fn open_npy(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        Ok(BlockTensor::OnDisk(NpyTensor::open(path)?))
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            BlockTensor::InCore(tsr) => tsr.shape().to_vec(),
            BlockTensor::OnDisk(dset) => dset.shape.clone(),
        }
    }

    /// Rows `[p0, p1)` of the leading axis.
    pub fn rows(&self, p0: usize, p1: usize) -> Result<Tsr> {
        match self {
            BlockTensor::InCore(tsr) => {
                let nrow = tsr.shape()[0];
                assert!(p0 <= p1 && p1 <= nrow, "rows {p0}..{p1} out of bounds for shape {:?}", tsr.shape());
                Ok(tsr.i(p0..p1).to_owned())
            },
            BlockTensor::OnDisk(dset) => dset.read_rows(p0, p1, &DeviceTsr::default()),
        }
    }

    /// Columns `[c0, c1)` of the second axis over all rows.
    pub fn cols(&self, c0: usize, c1: usize) -> Result<Tsr> {
        match self {
            BlockTensor::InCore(tsr) => {
                let ncol = tsr.shape()[1];
                assert!(c0 <= c1 && c1 <= ncol, "cols {c0}..{c1} out of bounds for shape {:?}", tsr.shape());
                Ok(tsr.i((.., c0..c1)).to_owned())
            },
            BlockTensor::OnDisk(dset) => dset.read_cols(c0, c1, &DeviceTsr::default()),
        }
    }

    pub fn load(&self) -> Result<Tsr> {
        self.rows(0, self.shape()[0])
    }
}
