#![allow(unused)]

/* #region for API callers */

pub use crate::block_tensor::BlockTensor;
pub use crate::density::{CCDensityProvider, PrecomputedDensity};
pub use crate::grad::ccsd_grad_kernel;
pub use crate::integrals::{CIntGradIntegrals, GradIntegrals};
pub use crate::response::{CPHFOutput, CPHFSolver, DIISCPHFSolver};
pub use crate::scratch::ScratchStore;
pub use crate::structs::{
    CCAmplitudes, CCDensity2, CCERIs, CCSDGradInfo, CCSDGradResults, Frozen, GradFlags, GradFlagsBuilder,
    IXIntermediates,
};

/* #endregion */

/* #region for developers */

// RSTSR backend selection
#[cfg(not(feature = "use_openblas"))]
pub type DeviceTsr = DeviceFaer;
#[cfg(feature = "use_openblas")]
pub type DeviceTsr = DeviceOpenBLAS;

pub(crate) use anyhow::{Context, Result, bail, ensure};
pub(crate) use libcint::prelude::*;
pub(crate) use log::{debug, info, warn};
pub(crate) use rayon::prelude::*;
pub(crate) use rstsr::prelude::*;

pub(crate) use crate::*;

pub type Tsr<D = IxD> = Tensor<f64, DeviceTsr, D>;
pub type TsrView<'a, D = IxD> = TensorView<'a, f64, DeviceTsr, D>;
pub type TsrMut<'a, D = IxD> = TensorMut<'a, f64, DeviceTsr, D>;

/* #endregion */
