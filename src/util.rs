use crate::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Obtain integrals in row-major layout (reverse of libcint's native column-major).
///
/// # Usage
///
/// ```norun
/// let tsr = intor_row_major(&cint_data, "int1e_ipovlp");
/// ```
pub fn intor_row_major(cint_data: &CInt, intor: &str) -> Tsr {
    // use up all rayon available threads for tensor operations
    let device = DeviceTsr::default();

    // intor, "s1", full_shls_slice
    let (out, shape) = cint_data.integrate_row_major(intor, None, None).into();

    // row-major by transposition of col-major shape
    rt::asarray((out, shape.c(), &device))
}

/// Build a c-contiguous tensor from a flat row-major buffer.
pub fn asarray_c(data: Vec<f64>, shape: &[usize], device: &DeviceTsr) -> Tsr {
    assert_eq!(data.len(), shape.iter().product::<usize>(), "buffer length does not match shape {shape:?}");
    rt::asarray((data, shape.to_vec().c(), device))
}

/// Flatten a tensor (any layout) into a row-major `Vec`.
pub fn to_c_vec(tsr: &TsrView) -> Vec<f64> {
    let size = tsr.size();
    if size == 0 {
        return vec![];
    }
    tsr.reshape([size]).to_vec()
}

/// Permute axes into a freshly allocated c-contiguous tensor.
pub fn transpose_c<const N: usize>(tsr: &TsrView, axes: [isize; N]) -> Tsr {
    let permuted = tsr.transpose(axes);
    let shape = permuted.shape().to_vec();
    asarray_c(to_c_vec(&permuted), &shape, tsr.device())
}

/// Read a c-contiguous numpy array from disk.
pub fn tensor_from_npy(path: impl AsRef<Path>, device: &DeviceTsr) -> Result<Tsr> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let npy = npyz::NpyFile::new(BufReader::new(file))?;
    ensure!(npy.order() == npyz::Order::C, "{} is stored in fortran order", path.display());
    let shape = npy.shape().iter().map(|&x| x as usize).collect::<Vec<usize>>();
    let data = npy.into_vec::<f64>()?;
    Ok(asarray_c(data, &shape, device))
}

/// Read the shape recorded in a numpy header without touching the data.
pub fn npy_shape(path: impl AsRef<Path>) -> Result<Vec<usize>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let npy = npyz::NpyFile::new(BufReader::new(file))?;
    Ok(npy.shape().iter().map(|&x| x as usize).collect())
}
