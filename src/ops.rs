//! Kernel dispatch for elementwise, activation, and softmax operations.
//!
//! Each function loads the relevant PTX module (compiled from embedded .cu
//! source on first use), checks the operand contract, and launches the kernel
//! writing in place into the caller-supplied output buffer.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, LaunchAsync};

use crate::buffer::{num_elements, DeviceBuffer};
use crate::context::BackendError;
use crate::launch::{grid_1d, grid_rows, KernelCache};

const ELEMENTWISE_CU: &str = include_str!("kernels/elementwise.cu");
const SOFTMAX_CU: &str = include_str!("kernels/softmax.cu");

const ELEMENTWISE_FUNCS: &[&str] = &[
    "mult_tt",
    "mult_add_tt",
    "mult_st",
    "add_tt",
    "add_st",
    "subtract_tt",
    "divide_tt",
    "clip_t",
    "log_t",
    "sigmoid_t",
    "sigmoid_deriv_t",
    "tanh_t",
    "tanh_deriv_t",
    "rel_t",
    "rel_deriv_t",
    "bcast_features_t",
    "binarize_v",
    "index_m_by_v",
    "fill_t",
    "mv_add",
    "mv_mult",
    "mv_div",
];
const SOFTMAX_FUNCS: &[&str] = &["softmax_m"];

const BLOCK_SIZE: usize = 256;

fn launch_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Launch(e.to_string())
}

// ============================================================================
// Binary elementwise ops
// ============================================================================

fn binary_op(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    func_name: &str,
    a: &DeviceBuffer,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(a.len(), out.len(), "{}: a has {} elements, out has {}", func_name, a.len(), out.len());
    assert_eq!(b.len(), out.len(), "{}: b has {} elements, out has {}", func_name, b.len(), out.len());
    let f = cache.get_or_load(dev, "elementwise", func_name, ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = out.len();
    let (av, bv, ov) = (a.view(), b.view(), out.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&av, &bv, &ov, n as u32)) }.map_err(launch_err)
}

pub fn mult_tt(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    a: &DeviceBuffer,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    binary_op(dev, cache, "mult_tt", a, b, out)
}

pub fn mult_add_tt(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    a: &DeviceBuffer,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    binary_op(dev, cache, "mult_add_tt", a, b, out)
}

pub fn add_tt(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    a: &DeviceBuffer,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    binary_op(dev, cache, "add_tt", a, b, out)
}

pub fn subtract_tt(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    a: &DeviceBuffer,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    binary_op(dev, cache, "subtract_tt", a, b, out)
}

pub fn divide_tt(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    a: &DeviceBuffer,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    binary_op(dev, cache, "divide_tt", a, b, out)
}

// ============================================================================
// Scalar-tensor ops
// ============================================================================

fn scalar_op(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    func_name: &str,
    s: f32,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(b.len(), out.len(), "{}: b has {} elements, out has {}", func_name, b.len(), out.len());
    let f = cache.get_or_load(dev, "elementwise", func_name, ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = out.len();
    let (bv, ov) = (b.view(), out.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (s, &bv, &ov, n as u32)) }.map_err(launch_err)
}

pub fn mult_st(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    s: f32,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    scalar_op(dev, cache, "mult_st", s, b, out)
}

pub fn add_st(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    s: f32,
    b: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    scalar_op(dev, cache, "add_st", s, b, out)
}

pub fn clip_t(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    a: &DeviceBuffer,
    lo: f32,
    hi: f32,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(a.len(), out.len(), "clip_t: a has {} elements, out has {}", a.len(), out.len());
    let f = cache.get_or_load(dev, "elementwise", "clip_t", ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = out.len();
    let (av, ov) = (a.view(), out.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&av, lo, hi, &ov, n as u32)) }.map_err(launch_err)
}

pub fn fill(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    out: &DeviceBuffer,
    value: f32,
) -> Result<(), BackendError> {
    let f = cache.get_or_load(dev, "elementwise", "fill_t", ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = out.len();
    let ov = out.view();
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&ov, value, n as u32)) }.map_err(launch_err)
}

// ============================================================================
// Activations and derivatives
// ============================================================================

fn unary_op(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    func_name: &str,
    x: &DeviceBuffer,
    y: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(x.len(), y.len(), "{}: x has {} elements, y has {}", func_name, x.len(), y.len());
    let f = cache.get_or_load(dev, "elementwise", func_name, ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = y.len();
    let (xv, yv) = (x.view(), y.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&xv, &yv, n as u32)) }.map_err(launch_err)
}

/// dx[i] = dy[i] * f'(y[i]) — derivative from the forward output.
fn deriv_op(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    func_name: &str,
    y: &DeviceBuffer,
    dy: &DeviceBuffer,
    dx: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(y.len(), dx.len(), "{}: y has {} elements, dx has {}", func_name, y.len(), dx.len());
    assert_eq!(dy.len(), dx.len(), "{}: dy has {} elements, dx has {}", func_name, dy.len(), dx.len());
    let f = cache.get_or_load(dev, "elementwise", func_name, ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = dx.len();
    let (yv, dyv, dxv) = (y.view(), dy.view(), dx.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&yv, &dyv, &dxv, n as u32)) }.map_err(launch_err)
}

pub fn sigmoid(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    x: &DeviceBuffer,
    y: &DeviceBuffer,
) -> Result<(), BackendError> {
    unary_op(dev, cache, "sigmoid_t", x, y)
}

pub fn sigmoid_deriv(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    y: &DeviceBuffer,
    dy: &DeviceBuffer,
    dx: &DeviceBuffer,
) -> Result<(), BackendError> {
    deriv_op(dev, cache, "sigmoid_deriv_t", y, dy, dx)
}

pub fn tanh(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    x: &DeviceBuffer,
    y: &DeviceBuffer,
) -> Result<(), BackendError> {
    unary_op(dev, cache, "tanh_t", x, y)
}

pub fn tanh_deriv(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    y: &DeviceBuffer,
    dy: &DeviceBuffer,
    dx: &DeviceBuffer,
) -> Result<(), BackendError> {
    deriv_op(dev, cache, "tanh_deriv_t", y, dy, dx)
}

pub fn rel(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    x: &DeviceBuffer,
    y: &DeviceBuffer,
) -> Result<(), BackendError> {
    unary_op(dev, cache, "rel_t", x, y)
}

pub fn rel_deriv(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    y: &DeviceBuffer,
    dy: &DeviceBuffer,
    dx: &DeviceBuffer,
) -> Result<(), BackendError> {
    deriv_op(dev, cache, "rel_deriv_t", y, dy, dx)
}

pub fn log_t(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    a: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    unary_op(dev, cache, "log_t", a, out)
}

// ============================================================================
// Structured elementwise ops
// ============================================================================

/// Replicate each element of rank-3 `a` (trailing dim 1) across the trailing
/// feature dimensions of `out`.
pub fn broadcast_features_t(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    a: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(a.rank(), 3, "broadcast_features_t: a must be rank 3, got {:?}", a.shape());
    assert_eq!(a.shape()[2], 1, "broadcast_features_t: a's trailing dim must be 1, got {:?}", a.shape());
    assert!(out.rank() > 2, "broadcast_features_t: out must have rank > 2, got {:?}", out.shape());
    let bsize = num_elements(&out.shape()[2..]);
    assert_eq!(a.len() * bsize, out.len(), "broadcast_features_t: {:?} does not broadcast to {:?}", a.shape(), out.shape());
    let f = cache.get_or_load(dev, "elementwise", "bcast_features_t", ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = out.len();
    let (av, ov) = (a.view(), out.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&av, &ov, bsize as u32, n as u32)) }
        .map_err(launch_err)
}

/// One-hot encode the index vector `v` into the (rows, cols) matrix `out`.
pub fn binarize_v(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    v: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(out.rank(), 2, "binarize_v: out must be a matrix, got {:?}", out.shape());
    assert_eq!(v.len(), out.rows(), "binarize_v: v has {} entries for {} rows", v.len(), out.rows());
    let f = cache.get_or_load(dev, "elementwise", "binarize_v", ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = out.len();
    let (vv, ov) = (v.view(), out.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&vv, &ov, out.cols() as u32, n as u32)) }
        .map_err(launch_err)
}

/// Gather one element per row: out[row] = m[row, v[row]].
pub fn index_m_by_v(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    m: &DeviceBuffer,
    v: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(m.rank(), 2, "index_m_by_v: m must be a matrix, got {:?}", m.shape());
    assert_eq!(v.len(), m.rows(), "index_m_by_v: v has {} entries for {} rows", v.len(), m.rows());
    assert_eq!(out.len(), m.rows(), "index_m_by_v: out has {} entries for {} rows", out.len(), m.rows());
    let f = cache.get_or_load(dev, "elementwise", "index_m_by_v", ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = out.len();
    let (mv, vv, ov) = (m.view(), v.view(), out.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&mv, &vv, &ov, m.cols() as u32, n as u32)) }
        .map_err(launch_err)
}

/// (M, N) matrix op (1, N) row vector broadcast, `func_name` one of the
/// mv_* kernels.
pub fn matvec_op(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    func_name: &str,
    m: &DeviceBuffer,
    v: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(m.rank(), 2, "{}: m must be a matrix, got {:?}", func_name, m.shape());
    assert_eq!(m.len(), out.len(), "{}: m has {} elements, out has {}", func_name, m.len(), out.len());
    assert_eq!(v.len(), m.cols(), "{}: v has {} entries for {} columns", func_name, v.len(), m.cols());
    let f = cache.get_or_load(dev, "elementwise", func_name, ELEMENTWISE_CU, ELEMENTWISE_FUNCS)?;
    let n = out.len();
    let (mv, vv, ov) = (m.view(), v.view(), out.view());
    unsafe { f.launch(grid_1d(n, BLOCK_SIZE), (&mv, &vv, &ov, m.cols() as u32, n as u32)) }
        .map_err(launch_err)
}

// ============================================================================
// Softmax
// ============================================================================

/// Row-wise numerically stable softmax of the (n, k) matrix `m` into `out`.
///
/// One 32-thread block per row with a per-row device scratch float; the
/// two-pass max-then-sum reduction in softmax.cu keeps exp() from
/// overflowing.
pub fn softmax_m(
    dev: &Arc<CudaDevice>,
    cache: &KernelCache,
    m: &DeviceBuffer,
    out: &DeviceBuffer,
) -> Result<(), BackendError> {
    assert_eq!(m.rank(), 2, "softmax_m: m must be a matrix, got {:?}", m.shape());
    assert_eq!(m.len(), out.len(), "softmax_m: m has {} elements, out has {}", m.len(), out.len());
    let (rows, cols) = (m.rows(), m.cols());
    let tmp = dev
        .alloc_zeros::<f32>(rows.max(1))
        .map_err(|e| BackendError::Memory(format!("softmax scratch ({} rows): {}", rows, e)))?;
    let f = cache.get_or_load(dev, "softmax", "softmax_m", SOFTMAX_CU, SOFTMAX_FUNCS)?;
    let (mv, ov) = (m.view(), out.view());
    unsafe {
        f.launch(
            grid_rows(rows, 32),
            (&mv, &tmp, &ov, rows as u32, cols as u32),
        )
    }
    .map_err(launch_err)
}
