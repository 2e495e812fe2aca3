//! Row-major GEMM/GEMV bridge over cuBLAS.
//!
//! cuBLAS is column-major; a row-major matrix is its own transpose viewed
//! column-major, so C = op(A)·op(B) is computed as C^T = op(B)^T·op(A)^T with
//! the operands swapped and the transpose flags passed through unchanged.
//! Axis reductions are delegated to SGEMV against a ones-vector.

use std::sync::Arc;

use cudarc::cublas::{result as cublas, sys, CudaBlas};
use cudarc::driver::CudaDevice;

use crate::buffer::DeviceBuffer;
use crate::context::BackendError;

fn op(trans: bool) -> sys::cublasOperation_t {
    if trans {
        sys::cublasOperation_t::CUBLAS_OP_T
    } else {
        sys::cublasOperation_t::CUBLAS_OP_N
    }
}

fn blas_err(call: &'static str) -> impl FnOnce(cublas::CublasError) -> BackendError {
    move |e| BackendError::Blas {
        call,
        msg: format!("{:?}", e),
    }
}

/// Output dimensions (m, n) and inner dimension k of a row-major
/// C = op(A)·op(B). Panics when the inner dimensions disagree — caller
/// contract violation.
pub(crate) fn gemm_dims(
    a_shape: &[usize],
    b_shape: &[usize],
    trans_a: bool,
    trans_b: bool,
) -> (usize, usize, usize) {
    assert_eq!(a_shape.len(), 2, "dot_mm: a must be a matrix, got {:?}", a_shape);
    assert_eq!(b_shape.len(), 2, "dot_mm: b must be a matrix, got {:?}", b_shape);
    let (m, k) = if trans_a {
        (a_shape[1], a_shape[0])
    } else {
        (a_shape[0], a_shape[1])
    };
    let (kb, n) = if trans_b {
        (b_shape[1], b_shape[0])
    } else {
        (b_shape[0], b_shape[1])
    };
    assert_eq!(k, kb, "dot_mm: inner dimensions differ ({} vs {})", k, kb);
    (m, n, k)
}

/// cuBLAS context handle plus the device it was created on.
pub struct BlasContext {
    blas: CudaBlas,
    dev: Arc<CudaDevice>,
}

impl BlasContext {
    pub fn new(dev: Arc<CudaDevice>) -> Result<Self, BackendError> {
        let blas = CudaBlas::new(Arc::clone(&dev)).map_err(|e| BackendError::Blas {
            call: "cublasCreate_v2",
            msg: format!("{:?}", e),
        })?;
        tracing::debug!("cuBLAS context created");
        Ok(Self { blas, dev })
    }

    fn handle(&self) -> sys::cublasHandle_t {
        *self.blas.handle()
    }

    /// Row-major C = op(A)·op(B) + beta·C, written into `out`.
    ///
    /// beta = 0 overwrites (`dot_mm`), beta = 1 accumulates (`dot_add_mm`).
    pub fn gemm(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        out: &DeviceBuffer,
        trans_a: bool,
        trans_b: bool,
        beta: f32,
    ) -> Result<(), BackendError> {
        let (m, n, k) = gemm_dims(a.shape(), b.shape(), trans_a, trans_b);
        assert_eq!(
            out.shape(),
            &[m, n],
            "dot_mm: out shape {:?} does not match result ({}, {})",
            out.shape(),
            m,
            n
        );
        let alpha = 1.0f32;
        // SAFETY: pointers are valid device allocations sized by the shape
        // asserts above; leading dimensions are the row-major column counts.
        unsafe {
            cublas::sgemm(
                self.handle(),
                op(trans_b),
                op(trans_a),
                n as i32,
                m as i32,
                k as i32,
                &alpha,
                b.device_ptr() as usize as *const f32,
                b.cols() as i32,
                a.device_ptr() as usize as *const f32,
                a.cols() as i32,
                &beta,
                out.device_ptr() as usize as *mut f32,
                n as i32,
            )
        }
        .map_err(blas_err("cublasSgemm_v2"))
    }

    /// Sum of a (rows, cols) matrix along `axis` (0 sums over rows, 1 over
    /// columns), via SGEMV against a ones-vector.
    pub fn sum_axis(
        &self,
        a: &DeviceBuffer,
        axis: usize,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        let (rows, cols) = (a.rows(), a.cols());
        let (expect_out, ones_len, trans) = match axis {
            0 => (cols, rows, false),
            1 => (rows, cols, true),
            _ => unreachable!("sum_axis: axis {} filtered by caller", axis),
        };
        assert_eq!(
            out.len(),
            expect_out,
            "sum_t: out has {} elements for axis {} of {:?}",
            out.len(),
            axis,
            a.shape()
        );
        let ones = self.ones_vector(ones_len)?;
        let alpha = 1.0f32;
        let beta = 0.0f32;
        // Column-major view of row-major (rows, cols) is a (cols, rows)
        // matrix: no-trans SGEMV sums over rows, trans sums over columns.
        // SAFETY: as in gemm; the ones buffer is sized ones_len.
        unsafe {
            cublas::sgemv(
                self.handle(),
                op(trans),
                cols as i32,
                rows as i32,
                &alpha,
                a.device_ptr() as usize as *const f32,
                cols as i32,
                ones.device_ptr() as usize as *const f32,
                1,
                &beta,
                out.device_ptr() as usize as *mut f32,
                1,
            )
        }
        .map_err(blas_err("cublasSgemv_v2"))
    }

    /// Scalar total of all elements, written to the single-element `out`.
    pub fn sum_all(&self, a: &DeviceBuffer, out: &DeviceBuffer) -> Result<(), BackendError> {
        assert_eq!(
            out.len(),
            1,
            "sum_t: axis None needs a scalar out, got {:?}",
            out.shape()
        );
        let len = a.len();
        if len == 0 {
            return Ok(());
        }
        let ones = self.ones_vector(len)?;
        let alpha = 1.0f32;
        let beta = 0.0f32;
        // Flattened a as a column-major (len, 1) matrix; the transposed GEMV
        // is then the dot product against ones.
        // SAFETY: as in sum_axis.
        unsafe {
            cublas::sgemv(
                self.handle(),
                op(true),
                len as i32,
                1,
                &alpha,
                a.device_ptr() as usize as *const f32,
                len as i32,
                ones.device_ptr() as usize as *const f32,
                1,
                &beta,
                out.device_ptr() as usize as *mut f32,
                1,
            )
        }
        .map_err(blas_err("cublasSgemv_v2"))
    }

    fn ones_vector(&self, len: usize) -> Result<DeviceBuffer, BackendError> {
        DeviceBuffer::from_host(&self.dev, &vec![1.0f32; len], &[len])
    }
}
