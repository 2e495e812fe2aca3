//! The operation facade.
//!
//! A [`Handler`] owns one device context plus the cuBLAS handle, the kernel
//! cache, and (optionally) a cuDNN context, and exposes every backend
//! operation as a method. Outputs are caller-allocated; operations write into
//! them in place. Convolution support is gated at construction: handlers
//! built without it return [`BackendError::CudnnUnavailable`] from the conv
//! methods instead of failing at startup.

use std::sync::Arc;

use cudarc::driver::CudaDevice;

use crate::blas::BlasContext;
use crate::buffer::{self, num_elements, DeviceBuffer};
use crate::context::{init_device, BackendError};
use crate::cudnn::CudnnContext;
use crate::launch::KernelCache;
use crate::ops;

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// GPU index to bind to.
    pub device_index: usize,
    /// Load cuDNN and enable the conv2d methods.
    pub init_cudnn: bool,
    /// Per-call scratch budget for convolution algorithms, in bytes.
    pub conv_workspace_limit: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            device_index: 0,
            init_cudnn: false,
            conv_workspace_limit: crate::cudnn::DEFAULT_WORKSPACE_LIMIT,
        }
    }
}

/// CUDA tensor-operation backend bound to a single device.
pub struct Handler {
    dev: Arc<CudaDevice>,
    blas: BlasContext,
    cudnn: Option<CudnnContext>,
    kernels: KernelCache,
}

impl Handler {
    /// Bind to a device with default options (no cuDNN).
    pub fn new(device_index: usize) -> Result<Self, BackendError> {
        Self::with_options(HandlerOptions {
            device_index,
            ..HandlerOptions::default()
        })
    }

    pub fn with_options(options: HandlerOptions) -> Result<Self, BackendError> {
        let dev = init_device(options.device_index)?;
        let blas = BlasContext::new(Arc::clone(&dev))?;
        let cudnn = if options.init_cudnn {
            Some(CudnnContext::new(options.conv_workspace_limit)?)
        } else {
            None
        };
        tracing::info!(
            device = options.device_index,
            cudnn = cudnn.is_some(),
            "handler initialized"
        );
        Ok(Self {
            dev,
            blas,
            cudnn,
            kernels: KernelCache::new(),
        })
    }

    /// The underlying device handle.
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.dev
    }

    /// Whether the conv2d methods are usable on this handler.
    pub fn has_cudnn(&self) -> bool {
        self.cudnn.is_some()
    }

    fn cudnn(&self) -> Result<&CudnnContext, BackendError> {
        self.cudnn.as_ref().ok_or_else(|| {
            tracing::warn!("conv2d requested on a handler constructed without cuDNN");
            BackendError::CudnnUnavailable(
                "handler was constructed without cuDNN support".to_string(),
            )
        })
    }

    // ------------------------------------------------------------------
    // Buffers and transfers
    // ------------------------------------------------------------------

    /// Allocate an uninitialized-content buffer (physically zero-filled).
    pub fn allocate(&self, shape: &[usize]) -> Result<DeviceBuffer, BackendError> {
        DeviceBuffer::zeros(&self.dev, shape)
    }

    /// Allocate a zero-filled buffer.
    pub fn zeros(&self, shape: &[usize]) -> Result<DeviceBuffer, BackendError> {
        DeviceBuffer::zeros(&self.dev, shape)
    }

    /// Allocate a one-filled buffer.
    pub fn ones(&self, shape: &[usize]) -> Result<DeviceBuffer, BackendError> {
        let buf = DeviceBuffer::zeros(&self.dev, shape)?;
        self.fill(&buf, 1.0)?;
        Ok(buf)
    }

    /// Set every element of `a` to `value`.
    pub fn fill(&self, a: &DeviceBuffer, value: f32) -> Result<(), BackendError> {
        ops::fill(&self.dev, &self.kernels, a, value)
    }

    /// Allocate a buffer holding a copy of the host data.
    pub fn create_from_host(
        &self,
        src: &[f32],
        shape: &[usize],
    ) -> Result<DeviceBuffer, BackendError> {
        DeviceBuffer::from_host(&self.dev, src, shape)
    }

    /// Upload host data into an existing buffer. The source shape must match
    /// the destination shape exactly.
    pub fn set_from_host(
        &self,
        dest: &DeviceBuffer,
        src: &[f32],
        src_shape: &[usize],
    ) -> Result<(), BackendError> {
        if dest.shape() != src_shape {
            return Err(BackendError::ShapeMismatch {
                expected: dest.shape().to_vec(),
                got: src_shape.to_vec(),
            });
        }
        assert_eq!(
            src.len(),
            num_elements(src_shape),
            "set_from_host: {} elements do not fill shape {:?}",
            src.len(),
            src_shape
        );
        dest.upload(src)
    }

    /// Copy a buffer back to the host.
    pub fn get_host_copy(&self, a: &DeviceBuffer) -> Result<Vec<f32>, BackendError> {
        a.to_host()
    }

    /// Device-to-device copy of `dest`'s byte count from `src`.
    pub fn copy_to(&self, dest: &DeviceBuffer, src: &DeviceBuffer) -> Result<(), BackendError> {
        buffer::copy_to(dest, src)
    }

    // ------------------------------------------------------------------
    // BLAS
    // ------------------------------------------------------------------

    /// out = op(a)·op(b), overwriting `out`.
    pub fn dot_mm(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        out: &DeviceBuffer,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<(), BackendError> {
        self.blas.gemm(a, b, out, trans_a, trans_b, 0.0)
    }

    /// out += op(a)·op(b), accumulating into `out`.
    pub fn dot_add_mm(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        out: &DeviceBuffer,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<(), BackendError> {
        self.blas.gemm(a, b, out, trans_a, trans_b, 1.0)
    }

    /// Sum of `a` along `axis`, or the scalar total when `axis` is `None`.
    ///
    /// Supported forms: any tensor with `axis: None` (scalar total), a vector
    /// with `axis: Some(0)` (also the scalar total), and a matrix with axis 0
    /// or 1. Anything else is [`BackendError::Unsupported`].
    pub fn sum_t(
        &self,
        a: &DeviceBuffer,
        axis: Option<usize>,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        match (a.rank(), axis) {
            (_, None) | (1, Some(0)) => self.blas.sum_all(a, out),
            (2, Some(ax @ (0 | 1))) => self.blas.sum_axis(a, ax, out),
            (rank, Some(ax)) => Err(BackendError::Unsupported(format!(
                "sum_t: axis Some({}) on rank-{} tensor",
                ax, rank
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Elementwise
    // ------------------------------------------------------------------

    /// out = a * b
    pub fn mult_tt(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::mult_tt(&self.dev, &self.kernels, a, b, out)
    }

    /// out += a * b
    pub fn mult_add_tt(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::mult_add_tt(&self.dev, &self.kernels, a, b, out)
    }

    /// out = s * a
    pub fn mult_st(&self, s: f32, a: &DeviceBuffer, out: &DeviceBuffer) -> Result<(), BackendError> {
        ops::mult_st(&self.dev, &self.kernels, s, a, out)
    }

    /// out = a + b
    pub fn add_tt(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::add_tt(&self.dev, &self.kernels, a, b, out)
    }

    /// out = s + a
    pub fn add_st(&self, s: f32, a: &DeviceBuffer, out: &DeviceBuffer) -> Result<(), BackendError> {
        ops::add_st(&self.dev, &self.kernels, s, a, out)
    }

    /// out = a - b
    pub fn subtract_tt(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::subtract_tt(&self.dev, &self.kernels, a, b, out)
    }

    /// out = a / b (IEEE semantics; division by zero produces inf/nan)
    pub fn divide_tt(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::divide_tt(&self.dev, &self.kernels, a, b, out)
    }

    /// out = min(max(a, a_min), a_max)
    pub fn clip_t(
        &self,
        a: &DeviceBuffer,
        a_min: f32,
        a_max: f32,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::clip_t(&self.dev, &self.kernels, a, a_min, a_max, out)
    }

    /// out = ln(a)
    pub fn log_t(&self, a: &DeviceBuffer, out: &DeviceBuffer) -> Result<(), BackendError> {
        ops::log_t(&self.dev, &self.kernels, a, out)
    }

    // ------------------------------------------------------------------
    // Broadcast / gather
    // ------------------------------------------------------------------

    /// Replicate a (T, B, 1) tensor across the feature dimensions of `out`.
    pub fn broadcast_features_t(
        &self,
        a: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::broadcast_features_t(&self.dev, &self.kernels, a, out)
    }

    /// One-hot encode index vector `v` into matrix `out`.
    pub fn binarize_v(&self, v: &DeviceBuffer, out: &DeviceBuffer) -> Result<(), BackendError> {
        ops::binarize_v(&self.dev, &self.kernels, v, out)
    }

    /// out[row] = m[row, v[row]]
    pub fn index_m_by_v(
        &self,
        m: &DeviceBuffer,
        v: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::index_m_by_v(&self.dev, &self.kernels, m, v, out)
    }

    /// Add a (1, N) row vector to every row of the (M, N) matrix `m`.
    pub fn add_mv(
        &self,
        m: &DeviceBuffer,
        v: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::matvec_op(&self.dev, &self.kernels, "mv_add", m, v, out)
    }

    /// Multiply every row of `m` by a (1, N) row vector, or fall back to a
    /// plain elementwise product when the shapes match exactly.
    pub fn mult_mv(
        &self,
        m: &DeviceBuffer,
        v: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        if m.shape() == v.shape() {
            return self.mult_tt(m, v, out);
        }
        ops::matvec_op(&self.dev, &self.kernels, "mv_mult", m, v, out)
    }

    /// Divide every row of `m` by a (1, N) row vector.
    pub fn divide_mv(
        &self,
        m: &DeviceBuffer,
        v: &DeviceBuffer,
        out: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::matvec_op(&self.dev, &self.kernels, "mv_div", m, v, out)
    }

    // ------------------------------------------------------------------
    // Activations
    // ------------------------------------------------------------------

    /// y = 1 / (1 + exp(-x))
    pub fn sigmoid(&self, x: &DeviceBuffer, y: &DeviceBuffer) -> Result<(), BackendError> {
        ops::sigmoid(&self.dev, &self.kernels, x, y)
    }

    /// dx = dy * y * (1 - y). The derivative needs only the forward output;
    /// `_x` is accepted for signature symmetry with the forward pass.
    pub fn sigmoid_deriv(
        &self,
        _x: &DeviceBuffer,
        y: &DeviceBuffer,
        dy: &DeviceBuffer,
        dx: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::sigmoid_deriv(&self.dev, &self.kernels, y, dy, dx)
    }

    /// y = tanh(x)
    pub fn tanh(&self, x: &DeviceBuffer, y: &DeviceBuffer) -> Result<(), BackendError> {
        ops::tanh(&self.dev, &self.kernels, x, y)
    }

    /// dx = dy * (1 - y²)
    pub fn tanh_deriv(
        &self,
        _x: &DeviceBuffer,
        y: &DeviceBuffer,
        dy: &DeviceBuffer,
        dx: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::tanh_deriv(&self.dev, &self.kernels, y, dy, dx)
    }

    /// y = max(x, 0)
    pub fn rel(&self, x: &DeviceBuffer, y: &DeviceBuffer) -> Result<(), BackendError> {
        ops::rel(&self.dev, &self.kernels, x, y)
    }

    /// dx = dy where y > 0, else 0
    pub fn rel_deriv(
        &self,
        _x: &DeviceBuffer,
        y: &DeviceBuffer,
        dy: &DeviceBuffer,
        dx: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        ops::rel_deriv(&self.dev, &self.kernels, y, dy, dx)
    }

    /// Row-wise numerically stable softmax of matrix `m` into `out`.
    /// Returns `out` so callers can chain into a consuming op.
    pub fn softmax_m<'a>(
        &self,
        m: &DeviceBuffer,
        out: &'a DeviceBuffer,
    ) -> Result<&'a DeviceBuffer, BackendError> {
        ops::softmax_m(&self.dev, &self.kernels, m, out)?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Convolution
    // ------------------------------------------------------------------

    /// Forward NCHW 2-D convolution (cross-correlation) plus per-channel
    /// bias, batched over the leading dimension.
    pub fn conv2d_forward_batch(
        &self,
        inputs: &DeviceBuffer,
        weights: &DeviceBuffer,
        bias: &DeviceBuffer,
        outputs: &DeviceBuffer,
        pad: usize,
        stride: (usize, usize),
    ) -> Result<(), BackendError> {
        self.cudnn()?
            .conv2d_forward_batch(&self.dev, inputs, weights, bias, outputs, pad, stride)
    }

    /// Backward NCHW 2-D convolution: accumulates filter, input, and bias
    /// gradients from `out_deltas` into the three delta buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d_backward_batch(
        &self,
        out_deltas: &DeviceBuffer,
        inputs: &DeviceBuffer,
        in_deltas: &DeviceBuffer,
        weights: &DeviceBuffer,
        bias: &DeviceBuffer,
        weight_deltas: &DeviceBuffer,
        bias_deltas: &DeviceBuffer,
        pad: usize,
        stride: (usize, usize),
    ) -> Result<(), BackendError> {
        self.cudnn()?.conv2d_backward_batch(
            &self.dev,
            out_deltas,
            inputs,
            in_deltas,
            weights,
            bias,
            weight_deltas,
            bias_deltas,
            pad,
            stride,
        )
    }
}
