//! cuDNN convolution bridge.
//!
//! Descriptors are transient per-call metadata and are modeled as RAII
//! guards: created on entry, destroyed on every exit path, including early
//! error returns. Tensor layout is fixed to NCHW / f32 / cross-correlation
//! with dilation 1, matching the operation contract.

pub mod ffi;

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use cudarc::driver::CudaDevice;

use self::ffi::{check, ConvAlgoPerf, CudnnApi};

use crate::buffer::DeviceBuffer;
use crate::context::BackendError;

/// Upper bound on per-call scratch memory for convolution algorithms.
///
/// The conservative default admits only algorithms that run without any
/// workspace; raising the limit lets cuDNN pick faster algorithms at the
/// cost of a transient device allocation per call.
pub const DEFAULT_WORKSPACE_LIMIT: usize = 0;

const REQUESTED_ALGOS: c_int = 8;

/// Process-wide cuDNN library handle, created once per handler.
pub struct CudnnContext {
    api: CudnnApi,
    // Stored as usize so the context stays Send; cuDNN handles are only ever
    // used from the handler's host control thread.
    handle: usize,
    workspace_limit: usize,
}

impl CudnnContext {
    pub fn new(workspace_limit: usize) -> Result<Self, BackendError> {
        let api = CudnnApi::load()?;
        let mut handle: ffi::CudnnHandle = ptr::null_mut();
        // SAFETY: cudnnCreate initializes the output handle pointer.
        check(unsafe { (api.create)(&mut handle) }, "cudnnCreate")?;
        tracing::debug!(workspace_limit, "cuDNN context created");
        Ok(Self {
            api,
            handle: handle as usize,
            workspace_limit,
        })
    }

    fn handle(&self) -> ffi::CudnnHandle {
        self.handle as ffi::CudnnHandle
    }

    /// Forward 2-D convolution over a batch, then per-channel bias add.
    ///
    /// All four tensors are NCHW; `outputs` must already have the shape
    /// cuDNN computes for this configuration (asserted, as are the bias-size
    /// agreements with the filter and output channel counts).
    pub fn conv2d_forward_batch(
        &self,
        dev: &Arc<CudaDevice>,
        inputs: &DeviceBuffer,
        weights: &DeviceBuffer,
        bias: &DeviceBuffer,
        outputs: &DeviceBuffer,
        pad: usize,
        stride: (usize, usize),
    ) -> Result<(), BackendError> {
        let x_desc = TensorDesc::new_4d(&self.api, dims4(inputs, "conv2d inputs"))?;
        let w_desc = FilterDesc::new_4d(&self.api, dims4(weights, "conv2d weights"))?;
        let b_desc = TensorDesc::new_4d(&self.api, [1, bias.len() as c_int, 1, 1])?;
        let conv_desc = ConvDesc::new_2d(&self.api, pad, stride)?;

        let out_dims = self.forward_output_dim(&conv_desc, &x_desc, &w_desc)?;
        assert_eq!(
            out_dims,
            outputs.shape(),
            "conv2d_forward_batch: cuDNN output shape {:?} != outputs shape {:?}",
            out_dims,
            outputs.shape()
        );
        assert_eq!(
            weights.shape()[0],
            bias.len(),
            "conv2d_forward_batch: bias size {} != filter output channels {}",
            bias.len(),
            weights.shape()[0]
        );
        assert_eq!(
            outputs.shape()[1],
            bias.len(),
            "conv2d_forward_batch: bias size {} != output channels {}",
            bias.len(),
            outputs.shape()[1]
        );

        let y_desc = TensorDesc::new_4d(&self.api, dims4(outputs, "conv2d outputs"))?;

        let (algo, ws_size) = self.pick_algorithm(
            |count, returned, perfs| {
                // SAFETY: descriptors outlive this call; perfs has capacity
                // for `count` entries.
                unsafe {
                    (self.api.get_convolution_forward_algorithm)(
                        self.handle(),
                        x_desc.raw,
                        w_desc.raw,
                        conv_desc.raw,
                        y_desc.raw,
                        count,
                        returned,
                        perfs,
                    )
                }
            },
            "cudnnGetConvolutionForwardAlgorithm_v7",
        )?;
        let workspace = Workspace::alloc(dev, ws_size)?;

        let alpha = 1.0f32;
        let beta = 0.0f32;
        // SAFETY: pointers are valid device allocations matching the
        // descriptors built above.
        check(
            unsafe {
                (self.api.convolution_forward)(
                    self.handle(),
                    scalar(&alpha),
                    x_desc.raw,
                    dptr(inputs),
                    w_desc.raw,
                    dptr(weights),
                    conv_desc.raw,
                    algo,
                    workspace.ptr(),
                    ws_size,
                    scalar(&beta),
                    y_desc.raw,
                    dptr_mut(outputs),
                )
            },
            "cudnnConvolutionForward",
        )?;

        let beta_acc = 1.0f32;
        // SAFETY: bias is (1, C, 1, 1) per b_desc; y accumulates in place.
        check(
            unsafe {
                (self.api.add_tensor)(
                    self.handle(),
                    scalar(&alpha),
                    b_desc.raw,
                    dptr(bias),
                    scalar(&beta_acc),
                    y_desc.raw,
                    dptr_mut(outputs),
                )
            },
            "cudnnAddTensor",
        )
    }

    /// Backward 2-D convolution over a batch: gradients w.r.t. filter
    /// weights, input data, and bias, accumulated into the caller's delta
    /// buffers from the upstream `out_deltas`.
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d_backward_batch(
        &self,
        dev: &Arc<CudaDevice>,
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
        assert_eq!(
            in_deltas.shape(),
            inputs.shape(),
            "conv2d_backward_batch: in_deltas shape {:?} != inputs shape {:?}",
            in_deltas.shape(),
            inputs.shape()
        );
        assert_eq!(
            weight_deltas.shape(),
            weights.shape(),
            "conv2d_backward_batch: weight_deltas shape {:?} != weights shape {:?}",
            weight_deltas.shape(),
            weights.shape()
        );
        assert_eq!(
            bias_deltas.len(),
            bias.len(),
            "conv2d_backward_batch: bias_deltas size {} != bias size {}",
            bias_deltas.len(),
            bias.len()
        );
        assert_eq!(
            out_deltas.shape()[1],
            bias.len(),
            "conv2d_backward_batch: bias size {} != output channels {}",
            bias.len(),
            out_deltas.shape()[1]
        );

        let x_desc = TensorDesc::new_4d(&self.api, dims4(inputs, "conv2d inputs"))?;
        let dx_desc = TensorDesc::new_4d(&self.api, dims4(in_deltas, "conv2d in_deltas"))?;
        let dy_desc = TensorDesc::new_4d(&self.api, dims4(out_deltas, "conv2d out_deltas"))?;
        let w_desc = FilterDesc::new_4d(&self.api, dims4(weights, "conv2d weights"))?;
        let dw_desc = FilterDesc::new_4d(&self.api, dims4(weight_deltas, "conv2d weight_deltas"))?;
        let db_desc = TensorDesc::new_4d(&self.api, [1, bias_deltas.len() as c_int, 1, 1])?;
        let conv_desc = ConvDesc::new_2d(&self.api, pad, stride)?;

        let alpha = 1.0f32;
        // Gradients accumulate into the caller's delta buffers.
        let beta = 1.0f32;

        let (algo, ws_size) = self.pick_algorithm(
            |count, returned, perfs| {
                // SAFETY: descriptors outlive this call.
                unsafe {
                    (self.api.get_convolution_backward_filter_algorithm)(
                        self.handle(),
                        x_desc.raw,
                        dy_desc.raw,
                        conv_desc.raw,
                        dw_desc.raw,
                        count,
                        returned,
                        perfs,
                    )
                }
            },
            "cudnnGetConvolutionBackwardFilterAlgorithm_v7",
        )?;
        let workspace = Workspace::alloc(dev, ws_size)?;
        // SAFETY: pointers match the descriptors built above.
        check(
            unsafe {
                (self.api.convolution_backward_filter)(
                    self.handle(),
                    scalar(&alpha),
                    x_desc.raw,
                    dptr(inputs),
                    dy_desc.raw,
                    dptr(out_deltas),
                    conv_desc.raw,
                    algo,
                    workspace.ptr(),
                    ws_size,
                    scalar(&beta),
                    dw_desc.raw,
                    dptr_mut(weight_deltas),
                )
            },
            "cudnnConvolutionBackwardFilter",
        )?;

        let (algo, ws_size) = self.pick_algorithm(
            |count, returned, perfs| {
                // SAFETY: descriptors outlive this call.
                unsafe {
                    (self.api.get_convolution_backward_data_algorithm)(
                        self.handle(),
                        w_desc.raw,
                        dy_desc.raw,
                        conv_desc.raw,
                        dx_desc.raw,
                        count,
                        returned,
                        perfs,
                    )
                }
            },
            "cudnnGetConvolutionBackwardDataAlgorithm_v7",
        )?;
        let workspace = Workspace::alloc(dev, ws_size)?;
        // SAFETY: pointers match the descriptors built above.
        check(
            unsafe {
                (self.api.convolution_backward_data)(
                    self.handle(),
                    scalar(&alpha),
                    w_desc.raw,
                    dptr(weights),
                    dy_desc.raw,
                    dptr(out_deltas),
                    conv_desc.raw,
                    algo,
                    workspace.ptr(),
                    ws_size,
                    scalar(&beta),
                    dx_desc.raw,
                    dptr_mut(in_deltas),
                )
            },
            "cudnnConvolutionBackwardData",
        )?;

        // SAFETY: db is (1, C, 1, 1) per db_desc.
        check(
            unsafe {
                (self.api.convolution_backward_bias)(
                    self.handle(),
                    scalar(&alpha),
                    dy_desc.raw,
                    dptr(out_deltas),
                    scalar(&beta),
                    db_desc.raw,
                    dptr_mut(bias_deltas),
                )
            },
            "cudnnConvolutionBackwardBias",
        )
    }

    fn forward_output_dim(
        &self,
        conv: &ConvDesc<'_>,
        x: &TensorDesc<'_>,
        w: &FilterDesc<'_>,
    ) -> Result<Vec<usize>, BackendError> {
        let (mut n, mut c, mut h, mut wd): (c_int, c_int, c_int, c_int) = (0, 0, 0, 0);
        // SAFETY: descriptors are live; out-params are plain ints.
        check(
            unsafe {
                (self.api.get_convolution2d_forward_output_dim)(
                    conv.raw, x.raw, w.raw, &mut n, &mut c, &mut h, &mut wd,
                )
            },
            "cudnnGetConvolution2dForwardOutputDim",
        )?;
        Ok(vec![n as usize, c as usize, h as usize, wd as usize])
    }

    /// Run a cuDNN v7 algorithm-heuristics query and pick the fastest
    /// algorithm whose workspace need fits the configured limit.
    fn pick_algorithm<F>(&self, query: F, call: &'static str) -> Result<(c_int, usize), BackendError>
    where
        F: FnOnce(c_int, *mut c_int, *mut ConvAlgoPerf) -> ffi::CudnnStatus,
    {
        let mut perfs = [ConvAlgoPerf::default(); REQUESTED_ALGOS as usize];
        let mut returned: c_int = 0;
        check(
            query(REQUESTED_ALGOS, &mut returned, perfs.as_mut_ptr()),
            call,
        )?;
        // Results come ordered by expected performance.
        perfs
            .iter()
            .take(returned.max(0) as usize)
            .find(|p| p.status == ffi::CUDNN_STATUS_SUCCESS && p.memory <= self.workspace_limit)
            .map(|p| (p.algo, p.memory))
            .ok_or_else(|| {
                BackendError::Unsupported(format!(
                    "{}: no algorithm fits the {}-byte workspace limit",
                    call, self.workspace_limit
                ))
            })
    }
}

impl Drop for CudnnContext {
    fn drop(&mut self) {
        // SAFETY: handle was created by cudnnCreate and is destroyed once.
        let _ = unsafe { (self.api.destroy)(self.handle()) };
    }
}

// ---------------------------------------------------------------------------
// Descriptor guards
// ---------------------------------------------------------------------------

fn dims4(buf: &DeviceBuffer, what: &str) -> [c_int; 4] {
    assert_eq!(buf.rank(), 4, "{} must be rank 4, got {:?}", what, buf.shape());
    let s = buf.shape();
    [s[0] as c_int, s[1] as c_int, s[2] as c_int, s[3] as c_int]
}

fn dptr(buf: &DeviceBuffer) -> *const c_void {
    buf.device_ptr() as usize as *const c_void
}

fn dptr_mut(buf: &DeviceBuffer) -> *mut c_void {
    buf.device_ptr() as usize as *mut c_void
}

fn scalar(v: &f32) -> *const c_void {
    v as *const f32 as *const c_void
}

struct TensorDesc<'a> {
    api: &'a CudnnApi,
    raw: ffi::TensorDescRaw,
}

impl<'a> TensorDesc<'a> {
    fn new_4d(api: &'a CudnnApi, [n, c, h, w]: [c_int; 4]) -> Result<Self, BackendError> {
        let mut raw: ffi::TensorDescRaw = ptr::null_mut();
        // SAFETY: create initializes raw; the guard owns it from here on, so
        // a failing set still destroys the descriptor.
        check(
            unsafe { (api.create_tensor_descriptor)(&mut raw) },
            "cudnnCreateTensorDescriptor",
        )?;
        let desc = Self { api, raw };
        check(
            unsafe {
                (api.set_tensor4d_descriptor)(
                    desc.raw,
                    ffi::CUDNN_TENSOR_NCHW,
                    ffi::CUDNN_DATA_FLOAT,
                    n,
                    c,
                    h,
                    w,
                )
            },
            "cudnnSetTensor4dDescriptor",
        )?;
        Ok(desc)
    }
}

impl Drop for TensorDesc<'_> {
    fn drop(&mut self) {
        // SAFETY: raw was created by cudnnCreateTensorDescriptor.
        let _ = unsafe { (self.api.destroy_tensor_descriptor)(self.raw) };
    }
}

struct FilterDesc<'a> {
    api: &'a CudnnApi,
    raw: ffi::FilterDescRaw,
}

impl<'a> FilterDesc<'a> {
    fn new_4d(api: &'a CudnnApi, [k, c, h, w]: [c_int; 4]) -> Result<Self, BackendError> {
        let mut raw: ffi::FilterDescRaw = ptr::null_mut();
        // SAFETY: as in TensorDesc::new_4d.
        check(
            unsafe { (api.create_filter_descriptor)(&mut raw) },
            "cudnnCreateFilterDescriptor",
        )?;
        let desc = Self { api, raw };
        check(
            unsafe {
                (api.set_filter4d_descriptor)(
                    desc.raw,
                    ffi::CUDNN_DATA_FLOAT,
                    ffi::CUDNN_TENSOR_NCHW,
                    k,
                    c,
                    h,
                    w,
                )
            },
            "cudnnSetFilter4dDescriptor",
        )?;
        Ok(desc)
    }
}

impl Drop for FilterDesc<'_> {
    fn drop(&mut self) {
        // SAFETY: raw was created by cudnnCreateFilterDescriptor.
        let _ = unsafe { (self.api.destroy_filter_descriptor)(self.raw) };
    }
}

struct ConvDesc<'a> {
    api: &'a CudnnApi,
    raw: ffi::ConvDescRaw,
}

impl<'a> ConvDesc<'a> {
    fn new_2d(api: &'a CudnnApi, pad: usize, stride: (usize, usize)) -> Result<Self, BackendError> {
        let mut raw: ffi::ConvDescRaw = ptr::null_mut();
        // SAFETY: as in TensorDesc::new_4d.
        check(
            unsafe { (api.create_convolution_descriptor)(&mut raw) },
            "cudnnCreateConvolutionDescriptor",
        )?;
        let desc = Self { api, raw };
        check(
            unsafe {
                (api.set_convolution2d_descriptor)(
                    desc.raw,
                    pad as c_int,
                    pad as c_int,
                    stride.0 as c_int,
                    stride.1 as c_int,
                    1, // dilation fixed to 1
                    1,
                    ffi::CUDNN_CROSS_CORRELATION,
                    ffi::CUDNN_DATA_FLOAT,
                )
            },
            "cudnnSetConvolution2dDescriptor",
        )?;
        Ok(desc)
    }
}

impl Drop for ConvDesc<'_> {
    fn drop(&mut self) {
        // SAFETY: raw was created by cudnnCreateConvolutionDescriptor.
        let _ = unsafe { (self.api.destroy_convolution_descriptor)(self.raw) };
    }
}

/// Optional per-call algorithm workspace.
struct Workspace {
    buf: Option<cudarc::driver::CudaSlice<u8>>,
}

impl Workspace {
    fn alloc(dev: &Arc<CudaDevice>, size: usize) -> Result<Self, BackendError> {
        let buf = if size > 0 {
            Some(dev.alloc_zeros::<u8>(size).map_err(|e| {
                BackendError::Memory(format!("conv workspace ({} bytes): {}", size, e))
            })?)
        } else {
            None
        };
        Ok(Self { buf })
    }

    fn ptr(&self) -> *mut c_void {
        use cudarc::driver::DevicePtr;
        match &self.buf {
            Some(b) => *b.device_ptr() as usize as *mut c_void,
            None => ptr::null_mut(),
        }
    }
}
