//! Runtime-loaded cuDNN function pointers via dlopen.
//!
//! This avoids a compile-time link against a specific cuDNN version — any
//! install providing `libcudnn.so` works, and hosts without cuDNN can still
//! use every non-convolution operation.

use std::ffi::{c_int, c_void};

use libloading::Library;

use crate::context::BackendError;

// ---------------------------------------------------------------------------
// Status codes and enum values
// ---------------------------------------------------------------------------

pub type CudnnStatus = c_int;
pub const CUDNN_STATUS_SUCCESS: CudnnStatus = 0;

pub const CUDNN_TENSOR_NCHW: c_int = 0;
pub const CUDNN_DATA_FLOAT: c_int = 0;
pub const CUDNN_CROSS_CORRELATION: c_int = 1;

// Opaque handles
pub type CudnnHandle = *mut c_void;
pub type TensorDescRaw = *mut c_void;
pub type FilterDescRaw = *mut c_void;
pub type ConvDescRaw = *mut c_void;

// ---------------------------------------------------------------------------
// Algorithm-heuristics result structs (layout per cudnn.h, v8)
// ---------------------------------------------------------------------------

/// cudnnConvolutionFwdAlgoPerf_t. The Bwd filter/data perf structs share this
/// exact layout, differing only in the algo enum they carry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ConvAlgoPerf {
    pub algo: c_int,
    pub status: CudnnStatus,
    pub time: f32,
    pub memory: usize,
    pub determinism: c_int,
    pub math_type: c_int,
    pub reserved: [c_int; 3],
}

impl Default for ConvAlgoPerf {
    fn default() -> Self {
        // SAFETY: all-zero bytes are a valid value for this plain-C struct.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// cuDNN API function signatures
// ---------------------------------------------------------------------------

type FnCreate = unsafe extern "C" fn(*mut CudnnHandle) -> CudnnStatus;
type FnDestroy = unsafe extern "C" fn(CudnnHandle) -> CudnnStatus;

type FnCreateTensorDesc = unsafe extern "C" fn(*mut TensorDescRaw) -> CudnnStatus;
type FnSetTensor4dDesc = unsafe extern "C" fn(
    TensorDescRaw,
    c_int, // format
    c_int, // data type
    c_int, c_int, c_int, c_int, // n, c, h, w
) -> CudnnStatus;
type FnDestroyTensorDesc = unsafe extern "C" fn(TensorDescRaw) -> CudnnStatus;

type FnCreateFilterDesc = unsafe extern "C" fn(*mut FilterDescRaw) -> CudnnStatus;
type FnSetFilter4dDesc = unsafe extern "C" fn(
    FilterDescRaw,
    c_int, // data type
    c_int, // format
    c_int, c_int, c_int, c_int, // k, c, h, w
) -> CudnnStatus;
type FnDestroyFilterDesc = unsafe extern "C" fn(FilterDescRaw) -> CudnnStatus;

type FnCreateConvDesc = unsafe extern "C" fn(*mut ConvDescRaw) -> CudnnStatus;
type FnSetConv2dDesc = unsafe extern "C" fn(
    ConvDescRaw,
    c_int, c_int, // pad h, w
    c_int, c_int, // stride h, w
    c_int, c_int, // dilation h, w
    c_int, // mode
    c_int, // compute type
) -> CudnnStatus;
type FnDestroyConvDesc = unsafe extern "C" fn(ConvDescRaw) -> CudnnStatus;

type FnGetConv2dForwardOutputDim = unsafe extern "C" fn(
    ConvDescRaw,
    TensorDescRaw,
    FilterDescRaw,
    *mut c_int, *mut c_int, *mut c_int, *mut c_int,
) -> CudnnStatus;

type FnGetConvFwdAlgo = unsafe extern "C" fn(
    CudnnHandle,
    TensorDescRaw,
    FilterDescRaw,
    ConvDescRaw,
    TensorDescRaw,
    c_int,
    *mut c_int,
    *mut ConvAlgoPerf,
) -> CudnnStatus;

type FnConvForward = unsafe extern "C" fn(
    CudnnHandle,
    *const c_void, // alpha
    TensorDescRaw, *const c_void, // x
    FilterDescRaw, *const c_void, // w
    ConvDescRaw,
    c_int, // algo
    *mut c_void, usize, // workspace, size
    *const c_void, // beta
    TensorDescRaw, *mut c_void, // y
) -> CudnnStatus;

type FnAddTensor = unsafe extern "C" fn(
    CudnnHandle,
    *const c_void, // alpha
    TensorDescRaw, *const c_void, // a
    *const c_void, // beta
    TensorDescRaw, *mut c_void, // c
) -> CudnnStatus;

type FnGetConvBwdFilterAlgo = unsafe extern "C" fn(
    CudnnHandle,
    TensorDescRaw, // x
    TensorDescRaw, // dy
    ConvDescRaw,
    FilterDescRaw, // dw
    c_int,
    *mut c_int,
    *mut ConvAlgoPerf,
) -> CudnnStatus;

type FnConvBackwardFilter = unsafe extern "C" fn(
    CudnnHandle,
    *const c_void, // alpha
    TensorDescRaw, *const c_void, // x
    TensorDescRaw, *const c_void, // dy
    ConvDescRaw,
    c_int, // algo
    *mut c_void, usize, // workspace, size
    *const c_void, // beta
    FilterDescRaw, *mut c_void, // dw
) -> CudnnStatus;

type FnGetConvBwdDataAlgo = unsafe extern "C" fn(
    CudnnHandle,
    FilterDescRaw, // w
    TensorDescRaw, // dy
    ConvDescRaw,
    TensorDescRaw, // dx
    c_int,
    *mut c_int,
    *mut ConvAlgoPerf,
) -> CudnnStatus;

type FnConvBackwardData = unsafe extern "C" fn(
    CudnnHandle,
    *const c_void, // alpha
    FilterDescRaw, *const c_void, // w
    TensorDescRaw, *const c_void, // dy
    ConvDescRaw,
    c_int, // algo
    *mut c_void, usize, // workspace, size
    *const c_void, // beta
    TensorDescRaw, *mut c_void, // dx
) -> CudnnStatus;

type FnConvBackwardBias = unsafe extern "C" fn(
    CudnnHandle,
    *const c_void, // alpha
    TensorDescRaw, *const c_void, // dy
    *const c_void, // beta
    TensorDescRaw, *mut c_void, // db
) -> CudnnStatus;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct CudnnApi {
    _lib: Library,
    pub create: FnCreate,
    pub destroy: FnDestroy,
    pub create_tensor_descriptor: FnCreateTensorDesc,
    pub set_tensor4d_descriptor: FnSetTensor4dDesc,
    pub destroy_tensor_descriptor: FnDestroyTensorDesc,
    pub create_filter_descriptor: FnCreateFilterDesc,
    pub set_filter4d_descriptor: FnSetFilter4dDesc,
    pub destroy_filter_descriptor: FnDestroyFilterDesc,
    pub create_convolution_descriptor: FnCreateConvDesc,
    pub set_convolution2d_descriptor: FnSetConv2dDesc,
    pub destroy_convolution_descriptor: FnDestroyConvDesc,
    pub get_convolution2d_forward_output_dim: FnGetConv2dForwardOutputDim,
    pub get_convolution_forward_algorithm: FnGetConvFwdAlgo,
    pub convolution_forward: FnConvForward,
    pub add_tensor: FnAddTensor,
    pub get_convolution_backward_filter_algorithm: FnGetConvBwdFilterAlgo,
    pub convolution_backward_filter: FnConvBackwardFilter,
    pub get_convolution_backward_data_algorithm: FnGetConvBwdDataAlgo,
    pub convolution_backward_data: FnConvBackwardData,
    pub convolution_backward_bias: FnConvBackwardBias,
}

// Safety: the loaded function pointers are process-global; cuDNN calls are
// issued from the single host control thread that owns the handler.
unsafe impl Send for CudnnApi {}
unsafe impl Sync for CudnnApi {}

const LIBRARY_CANDIDATES: &[&str] = &[
    "libcudnn.so.9",
    "libcudnn.so.8",
    "libcudnn.so",
    "cudnn64_9.dll",
    "cudnn64_8.dll",
];

fn sym<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T, BackendError> {
    // SAFETY: symbol types are expected to match the cuDNN v8 API.
    unsafe { lib.get::<T>(name) }.map(|s| *s).map_err(|e| {
        BackendError::CudnnUnavailable(format!(
            "missing symbol {}: {}",
            String::from_utf8_lossy(&name[..name.len() - 1]),
            e
        ))
    })
}

impl CudnnApi {
    /// Load libcudnn and resolve every entry point this backend uses.
    pub fn load() -> Result<Self, BackendError> {
        let lib = LIBRARY_CANDIDATES
            .iter()
            .find_map(|name| {
                // SAFETY: dynamic library probing only.
                unsafe { Library::new(name) }.ok()
            })
            .ok_or_else(|| {
                BackendError::CudnnUnavailable(format!(
                    "no cuDNN library found (tried {})",
                    LIBRARY_CANDIDATES.join(", ")
                ))
            })?;
        let api = CudnnApi {
            create: sym(&lib, b"cudnnCreate\0")?,
            destroy: sym(&lib, b"cudnnDestroy\0")?,
            create_tensor_descriptor: sym(&lib, b"cudnnCreateTensorDescriptor\0")?,
            set_tensor4d_descriptor: sym(&lib, b"cudnnSetTensor4dDescriptor\0")?,
            destroy_tensor_descriptor: sym(&lib, b"cudnnDestroyTensorDescriptor\0")?,
            create_filter_descriptor: sym(&lib, b"cudnnCreateFilterDescriptor\0")?,
            set_filter4d_descriptor: sym(&lib, b"cudnnSetFilter4dDescriptor\0")?,
            destroy_filter_descriptor: sym(&lib, b"cudnnDestroyFilterDescriptor\0")?,
            create_convolution_descriptor: sym(&lib, b"cudnnCreateConvolutionDescriptor\0")?,
            set_convolution2d_descriptor: sym(&lib, b"cudnnSetConvolution2dDescriptor\0")?,
            destroy_convolution_descriptor: sym(&lib, b"cudnnDestroyConvolutionDescriptor\0")?,
            get_convolution2d_forward_output_dim: sym(
                &lib,
                b"cudnnGetConvolution2dForwardOutputDim\0",
            )?,
            get_convolution_forward_algorithm: sym(
                &lib,
                b"cudnnGetConvolutionForwardAlgorithm_v7\0",
            )?,
            convolution_forward: sym(&lib, b"cudnnConvolutionForward\0")?,
            add_tensor: sym(&lib, b"cudnnAddTensor\0")?,
            get_convolution_backward_filter_algorithm: sym(
                &lib,
                b"cudnnGetConvolutionBackwardFilterAlgorithm_v7\0",
            )?,
            convolution_backward_filter: sym(&lib, b"cudnnConvolutionBackwardFilter\0")?,
            get_convolution_backward_data_algorithm: sym(
                &lib,
                b"cudnnGetConvolutionBackwardDataAlgorithm_v7\0",
            )?,
            convolution_backward_data: sym(&lib, b"cudnnConvolutionBackwardData\0")?,
            convolution_backward_bias: sym(&lib, b"cudnnConvolutionBackwardBias\0")?,
            _lib: lib,
        };
        Ok(api)
    }
}

/// Check a cuDNN API return code.
pub fn check(status: CudnnStatus, call: &'static str) -> Result<(), BackendError> {
    if status == CUDNN_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::Cudnn { call, code: status })
    }
}
