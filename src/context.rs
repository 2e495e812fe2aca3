//! CUDA device context management and the backend error taxonomy.
//!
//! Uses `cudarc` for safe CUDA driver API access. Device and library handles
//! are owned by the [`Handler`](crate::Handler) that created them — there is
//! no process-global context state.

use std::sync::Arc;

use cudarc::driver::CudaDevice;

/// Initialize a CUDA device handle for the given GPU index.
///
/// A missing or broken driver is a fatal initialization error; there is no
/// degraded mode.
pub fn init_device(device_idx: usize) -> Result<Arc<CudaDevice>, BackendError> {
    let dev = CudaDevice::new(device_idx)
        .map_err(|e| BackendError::DeviceInit(format!("device {}: {}", device_idx, e)))?;
    tracing::debug!(device = device_idx, "CUDA device initialized");
    Ok(dev)
}

/// Check if any CUDA device is available.
pub fn is_cuda_available() -> bool {
    CudaDevice::new(0).is_ok()
}

/// Number of available CUDA devices.
pub fn device_count() -> usize {
    (0..16).take_while(|&i| CudaDevice::new(i).is_ok()).count()
}

/// Backend errors.
///
/// Contract violations (mismatched operand lengths, convolution shape or
/// bias-size disagreements) are caller programming errors and panic via
/// `assert!` instead of surfacing here.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("CUDA device init failed: {0}")]
    DeviceInit(String),

    #[error("PTX compilation failed for module '{module}': {msg}")]
    PtxCompile { module: String, msg: String },

    #[error("failed to load module '{module}': {msg}")]
    ModuleLoad { module: String, msg: String },

    #[error("function '{func}' not found in module '{module}'")]
    FuncNotFound { module: String, func: String },

    #[error("CUDA kernel launch failed: {0}")]
    Launch(String),

    #[error("CUDA memory error: {0}")]
    Memory(String),

    #[error("cuBLAS call {call} failed: {msg}")]
    Blas { call: &'static str, msg: String },

    #[error("cuDNN call {call} failed with status {code}")]
    Cudnn { call: &'static str, code: i32 },

    #[error("cuDNN unavailable: {0}")]
    CudnnUnavailable(String),

    #[error("shape of destination ({expected:?}) != shape of source ({got:?})")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}
