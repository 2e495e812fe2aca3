//! # synapse-cuda
//!
//! CUDA tensor-operation backend for neural-network execution engines.
//!
//! Provides:
//! - GPU buffer management (allocation, host↔device transfers, views)
//! - Elementwise and activation kernels compiled from CUDA C at runtime
//! - Row-major GEMM/GEMV bridged to cuBLAS
//! - A custom block-synchronized, numerically stable row-wise softmax
//! - 2-D convolution forward/backward bridged to a runtime-loaded cuDNN
//!
//! All operations go through a single [`Handler`] that owns the device and
//! library contexts. Buffers are caller-allocated; operations write results
//! in place into caller-supplied outputs. The element type is fixed to `f32`
//! throughout.

pub mod blas;
pub mod buffer;
pub mod context;
pub mod cudnn;
pub mod handler;
pub mod launch;
pub mod ops;

pub use buffer::DeviceBuffer;
pub use context::{device_count, is_cuda_available, BackendError};
pub use handler::{Handler, HandlerOptions};
