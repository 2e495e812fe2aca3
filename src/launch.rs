//! Kernel module cache and launch-configuration helpers.
//!
//! CUDA C sources embedded in the crate are compiled to PTX via NVRTC on
//! first use and loaded once per handler. The cache is owned by the handler,
//! not process-global.

use std::collections::HashSet;
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaFunction, LaunchConfig};
use parking_lot::Mutex;

use crate::context::BackendError;

/// Registry of PTX modules already compiled and loaded on the device.
pub struct KernelCache {
    loaded: Mutex<HashSet<&'static str>>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self {
            loaded: Mutex::new(HashSet::new()),
        }
    }

    /// Get a kernel function handle, compiling and loading its module if
    /// this cache has not seen it yet.
    pub fn get_or_load(
        &self,
        dev: &Arc<CudaDevice>,
        module_name: &'static str,
        func_name: &str,
        source: &str,
        func_names: &[&'static str],
    ) -> Result<CudaFunction, BackendError> {
        let needs_load = !self.loaded.lock().contains(module_name);
        if needs_load {
            let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| BackendError::PtxCompile {
                module: module_name.to_string(),
                msg: e.to_string(),
            })?;
            dev.load_ptx(ptx, module_name, func_names)
                .map_err(|e| BackendError::ModuleLoad {
                    module: module_name.to_string(),
                    msg: e.to_string(),
                })?;
            self.loaded.lock().insert(module_name);
            tracing::debug!(module = module_name, "compiled and loaded PTX module");
        }
        dev.get_func(module_name, func_name)
            .ok_or_else(|| BackendError::FuncNotFound {
                module: module_name.to_string(),
                func: func_name.to_string(),
            })
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Grid dimensions for a 1-D launch with one thread per flat index.
pub fn grid_1d(n: usize, block_size: usize) -> LaunchConfig {
    let grid = (n + block_size - 1) / block_size;
    LaunchConfig {
        grid_dim: (grid as u32, 1, 1),
        block_dim: (block_size as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// One block per row with a fixed number of threads per block.
pub fn grid_rows(rows: usize, threads: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (rows as u32, 1, 1),
        block_dim: (threads as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}
