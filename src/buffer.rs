//! GPU-resident tensor storage.
//!
//! A [`DeviceBuffer`] pairs a reference-counted device allocation with shape
//! metadata. Reshapes and row slices are views: they share the underlying
//! allocation through the `Arc` and never move data. A view must therefore be
//! dropped before (or together with) every other handle to the same
//! allocation — the memory is freed when the last handle goes away.

use std::fmt;
use std::sync::Arc;

use cudarc::driver::{result as driver, sys, CudaDevice, CudaSlice, CudaView, DevicePtr};

use crate::context::BackendError;

/// Element count implied by a shape. The empty shape is a scalar (one
/// element), matching the convention of the host arrays this backend mirrors.
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// A fixed-dtype (`f32`) tensor living in CUDA device memory.
#[derive(Clone)]
pub struct DeviceBuffer {
    pub(crate) data: Arc<CudaSlice<f32>>,
    /// Element offset into `data` (non-zero for row-slice views).
    pub(crate) offset: usize,
    pub(crate) shape: Vec<usize>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("shape", &self.shape)
            .field("offset", &self.offset)
            .finish()
    }
}

impl DeviceBuffer {
    /// Allocate a zero-filled buffer of the given shape.
    pub fn zeros(dev: &Arc<CudaDevice>, shape: &[usize]) -> Result<Self, BackendError> {
        let n = num_elements(shape);
        let slice = dev
            .alloc_zeros::<f32>(n.max(1))
            .map_err(|e| BackendError::Memory(format!("alloc_zeros({} elems): {}", n, e)))?;
        Ok(Self {
            data: Arc::new(slice),
            offset: 0,
            shape: shape.to_vec(),
        })
    }

    /// Allocate and upload host data in one step (H2D).
    pub fn from_host(
        dev: &Arc<CudaDevice>,
        src: &[f32],
        shape: &[usize],
    ) -> Result<Self, BackendError> {
        assert_eq!(
            src.len(),
            num_elements(shape),
            "from_host: {} elements do not fill shape {:?}",
            src.len(),
            shape
        );
        let slice = dev
            .htod_copy(src.to_vec())
            .map_err(|e| BackendError::Memory(format!("htod_copy({} elems): {}", src.len(), e)))?;
        Ok(Self {
            data: Arc::new(slice),
            offset: 0,
            shape: shape.to_vec(),
        })
    }

    /// Blocking upload of host data into this buffer (H2D).
    ///
    /// Length agreement is checked by the handler before calling this.
    pub(crate) fn upload(&self, src: &[f32]) -> Result<(), BackendError> {
        // SAFETY: device pointer is valid for self.len() elements.
        unsafe { driver::memcpy_htod_sync(self.device_ptr(), src) }
            .map_err(|e| BackendError::Memory(format!("memcpy_htod({} elems): {}", src.len(), e)))
    }

    /// Blocking copy of the buffer contents back to the host.
    pub fn to_host(&self) -> Result<Vec<f32>, BackendError> {
        let mut out = vec![0.0f32; self.len()];
        // SAFETY: device pointer is valid for self.len() elements.
        unsafe { driver::memcpy_dtoh_sync(&mut out, self.device_ptr()) }
            .map_err(|e| BackendError::Memory(format!("memcpy_dtoh: {}", e)))?;
        Ok(out)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        num_elements(&self.shape)
    }

    /// Whether this buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes.
    pub fn nbytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }

    /// Tensor shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Tensor rank.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Leading dimension. Panics on scalars.
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Second dimension. Panics below rank 2.
    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    /// A same-memory view with a different shape. The element count must be
    /// unchanged; no data moves.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self, BackendError> {
        if num_elements(shape) != self.len() {
            return Err(BackendError::ShapeMismatch {
                expected: self.shape.clone(),
                got: shape.to_vec(),
            });
        }
        Ok(Self {
            data: Arc::clone(&self.data),
            offset: self.offset,
            shape: shape.to_vec(),
        })
    }

    /// A same-memory view of rows `start..end` along the leading dimension.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        assert!(self.rank() >= 1, "slice_rows: scalar buffer");
        assert!(
            start <= end && end <= self.shape[0],
            "slice_rows: range {}..{} out of bounds for {} rows",
            start,
            end,
            self.shape[0]
        );
        let row_elems = num_elements(&self.shape[1..]);
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Self {
            data: Arc::clone(&self.data),
            offset: self.offset + start * row_elems,
            shape,
        }
    }

    /// View of the underlying slice for kernel launches, honoring the offset.
    pub(crate) fn view(&self) -> CudaView<'_, f32> {
        self.data.slice(self.offset..self.offset + self.len())
    }

    /// Raw device pointer (element offset applied), for library calls.
    pub(crate) fn device_ptr(&self) -> sys::CUdeviceptr {
        *self.data.device_ptr() + (self.offset * std::mem::size_of::<f32>()) as sys::CUdeviceptr
    }
}

/// Device-to-device raw byte copy of `dest`'s byte count.
///
/// Both buffers must have equal byte sizes; this is the caller's
/// responsibility and only debug-asserted.
pub fn copy_to(dest: &DeviceBuffer, src: &DeviceBuffer) -> Result<(), BackendError> {
    debug_assert_eq!(
        dest.nbytes(),
        src.nbytes(),
        "copy_to: byte sizes differ ({} vs {})",
        dest.nbytes(),
        src.nbytes()
    );
    // SAFETY: both pointers are valid device allocations; sizes are the
    // caller's contract.
    unsafe { driver::memcpy_dtod_sync(dest.device_ptr(), src.device_ptr(), dest.nbytes()) }
        .map_err(|e| BackendError::Memory(format!("memcpy_dtod({} bytes): {}", dest.nbytes(), e)))
}
