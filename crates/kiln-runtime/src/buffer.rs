//! Host-side buffer adopting callee-returned memory.
//!
//! `HostBuffer` is the minimal host tensor the standard result converters
//! produce: dtype, shape, and an exclusively-owned byte buffer released
//! through an explicit deleter. Concrete tensor libraries wrap or replace
//! it with their own converters.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::error::{Error, Result};
use kiln_types::DType;

/// Deleter invoked on the buffer's base pointer when the buffer drops.
pub type Deleter = unsafe extern "C" fn(*mut c_void);

/// An owned, dense host buffer with a dtype and shape.
#[derive(Debug)]
pub struct HostBuffer {
    dtype: DType,
    sizes: Vec<i64>,
    data: NonNull<u8>,
    base: *mut c_void,
    size_bytes: usize,
    deleter: Option<Deleter>,
}

// Safety: the buffer is exclusively owned; the deleter is a plain C
// function.
unsafe impl Send for HostBuffer {}

impl HostBuffer {
    /// Adopt a buffer returned by compiled code.
    ///
    /// `base` is what the deleter will be called on; `data` is where the
    /// elements start (equal to `base` unless the allocation carries
    /// alignment padding).
    ///
    /// # Safety
    /// `data` must point at `sizes.product() * dtype.size_in_bytes()`
    /// readable bytes that stay valid until the buffer drops, and `base`
    /// must be releasable through `deleter` exactly once.
    pub unsafe fn adopt(
        dtype: DType,
        sizes: Vec<i64>,
        base: *mut c_void,
        data: *mut u8,
        deleter: Option<Deleter>,
    ) -> Result<HostBuffer> {
        let data = NonNull::new(data)
            .ok_or_else(|| Error::Execution("returned memref has a null data pointer".into()))?;
        let num_elements: i64 = sizes.iter().product();
        let size_bytes = num_elements.max(0) as usize * dtype.size_in_bytes();
        Ok(HostBuffer {
            dtype,
            sizes,
            data,
            base,
            size_bytes,
            deleter,
        })
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shape.
    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    /// Total number of elements.
    pub fn num_elements(&self) -> usize {
        self.sizes.iter().product::<i64>().max(0) as usize
    }

    /// Size of the data in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Raw bytes of the buffer.
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: construction guarantees the region is readable.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.size_bytes) }
    }

    /// View the buffer as a typed slice.
    ///
    /// # Safety
    /// `T` must match the buffer's dtype layout.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        debug_assert_eq!(std::mem::size_of::<T>(), self.dtype.size_in_bytes());
        std::slice::from_raw_parts(self.data.as_ptr() as *const T, self.num_elements())
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter {
            // Safety: base is released exactly once, per the adopt contract.
            unsafe { deleter(self.base) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adopt_and_read() {
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let ptr = unsafe { libc::malloc(16) } as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, ptr, 16) };

        let buffer = unsafe {
            HostBuffer::adopt(
                DType::F32,
                vec![2, 2],
                ptr as *mut c_void,
                ptr,
                Some(libc::free as Deleter),
            )
        }
        .unwrap();
        assert_eq!(buffer.dtype(), DType::F32);
        assert_eq!(buffer.num_elements(), 4);
        assert_eq!(buffer.size_in_bytes(), 16);
        assert_eq!(unsafe { buffer.as_slice::<f32>() }, &[1.0, 2.0, 3.0, 4.0]);
        // Drop frees via libc::free.
    }

    #[test]
    fn test_null_data_rejected() {
        let result = unsafe {
            HostBuffer::adopt(DType::F32, vec![1], std::ptr::null_mut(), std::ptr::null_mut(), None)
        };
        assert!(result.is_err());
    }
}
