//! Device memory: raw allocation and transfer calls, and [`DeviceBuffer`],
//! an owned allocation freed on drop.

use tracing::debug;
use tracing::error;

use crate::error::StatusExt;
use crate::ipc;
use crate::ipc::MemoryHandle;
use crate::types::ptr_as_hex;
use crate::types::DevicePtr;
use crate::Error;
use crate::Result;
use crate::Runtime;
use crate::Stream;

/// Free and total memory of the current device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

pub fn allocate(runtime: &Runtime, bytes: usize) -> Result<DevicePtr> {
    let ptr = runtime
        .driver()
        .mem_alloc(bytes)
        .with_context(|| format!("Failed allocating {bytes} bytes of device memory"))?;
    debug!(ptr = %ptr_as_hex(ptr), bytes, "allocated device memory");
    Ok(ptr)
}

pub fn free(runtime: &Runtime, ptr: DevicePtr) -> Result<()> {
    runtime
        .driver()
        .mem_free(ptr)
        .with_context(|| format!("Failed freeing device memory at {}", ptr_as_hex(ptr)))
}

pub fn info(runtime: &Runtime) -> Result<MemoryInfo> {
    let (free, total) = runtime
        .driver()
        .mem_get_info()
        .with_context(|| "Failed querying device memory usage".to_string())?;
    Ok(MemoryInfo { free, total })
}

pub fn copy_to_device(runtime: &Runtime, dst: DevicePtr, src: &[u8]) -> Result<()> {
    runtime.driver().memcpy_htod(dst, src).with_context(|| {
        format!(
            "Failed copying {} bytes from host to device memory at {}",
            src.len(),
            ptr_as_hex(dst)
        )
    })
}

pub fn copy_to_host(runtime: &Runtime, dst: &mut [u8], src: DevicePtr) -> Result<()> {
    let len = dst.len();
    runtime.driver().memcpy_dtoh(dst, src).with_context(|| {
        format!(
            "Failed copying {len} bytes from device memory at {} to host",
            ptr_as_hex(src)
        )
    })
}

pub fn copy_device_to_device(
    runtime: &Runtime,
    dst: DevicePtr,
    src: DevicePtr,
    bytes: usize,
) -> Result<()> {
    runtime
        .driver()
        .memcpy_dtod(dst, src, bytes)
        .with_context(|| {
            format!(
                "Failed copying {bytes} bytes from device memory at {} to {}",
                ptr_as_hex(src),
                ptr_as_hex(dst)
            )
        })
}

/// Sets `len` bytes starting at `ptr` to `value`.
pub fn set(runtime: &Runtime, ptr: DevicePtr, value: u8, len: usize) -> Result<()> {
    runtime
        .driver()
        .memset_d8(ptr, value, len)
        .with_context(|| {
            format!(
                "Failed setting {len} bytes of device memory at {} to {value:#04x}",
                ptr_as_hex(ptr)
            )
        })
}

pub fn set_async(stream: &Stream, ptr: DevicePtr, value: u8, len: usize) -> Result<()> {
    stream
        .runtime()
        .driver()
        .memset_d8_async(ptr, value, len, stream.id())
        .with_context(|| {
            format!(
                "Failed enqueueing a set of {len} bytes of device memory at {}",
                ptr_as_hex(ptr)
            )
        })
}

/// Enqueues a host-to-device copy on `stream`.
///
/// # Safety
///
/// `src` must not be dropped or modified until the stream has finished the
/// copy (for example, until [`Stream::synchronize`] returns).
pub unsafe fn copy_to_device_async(stream: &Stream, dst: DevicePtr, src: &[u8]) -> Result<()> {
    stream
        .runtime()
        .driver()
        .memcpy_htod_async(dst, src.as_ptr(), src.len(), stream.id())
        .with_context(|| {
            format!(
                "Failed enqueueing a copy of {} bytes to device memory at {}",
                src.len(),
                ptr_as_hex(dst)
            )
        })
}

/// Enqueues a device-to-host copy on `stream`.
///
/// # Safety
///
/// `dst` must not be dropped, read or written until the stream has finished
/// the copy.
pub unsafe fn copy_to_host_async(stream: &Stream, dst: &mut [u8], src: DevicePtr) -> Result<()> {
    let len = dst.len();
    stream
        .runtime()
        .driver()
        .memcpy_dtoh_async(dst.as_mut_ptr(), src, len, stream.id())
        .with_context(|| {
            format!(
                "Failed enqueueing a copy of {len} bytes from device memory at {}",
                ptr_as_hex(src)
            )
        })
}

/// An allocation of device memory owned by this process, freed on drop.
#[derive(Debug)]
pub struct DeviceBuffer {
    runtime: Runtime,
    ptr: DevicePtr,
    len: usize,
}

impl DeviceBuffer {
    pub fn new(runtime: &Runtime, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate a zero-length device buffer".to_string(),
            ));
        }
        let ptr = allocate(runtime, len)?;
        Ok(Self {
            runtime: runtime.clone(),
            ptr,
            len,
        })
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_host(runtime: &Runtime, data: &[u8]) -> Result<Self> {
        let buffer = Self::new(runtime, data.len())?;
        buffer.copy_from_host(data)?;
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn copy_from_host(&self, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        copy_to_device(&self.runtime, self.ptr, data)
    }

    pub fn copy_to_host(&self, data: &mut [u8]) -> Result<()> {
        self.check_len(data.len())?;
        copy_to_host(&self.runtime, data, self.ptr)
    }

    pub fn to_host_vec(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.len];
        self.copy_to_host(&mut data)?;
        Ok(data)
    }

    pub fn fill(&self, value: u8) -> Result<()> {
        set(&self.runtime, self.ptr, value, self.len)
    }

    pub fn fill_async(&self, value: u8, stream: &Stream) -> Result<()> {
        set_async(stream, self.ptr, value, self.len)
    }

    /// Exports the allocation for use by another process.
    pub fn export(&self) -> Result<MemoryHandle> {
        ipc::export_memory(&self.runtime, self.ptr)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.len {
            return Err(Error::InvalidArgument(format!(
                "host slice of {len} bytes does not match device buffer of {} bytes",
                self.len
            )));
        }
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = free(&self.runtime, self.ptr) {
            error!(ptr = %ptr_as_hex(self.ptr), error = %e, "failed to free device buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cudarc::driver::sys::CUresult;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::mock::Call;
    use crate::mock::MockDriver;
    use crate::StreamFlags;

    fn setup() -> (Arc<MockDriver>, Runtime) {
        let mock = Arc::new(MockDriver::new());
        let runtime = Runtime::with_driver(mock.clone());
        (mock, runtime)
    }

    #[test]
    fn zero_length_buffer_never_reaches_the_driver() {
        let (mock, runtime) = setup();

        let err = DeviceBuffer::new(&runtime, 0).unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(mock.calls(Call::MemAlloc), 0);
    }

    #[test]
    fn allocation_failure_reports_size() {
        let (mock, runtime) = setup();
        mock.fail(Call::MemAlloc, CUresult::CUDA_ERROR_OUT_OF_MEMORY);

        let err = DeviceBuffer::new(&runtime, 4096).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed allocating 4096 bytes of device memory: CUDA_ERROR_OUT_OF_MEMORY"
        );
    }

    #[test]
    fn host_round_trip_and_fill() {
        let (mock, runtime) = setup();
        let buffer = DeviceBuffer::from_host(&runtime, b"shared bytes").unwrap();
        assert_eq!(buffer.to_host_vec().unwrap(), b"shared bytes".to_vec());

        buffer.fill(0x5a).unwrap();
        assert_eq!(buffer.to_host_vec().unwrap(), vec![0x5a; 12]);

        drop(buffer);
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let (_mock, runtime) = setup();
        let buffer = DeviceBuffer::new(&runtime, 8).unwrap();

        let err = buffer.copy_from_host(&[0u8; 4]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid argument: host slice of 4 bytes does not match device buffer of 8 bytes"
        );
        assert!(buffer.copy_to_host(&mut [0u8; 9]).is_err());
    }

    #[test]
    fn device_to_device_copy() {
        let (_mock, runtime) = setup();
        let src = DeviceBuffer::from_host(&runtime, &[1, 2, 3, 4]).unwrap();
        let dst = DeviceBuffer::new(&runtime, 4).unwrap();

        copy_device_to_device(&runtime, dst.as_device_ptr(), src.as_device_ptr(), 4).unwrap();
        assert_eq!(dst.to_host_vec().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn async_transfers_complete_after_synchronize() {
        let (_mock, runtime) = setup();
        let stream = Stream::new(&runtime, StreamFlags::NON_BLOCKING).unwrap();
        let buffer = DeviceBuffer::new(&runtime, 3).unwrap();
        let input = [7u8, 8, 9];
        let mut output = [0u8; 3];

        unsafe {
            copy_to_device_async(&stream, buffer.as_device_ptr(), &input).unwrap();
            copy_to_host_async(&stream, &mut output, buffer.as_device_ptr()).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(output, input);

        buffer.fill_async(0, &stream).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(buffer.to_host_vec().unwrap(), vec![0; 3]);
    }

    #[test]
    fn reports_memory_info() {
        let (_mock, runtime) = setup();
        let before = info(&runtime).unwrap();
        let _buffer = DeviceBuffer::new(&runtime, 1 << 20).unwrap();
        let after = info(&runtime).unwrap();

        assert_eq!(before.total, after.total);
        assert_eq!(before.free - after.free, 1 << 20);
    }

    #[test]
    fn export_goes_through_ipc() {
        let (mock, runtime) = setup();
        let buffer = DeviceBuffer::new(&runtime, 16).unwrap();

        let handle = buffer.export().unwrap();
        assert_eq!(handle, mock.memory_handle_for(buffer.as_device_ptr()));
        assert_eq!(mock.calls(Call::IpcGetMemHandle), 1);
    }
}
