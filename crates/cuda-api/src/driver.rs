//! The seam between the wrappers and the native device runtime.
//!
//! Every method forwards to exactly one runtime function and reports the raw
//! status on failure. Translating that status into an [`Error`](crate::Error)
//! with a useful message is left to the callers in the other modules.

use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_uint;
use std::ffi::c_void;
use std::ffi::CStr;
use std::ffi::OsStr;
use std::fmt;

use cudarc::driver::sys;
use cudarc::driver::sys::CUipcMem_flags;
use cudarc::driver::sys::CUresult;
use cudarc::driver::sys::Lib;
use libloading::Library;

use crate::ipc::EventHandle;
use crate::ipc::MemoryHandle;
use crate::types::ContextId;
use crate::types::DeviceId;
use crate::types::DevicePtr;
use crate::types::EventId;
use crate::types::StreamId;
use crate::types::IPC_HANDLE_SIZE;
use crate::Error;
use crate::Result as CrateResult;

/// Names the driver library to load instead of searching the loader path.
pub const LIB_PATH_ENV: &str = "CUDA_API_LIB_PATH";

const DEFAULT_LIB: &str = "libcuda.so.1";
const FALLBACK_LIB: &str = "libcuda.so";

pub type DriverResult<T> = Result<T, CUresult>;

pub trait Driver: Send + Sync {
    fn init(&self, flags: u32) -> DriverResult<()>;
    fn driver_get_version(&self) -> DriverResult<i32>;

    fn device_get_count(&self) -> DriverResult<i32>;
    fn device_get(&self, ordinal: i32) -> DriverResult<DeviceId>;
    fn device_get_name(&self, device: DeviceId) -> DriverResult<String>;
    fn device_total_mem(&self, device: DeviceId) -> DriverResult<usize>;
    fn device_get_pci_bus_id(&self, device: DeviceId) -> DriverResult<String>;
    fn device_can_access_peer(&self, device: DeviceId, peer: DeviceId) -> DriverResult<bool>;

    fn primary_ctx_retain(&self, device: DeviceId) -> DriverResult<ContextId>;
    fn primary_ctx_release(&self, device: DeviceId) -> DriverResult<()>;
    fn ctx_set_current(&self, ctx: ContextId) -> DriverResult<()>;
    fn ctx_synchronize(&self) -> DriverResult<()>;

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr>;
    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()>;
    /// Returns `(free, total)` bytes of the current device.
    fn mem_get_info(&self) -> DriverResult<(usize, usize)>;
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()>;
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()>;
    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()>;
    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> DriverResult<()>;
    fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: StreamId,
    ) -> DriverResult<()>;

    /// # Safety
    ///
    /// `src` must stay valid for `bytes` reads until the stream has completed the copy.
    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamId,
    ) -> DriverResult<()>;

    /// # Safety
    ///
    /// `dst` must stay valid for `bytes` writes until the stream has completed the copy.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> DriverResult<()>;

    fn stream_create(&self, flags: u32) -> DriverResult<StreamId>;
    fn stream_create_with_priority(&self, flags: u32, priority: i32) -> DriverResult<StreamId>;
    fn stream_destroy(&self, stream: StreamId) -> DriverResult<()>;
    fn stream_synchronize(&self, stream: StreamId) -> DriverResult<()>;
    fn stream_query(&self, stream: StreamId) -> DriverResult<()>;
    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> DriverResult<()>;

    fn event_create(&self, flags: u32) -> DriverResult<EventId>;
    fn event_destroy(&self, event: EventId) -> DriverResult<()>;
    fn event_record(&self, event: EventId, stream: StreamId) -> DriverResult<()>;
    fn event_synchronize(&self, event: EventId) -> DriverResult<()>;
    fn event_query(&self, event: EventId) -> DriverResult<()>;
    /// Milliseconds between two recorded events.
    fn event_elapsed_time(&self, start: EventId, end: EventId) -> DriverResult<f32>;

    fn ipc_get_mem_handle(&self, ptr: DevicePtr) -> DriverResult<MemoryHandle>;
    fn ipc_open_mem_handle(&self, handle: &MemoryHandle) -> DriverResult<DevicePtr>;
    fn ipc_close_mem_handle(&self, ptr: DevicePtr) -> DriverResult<()>;
    fn ipc_get_event_handle(&self, event: EventId) -> DriverResult<EventHandle>;
    fn ipc_open_event_handle(&self, handle: &EventHandle) -> DriverResult<EventId>;
}

#[inline]
fn check(result: CUresult) -> DriverResult<()> {
    if result == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(result)
    }
}

fn string_from_buf(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf.iter().map(|&c| c as u8).collect();
    match CStr::from_bytes_until_nul(&bytes) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

/// [`Driver`] backed by a loaded CUDA driver library.
pub struct CudaDriver {
    lib: Lib,
}

impl CudaDriver {
    /// Loads the driver library named by [`LIB_PATH_ENV`], or the system's
    /// `libcuda` when the variable is unset.
    pub fn load() -> CrateResult<Self> {
        match std::env::var(LIB_PATH_ENV) {
            Ok(path) => Self::open(path),
            Err(_) => Self::open(DEFAULT_LIB).or_else(|err| {
                tracing::debug!(error = %err, "retrying with {FALLBACK_LIB}");
                Self::open(FALLBACK_LIB)
            }),
        }
    }

    /// Loads the driver library at `path`.
    pub fn open<P: AsRef<OsStr>>(path: P) -> CrateResult<Self> {
        let path = path.as_ref();
        tracing::info!("Loading CUDA library from {}", path.to_string_lossy());
        let load_error = |source| Error::LibraryLoad {
            path: path.to_string_lossy().into_owned(),
            source,
        };
        // SAFETY: loading libcuda only runs the library's own initializers.
        let library = unsafe { Library::new(path) }.map_err(load_error)?;
        let lib = unsafe { Lib::from_library(library) }.map_err(load_error)?;
        Ok(Self { lib })
    }
}

impl fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDriver").finish_non_exhaustive()
    }
}

impl Driver for CudaDriver {
    fn init(&self, flags: u32) -> DriverResult<()> {
        unsafe { check((self.lib.cuInit)(flags as c_uint)) }
    }

    fn driver_get_version(&self) -> DriverResult<i32> {
        let mut version: c_int = 0;
        unsafe { check((self.lib.cuDriverGetVersion)(&mut version))? };
        Ok(version)
    }

    fn device_get_count(&self) -> DriverResult<i32> {
        let mut count: c_int = 0;
        unsafe { check((self.lib.cuDeviceGetCount)(&mut count))? };
        Ok(count)
    }

    fn device_get(&self, ordinal: i32) -> DriverResult<DeviceId> {
        let mut device: DeviceId = 0;
        unsafe { check((self.lib.cuDeviceGet)(&mut device, ordinal))? };
        Ok(device)
    }

    fn device_get_name(&self, device: DeviceId) -> DriverResult<String> {
        let mut buf = [0 as c_char; 256];
        unsafe {
            check((self.lib.cuDeviceGetName)(
                buf.as_mut_ptr(),
                buf.len() as c_int,
                device,
            ))?
        };
        Ok(string_from_buf(&buf))
    }

    fn device_total_mem(&self, device: DeviceId) -> DriverResult<usize> {
        let mut bytes: usize = 0;
        unsafe { check((self.lib.cuDeviceTotalMem_v2)(&mut bytes, device))? };
        Ok(bytes)
    }

    fn device_get_pci_bus_id(&self, device: DeviceId) -> DriverResult<String> {
        // "domain:bus:device.function" fits comfortably in 16 bytes
        let mut buf = [0 as c_char; 32];
        unsafe {
            check((self.lib.cuDeviceGetPCIBusId)(
                buf.as_mut_ptr(),
                buf.len() as c_int,
                device,
            ))?
        };
        Ok(string_from_buf(&buf))
    }

    fn device_can_access_peer(&self, device: DeviceId, peer: DeviceId) -> DriverResult<bool> {
        let mut can_access: c_int = 0;
        unsafe {
            check((self.lib.cuDeviceCanAccessPeer)(
                &mut can_access,
                device,
                peer,
            ))?
        };
        Ok(can_access != 0)
    }

    fn primary_ctx_retain(&self, device: DeviceId) -> DriverResult<ContextId> {
        let mut ctx: ContextId = std::ptr::null_mut();
        unsafe { check((self.lib.cuDevicePrimaryCtxRetain)(&mut ctx, device))? };
        Ok(ctx)
    }

    fn primary_ctx_release(&self, device: DeviceId) -> DriverResult<()> {
        unsafe { check((self.lib.cuDevicePrimaryCtxRelease_v2)(device)) }
    }

    fn ctx_set_current(&self, ctx: ContextId) -> DriverResult<()> {
        unsafe { check((self.lib.cuCtxSetCurrent)(ctx)) }
    }

    fn ctx_synchronize(&self) -> DriverResult<()> {
        unsafe { check((self.lib.cuCtxSynchronize)()) }
    }

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        let mut ptr: DevicePtr = 0;
        unsafe { check((self.lib.cuMemAlloc_v2)(&mut ptr, bytes))? };
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        unsafe { check((self.lib.cuMemFree_v2)(ptr)) }
    }

    fn mem_get_info(&self) -> DriverResult<(usize, usize)> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        unsafe { check((self.lib.cuMemGetInfo_v2)(&mut free, &mut total))? };
        Ok((free, total))
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        unsafe {
            check((self.lib.cuMemcpyHtoD_v2)(
                dst,
                src.as_ptr() as *const c_void,
                src.len(),
            ))
        }
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        unsafe {
            check((self.lib.cuMemcpyDtoH_v2)(
                dst.as_mut_ptr() as *mut c_void,
                src,
                dst.len(),
            ))
        }
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()> {
        unsafe { check((self.lib.cuMemcpyDtoD_v2)(dst, src, bytes)) }
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> DriverResult<()> {
        unsafe { check((self.lib.cuMemsetD8_v2)(dst, value, count)) }
    }

    fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: StreamId,
    ) -> DriverResult<()> {
        unsafe { check((self.lib.cuMemsetD8Async)(dst, value, count, stream)) }
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamId,
    ) -> DriverResult<()> {
        check((self.lib.cuMemcpyHtoDAsync_v2)(
            dst,
            src as *const c_void,
            bytes,
            stream,
        ))
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> DriverResult<()> {
        check((self.lib.cuMemcpyDtoHAsync_v2)(
            dst as *mut c_void,
            src,
            bytes,
            stream,
        ))
    }

    fn stream_create(&self, flags: u32) -> DriverResult<StreamId> {
        let mut stream: StreamId = std::ptr::null_mut();
        unsafe { check((self.lib.cuStreamCreate)(&mut stream, flags as c_uint))? };
        Ok(stream)
    }

    fn stream_create_with_priority(&self, flags: u32, priority: i32) -> DriverResult<StreamId> {
        let mut stream: StreamId = std::ptr::null_mut();
        unsafe {
            check((self.lib.cuStreamCreateWithPriority)(
                &mut stream,
                flags as c_uint,
                priority as c_int,
            ))?
        };
        Ok(stream)
    }

    fn stream_destroy(&self, stream: StreamId) -> DriverResult<()> {
        unsafe { check((self.lib.cuStreamDestroy_v2)(stream)) }
    }

    fn stream_synchronize(&self, stream: StreamId) -> DriverResult<()> {
        unsafe { check((self.lib.cuStreamSynchronize)(stream)) }
    }

    fn stream_query(&self, stream: StreamId) -> DriverResult<()> {
        unsafe { check((self.lib.cuStreamQuery)(stream)) }
    }

    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> DriverResult<()> {
        unsafe { check((self.lib.cuStreamWaitEvent)(stream, event, 0)) }
    }

    fn event_create(&self, flags: u32) -> DriverResult<EventId> {
        let mut event: EventId = std::ptr::null_mut();
        unsafe { check((self.lib.cuEventCreate)(&mut event, flags as c_uint))? };
        Ok(event)
    }

    fn event_destroy(&self, event: EventId) -> DriverResult<()> {
        unsafe { check((self.lib.cuEventDestroy_v2)(event)) }
    }

    fn event_record(&self, event: EventId, stream: StreamId) -> DriverResult<()> {
        unsafe { check((self.lib.cuEventRecord)(event, stream)) }
    }

    fn event_synchronize(&self, event: EventId) -> DriverResult<()> {
        unsafe { check((self.lib.cuEventSynchronize)(event)) }
    }

    fn event_query(&self, event: EventId) -> DriverResult<()> {
        unsafe { check((self.lib.cuEventQuery)(event)) }
    }

    fn event_elapsed_time(&self, start: EventId, end: EventId) -> DriverResult<f32> {
        let mut millis: f32 = 0.0;
        unsafe { check((self.lib.cuEventElapsedTime)(&mut millis, start, end))? };
        Ok(millis)
    }

    fn ipc_get_mem_handle(&self, ptr: DevicePtr) -> DriverResult<MemoryHandle> {
        let mut raw = sys::CUipcMemHandle_st {
            reserved: [0; IPC_HANDLE_SIZE],
        };
        unsafe { check((self.lib.cuIpcGetMemHandle)(&mut raw, ptr))? };
        Ok(MemoryHandle::from_bytes(raw.reserved.map(|b| b as u8)))
    }

    fn ipc_open_mem_handle(&self, handle: &MemoryHandle) -> DriverResult<DevicePtr> {
        let raw = sys::CUipcMemHandle_st {
            reserved: handle.as_bytes().map(|b| b as c_char),
        };
        let mut ptr: DevicePtr = 0;
        unsafe {
            check((self.lib.cuIpcOpenMemHandle_v2)(
                &mut ptr,
                raw,
                CUipcMem_flags::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS as c_uint,
            ))?
        };
        Ok(ptr)
    }

    fn ipc_close_mem_handle(&self, ptr: DevicePtr) -> DriverResult<()> {
        unsafe { check((self.lib.cuIpcCloseMemHandle)(ptr)) }
    }

    fn ipc_get_event_handle(&self, event: EventId) -> DriverResult<EventHandle> {
        let mut raw = sys::CUipcEventHandle_st {
            reserved: [0; IPC_HANDLE_SIZE],
        };
        unsafe { check((self.lib.cuIpcGetEventHandle)(&mut raw, event))? };
        Ok(EventHandle::from_bytes(raw.reserved.map(|b| b as u8)))
    }

    fn ipc_open_event_handle(&self, handle: &EventHandle) -> DriverResult<EventId> {
        let raw = sys::CUipcEventHandle_st {
            reserved: handle.as_bytes().map(|b| b as c_char),
        };
        let mut event: EventId = std::ptr::null_mut();
        unsafe { check((self.lib.cuIpcOpenEventHandle)(&mut event, raw))? };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn missing_library_is_an_error() {
        let err = CudaDriver::open("/nonexistent/libcuda.so.1").unwrap_err();
        let Error::LibraryLoad { path, .. } = &err else {
            panic!("expected a load failure, got {err:?}");
        };
        assert_eq!(path, "/nonexistent/libcuda.so.1");
        assert!(err
            .to_string()
            .starts_with("Failed loading the CUDA driver library from /nonexistent/libcuda.so.1"));
        assert!(err.status().is_none());
    }

    #[test]
    fn names_stop_at_the_terminator() {
        let mut buf = [0 as c_char; 16];
        for (slot, byte) in buf.iter_mut().zip(b"Mock GPU\0junk") {
            *slot = *byte as c_char;
        }
        assert_eq!(string_from_buf(&buf), "Mock GPU");
    }

    #[test]
    fn unterminated_names_use_the_whole_buffer() {
        let buf = [b'a' as c_char; 4];
        assert_eq!(string_from_buf(&buf), "aaaa");
    }
}
