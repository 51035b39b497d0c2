use std::marker::PhantomData;

use tracing::debug;
use tracing::error;

use super::MemoryHandle;
use crate::error::StatusExt;
use crate::types::ptr_as_hex;
use crate::types::DevicePtr;
use crate::Error;
use crate::Result;
use crate::Runtime;

/// Obtains a handle for a region of device memory that can be sent to
/// another process.
///
/// `ptr` must be the base of an allocation made in this process.
pub fn export_memory(runtime: &Runtime, ptr: DevicePtr) -> Result<MemoryHandle> {
    let handle = runtime.driver().ipc_get_mem_handle(ptr).with_context(|| {
        format!(
            "Failed producing an IPC memory handle for device pointer {}",
            ptr_as_hex(ptr)
        )
    })?;
    debug!(ptr = %ptr_as_hex(ptr), "exported IPC memory handle");
    Ok(handle)
}

/// Maps memory exported by another process into this one, enabling peer
/// access lazily if the memory lives on a different device.
///
/// The pointer is returned as the driver produced it. Prefer
/// [`ImportedMemory`], which also rejects null and unmaps on drop.
pub fn import_memory(runtime: &Runtime, handle: &MemoryHandle) -> Result<DevicePtr> {
    let ptr = runtime
        .driver()
        .ipc_open_mem_handle(handle)
        .with_context(|| "Failed obtaining a device pointer from an IPC memory handle".to_string())?;
    debug!(ptr = %ptr_as_hex(ptr), "imported IPC memory handle");
    Ok(ptr)
}

/// Releases a mapping obtained from [`import_memory`].
pub fn unmap(runtime: &Runtime, ptr: DevicePtr) -> Result<()> {
    runtime.driver().ipc_close_mem_handle(ptr).with_context(|| {
        format!(
            "Failed unmapping IPC memory mapped to {}",
            ptr_as_hex(ptr)
        )
    })?;
    debug!(ptr = %ptr_as_hex(ptr), "unmapped IPC memory");
    Ok(())
}

/// Owner of a mapping imported from another process.
///
/// Exactly one `ImportedMemory` is responsible for each mapping. It can be
/// moved but not duplicated:
///
/// ```compile_fail
/// fn duplicable<T: Clone>() {}
/// duplicable::<cuda_api::ImportedMemory<u8>>();
/// ```
///
/// Dropping it unmaps the memory. A null stored pointer means there is
/// nothing left to release.
pub struct ImportedMemory<T = u8> {
    runtime: Runtime,
    ptr: DevicePtr,
    _marker: PhantomData<T>,
}

impl<T> ImportedMemory<T> {
    pub fn new(runtime: &Runtime, handle: &MemoryHandle) -> Result<Self> {
        let ptr = import_memory(runtime, handle)?;
        if ptr == 0 {
            return Err(Error::NullPointer);
        }
        Ok(Self {
            runtime: runtime.clone(),
            ptr,
            _marker: PhantomData,
        })
    }

    pub fn get(&self) -> DevicePtr {
        self.ptr
    }

    /// The mapping as a typed pointer, for handing to kernels. It is only
    /// dereferenceable on the device.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr as usize as *mut T
    }

    /// Unmaps now and reports failure, instead of logging it on drop.
    ///
    /// Ownership is given up before the call, so a failed unmap is not
    /// retried.
    pub fn unmap(mut self) -> Result<()> {
        let ptr = std::mem::replace(&mut self.ptr, 0);
        unmap(&self.runtime, ptr)
    }

    /// Gives up ownership without unmapping. The caller becomes responsible
    /// for calling [`unmap`] on the returned pointer.
    pub fn into_raw(mut self) -> DevicePtr {
        std::mem::replace(&mut self.ptr, 0)
    }
}

impl<T> std::fmt::Debug for ImportedMemory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportedMemory")
            .field("ptr", &ptr_as_hex(self.ptr))
            .finish()
    }
}

impl<T> Drop for ImportedMemory<T> {
    fn drop(&mut self) {
        if self.ptr == 0 {
            return;
        }
        if let Err(e) = unmap(&self.runtime, self.ptr) {
            error!(ptr = %ptr_as_hex(self.ptr), error = %e, "failed to unmap imported IPC memory");
        }
    }
}
