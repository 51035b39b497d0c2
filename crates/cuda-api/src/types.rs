//! Raw identifiers shared by the wrappers.

use cudarc::driver::sys;

/// Address of a region in device memory. `0` is the null device pointer.
pub type DevicePtr = sys::CUdeviceptr;

/// Raw runtime event identifier.
pub type EventId = sys::CUevent;

/// Raw runtime stream identifier. The null stream is the default stream.
pub type StreamId = sys::CUstream;

/// Raw runtime context identifier.
pub type ContextId = sys::CUcontext;

/// Raw runtime device identifier.
pub type DeviceId = sys::CUdevice;

/// Size in bytes of the runtime's opaque IPC handles.
pub const IPC_HANDLE_SIZE: usize = 64;

pub(crate) fn ptr_as_hex(ptr: DevicePtr) -> String {
    format!("{ptr:#x}")
}

pub(crate) fn id_as_hex<T>(id: *mut T) -> String {
    format!("{:#x}", id as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_pointers_as_prefixed_hex() {
        assert_eq!(ptr_as_hex(0x7f00_1000), "0x7f001000");
        assert_eq!(ptr_as_hex(0), "0x0");
        assert_eq!(id_as_hex(0x2a0usize as EventId), "0x2a0");
    }
}
