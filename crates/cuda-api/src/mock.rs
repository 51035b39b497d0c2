//! In-memory [`Driver`] for tests.
//!
//! Device memory is backed by host vectors, work completes as soon as it is
//! enqueued, and any call can be made to fail with a chosen status. Handles
//! exported here can be imported from the same process, standing in for a
//! peer process.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use cudarc::driver::sys::CUevent_flags;
use cudarc::driver::sys::CUresult;

use crate::driver::Driver;
use crate::driver::DriverResult;
use crate::ipc::EventHandle;
use crate::ipc::MemoryHandle;
use crate::types::ContextId;
use crate::types::DeviceId;
use crate::types::DevicePtr;
use crate::types::EventId;
use crate::types::StreamId;
use crate::types::IPC_HANDLE_SIZE;

const TOTAL_MEMORY: usize = 16 << 30;
const DRIVER_VERSION: i32 = 11080;
const FIRST_ADDRESS: u64 = 0x7f00_0000_0000;
const PAGE: u64 = 0x1000;
const MEMORY_MAGIC: &[u8; 8] = b"mockmem\0";
const EVENT_MAGIC: &[u8; 8] = b"mockevt\0";

/// One entry per forwarded driver function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Init,
    DriverGetVersion,
    DeviceGetCount,
    DeviceGet,
    DeviceGetName,
    DeviceTotalMem,
    DeviceGetPciBusId,
    DeviceCanAccessPeer,
    PrimaryCtxRetain,
    PrimaryCtxRelease,
    CtxSetCurrent,
    CtxSynchronize,
    MemAlloc,
    MemFree,
    MemGetInfo,
    MemcpyHtoD,
    MemcpyDtoH,
    MemcpyDtoD,
    MemsetD8,
    MemsetD8Async,
    MemcpyHtoDAsync,
    MemcpyDtoHAsync,
    StreamCreate,
    StreamDestroy,
    StreamSynchronize,
    StreamQuery,
    StreamWaitEvent,
    EventCreate,
    EventDestroy,
    EventRecord,
    EventSynchronize,
    EventQuery,
    EventElapsedTime,
    IpcGetMemHandle,
    IpcOpenMemHandle,
    IpcCloseMemHandle,
    IpcGetEventHandle,
    IpcOpenEventHandle,
}

#[derive(Debug, Clone, Copy)]
struct MockEvent {
    flags: u32,
    recorded_at: Option<u64>,
}

#[derive(Debug)]
struct State {
    devices: u32,
    failures: HashMap<Call, CUresult>,
    calls: HashMap<Call, usize>,
    next_address: u64,
    next_id: usize,
    clock: u64,
    allocations: BTreeMap<DevicePtr, Vec<u8>>,
    /// mapped address -> base of the allocation it aliases
    mappings: BTreeMap<DevicePtr, DevicePtr>,
    last_mapping: Option<DevicePtr>,
    null_import: bool,
    streams: HashSet<usize>,
    events: HashMap<usize, MockEvent>,
    retained: HashMap<DeviceId, usize>,
}

impl State {
    fn reserve_address(&mut self, len: usize) -> DevicePtr {
        let addr = self.next_address;
        let pages = (len as u64).div_ceil(PAGE).max(1);
        self.next_address += (pages + 1) * PAGE;
        addr
    }

    fn next_id(&mut self) -> usize {
        self.next_id += 0x10;
        self.next_id
    }

    fn check_device(&self, device: DeviceId) -> DriverResult<()> {
        if device >= 0 && (device as u32) < self.devices {
            Ok(())
        } else {
            Err(CUresult::CUDA_ERROR_INVALID_DEVICE)
        }
    }

    fn check_stream(&self, stream: StreamId) -> DriverResult<()> {
        if stream.is_null() || self.streams.contains(&(stream as usize)) {
            Ok(())
        } else {
            Err(CUresult::CUDA_ERROR_INVALID_HANDLE)
        }
    }

    fn event(&self, event: EventId) -> DriverResult<MockEvent> {
        self.events
            .get(&(event as usize))
            .copied()
            .ok_or(CUresult::CUDA_ERROR_INVALID_HANDLE)
    }

    /// Finds the allocation backing `len` bytes at `addr`, following IPC
    /// mappings. Returns the allocation base and the offset into it.
    fn resolve(&self, addr: DevicePtr, len: usize) -> DriverResult<(DevicePtr, usize)> {
        let fits = |start: DevicePtr, base: DevicePtr| -> Option<(DevicePtr, usize)> {
            let size = self.allocations.get(&base)?.len();
            let offset = usize::try_from(addr - start).ok()?;
            (offset.checked_add(len)? <= size).then_some((base, offset))
        };

        if let Some((&base, _)) = self.allocations.range(..=addr).next_back() {
            if let Some(found) = fits(base, base) {
                return Ok(found);
            }
        }
        if let Some((&mapped, &base)) = self.mappings.range(..=addr).next_back() {
            if let Some(found) = fits(mapped, base) {
                return Ok(found);
            }
        }
        Err(CUresult::CUDA_ERROR_INVALID_VALUE)
    }

    fn write(&mut self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        let (base, offset) = self.resolve(dst, src.len())?;
        if let Some(memory) = self.allocations.get_mut(&base) {
            memory[offset..offset + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    fn read(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        let (base, offset) = self.resolve(src, dst.len())?;
        if let Some(memory) = self.allocations.get(&base) {
            dst.copy_from_slice(&memory[offset..offset + dst.len()]);
        }
        Ok(())
    }

    fn fill(&mut self, dst: DevicePtr, value: u8, count: usize) -> DriverResult<()> {
        let (base, offset) = self.resolve(dst, count)?;
        if let Some(memory) = self.allocations.get_mut(&base) {
            memory[offset..offset + count].fill(value);
        }
        Ok(())
    }
}

fn encode(magic: &[u8; 8], value: u64) -> [u8; IPC_HANDLE_SIZE] {
    let mut bytes = [0u8; IPC_HANDLE_SIZE];
    bytes[..8].copy_from_slice(magic);
    bytes[8..16].copy_from_slice(&value.to_le_bytes());
    bytes
}

fn decode(magic: &[u8; 8], bytes: &[u8; IPC_HANDLE_SIZE]) -> Option<u64> {
    if &bytes[..8] != magic {
        return None;
    }
    let mut value = [0u8; 8];
    value.copy_from_slice(&bytes[8..16]);
    Some(u64::from_le_bytes(value))
}

/// Scriptable in-memory driver.
#[derive(Debug)]
pub struct MockDriver {
    state: Mutex<State>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A driver with a single device.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    pub fn with_devices(devices: u32) -> Self {
        Self {
            state: Mutex::new(State {
                devices,
                failures: HashMap::new(),
                calls: HashMap::new(),
                next_address: FIRST_ADDRESS,
                next_id: 0x1000,
                clock: 0,
                allocations: BTreeMap::new(),
                mappings: BTreeMap::new(),
                last_mapping: None,
                null_import: false,
                streams: HashSet::new(),
                events: HashMap::new(),
                retained: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call and applies any scripted failure.
    fn enter(&self, call: Call) -> DriverResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        *state.calls.entry(call).or_default() += 1;
        match state.failures.get(&call) {
            Some(&status) => Err(status),
            None => Ok(state),
        }
    }

    /// Makes every following `call` fail with `status`, until cleared.
    pub fn fail(&self, call: Call, status: CUresult) {
        self.lock().failures.insert(call, status);
    }

    pub fn clear_failure(&self, call: Call) {
        self.lock().failures.remove(&call);
    }

    /// How many times `call` has been made, including failed attempts.
    pub fn calls(&self, call: Call) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Makes IPC memory imports succeed with a null pointer.
    pub fn set_null_import(&self, enabled: bool) {
        self.lock().null_import = enabled;
    }

    /// Allocates device memory directly, without going through (or counting)
    /// a driver call.
    pub fn driver_alloc(&self, len: usize) -> DevicePtr {
        let mut state = self.lock();
        let ptr = state.reserve_address(len);
        state.allocations.insert(ptr, vec![0; len]);
        ptr
    }

    /// The handle this driver produces when exporting the allocation at `base`.
    pub fn memory_handle_for(&self, base: DevicePtr) -> MemoryHandle {
        MemoryHandle::from_bytes(encode(MEMORY_MAGIC, base))
    }

    /// Current contents of the allocation (or mapping) starting at `ptr`.
    pub fn device_memory(&self, ptr: DevicePtr) -> Option<Vec<u8>> {
        let state = self.lock();
        let base = state.mappings.get(&ptr).copied().unwrap_or(ptr);
        state.allocations.get(&base).cloned()
    }

    pub fn last_mapping(&self) -> Option<DevicePtr> {
        self.lock().last_mapping
    }

    pub fn live_mappings(&self) -> usize {
        self.lock().mappings.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    pub fn live_streams(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn live_events(&self) -> usize {
        self.lock().events.len()
    }

    pub fn retained_contexts(&self) -> usize {
        self.lock().retained.values().sum()
    }
}

impl Driver for MockDriver {
    fn init(&self, _flags: u32) -> DriverResult<()> {
        self.enter(Call::Init).map(|_| ())
    }

    fn driver_get_version(&self) -> DriverResult<i32> {
        self.enter(Call::DriverGetVersion)?;
        Ok(DRIVER_VERSION)
    }

    fn device_get_count(&self) -> DriverResult<i32> {
        let state = self.enter(Call::DeviceGetCount)?;
        Ok(state.devices as i32)
    }

    fn device_get(&self, ordinal: i32) -> DriverResult<DeviceId> {
        let state = self.enter(Call::DeviceGet)?;
        state.check_device(ordinal)?;
        Ok(ordinal)
    }

    fn device_get_name(&self, device: DeviceId) -> DriverResult<String> {
        let state = self.enter(Call::DeviceGetName)?;
        state.check_device(device)?;
        Ok(format!("Mock GPU {device}"))
    }

    fn device_total_mem(&self, device: DeviceId) -> DriverResult<usize> {
        let state = self.enter(Call::DeviceTotalMem)?;
        state.check_device(device)?;
        Ok(TOTAL_MEMORY)
    }

    fn device_get_pci_bus_id(&self, device: DeviceId) -> DriverResult<String> {
        let state = self.enter(Call::DeviceGetPciBusId)?;
        state.check_device(device)?;
        Ok(format!("0000:{:02x}:00.0", device + 1))
    }

    fn device_can_access_peer(&self, device: DeviceId, peer: DeviceId) -> DriverResult<bool> {
        let state = self.enter(Call::DeviceCanAccessPeer)?;
        state.check_device(device)?;
        state.check_device(peer)?;
        Ok(device != peer)
    }

    fn primary_ctx_retain(&self, device: DeviceId) -> DriverResult<ContextId> {
        let mut state = self.enter(Call::PrimaryCtxRetain)?;
        state.check_device(device)?;
        *state.retained.entry(device).or_default() += 1;
        Ok((0xc0_0000 + device as usize * 0x100) as ContextId)
    }

    fn primary_ctx_release(&self, device: DeviceId) -> DriverResult<()> {
        let mut state = self.enter(Call::PrimaryCtxRelease)?;
        state.check_device(device)?;
        match state.retained.get_mut(&device) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(())
            }
            _ => Err(CUresult::CUDA_ERROR_INVALID_CONTEXT),
        }
    }

    fn ctx_set_current(&self, _ctx: ContextId) -> DriverResult<()> {
        self.enter(Call::CtxSetCurrent).map(|_| ())
    }

    fn ctx_synchronize(&self) -> DriverResult<()> {
        self.enter(Call::CtxSynchronize).map(|_| ())
    }

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        let mut state = self.enter(Call::MemAlloc)?;
        if bytes == 0 {
            return Err(CUresult::CUDA_ERROR_INVALID_VALUE);
        }
        let used: usize = state.allocations.values().map(Vec::len).sum();
        if used + bytes > TOTAL_MEMORY {
            return Err(CUresult::CUDA_ERROR_OUT_OF_MEMORY);
        }
        let ptr = state.reserve_address(bytes);
        state.allocations.insert(ptr, vec![0; bytes]);
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        let mut state = self.enter(Call::MemFree)?;
        state
            .allocations
            .remove(&ptr)
            .map(|_| ())
            .ok_or(CUresult::CUDA_ERROR_INVALID_VALUE)
    }

    fn mem_get_info(&self) -> DriverResult<(usize, usize)> {
        let state = self.enter(Call::MemGetInfo)?;
        let used: usize = state.allocations.values().map(Vec::len).sum();
        Ok((TOTAL_MEMORY - used, TOTAL_MEMORY))
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        self.enter(Call::MemcpyHtoD)?.write(dst, src)
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        self.enter(Call::MemcpyDtoH)?.read(dst, src)
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()> {
        let mut state = self.enter(Call::MemcpyDtoD)?;
        let mut staging = vec![0u8; bytes];
        state.read(&mut staging, src)?;
        state.write(dst, &staging)
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> DriverResult<()> {
        self.enter(Call::MemsetD8)?.fill(dst, value, count)
    }

    fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: StreamId,
    ) -> DriverResult<()> {
        let mut state = self.enter(Call::MemsetD8Async)?;
        state.check_stream(stream)?;
        state.fill(dst, value, count)
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamId,
    ) -> DriverResult<()> {
        let mut state = self.enter(Call::MemcpyHtoDAsync)?;
        state.check_stream(stream)?;
        state.write(dst, std::slice::from_raw_parts(src, bytes))
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> DriverResult<()> {
        let state = self.enter(Call::MemcpyDtoHAsync)?;
        state.check_stream(stream)?;
        state.read(std::slice::from_raw_parts_mut(dst, bytes), src)
    }

    fn stream_create(&self, _flags: u32) -> DriverResult<StreamId> {
        let mut state = self.enter(Call::StreamCreate)?;
        let id = state.next_id();
        state.streams.insert(id);
        Ok(id as StreamId)
    }

    fn stream_create_with_priority(&self, flags: u32, _priority: i32) -> DriverResult<StreamId> {
        self.stream_create(flags)
    }

    fn stream_destroy(&self, stream: StreamId) -> DriverResult<()> {
        let mut state = self.enter(Call::StreamDestroy)?;
        if state.streams.remove(&(stream as usize)) {
            Ok(())
        } else {
            Err(CUresult::CUDA_ERROR_INVALID_HANDLE)
        }
    }

    fn stream_synchronize(&self, stream: StreamId) -> DriverResult<()> {
        self.enter(Call::StreamSynchronize)?.check_stream(stream)
    }

    fn stream_query(&self, stream: StreamId) -> DriverResult<()> {
        self.enter(Call::StreamQuery)?.check_stream(stream)
    }

    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> DriverResult<()> {
        let state = self.enter(Call::StreamWaitEvent)?;
        state.check_stream(stream)?;
        state.event(event).map(|_| ())
    }

    fn event_create(&self, flags: u32) -> DriverResult<EventId> {
        let mut state = self.enter(Call::EventCreate)?;
        let id = state.next_id();
        state.events.insert(
            id,
            MockEvent {
                flags,
                recorded_at: None,
            },
        );
        Ok(id as EventId)
    }

    fn event_destroy(&self, event: EventId) -> DriverResult<()> {
        let mut state = self.enter(Call::EventDestroy)?;
        state
            .events
            .remove(&(event as usize))
            .map(|_| ())
            .ok_or(CUresult::CUDA_ERROR_INVALID_HANDLE)
    }

    fn event_record(&self, event: EventId, stream: StreamId) -> DriverResult<()> {
        let mut state = self.enter(Call::EventRecord)?;
        state.check_stream(stream)?;
        state.event(event)?;
        state.clock += 1;
        let now = state.clock;
        if let Some(entry) = state.events.get_mut(&(event as usize)) {
            entry.recorded_at = Some(now);
        }
        Ok(())
    }

    fn event_synchronize(&self, event: EventId) -> DriverResult<()> {
        self.enter(Call::EventSynchronize)?.event(event).map(|_| ())
    }

    fn event_query(&self, event: EventId) -> DriverResult<()> {
        self.enter(Call::EventQuery)?.event(event).map(|_| ())
    }

    fn event_elapsed_time(&self, start: EventId, end: EventId) -> DriverResult<f32> {
        let state = self.enter(Call::EventElapsedTime)?;
        let start = state.event(start)?;
        let end = state.event(end)?;
        let timing_disabled = CUevent_flags::CU_EVENT_DISABLE_TIMING as u32;
        if (start.flags | end.flags) & timing_disabled != 0 {
            return Err(CUresult::CUDA_ERROR_INVALID_HANDLE);
        }
        match (start.recorded_at, end.recorded_at) {
            (Some(from), Some(to)) => Ok((to as f32 - from as f32) * 0.25),
            _ => Err(CUresult::CUDA_ERROR_INVALID_HANDLE),
        }
    }

    fn ipc_get_mem_handle(&self, ptr: DevicePtr) -> DriverResult<MemoryHandle> {
        let state = self.enter(Call::IpcGetMemHandle)?;
        if !state.allocations.contains_key(&ptr) {
            return Err(CUresult::CUDA_ERROR_INVALID_VALUE);
        }
        Ok(MemoryHandle::from_bytes(encode(MEMORY_MAGIC, ptr)))
    }

    fn ipc_open_mem_handle(&self, handle: &MemoryHandle) -> DriverResult<DevicePtr> {
        let mut state = self.enter(Call::IpcOpenMemHandle)?;
        let base = decode(MEMORY_MAGIC, handle.as_bytes())
            .filter(|base| state.allocations.contains_key(base))
            .ok_or(CUresult::CUDA_ERROR_INVALID_VALUE)?;
        if state.null_import {
            return Ok(0);
        }
        let len = state.allocations.get(&base).map(Vec::len).unwrap_or(0);
        let mapped = state.reserve_address(len);
        state.mappings.insert(mapped, base);
        state.last_mapping = Some(mapped);
        Ok(mapped)
    }

    fn ipc_close_mem_handle(&self, ptr: DevicePtr) -> DriverResult<()> {
        let mut state = self.enter(Call::IpcCloseMemHandle)?;
        state
            .mappings
            .remove(&ptr)
            .map(|_| ())
            .ok_or(CUresult::CUDA_ERROR_INVALID_VALUE)
    }

    fn ipc_get_event_handle(&self, event: EventId) -> DriverResult<EventHandle> {
        let state = self.enter(Call::IpcGetEventHandle)?;
        let entry = state.event(event)?;
        if entry.flags & CUevent_flags::CU_EVENT_INTERPROCESS as u32 == 0 {
            return Err(CUresult::CUDA_ERROR_INVALID_VALUE);
        }
        Ok(EventHandle::from_bytes(encode(EVENT_MAGIC, event as usize as u64)))
    }

    fn ipc_open_event_handle(&self, handle: &EventHandle) -> DriverResult<EventId> {
        let mut state = self.enter(Call::IpcOpenEventHandle)?;
        let source = decode(EVENT_MAGIC, handle.as_bytes())
            .and_then(|id| state.events.get(&(id as usize)).copied())
            .ok_or(CUresult::CUDA_ERROR_INVALID_VALUE)?;
        let id = state.next_id();
        state.events.insert(id, source);
        Ok(id as EventId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn scripted_failure_is_counted_and_cleared() {
        let mock = MockDriver::new();
        mock.fail(Call::MemAlloc, CUresult::CUDA_ERROR_OUT_OF_MEMORY);

        assert_eq!(mock.mem_alloc(16), Err(CUresult::CUDA_ERROR_OUT_OF_MEMORY));
        assert_eq!(mock.calls(Call::MemAlloc), 1);
        assert_eq!(mock.live_allocations(), 0);

        mock.clear_failure(Call::MemAlloc);
        assert!(mock.mem_alloc(16).is_ok());
        assert_eq!(mock.calls(Call::MemAlloc), 2);
    }

    #[test]
    fn mappings_alias_the_exported_allocation() {
        let mock = MockDriver::new();
        let base = mock.driver_alloc(8);
        let handle = mock.ipc_get_mem_handle(base).unwrap();
        let mapped = mock.ipc_open_mem_handle(&handle).unwrap();

        assert_ne!(mapped, base);
        mock.memcpy_htod(mapped + 4, &[9, 9, 9, 9]).unwrap();
        assert_eq!(mock.device_memory(base).unwrap(), vec![0, 0, 0, 0, 9, 9, 9, 9]);
        assert_eq!(mock.device_memory(mapped), mock.device_memory(base));
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mock = MockDriver::new();
        let base = mock.driver_alloc(8);

        assert_eq!(
            mock.memset_d8(base + 4, 1, 8),
            Err(CUresult::CUDA_ERROR_INVALID_VALUE)
        );
        assert_eq!(
            mock.memset_d8(FIRST_ADDRESS - 1, 1, 1),
            Err(CUresult::CUDA_ERROR_INVALID_VALUE)
        );
    }

    #[test]
    fn only_allocation_bases_can_be_exported() {
        let mock = MockDriver::new();
        let base = mock.driver_alloc(64);

        assert!(mock.ipc_get_mem_handle(base).is_ok());
        assert_eq!(
            mock.ipc_get_mem_handle(base + 8),
            Err(CUresult::CUDA_ERROR_INVALID_VALUE)
        );
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mock = MockDriver::new();
        let bogus = MemoryHandle::from_bytes([0xff; IPC_HANDLE_SIZE]);

        assert_eq!(
            mock.ipc_open_mem_handle(&bogus),
            Err(CUresult::CUDA_ERROR_INVALID_VALUE)
        );
        assert_eq!(
            mock.ipc_open_event_handle(&EventHandle::from_bytes([0; IPC_HANDLE_SIZE])),
            Err(CUresult::CUDA_ERROR_INVALID_VALUE)
        );
    }
}
