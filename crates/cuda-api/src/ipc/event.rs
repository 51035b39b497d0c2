use tracing::debug;
use tracing::error;

use super::EventHandle;
use crate::error::StatusExt;
use crate::event::AsEventId;
use crate::types::id_as_hex;
use crate::types::EventId;
use crate::Result;
use crate::Runtime;

/// Obtains a handle for an interprocess event that can be sent to another
/// process. The event must have been created with
/// [`EventFlags::INTERPROCESS`](crate::EventFlags::INTERPROCESS).
pub fn export_event(runtime: &Runtime, event_id: EventId) -> Result<EventHandle> {
    let handle = runtime
        .driver()
        .ipc_get_event_handle(event_id)
        .with_context(|| {
            format!(
                "Failed obtaining an IPC event handle for event {}",
                id_as_hex(event_id)
            )
        })?;
    debug!(event = %id_as_hex(event_id), "exported IPC event handle");
    Ok(handle)
}

/// Opens an event exported by another process.
///
/// The returned identifier must eventually be destroyed; [`ImportedEvent`]
/// does that on drop.
pub fn import_event(runtime: &Runtime, handle: &EventHandle) -> Result<EventId> {
    let event_id = runtime
        .driver()
        .ipc_open_event_handle(handle)
        .with_context(|| "Failed obtaining an event ID from an IPC event handle".to_string())?;
    debug!(event = %id_as_hex(event_id), "imported IPC event handle");
    Ok(event_id)
}

/// An event opened from another process's handle, destroyed on drop.
#[derive(Debug)]
pub struct ImportedEvent {
    runtime: Runtime,
    id: EventId,
}

// The runtime's event identifiers may be used from any thread.
unsafe impl Send for ImportedEvent {}

impl ImportedEvent {
    pub fn open(runtime: &Runtime, handle: &EventHandle) -> Result<Self> {
        let id = import_event(runtime, handle)?;
        Ok(Self {
            runtime: runtime.clone(),
            id,
        })
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Blocks until the exporting process's recorded work has completed.
    pub fn synchronize(&self) -> Result<()> {
        crate::event::synchronize(&self.runtime, self.id)
    }

    pub fn has_occurred(&self) -> Result<bool> {
        crate::event::query(&self.runtime, self.id)
    }
}

impl AsEventId for ImportedEvent {
    fn event_id(&self) -> EventId {
        self.id
    }
}

impl Drop for ImportedEvent {
    fn drop(&mut self) {
        if let Err(e) = crate::event::destroy(&self.runtime, self.id) {
            error!(event = %id_as_hex(self.id), error = %e, "failed to destroy imported event");
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
    use crate::Event;
    use crate::EventFlags;

    fn setup() -> (Arc<MockDriver>, Runtime) {
        let mock = Arc::new(MockDriver::new());
        let runtime = Runtime::with_driver(mock.clone());
        (mock, runtime)
    }

    #[test]
    fn export_failure_names_the_event() {
        let (mock, runtime) = setup();
        mock.fail(Call::IpcGetEventHandle, CUresult::CUDA_ERROR_INVALID_HANDLE);

        let err = export_event(&runtime, 0x40usize as EventId).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed obtaining an IPC event handle for event 0x40: CUDA_ERROR_INVALID_HANDLE"
        );
    }

    #[test]
    fn import_failure_has_fixed_message() {
        let (mock, runtime) = setup();
        mock.fail(Call::IpcOpenEventHandle, CUresult::CUDA_ERROR_INVALID_VALUE);

        let err = import_event(&runtime, &EventHandle::from_bytes([0; 64])).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed obtaining an event ID from an IPC event handle: CUDA_ERROR_INVALID_VALUE"
        );
    }

    #[test]
    fn exporting_requires_an_interprocess_event() {
        let (_mock, runtime) = setup();
        let plain = Event::new(&runtime, EventFlags::DEFAULT).unwrap();

        let err = export_event(&runtime, plain.id()).unwrap_err();
        assert_eq!(err.status(), Some(CUresult::CUDA_ERROR_INVALID_VALUE));
    }

    #[test]
    fn imported_event_is_a_distinct_id_destroyed_on_drop() {
        let (mock, runtime) = setup();
        let event = Event::new_interprocess(&runtime).unwrap();
        let handle = event.export().unwrap();

        let imported = ImportedEvent::open(&runtime, &handle).unwrap();
        assert_ne!(imported.id(), event.id());
        assert!(imported.has_occurred().unwrap());
        imported.synchronize().unwrap();
        assert_eq!(mock.live_events(), 2);

        drop(imported);
        assert_eq!(mock.live_events(), 1);
    }
}
