//! Events: markers recorded into a stream that complete once the work queued
//! before them has finished.

use std::ops::BitOr;
use std::time::Duration;

use cudarc::driver::sys::CUevent_flags;
use cudarc::driver::sys::CUresult;
use tracing::debug;
use tracing::error;

use crate::error::StatusExt;
use crate::ipc;
use crate::ipc::EventHandle;
use crate::types::id_as_hex;
use crate::types::EventId;
use crate::types::StreamId;
use crate::Result;
use crate::Runtime;
use crate::Stream;

/// Creation flags for [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const DEFAULT: Self = Self(CUevent_flags::CU_EVENT_DEFAULT as u32);
    /// Waiting on the event yields the host thread instead of spinning.
    pub const BLOCKING_SYNC: Self = Self(CUevent_flags::CU_EVENT_BLOCKING_SYNC as u32);
    pub const DISABLE_TIMING: Self = Self(CUevent_flags::CU_EVENT_DISABLE_TIMING as u32);
    /// Required for [`Event::export`]; must be combined with `DISABLE_TIMING`.
    pub const INTERPROCESS: Self = Self(CUevent_flags::CU_EVENT_INTERPROCESS as u32);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Anything that names a runtime event.
pub trait AsEventId {
    fn event_id(&self) -> EventId;
}

impl AsEventId for EventId {
    fn event_id(&self) -> EventId {
        *self
    }
}

/// An event owned by this process, destroyed on drop.
#[derive(Debug)]
pub struct Event {
    runtime: Runtime,
    id: EventId,
    flags: EventFlags,
}

// The runtime's event identifiers may be used from any thread.
unsafe impl Send for Event {}

impl Event {
    pub fn new(runtime: &Runtime, flags: EventFlags) -> Result<Self> {
        let id = runtime
            .driver()
            .event_create(flags.bits())
            .with_context(|| format!("Failed creating an event with flags {:#x}", flags.bits()))?;
        debug!(event = %id_as_hex(id), flags = flags.bits(), "created event");
        Ok(Self {
            runtime: runtime.clone(),
            id,
            flags,
        })
    }

    /// Creates an event that can be exported to other processes.
    pub fn new_interprocess(runtime: &Runtime) -> Result<Self> {
        Self::new(
            runtime,
            EventFlags::INTERPROCESS | EventFlags::DISABLE_TIMING,
        )
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// Records the event into `stream`, after all work already queued there.
    pub fn record(&self, stream: &Stream) -> Result<()> {
        record(&self.runtime, self.id, stream.id())
    }

    /// Records the event into the default stream.
    pub fn record_default(&self) -> Result<()> {
        record(&self.runtime, self.id, std::ptr::null_mut())
    }

    pub fn synchronize(&self) -> Result<()> {
        synchronize(&self.runtime, self.id)
    }

    /// Whether all work captured by the last record has completed.
    pub fn has_occurred(&self) -> Result<bool> {
        query(&self.runtime, self.id)
    }

    /// Time between `start` and this event. Both must have been recorded
    /// and completed, and neither may have timing disabled.
    pub fn elapsed_since(&self, start: &Event) -> Result<Duration> {
        let millis = self
            .runtime
            .driver()
            .event_elapsed_time(start.id, self.id)
            .with_context(|| {
                format!(
                    "Failed measuring elapsed time between events {} and {}",
                    id_as_hex(start.id),
                    id_as_hex(self.id)
                )
            })?;
        Ok(Duration::from_secs_f64(f64::from(millis) / 1000.0))
    }

    pub fn export(&self) -> Result<EventHandle> {
        ipc::export_event(&self.runtime, self.id)
    }
}

impl AsEventId for Event {
    fn event_id(&self) -> EventId {
        self.id
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Err(e) = destroy(&self.runtime, self.id) {
            error!(event = %id_as_hex(self.id), error = %e, "failed to destroy event");
        }
    }
}

pub(crate) fn record(runtime: &Runtime, event: EventId, stream: StreamId) -> Result<()> {
    runtime
        .driver()
        .event_record(event, stream)
        .with_context(|| {
            format!(
                "Failed recording event {} on stream {}",
                id_as_hex(event),
                id_as_hex(stream)
            )
        })
}

pub(crate) fn synchronize(runtime: &Runtime, event: EventId) -> Result<()> {
    runtime
        .driver()
        .event_synchronize(event)
        .with_context(|| format!("Failed waiting for event {}", id_as_hex(event)))
}

pub(crate) fn query(runtime: &Runtime, event: EventId) -> Result<bool> {
    match runtime.driver().event_query(event) {
        Ok(()) => Ok(true),
        Err(CUresult::CUDA_ERROR_NOT_READY) => Ok(false),
        Err(status) => Err::<bool, _>(status)
            .with_context(|| format!("Failed querying the status of event {}", id_as_hex(event))),
    }
}

pub(crate) fn destroy(runtime: &Runtime, event: EventId) -> Result<()> {
    runtime
        .driver()
        .event_destroy(event)
        .with_context(|| format!("Failed destroying event {}", id_as_hex(event)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

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
    fn flags_combine() {
        let flags = EventFlags::INTERPROCESS | EventFlags::DISABLE_TIMING;
        assert!(flags.contains(EventFlags::INTERPROCESS));
        assert!(flags.contains(EventFlags::DISABLE_TIMING));
        assert!(!flags.contains(EventFlags::BLOCKING_SYNC));
        assert_eq!(EventFlags::default(), EventFlags::DEFAULT);
    }

    #[test]
    fn not_ready_is_not_an_error() {
        let (mock, runtime) = setup();
        let event = Event::new(&runtime, EventFlags::DEFAULT).unwrap();

        mock.fail(Call::EventQuery, CUresult::CUDA_ERROR_NOT_READY);
        assert!(!event.has_occurred().unwrap());

        mock.fail(Call::EventQuery, CUresult::CUDA_ERROR_LAUNCH_FAILED);
        let err = event.has_occurred().unwrap_err();
        assert_eq!(err.status(), Some(CUresult::CUDA_ERROR_LAUNCH_FAILED));
        assert!(err
            .to_string()
            .starts_with("Failed querying the status of event 0x"));

        mock.clear_failure(Call::EventQuery);
        assert!(event.has_occurred().unwrap());
    }

    #[test]
    fn elapsed_time_between_recorded_events() {
        let (_mock, runtime) = setup();
        let stream = Stream::new(&runtime, StreamFlags::NON_BLOCKING).unwrap();
        let start = Event::new(&runtime, EventFlags::DEFAULT).unwrap();
        let end = Event::new(&runtime, EventFlags::DEFAULT).unwrap();

        start.record(&stream).unwrap();
        end.record(&stream).unwrap();
        end.synchronize().unwrap();

        assert!(end.elapsed_since(&start).unwrap() > Duration::ZERO);
    }

    #[test]
    fn elapsed_time_fails_without_timing() {
        let (_mock, runtime) = setup();
        let start = Event::new_interprocess(&runtime).unwrap();
        let end = Event::new_interprocess(&runtime).unwrap();
        start.record_default().unwrap();
        end.record_default().unwrap();

        let err = end.elapsed_since(&start).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Failed measuring elapsed time between events"));
    }

    #[test]
    fn creation_failure_reports_flags() {
        let (mock, runtime) = setup();
        mock.fail(Call::EventCreate, CUresult::CUDA_ERROR_OUT_OF_MEMORY);

        let err = Event::new(&runtime, EventFlags::BLOCKING_SYNC).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed creating an event with flags 0x1: CUDA_ERROR_OUT_OF_MEMORY"
        );
    }

    #[test]
    fn drop_destroys() {
        let (mock, runtime) = setup();
        let event = Event::new(&runtime, EventFlags::DEFAULT).unwrap();
        assert_eq!(mock.live_events(), 1);
        drop(event);
        assert_eq!(mock.live_events(), 0);
        assert_eq!(mock.calls(Call::EventDestroy), 1);
    }
}
