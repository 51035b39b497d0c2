use cudarc::driver::sys::CUresult;
use cudarc::driver::sys::CUstream_flags;
use tracing::debug;
use tracing::error;

use crate::error::StatusExt;
use crate::event::AsEventId;
use crate::types::id_as_hex;
use crate::types::StreamId;
use crate::Result;
use crate::Runtime;

/// Creation flags for [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(u32);

impl StreamFlags {
    /// Work in the stream is ordered after the legacy default stream.
    pub const DEFAULT: Self = Self(CUstream_flags::CU_STREAM_DEFAULT as u32);
    /// Work in the stream may run concurrently with the legacy default stream.
    pub const NON_BLOCKING: Self = Self(CUstream_flags::CU_STREAM_NON_BLOCKING as u32);

    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// A queue of device work owned by this process, destroyed on drop.
#[derive(Debug)]
pub struct Stream {
    runtime: Runtime,
    id: StreamId,
}

// The runtime's stream identifiers may be used from any thread.
unsafe impl Send for Stream {}

impl Stream {
    pub fn new(runtime: &Runtime, flags: StreamFlags) -> Result<Self> {
        let id = runtime
            .driver()
            .stream_create(flags.bits())
            .with_context(|| format!("Failed creating a stream with flags {:#x}", flags.bits()))?;
        debug!(stream = %id_as_hex(id), "created stream");
        Ok(Self {
            runtime: runtime.clone(),
            id,
        })
    }

    /// Creates a stream with a scheduling priority. Lower numbers are higher
    /// priorities; the driver clamps out-of-range values.
    pub fn with_priority(runtime: &Runtime, flags: StreamFlags, priority: i32) -> Result<Self> {
        let id = runtime
            .driver()
            .stream_create_with_priority(flags.bits(), priority)
            .with_context(|| format!("Failed creating a stream with priority {priority}"))?;
        debug!(stream = %id_as_hex(id), priority, "created stream");
        Ok(Self {
            runtime: runtime.clone(),
            id,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Blocks until all work queued in the stream has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.runtime
            .driver()
            .stream_synchronize(self.id)
            .with_context(|| format!("Failed synchronizing stream {}", id_as_hex(self.id)))
    }

    /// Whether all work queued in the stream has completed.
    pub fn is_idle(&self) -> Result<bool> {
        match self.runtime.driver().stream_query(self.id) {
            Ok(()) => Ok(true),
            Err(CUresult::CUDA_ERROR_NOT_READY) => Ok(false),
            Err(status) => Err::<bool, _>(status)
                .with_context(|| format!("Failed querying stream {}", id_as_hex(self.id))),
        }
    }

    /// Makes future work in this stream wait until `event` has occurred.
    /// The event may belong to another process.
    pub fn wait_event(&self, event: &impl AsEventId) -> Result<()> {
        let event_id = event.event_id();
        self.runtime
            .driver()
            .stream_wait_event(self.id, event_id)
            .with_context(|| {
                format!(
                    "Failed making stream {} wait on event {}",
                    id_as_hex(self.id),
                    id_as_hex(event_id)
                )
            })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let result = self
            .runtime
            .driver()
            .stream_destroy(self.id)
            .with_context(|| format!("Failed destroying stream {}", id_as_hex(self.id)));
        if let Err(e) = result {
            error!(error = %e, "failed to destroy stream");
        }
    }
}
