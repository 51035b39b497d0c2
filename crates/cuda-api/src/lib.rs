//! Safe wrappers around the CUDA driver API.
//!
//! Covers device memory, streams, events, devices and, most importantly,
//! inter-process sharing: exporting a memory region or an event as an opaque
//! handle, importing that handle in another process, and releasing the
//! resulting mapping exactly once.
//!
//! All native work is done by the driver. The wrappers forward arguments
//! through a [`Driver`] and turn failing status codes into [`Error`]s that
//! name the pointer or identifier involved.

pub mod device;
pub mod driver;
pub mod error;
pub mod event;
pub mod ipc;
pub mod memory;
pub mod mock;
pub mod runtime;
pub mod stream;
pub mod types;

pub use device::Device;
pub use device::PrimaryContext;
pub use driver::CudaDriver;
pub use driver::Driver;
pub use error::Error;
pub use error::Result;
pub use event::Event;
pub use event::EventFlags;
pub use ipc::EventHandle;
pub use ipc::ImportedEvent;
pub use ipc::ImportedMemory;
pub use ipc::MemoryHandle;
pub use memory::DeviceBuffer;
pub use runtime::Runtime;
pub use stream::Stream;
pub use stream::StreamFlags;
pub use types::DevicePtr;
pub use types::EventId;
