//! Inter-process sharing of device memory and events.
//!
//! One process exports a resource as a fixed-size handle and ships the handle
//! to a peer by any means (a pipe, a socket, a file). The peer imports it to
//! get a locally valid device pointer or event. Mapping rules and peer access
//! are entirely up to the driver.

mod event;
mod handle;
mod memory;

pub use event::export_event;
pub use event::import_event;
pub use event::ImportedEvent;
pub use handle::EventHandle;
pub use handle::MemoryHandle;
pub use memory::export_memory;
pub use memory::import_memory;
pub use memory::unmap;
pub use memory::ImportedMemory;
