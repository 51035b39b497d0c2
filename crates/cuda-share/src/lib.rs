//! Share a device buffer between two processes through CUDA IPC handles.

pub mod channel;
pub mod config;
pub mod protocol;
pub mod session;
