use std::fmt;
use std::sync::Arc;

use crate::driver::CudaDriver;
use crate::driver::Driver;
use crate::error::StatusExt;
use crate::Result;

/// Shared handle onto a [`Driver`].
///
/// Every wrapper object keeps a clone so that it releases its resource
/// through the same driver that produced it.
#[derive(Clone)]
pub struct Runtime {
    driver: Arc<dyn Driver>,
}

impl Runtime {
    /// Loads the native CUDA driver library and initializes it.
    ///
    /// A missing library is reported as [`Error::LibraryLoad`](crate::Error::LibraryLoad).
    /// See [`CudaDriver::load`] for where the library is looked up.
    pub fn new() -> Result<Self> {
        let runtime = Self::with_driver(Arc::new(CudaDriver::load()?));
        crate::device::init(&runtime)?;
        Ok(runtime)
    }

    /// Wraps an already-initialized driver.
    pub fn with_driver(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// Blocks until all work queued in the current context has finished.
    pub fn synchronize(&self) -> Result<()> {
        self.driver
            .ctx_synchronize()
            .with_context(|| "Failed synchronizing the current context".to_string())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}
