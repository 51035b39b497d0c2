use std::fmt;

use tracing::debug;
use tracing::error;

use crate::error::StatusExt;
use crate::types::id_as_hex;
use crate::types::ContextId;
use crate::types::DeviceId;
use crate::Error;
use crate::Result;
use crate::Runtime;

/// Initializes the driver. Must precede every other call in the process;
/// [`Runtime::new`] does it for you.
pub fn init(runtime: &Runtime) -> Result<()> {
    runtime
        .driver()
        .init(0)
        .with_context(|| "Failed initializing the CUDA driver".to_string())
}

/// Version of the installed driver, as `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
}

impl DriverVersion {
    /// Decodes the driver's `1000 * major + 10 * minor` encoding.
    pub fn from_raw(raw: i32) -> Self {
        let raw = raw.max(0) as u32;
        Self {
            major: raw / 1000,
            minor: (raw % 1000) / 10,
        }
    }
}

impl fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub fn driver_version(runtime: &Runtime) -> Result<DriverVersion> {
    let raw = runtime
        .driver()
        .driver_get_version()
        .with_context(|| "Failed obtaining the CUDA driver version".to_string())?;
    Ok(DriverVersion::from_raw(raw))
}

/// Number of devices visible to this process.
pub fn count(runtime: &Runtime) -> Result<u32> {
    let count = runtime
        .driver()
        .device_get_count()
        .with_context(|| "Failed obtaining the number of CUDA devices".to_string())?;
    Ok(count.max(0) as u32)
}

/// Blocks until all work queued in the current context has finished.
pub fn synchronize_current(runtime: &Runtime) -> Result<()> {
    runtime.synchronize()
}

/// A device, identified by its ordinal among the visible devices.
#[derive(Debug, Clone)]
pub struct Device {
    runtime: Runtime,
    ordinal: u32,
    id: DeviceId,
}

impl Device {
    pub fn get(runtime: &Runtime, ordinal: u32) -> Result<Self> {
        let raw_ordinal = i32::try_from(ordinal)
            .map_err(|_| Error::InvalidArgument(format!("device ordinal {ordinal} out of range")))?;
        let id = runtime
            .driver()
            .device_get(raw_ordinal)
            .with_context(|| format!("Failed obtaining a handle to CUDA device {ordinal}"))?;
        Ok(Self {
            runtime: runtime.clone(),
            ordinal,
            id,
        })
    }

    /// All visible devices, in ordinal order.
    pub fn all(runtime: &Runtime) -> Result<Vec<Self>> {
        (0..count(runtime)?)
            .map(|ordinal| Self::get(runtime, ordinal))
            .collect()
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> Result<String> {
        self.runtime
            .driver()
            .device_get_name(self.id)
            .with_context(|| format!("Failed obtaining the name of CUDA device {}", self.ordinal))
    }

    pub fn total_memory(&self) -> Result<usize> {
        self.runtime
            .driver()
            .device_total_mem(self.id)
            .with_context(|| {
                format!(
                    "Failed obtaining the total memory of CUDA device {}",
                    self.ordinal
                )
            })
    }

    /// PCI location of the device, e.g. `0000:3b:00.0`.
    pub fn pci_bus_id(&self) -> Result<String> {
        self.runtime
            .driver()
            .device_get_pci_bus_id(self.id)
            .with_context(|| {
                format!(
                    "Failed obtaining the PCI bus id of CUDA device {}",
                    self.ordinal
                )
            })
    }

    /// Whether this device can map memory that lives on `peer`.
    pub fn can_access_peer(&self, peer: &Device) -> Result<bool> {
        self.runtime
            .driver()
            .device_can_access_peer(self.id, peer.id)
            .with_context(|| {
                format!(
                    "Failed checking whether CUDA device {} can access device {}",
                    self.ordinal, peer.ordinal
                )
            })
    }

    /// Retains the device's primary context and makes it current on the
    /// calling thread.
    pub fn primary_context(&self) -> Result<PrimaryContext> {
        let ctx = self
            .runtime
            .driver()
            .primary_ctx_retain(self.id)
            .with_context(|| {
                format!(
                    "Failed retaining the primary context of CUDA device {}",
                    self.ordinal
                )
            })?;
        let context = PrimaryContext {
            runtime: self.runtime.clone(),
            device: self.id,
            ordinal: self.ordinal,
            ctx,
        };
        context.make_current()?;
        debug!(device = self.ordinal, ctx = %id_as_hex(ctx), "primary context is current");
        Ok(context)
    }
}

/// A retained primary context, released on drop.
#[derive(Debug)]
pub struct PrimaryContext {
    runtime: Runtime,
    device: DeviceId,
    ordinal: u32,
    ctx: ContextId,
}

// Contexts may be made current on any thread.
unsafe impl Send for PrimaryContext {}

impl PrimaryContext {
    pub fn id(&self) -> ContextId {
        self.ctx
    }

    /// Makes this context current on the calling thread.
    pub fn make_current(&self) -> Result<()> {
        self.runtime
            .driver()
            .ctx_set_current(self.ctx)
            .with_context(|| {
                format!(
                    "Failed making the primary context of CUDA device {} current",
                    self.ordinal
                )
            })
    }
}

impl Drop for PrimaryContext {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.driver().primary_ctx_release(self.device) {
            error!(device = self.ordinal, status = ?e, "failed to release primary context");
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

    fn setup(devices: u32) -> (Arc<MockDriver>, Runtime) {
        let mock = Arc::new(MockDriver::with_devices(devices));
        let runtime = Runtime::with_driver(mock.clone());
        (mock, runtime)
    }

    #[test]
    fn decodes_driver_version() {
        assert_eq!(
            DriverVersion::from_raw(12040),
            DriverVersion { major: 12, minor: 4 }
        );
        assert_eq!(DriverVersion::from_raw(11080).to_string(), "11.8");
        assert_eq!(DriverVersion::from_raw(-1).to_string(), "0.0");
    }

    #[test]
    fn reports_driver_version() {
        let (_mock, runtime) = setup(1);
        assert_eq!(driver_version(&runtime).unwrap().to_string(), "11.8");
    }

    #[test]
    fn enumerates_devices() {
        let (_mock, runtime) = setup(2);
        let devices = Device::all(&runtime).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].ordinal(), 1);
        assert_eq!(devices[0].name().unwrap(), "Mock GPU 0");
        assert_eq!(devices[1].pci_bus_id().unwrap(), "0000:02:00.0");
        assert!(devices[0].total_memory().unwrap() > 0);
        assert!(devices[0].can_access_peer(&devices[1]).unwrap());
        assert!(!devices[0].can_access_peer(&devices[0]).unwrap());
    }

    #[test]
    fn unknown_ordinal_names_the_device() {
        let (_mock, runtime) = setup(1);
        let err = Device::get(&runtime, 3).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed obtaining a handle to CUDA device 3: CUDA_ERROR_INVALID_DEVICE"
        );
    }

    #[test]
    fn primary_context_is_retained_and_released() {
        let (mock, runtime) = setup(1);
        let device = Device::get(&runtime, 0).unwrap();

        let ctx = device.primary_context().unwrap();
        assert_eq!(mock.calls(Call::CtxSetCurrent), 1);
        assert_eq!(mock.retained_contexts(), 1);

        drop(ctx);
        assert_eq!(mock.retained_contexts(), 0);
    }

    #[test]
    fn init_failure_is_reported() {
        let (mock, runtime) = setup(1);
        mock.fail(Call::Init, CUresult::CUDA_ERROR_NO_DEVICE);

        let err = init(&runtime).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed initializing the CUDA driver: CUDA_ERROR_NO_DEVICE"
        );
    }
}
