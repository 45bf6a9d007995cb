//! Device model.
//!
//! A device is one concrete type exposing an explicit capability set: the
//! base byte-stream operations every device has, plus optional capability
//! interfaces queried through typed accessors. A driver without a given
//! capability simply returns `None` from the accessor.

pub mod usb;

use alloc::sync::Arc;

use crate::errno::{ErrorCode, Result};
use crate::sync::Spinlock;

/// Base operations. Character-style devices implement these; others keep
/// the defaults and expose their capability interface instead.
pub trait DeviceOps: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(ErrorCode::Unsupported)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(ErrorCode::Unsupported)
    }
}

/// Direction of the data phase of a SCSI request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiDirection {
    In,
    Out,
}

/// Capability interface for devices that speak SCSI command blocks.
pub trait ScsiDeviceOps: Send + Sync {
    /// Execute one CDB. `result` receives the data phase for `In`
    /// requests; the returned value is the number of result bytes.
    fn perform_scsi(
        &self,
        lun: u32,
        dir: ScsiDirection,
        cdb: &[u8],
        result: Option<&mut [u8]>,
    ) -> Result<usize>;
}

pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn ops(&self) -> &dyn DeviceOps;

    /// SCSI capability, when the device has one.
    fn scsi_ops(&self) -> Option<&dyn ScsiDeviceOps> {
        None
    }
}

static CONSOLE: Spinlock<Option<Arc<dyn Device>>> = Spinlock::new(None);

/// Install the system console; new threads wire their standard handles to
/// it.
pub fn set_console(dev: Arc<dyn Device>) {
    *CONSOLE.lock() = Some(dev);
}

pub fn console() -> Option<Arc<dyn Device>> {
    CONSOLE.lock().clone()
}
