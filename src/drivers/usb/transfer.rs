//! USB transfers and pipes.
//!
//! A transfer describes one exchange with an endpoint: type, direction,
//! control-request block, a DMA data buffer, and the HCD's private
//! queue-head/descriptor chain. While a transfer is pending it sits on
//! exactly one device's pending list, so device removal can cancel
//! everything in flight.
//!
//! Completion runs from IRQ context: the HCD fills in the result length and
//! error flag, then calls [`complete`], which hands the transfer to its
//! pipe callback or wakes the synchronous waiter. Callbacks may re-arm
//! their pipe immediately (that is how multi-phase exchanges such as
//! CBW → data → CSW are chained).

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use bitflags::bitflags;
use core::any::Any;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::errno::{ErrorCode, Result};
use crate::memory::dma::{self, DmaChunk};
use crate::sync::{Semaphore, Spinlock};
use crate::PAGE_SIZE;

use super::UsbDevice;

/// Offset of the data area inside a transfer's DMA frame; the 8-byte
/// control request occupies the start of the frame.
pub const TRANSFER_DATA_OFFSET: usize = 64;
/// Usable data bytes per transfer.
pub const TRANSFER_MAX_DATA: usize = PAGE_SIZE - TRANSFER_DATA_OFFSET;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferFlags: u32 {
        /// Linked on the owning device's pending list.
        const PENDING = 1 << 0;
        /// At least one descriptor finished with an error.
        const ERROR = 1 << 1;
        /// Data flows device → host.
        const READ = 1 << 2;
        /// The transfer carries a data stage.
        const DATA = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Interrupt,
    Bulk,
    Isochronous,
}

/// Standard 8-byte control request block, wire layout.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default)]
#[repr(C, packed)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Where a finished transfer reports to.
pub enum TransferCallback {
    /// Owning pipe; its callback runs in IRQ context.
    Pipe(Weak<Pipe>),
    /// Synchronous waiter blocked on the semaphore.
    Waiter(Arc<Semaphore>),
}

pub struct TransferInner {
    pub flags: TransferFlags,
    pub control_req: ControlRequest,
    /// Requested data-stage length.
    pub length: usize,
    /// Bytes actually moved, written by the HCD on completion.
    pub result_length: usize,
    /// Polling interval in ms (interrupt transfers; selects the periodic
    /// queue).
    pub interval: u8,
    /// Endpoint max packet size; 0 means "use the device's default pipe
    /// size" (control transfers).
    pub max_packet: u16,
}

pub struct Transfer {
    pub device: Arc<UsbDevice>,
    pub ttype: TransferType,
    pub endpoint: u8,
    pub inner: Spinlock<TransferInner>,
    /// HCD-private chain (QH/TDs); owned by the host controller driver.
    pub hcd_priv: Spinlock<Option<Box<dyn Any + Send>>>,
    pub callback: Spinlock<Option<TransferCallback>>,
    dma: DmaChunk,
}

impl Transfer {
    /// Allocate a transfer with its DMA frame and the HCD's queue
    /// structures.
    pub fn new(
        device: &Arc<UsbDevice>,
        ttype: TransferType,
        endpoint: u8,
        flags: TransferFlags,
    ) -> Result<Arc<Transfer>> {
        let dma = dma::alloc_buffer(device.hcd.phys(), PAGE_SIZE)?;
        let xfer = Arc::new(Transfer {
            device: device.clone(),
            ttype,
            endpoint,
            inner: Spinlock::new(TransferInner {
                flags,
                control_req: ControlRequest::default(),
                length: 0,
                result_length: 0,
                interval: 0,
                max_packet: 0,
            }),
            hcd_priv: Spinlock::new(None),
            callback: Spinlock::new(None),
            dma,
        });
        device.hcd.setup_transfer(&xfer)?;
        Ok(xfer)
    }

    /// Physical address of the control-request block.
    pub fn control_phys(&self) -> crate::memory::address::PhysAddr {
        self.dma.phys
    }

    /// Physical address of the data area.
    pub fn data_phys(&self) -> crate::memory::address::PhysAddr {
        crate::memory::address::PhysAddr::new(self.dma.phys.as_u64() + TRANSFER_DATA_OFFSET as u64)
    }

    /// Install the control request and mirror it into the DMA frame for
    /// the SETUP descriptor.
    pub fn set_control(&self, req: ControlRequest) {
        let phys = self.device.hcd.phys();
        phys.copy_in(self.dma.phys, 0, req.as_bytes());
        let mut inner = self.inner.lock();
        inner.control_req = req;
        inner.length = req.length as usize;
    }

    /// Stage outbound data bytes.
    pub fn write_data(&self, data: &[u8]) -> Result<()> {
        if data.len() > TRANSFER_MAX_DATA {
            return Err(ErrorCode::BadLength);
        }
        self.device
            .hcd
            .phys()
            .copy_in(self.dma.phys, TRANSFER_DATA_OFFSET, data);
        self.inner.lock().length = data.len();
        Ok(())
    }

    pub fn set_length(&self, len: usize) -> Result<()> {
        if len > TRANSFER_MAX_DATA {
            return Err(ErrorCode::BadLength);
        }
        self.inner.lock().length = len;
        Ok(())
    }

    pub fn set_interval(&self, ms: u8) {
        self.inner.lock().interval = ms;
    }

    /// Copy received bytes out; returns how many were available.
    pub fn read_result(&self, buf: &mut [u8]) -> usize {
        let n = self.inner.lock().result_length.min(buf.len());
        self.device
            .hcd
            .phys()
            .copy_out(self.dma.phys, TRANSFER_DATA_OFFSET, &mut buf[..n]);
        n
    }

    pub fn flags(&self) -> TransferFlags {
        self.inner.lock().flags
    }

    pub fn result_length(&self) -> usize {
        self.inner.lock().result_length
    }

    /// Hand the transfer to the host controller.
    pub fn schedule(self: &Arc<Self>) -> Result<()> {
        self.device.hcd.schedule_transfer(self)
    }

    pub fn cancel(self: &Arc<Self>) -> Result<()> {
        self.device.hcd.cancel_transfer(self)
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        // The HCD chain (hcd_priv) frees its descriptor chunks on drop.
        dma::free_buffer(self.device.hcd.phys(), self.dma);
    }
}

/// Link a transfer onto its device's pending list. Called by the HCD with
/// scheduling rights; a transfer may only be pending once.
pub fn mark_scheduled(xfer: &Arc<Transfer>) {
    let mut inner = xfer.inner.lock();
    assert!(
        !inner.flags.contains(TransferFlags::PENDING),
        "scheduling transfer that is already pending"
    );
    inner.flags.insert(TransferFlags::PENDING);
    inner.result_length = 0;
    inner.flags.remove(TransferFlags::ERROR);
    drop(inner);
    xfer.device.pending.lock().push(xfer.clone());
}

/// Unlink a cancelled or finished transfer from the device's pending list.
/// No-op when not pending.
pub fn unmark_pending(xfer: &Arc<Transfer>) -> bool {
    let mut inner = xfer.inner.lock();
    if !inner.flags.contains(TransferFlags::PENDING) {
        return false;
    }
    inner.flags.remove(TransferFlags::PENDING);
    drop(inner);
    xfer.device
        .pending
        .lock()
        .retain(|t| !Arc::ptr_eq(t, xfer));
    true
}

/// Completion entry point, invoked by the HCD from IRQ context after the
/// result length and error flag are set. Transitions the transfer out of
/// pending and notifies the owner. Must not block.
pub fn complete(xfer: &Arc<Transfer>) {
    unmark_pending(xfer);
    // Resolve the target outside the callback lock: a pipe callback may
    // re-arm and re-enter this transfer.
    enum Target {
        Pipe(Arc<Pipe>),
        Waiter(Arc<Semaphore>),
        Gone,
    }
    let target = {
        let cb = xfer.callback.lock();
        match &*cb {
            Some(TransferCallback::Pipe(weak)) => {
                weak.upgrade().map(Target::Pipe).unwrap_or(Target::Gone)
            }
            Some(TransferCallback::Waiter(sem)) => Target::Waiter(sem.clone()),
            None => Target::Gone,
        }
    };
    match target {
        Target::Pipe(pipe) => pipe.callback.on_pipe_callback(&pipe),
        Target::Waiter(sem) => sem.signal(),
        Target::Gone => log::warn!("transfer completed with no callback"),
    }
}

/// Completion receiver of a pipe. Runs in IRQ context; re-arming the pipe
/// via [`Pipe::start`] is legal, blocking is not.
pub trait PipeCallback: Send + Sync {
    fn on_pipe_callback(&self, pipe: &Arc<Pipe>);
}

/// A pipe couples one endpoint with one reusable transfer and a completion
/// receiver.
pub struct Pipe {
    pub device: Arc<UsbDevice>,
    pub xfer: Arc<Transfer>,
    pub callback: Arc<dyn PipeCallback>,
    pub max_packet: u16,
}

impl Pipe {
    pub fn new(
        device: &Arc<UsbDevice>,
        ttype: TransferType,
        endpoint: u8,
        flags: TransferFlags,
        max_packet: u16,
        interval: u8,
        callback: Arc<dyn PipeCallback>,
    ) -> Result<Arc<Pipe>> {
        let xfer = Transfer::new(device, ttype, endpoint, flags)?;
        xfer.set_interval(interval);
        xfer.inner.lock().max_packet = max_packet;
        let pipe = Arc::new(Pipe {
            device: device.clone(),
            xfer,
            callback,
            max_packet,
        });
        *pipe.xfer.callback.lock() = Some(TransferCallback::Pipe(Arc::downgrade(&pipe)));
        Ok(pipe)
    }

    /// (Re-)arm the pipe's transfer.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.xfer.schedule()
    }

    pub fn stop(self: &Arc<Self>) -> Result<()> {
        self.xfer.cancel()
    }
}
