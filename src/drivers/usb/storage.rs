//! USB mass storage: SCSI Bulk-Only Transport.
//!
//! One request is a three-phase exchange: the Command Block Wrapper goes
//! out on the bulk-out pipe, data (if any) and the 13-byte Command Status
//! Wrapper come back on the bulk-in pipe. The pipe callbacks drive the
//! phases from IRQ context (the out-completion arms bulk-in, the
//! in-completion collects data until the expected length is consumed and
//! then expects the CSW) while the requesting thread sleeps on a
//! semaphore until the CSW (or an error) shows up.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::drivers::{Device, DeviceOps, ScsiDeviceOps, ScsiDirection};
use crate::errno::{ErrorCode, Result};
use crate::sync::{Semaphore, Spinlock};

use super::transfer::{Pipe, PipeCallback, TransferFlags, TransferType, TRANSFER_MAX_DATA};
use super::{UsbDevice, UsbInterface, DIR_DEVICE_TO_HOST, RECIPIENT_INTERFACE, TYPE_CLASS};

// Bulk-only transport.
const BBB_SUBCLASS_SCSI: u8 = 0x06;
const BBB_PROTOCOL_BULK_ONLY: u8 = 0x50;
const REQ_GET_MAX_LUN: u8 = 0xFE;

pub const CBW_SIGNATURE: u32 = 0x4342_5355;
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_FLAG_DATA_IN: u8 = 1 << 7;
pub const CBW_FLAG_DATA_OUT: u8 = 0;

pub const CSW_STATUS_GOOD: u8 = 0x00;
pub const CSW_STATUS_FAIL: u8 = 0x01;
pub const CSW_STATUS_PHASE_ERROR: u8 = 0x02;

/// Command Block Wrapper (31 bytes).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
pub struct Cbw {
    pub signature: u32,
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cb: [u8; 16],
}

/// Command Status Wrapper (13 bytes).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
pub struct Csw {
    pub signature: u32,
    pub tag: u32,
    pub data_residue: u32,
    pub status: u8,
}

/// Progress of the request currently on the wire.
struct ScsiState {
    /// Data-phase bytes still expected by the caller.
    want: usize,
    data: Vec<u8>,
    csw: Option<Csw>,
    error: Option<ErrorCode>,
}

impl core::fmt::Debug for UsbStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UsbStorage").finish()
    }
}

pub struct UsbStorage {
    device: Arc<UsbDevice>,
    bulk_in: Spinlock<Option<Arc<Pipe>>>,
    bulk_out: Spinlock<Option<Arc<Pipe>>>,
    max_lun: u8,
    state: Spinlock<ScsiState>,
    /// Signalled when the CSW is received (or the exchange died).
    done: Semaphore,
    /// Serializes CBW/CSW exchanges on this device.
    slot: Semaphore,
    tag: AtomicU32,
}

struct PipeInCallbackWrapper(Weak<UsbStorage>);
struct PipeOutCallbackWrapper(Weak<UsbStorage>);

impl PipeCallback for PipeInCallbackWrapper {
    fn on_pipe_callback(&self, pipe: &Arc<Pipe>) {
        if let Some(dev) = self.0.upgrade() {
            dev.on_pipe_in(pipe);
        }
    }
}

impl PipeCallback for PipeOutCallbackWrapper {
    fn on_pipe_callback(&self, pipe: &Arc<Pipe>) {
        if let Some(dev) = self.0.upgrade() {
            dev.on_pipe_out(pipe);
        }
    }
}

impl UsbStorage {
    fn next_tag(&self) -> u32 {
        self.tag.fetch_add(1, Ordering::Relaxed)
    }

    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    /// Arm the bulk-in pipe for the next expected amount.
    fn arm_bulk_in(&self, len: usize) {
        let pipe = self.bulk_in.lock().clone();
        if let Some(pipe) = pipe {
            if pipe.xfer.set_length(len).is_ok() {
                if let Err(e) = pipe.start() {
                    log::error!("usbstorage: bulk-in arm failed: {:?}", e);
                }
            }
        }
    }

    /// Bulk-out finished (the CBW went out). Arm bulk-in for whatever
    /// comes back: the data phase when one is expected, the CSW
    /// otherwise.
    fn on_pipe_out(&self, pipe: &Arc<Pipe>) {
        if pipe.xfer.flags().contains(TransferFlags::ERROR) {
            let mut st = self.state.lock();
            st.error = Some(ErrorCode::Io);
            drop(st);
            self.done.signal();
            return;
        }
        let remaining = {
            let st = self.state.lock();
            st.want - st.data.len()
        };
        let next = if remaining > 0 {
            remaining.min(TRANSFER_MAX_DATA)
        } else {
            core::mem::size_of::<Csw>()
        };
        self.arm_bulk_in(next);
    }

    /// Bulk-in finished: either a slice of the data phase or the CSW.
    fn on_pipe_in(&self, pipe: &Arc<Pipe>) {
        let xfer = &pipe.xfer;
        if xfer.flags().contains(TransferFlags::ERROR) {
            let mut st = self.state.lock();
            st.error = Some(ErrorCode::Io);
            drop(st);
            self.done.signal();
            return;
        }

        let len = xfer.result_length();
        let mut chunk = alloc::vec![0u8; len];
        xfer.read_result(&mut chunk);

        let mut rearm = None;
        {
            let mut st = self.state.lock();
            if st.data.len() < st.want {
                // Data phase.
                let room = st.want - st.data.len();
                let take = len.min(room);
                st.data.extend_from_slice(&chunk[..take]);
                let remaining = st.want - st.data.len();
                rearm = Some(if remaining > 0 {
                    remaining.min(TRANSFER_MAX_DATA)
                } else {
                    core::mem::size_of::<Csw>()
                });
            } else {
                // CSW phase.
                match Csw::read_from_bytes(&chunk[..]) {
                    Ok(csw) if len == core::mem::size_of::<Csw>() => {
                        st.csw = Some(csw);
                    }
                    _ => {
                        log::warn!(
                            "usbstorage: invalid csw length (expected {} got {})",
                            core::mem::size_of::<Csw>(),
                            len
                        );
                        st.error = Some(ErrorCode::BadLength);
                    }
                }
                drop(st);
                self.done.signal();
                return;
            }
        }

        if let Some(len) = rearm {
            self.arm_bulk_in(len);
        }
    }

    fn do_request(
        &self,
        lun: u32,
        dir: ScsiDirection,
        cdb: &[u8],
        mut result: Option<&mut [u8]>,
    ) -> Result<usize> {
        let want = result.as_ref().map(|b| b.len()).unwrap_or(0);
        let tag = self.next_tag();

        {
            let mut st = self.state.lock();
            st.want = want;
            st.data = Vec::with_capacity(want);
            st.csw = None;
            st.error = None;
        }

        let mut cb = [0u8; 16];
        cb[..cdb.len()].copy_from_slice(cdb);
        let cbw = Cbw {
            signature: CBW_SIGNATURE,
            tag,
            data_transfer_length: want as u32,
            flags: if dir == ScsiDirection::In {
                CBW_FLAG_DATA_IN
            } else {
                CBW_FLAG_DATA_OUT
            },
            lun: lun as u8,
            cb_length: cdb.len() as u8,
            cb,
        };

        let out = self
            .bulk_out
            .lock()
            .clone()
            .ok_or(ErrorCode::NoResource)?;
        out.xfer.write_data(cbw.as_bytes())?;
        out.start()?;

        // The in-callback signals once the CSW has landed.
        self.done.wait_and_drain();

        let mut st = self.state.lock();
        if let Some(e) = st.error.take() {
            return Err(e);
        }
        let csw = st.csw.take().ok_or(ErrorCode::Io)?;
        if csw.signature != CSW_SIGNATURE {
            return Err(ErrorCode::Io);
        }
        if csw.tag != tag {
            return Err(ErrorCode::Io);
        }
        if csw.status != CSW_STATUS_GOOD {
            log::warn!("usbstorage: device rejected request: {}", csw.status);
            return Err(ErrorCode::Io);
        }

        let n = st.data.len();
        if let Some(buf) = result.as_deref_mut() {
            buf[..n].copy_from_slice(&st.data);
        }
        Ok(n)
    }
}

impl DeviceOps for UsbStorage {}

impl ScsiDeviceOps for UsbStorage {
    fn perform_scsi(
        &self,
        lun: u32,
        dir: ScsiDirection,
        cdb: &[u8],
        result: Option<&mut [u8]>,
    ) -> Result<usize> {
        if cdb.is_empty() || cdb.len() > 16 {
            return Err(ErrorCode::BadLength);
        }
        if lun > self.max_lun as u32 {
            return Err(ErrorCode::NotFound);
        }
        // One exchange at a time per device.
        self.slot.wait();
        let res = self.do_request(lun, dir, cdb, result);
        self.slot.signal();
        res
    }
}

impl Device for UsbStorage {
    fn name(&self) -> &str {
        "usbstorage"
    }

    fn ops(&self) -> &dyn DeviceOps {
        self
    }

    fn scsi_ops(&self) -> Option<&dyn ScsiDeviceOps> {
        Some(self)
    }
}

/// Ask the device how many LUNs it has. Devices may stall this; zero is
/// the safe default.
fn get_max_lun(device: &Arc<UsbDevice>, iface: &UsbInterface) -> u8 {
    let mut lun = [0u8; 1];
    match device.control(
        DIR_DEVICE_TO_HOST | TYPE_CLASS | RECIPIENT_INTERFACE,
        REQ_GET_MAX_LUN,
        0,
        iface.number as u16,
        Some(&mut lun),
        None,
    ) {
        Ok(1) => lun[0],
        _ => 0,
    }
}

/// Class-driver entry point: claim a mass-storage interface and set up the
/// bulk pipes.
pub fn probe(device: &Arc<UsbDevice>, iface: &UsbInterface) -> Result<Arc<UsbStorage>> {
    if iface.subclass != BBB_SUBCLASS_SCSI || iface.protocol != BBB_PROTOCOL_BULK_ONLY {
        log::info!(
            "usbstorage: unsupported subclass/protocol {:02x}/{:02x}",
            iface.subclass,
            iface.protocol
        );
        return Err(ErrorCode::Unsupported);
    }

    let ep_in = iface
        .endpoints
        .iter()
        .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.is_in())
        .ok_or(ErrorCode::NoResource)?;
    let ep_out = iface
        .endpoints
        .iter()
        .find(|ep| ep.transfer_type() == TransferType::Bulk && !ep.is_in())
        .ok_or(ErrorCode::NoResource)?;

    let max_lun = get_max_lun(device, iface);

    let storage = Arc::new(UsbStorage {
        device: device.clone(),
        bulk_in: Spinlock::new(None),
        bulk_out: Spinlock::new(None),
        max_lun,
        state: Spinlock::new(ScsiState {
            want: 0,
            data: Vec::new(),
            csw: None,
            error: None,
        }),
        done: Semaphore::new(0),
        slot: Semaphore::new(1),
        tag: AtomicU32::new(1),
    });

    let in_pipe = Pipe::new(
        device,
        TransferType::Bulk,
        ep_in.number(),
        TransferFlags::READ | TransferFlags::DATA,
        ep_in.max_packet_size,
        0,
        Arc::new(PipeInCallbackWrapper(Arc::downgrade(&storage))),
    )?;
    let out_pipe = Pipe::new(
        device,
        TransferType::Bulk,
        ep_out.number(),
        TransferFlags::DATA,
        ep_out.max_packet_size,
        0,
        Arc::new(PipeOutCallbackWrapper(Arc::downgrade(&storage))),
    )?;
    *storage.bulk_in.lock() = Some(in_pipe);
    *storage.bulk_out.lock() = Some(out_pipe);

    log::info!(
        "usbstorage: attached (bulk-in ep {}, bulk-out ep {}, max lun {})",
        ep_in.number(),
        ep_out.number(),
        max_lun
    );
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering as StdOrdering;

    use crate::drivers::usb::uhci::{HcdResources, UhciHcd};
    use crate::drivers::usb::{UsbDeviceFlags, UsbEndpoint, UsbSpeed};
    use crate::test_support::uhci_emu::{BbbDevice, FakePortIo, UhciEmulator};
    use crate::test_support::{test_arena, TestMach};

    const DEV_ADDR: u8 = 2;
    const EP_IN: u8 = 1;
    const EP_OUT: u8 = 2;

    struct Rig {
        device: Arc<UsbDevice>,
        model: Arc<BbbDevice>,
        stop: Arc<AtomicBool>,
        pump: Option<std::thread::JoinHandle<()>>,
    }

    impl Rig {
        fn new(max_lun: u8) -> Rig {
            let phys = test_arena(256);
            let io = FakePortIo::new();
            let md = Arc::new(TestMach::new());
            let hcd = UhciHcd::new(HcdResources::new(io.clone()), md, phys.clone()).unwrap();
            hcd.attach().unwrap();
            let emu = UhciEmulator::new(io, phys);
            let model = BbbDevice::new(DEV_ADDR, EP_IN, EP_OUT, max_lun);
            emu.add_device(model.clone());

            let device = UsbDevice::new(
                hcd.clone(),
                DEV_ADDR,
                UsbSpeed::Full,
                UsbDeviceFlags::empty(),
                64,
            );

            // Drive the emulated controller from a separate thread, the
            // way the real one runs concurrently with the CPU.
            let stop = Arc::new(AtomicBool::new(false));
            let pump = {
                let emu = emu.clone();
                let hcd = hcd.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(StdOrdering::SeqCst) {
                        emu.run_once();
                        hcd.handle_irq();
                        std::thread::sleep(std::time::Duration::from_micros(100));
                    }
                })
            };

            Rig {
                device,
                model,
                stop,
                pump: Some(pump),
            }
        }

        fn iface(&self) -> UsbInterface {
            UsbInterface {
                number: 0,
                class: 0x08,
                subclass: BBB_SUBCLASS_SCSI,
                protocol: BBB_PROTOCOL_BULK_ONLY,
                endpoints: alloc::vec![
                    UsbEndpoint {
                        address: 0x80 | EP_IN,
                        attributes: 0x02,
                        max_packet_size: 64,
                        interval: 0,
                    },
                    UsbEndpoint {
                        address: EP_OUT,
                        attributes: 0x02,
                        max_packet_size: 64,
                        interval: 0,
                    },
                ],
            }
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.stop.store(true, StdOrdering::SeqCst);
            if let Some(p) = self.pump.take() {
                let _ = p.join();
            }
        }
    }

    fn read_10_cdb(lba: u32, sectors: u16) -> [u8; 10] {
        let mut cdb = [0u8; 10];
        cdb[0] = 0x28;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&sectors.to_be_bytes());
        cdb
    }

    #[test]
    fn read_10_roundtrip() {
        let rig = Rig::new(0);
        let storage = probe(&rig.device, &rig.iface()).unwrap();

        let mut buf = alloc::vec![0u8; 1024];
        let n = storage
            .perform_scsi(0, ScsiDirection::In, &read_10_cdb(0, 2), Some(&mut buf))
            .unwrap();
        assert_eq!(n, 1024);
        assert_eq!(buf, BbbDevice::pattern(1024));
    }

    #[test]
    fn test_unit_ready_has_no_data_phase() {
        let rig = Rig::new(0);
        let storage = probe(&rig.device, &rig.iface()).unwrap();
        let cdb = [0u8; 6]; // TEST UNIT READY
        let n = storage
            .perform_scsi(0, ScsiDirection::Out, &cdb, None)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn sequential_requests_reuse_the_pipes() {
        let rig = Rig::new(0);
        let storage = probe(&rig.device, &rig.iface()).unwrap();
        for round in 0..3 {
            let mut buf = alloc::vec![0u8; 256];
            let n = storage
                .perform_scsi(
                    0,
                    ScsiDirection::In,
                    &read_10_cdb(round, 1),
                    Some(&mut buf),
                )
                .unwrap();
            assert_eq!(n, 256);
            assert_eq!(buf, BbbDevice::pattern(256));
        }
    }

    #[test]
    fn max_lun_is_discovered_at_probe() {
        let rig = Rig::new(1);
        let storage = probe(&rig.device, &rig.iface()).unwrap();
        assert_eq!(storage.max_lun(), 1);
        // LUNs beyond the maximum are rejected before touching the wire.
        assert_eq!(
            storage.perform_scsi(5, ScsiDirection::In, &[0x12], None),
            Err(ErrorCode::NotFound)
        );
    }

    #[test]
    fn csw_tag_mismatch_is_an_io_error() {
        let rig = Rig::new(0);
        let storage = probe(&rig.device, &rig.iface()).unwrap();
        rig.model.corrupt_next_tag();
        let mut buf = alloc::vec![0u8; 64];
        assert_eq!(
            storage.perform_scsi(0, ScsiDirection::In, &read_10_cdb(0, 1), Some(&mut buf)),
            Err(ErrorCode::Io)
        );
    }

    #[test]
    fn csw_failure_status_is_an_io_error() {
        let rig = Rig::new(0);
        let storage = probe(&rig.device, &rig.iface()).unwrap();
        rig.model.fail_next(CSW_STATUS_FAIL);
        assert_eq!(
            storage.perform_scsi(0, ScsiDirection::Out, &[0u8; 6], None),
            Err(ErrorCode::Io)
        );
        // The device recovers for the next exchange.
        assert!(storage
            .perform_scsi(0, ScsiDirection::Out, &[0u8; 6], None)
            .is_ok());
    }

    #[test]
    fn oversized_or_empty_cdbs_are_rejected() {
        let rig = Rig::new(0);
        let storage = probe(&rig.device, &rig.iface()).unwrap();
        assert_eq!(
            storage.perform_scsi(0, ScsiDirection::Out, &[], None),
            Err(ErrorCode::BadLength)
        );
        assert_eq!(
            storage.perform_scsi(0, ScsiDirection::Out, &[0u8; 17], None),
            Err(ErrorCode::BadLength)
        );
    }

    #[test]
    fn wrong_interface_class_is_not_probed() {
        let rig = Rig::new(0);
        let mut iface = rig.iface();
        iface.subclass = 0x02; // ATAPI
        assert_eq!(
            probe(&rig.device, &iface).unwrap_err(),
            ErrorCode::Unsupported
        );
    }

    #[test]
    fn storage_exposes_the_scsi_capability() {
        let rig = Rig::new(0);
        let storage = probe(&rig.device, &rig.iface()).unwrap();
        let dev: Arc<dyn Device> = storage;
        assert_eq!(dev.name(), "usbstorage");
        assert!(dev.scsi_ops().is_some());
    }
}
