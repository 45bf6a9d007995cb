//! USB core: devices, descriptors, and the host-controller contract.
//!
//! The HCD owns scheduling; the core owns the device model, synchronous
//! control transfers, and dispatch of freshly enumerated devices to class
//! drivers.

pub mod roothub;
pub mod storage;
pub mod transfer;
pub mod uhci;

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::errno::{ErrorCode, Result};
use crate::memory::physical::PhysAllocator;
use crate::sync::{Semaphore, Spinlock};

use transfer::{ControlRequest, Transfer, TransferCallback, TransferFlags, TransferType};

// ── Speeds, flags, endpoints ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// 1.5 Mbps.
    Low,
    /// 12 Mbps.
    Full,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbDeviceFlags: u32 {
        const LOW_SPEED = 1 << 0;
        /// Controller-emulated hub; transfers short-circuit to it.
        const ROOT_HUB = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UsbEndpoint {
    /// bit 7 = direction (1 = IN), bits 3..0 = endpoint number.
    pub address: u8,
    /// bits 1..0 = transfer type (0 control, 1 iso, 2 bulk, 3 interrupt).
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl UsbEndpoint {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn transfer_type(&self) -> TransferType {
        match self.attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsbInterface {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<UsbEndpoint>,
}

// ── The host-controller contract ────────────────

pub trait Hcd: Send + Sync {
    /// Allocate the queue structures a transfer will need.
    fn setup_transfer(&self, xfer: &Arc<Transfer>) -> Result<()>;

    /// Build the descriptor chain and publish it to the controller.
    fn schedule_transfer(&self, xfer: &Arc<Transfer>) -> Result<()>;

    /// Pull a pending transfer back; descriptors are reclaimed at
    /// teardown.
    fn cancel_transfer(&self, xfer: &Arc<Transfer>) -> Result<()>;

    /// DMA-capable memory behind this controller.
    fn phys(&self) -> &Arc<PhysAllocator>;
}

// ── Devices ─────────────────────────────────────

pub struct UsbDevice {
    pub address: u8,
    pub speed: UsbSpeed,
    pub flags: UsbDeviceFlags,
    pub max_packet_sz0: u16,
    pub hcd: Arc<dyn Hcd>,
    /// Transfers currently pending against this device.
    pub pending: Spinlock<Vec<Arc<Transfer>>>,
    pub interfaces: Spinlock<Vec<UsbInterface>>,
}

impl UsbDevice {
    pub fn new(
        hcd: Arc<dyn Hcd>,
        address: u8,
        speed: UsbSpeed,
        flags: UsbDeviceFlags,
        max_packet_sz0: u16,
    ) -> Arc<UsbDevice> {
        Arc::new(UsbDevice {
            address,
            speed,
            flags,
            max_packet_sz0,
            hcd,
            pending: Spinlock::new(Vec::new()),
            interfaces: Spinlock::new(Vec::new()),
        })
    }

    pub fn is_low_speed(&self) -> bool {
        self.flags.contains(UsbDeviceFlags::LOW_SPEED) || self.speed == UsbSpeed::Low
    }

    /// Synchronous control transfer. For IN requests the reply lands in
    /// `data`; the return value is the number of bytes moved.
    pub fn control(
        self: &Arc<Self>,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Option<&mut [u8]>,
        out_data: Option<&[u8]>,
    ) -> Result<usize> {
        let is_read = request_type & DIR_DEVICE_TO_HOST != 0;
        let length = match (&data, &out_data) {
            (Some(d), _) if is_read => d.len(),
            (_, Some(o)) => o.len(),
            _ => 0,
        };

        let mut flags = TransferFlags::empty();
        if is_read {
            flags |= TransferFlags::READ;
        }
        if length > 0 {
            flags |= TransferFlags::DATA;
        }

        let xfer = Transfer::new(self, TransferType::Control, 0, flags)?;
        xfer.set_control(ControlRequest {
            request_type,
            request,
            value,
            index,
            length: length as u16,
        });
        if let Some(out) = out_data {
            if !is_read {
                xfer.write_data(out)?;
            }
        }
        xfer.set_length(length)?;

        let sem = Arc::new(Semaphore::new(0));
        *xfer.callback.lock() = Some(TransferCallback::Waiter(sem.clone()));

        xfer.schedule()?;
        sem.wait_and_drain();

        if xfer.flags().contains(TransferFlags::ERROR) {
            return Err(ErrorCode::Io);
        }
        let n = match data {
            Some(buf) if is_read => xfer.read_result(buf),
            _ => xfer.result_length(),
        };
        Ok(n)
    }
}

// ── Descriptor structures ───────────────────────

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

// Standard request codes.
pub const REQ_GET_STATUS: u8 = 0x00;
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_FEATURE: u8 = 0x03;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;

// Descriptor types (high byte of wValue).
pub const DESC_DEVICE: u16 = 0x0100;
pub const DESC_CONFIG: u16 = 0x0200;
pub const DESC_HUB: u16 = 0x2900;

// Request-type fields.
pub const DIR_HOST_TO_DEVICE: u8 = 0x00;
pub const DIR_DEVICE_TO_HOST: u8 = 0x80;
pub const TYPE_STANDARD: u8 = 0x00;
pub const TYPE_CLASS: u8 = 0x20;
pub const RECIPIENT_DEVICE: u8 = 0x00;
pub const RECIPIENT_INTERFACE: u8 = 0x01;
pub const RECIPIENT_OTHER: u8 = 0x03;

// Class codes.
pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const CLASS_HUB: u8 = 0x09;

/// Parse a full configuration-descriptor blob into interfaces and their
/// endpoints.
pub fn parse_config(data: &[u8]) -> Vec<UsbInterface> {
    let mut interfaces = Vec::new();
    let mut offset = 0;

    while offset + 1 < data.len() {
        let len = data[offset] as usize;
        let desc_type = data[offset + 1];
        if len < 2 || offset + len > data.len() {
            break;
        }

        match desc_type {
            // Interface descriptor.
            4 if len >= 9 => interfaces.push(UsbInterface {
                number: data[offset + 2],
                class: data[offset + 5],
                subclass: data[offset + 6],
                protocol: data[offset + 7],
                endpoints: Vec::new(),
            }),
            // Endpoint descriptor.
            5 if len >= 7 => {
                if let Some(iface) = interfaces.last_mut() {
                    iface.endpoints.push(UsbEndpoint {
                        address: data[offset + 2],
                        attributes: data[offset + 3],
                        max_packet_size: u16::from_le_bytes([
                            data[offset + 4],
                            data[offset + 5],
                        ]),
                        interval: data[offset + 6],
                    });
                }
            }
            _ => {}
        }

        offset += len;
    }

    interfaces
}

/// Dispatch an enumerated device to its class driver.
pub fn register_device(device: &Arc<UsbDevice>) {
    let interfaces = device.interfaces.lock().clone();
    for iface in &interfaces {
        log::info!(
            "usb device {}: interface {} class {:02x}:{:02x} proto {:02x}, {} endpoints",
            device.address,
            iface.number,
            iface.class,
            iface.subclass,
            iface.protocol,
            iface.endpoints.len()
        );
        if iface.class == CLASS_MASS_STORAGE {
            if let Err(e) = storage::probe(device, iface) {
                log::warn!("usb storage probe failed: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_extracts_interfaces_and_endpoints() {
        // config(9) + interface(9, mass storage) + 2 bulk endpoints(7).
        let blob: alloc::vec::Vec<u8> = alloc::vec![
            9, 2, 32, 0, 1, 1, 0, 0x80, 50, // config
            9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0, // interface
            7, 5, 0x81, 0x02, 0x40, 0x00, 0, // bulk in, 64
            7, 5, 0x02, 0x02, 0x40, 0x00, 0, // bulk out, 64
        ];
        let ifaces = parse_config(&blob);
        assert_eq!(ifaces.len(), 1);
        let i = &ifaces[0];
        assert_eq!((i.class, i.subclass, i.protocol), (0x08, 0x06, 0x50));
        assert_eq!(i.endpoints.len(), 2);
        assert!(i.endpoints[0].is_in());
        assert_eq!(i.endpoints[0].transfer_type(), TransferType::Bulk);
        assert_eq!(i.endpoints[1].number(), 2);
        assert_eq!(i.endpoints[0].max_packet_size, 64);
    }

    #[test]
    fn truncated_descriptors_stop_the_parse() {
        let blob = [9u8, 4, 0, 0, 2]; // claims 9 bytes, provides 5
        assert!(parse_config(&blob).is_empty());
    }
}
