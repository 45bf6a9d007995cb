//! Emulated root hub.
//!
//! The UHCI controller has no real hub device; port state lives in the
//! PORTSC registers. This module answers hub-class control transfers
//! against those registers so the rest of the stack can treat the root
//! ports like any other hub. Transfers complete synchronously; nothing
//! ever reaches the wire.

use alloc::sync::Arc;

use crate::errno::{ErrorCode, Result};

use super::transfer::{self, Transfer, TransferFlags, TransferType};
use super::uhci::{HcdResources, REG_PORTSC1};
use super::{
    UsbDevice, DESC_CONFIG, DESC_DEVICE, DESC_HUB, REQ_CLEAR_FEATURE, REQ_GET_DESCRIPTOR,
    REQ_GET_STATUS, REQ_SET_ADDRESS, REQ_SET_CONFIGURATION, REQ_SET_FEATURE,
};

/// Root ports on a UHCI controller.
pub const ROOT_PORTS: u8 = 2;

// PORTSC bits.
pub const PORTSC_CCS: u16 = 1 << 0;
pub const PORTSC_CSC: u16 = 1 << 1;
pub const PORTSC_PE: u16 = 1 << 2;
pub const PORTSC_PEC: u16 = 1 << 3;
pub const PORTSC_LSDA: u16 = 1 << 8;
pub const PORTSC_PR: u16 = 1 << 9;

// Hub-class feature selectors.
const FEAT_PORT_ENABLE: u16 = 1;
const FEAT_PORT_RESET: u16 = 4;
const FEAT_PORT_POWER: u16 = 8;
const FEAT_C_PORT_CONNECTION: u16 = 16;
const FEAT_C_PORT_ENABLE: u16 = 17;
const FEAT_C_PORT_RESET: u16 = 20;

// wPortStatus bits of the hub-class port status reply.
const PS_CONNECTION: u16 = 1 << 0;
const PS_ENABLE: u16 = 1 << 1;
const PS_RESET: u16 = 1 << 8;
const PS_LOW_SPEED: u16 = 1 << 9;

pub struct RootHub {
    res: HcdResources,
    device: Arc<UsbDevice>,
}

impl RootHub {
    pub fn new(res: HcdResources, device: Arc<UsbDevice>) -> Self {
        RootHub { res, device }
    }

    pub fn device(&self) -> &Arc<UsbDevice> {
        &self.device
    }

    fn portsc_reg(port: u16) -> Result<u16> {
        if port == 0 || port > ROOT_PORTS as u16 {
            return Err(ErrorCode::BadAddress);
        }
        Ok(REG_PORTSC1 + (port - 1) * 2)
    }

    /// Answer one control transfer addressed to the root hub. Fills the
    /// transfer's result and completes it in place.
    pub fn handle_transfer(&self, xfer: &Arc<Transfer>) -> Result<()> {
        if xfer.ttype != TransferType::Control {
            return Err(ErrorCode::Unsupported);
        }
        let req = xfer.inner.lock().control_req;

        let mut reply = [0u8; 64];
        let outcome: Result<usize> = match (req.request_type, req.request) {
            (0x80, REQ_GET_DESCRIPTOR) if req.value == DESC_DEVICE => {
                Ok(self.device_descriptor(&mut reply))
            }
            (0x80, REQ_GET_DESCRIPTOR) if req.value == DESC_CONFIG => {
                Ok(self.config_descriptor(&mut reply))
            }
            (0xA0, REQ_GET_DESCRIPTOR) if req.value == DESC_HUB => {
                Ok(self.hub_descriptor(&mut reply))
            }
            (0xA3, REQ_GET_STATUS) => self.port_status(req.index, &mut reply),
            (0x23, REQ_SET_FEATURE) => self.set_port_feature(req.index, req.value).map(|_| 0),
            (0x23, REQ_CLEAR_FEATURE) => {
                self.clear_port_feature(req.index, req.value).map(|_| 0)
            }
            (0x00, REQ_SET_ADDRESS) | (0x00, REQ_SET_CONFIGURATION) => Ok(0),
            _ => {
                log::warn!(
                    "roothub: unsupported request {:02x}/{:02x}",
                    req.request_type,
                    req.request
                );
                Err(ErrorCode::Unsupported)
            }
        };

        match outcome {
            Ok(len) => {
                let n = len.min(req.length as usize);
                let phys = self.device.hcd.phys();
                phys.copy_in(xfer.data_phys(), 0, &reply[..n]);
                xfer.inner.lock().result_length = n;
            }
            Err(_) => {
                xfer.inner.lock().flags.insert(TransferFlags::ERROR);
            }
        }
        transfer::complete(xfer);
        Ok(())
    }

    fn device_descriptor(&self, buf: &mut [u8]) -> usize {
        // 18-byte standard descriptor, class 9 (hub).
        let d: [u8; 18] = [
            18, 1, 0x10, 0x01, 9, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
        ];
        buf[..18].copy_from_slice(&d);
        18
    }

    fn config_descriptor(&self, buf: &mut [u8]) -> usize {
        // config(9) + interface(9, hub class) + interrupt endpoint(7).
        let d: [u8; 25] = [
            9, 2, 25, 0, 1, 1, 0, 0x40, 0, // configuration
            9, 4, 0, 0, 1, 9, 0, 0, 0, // interface
            7, 5, 0x81, 0x03, 8, 0, 0xFF, // status-change endpoint
        ];
        buf[..25].copy_from_slice(&d);
        25
    }

    fn hub_descriptor(&self, buf: &mut [u8]) -> usize {
        let d: [u8; 9] = [9, 0x29, ROOT_PORTS, 0, 0, 1, 0, 0x00, 0xFF];
        buf[..9].copy_from_slice(&d);
        9
    }

    /// wPortStatus/wPortChange from the PORTSC register.
    fn port_status(&self, port: u16, buf: &mut [u8]) -> Result<usize> {
        let reg = Self::portsc_reg(port)?;
        let sc = self.res.read2(reg);

        let mut status = 0u16;
        if sc & PORTSC_CCS != 0 {
            status |= PS_CONNECTION;
        }
        if sc & PORTSC_PE != 0 {
            status |= PS_ENABLE;
        }
        if sc & PORTSC_PR != 0 {
            status |= PS_RESET;
        }
        if sc & PORTSC_LSDA != 0 {
            status |= PS_LOW_SPEED;
        }
        let mut change = 0u16;
        if sc & PORTSC_CSC != 0 {
            change |= 1 << 0;
        }
        if sc & PORTSC_PEC != 0 {
            change |= 1 << 1;
        }

        buf[..2].copy_from_slice(&status.to_le_bytes());
        buf[2..4].copy_from_slice(&change.to_le_bytes());
        Ok(4)
    }

    fn set_port_feature(&self, port: u16, feature: u16) -> Result<()> {
        let reg = Self::portsc_reg(port)?;
        match feature {
            FEAT_PORT_RESET => {
                let sc = self.res.read2(reg);
                self.res.write2(reg, sc | PORTSC_PR);
                // The caller clears the reset via CLEAR_FEATURE after the
                // mandated settle time.
                Ok(())
            }
            FEAT_PORT_ENABLE => {
                let sc = self.res.read2(reg);
                self.res.write2(reg, sc | PORTSC_PE);
                Ok(())
            }
            // Root ports are always powered.
            FEAT_PORT_POWER => Ok(()),
            _ => Err(ErrorCode::Unsupported),
        }
    }

    fn clear_port_feature(&self, port: u16, feature: u16) -> Result<()> {
        let reg = Self::portsc_reg(port)?;
        let sc = self.res.read2(reg);
        // Change bits are write-1-to-clear; state bits are masked off.
        match feature {
            FEAT_PORT_ENABLE => {
                self.res.write2(reg, sc & !(PORTSC_PE | PORTSC_CSC | PORTSC_PEC));
                Ok(())
            }
            FEAT_PORT_RESET | FEAT_C_PORT_RESET => {
                self.res.write2(reg, sc & !(PORTSC_PR | PORTSC_CSC | PORTSC_PEC));
                Ok(())
            }
            FEAT_C_PORT_CONNECTION => {
                self.res.write2(reg, (sc & !PORTSC_PEC) | PORTSC_CSC);
                Ok(())
            }
            FEAT_C_PORT_ENABLE => {
                self.res.write2(reg, (sc & !PORTSC_CSC) | PORTSC_PEC);
                Ok(())
            }
            _ => Err(ErrorCode::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use crate::drivers::usb::uhci::{HcdResources, PortIo, UhciHcd};
    use crate::drivers::usb::{UsbDeviceFlags, UsbSpeed};
    use crate::test_support::uhci_emu::FakePortIo;
    use crate::test_support::{test_arena, TestMach};

    fn hub_fixture() -> (Arc<FakePortIo>, Arc<UsbDevice>) {
        let phys = test_arena(64);
        let io = FakePortIo::new();
        let md = Arc::new(TestMach::new());
        let hcd = UhciHcd::new(HcdResources::new(io.clone()), md, phys).unwrap();
        let hub_dev = UsbDevice::new(
            hcd.clone(),
            1,
            UsbSpeed::Full,
            UsbDeviceFlags::ROOT_HUB,
            8,
        );
        hcd.set_root_hub(hub_dev.clone());
        // Keep the controller stopped: root-hub traffic never reaches the
        // frame list, so these tests run without the emulator.
        (io, hub_dev)
    }

    #[test]
    fn hub_descriptor_reports_two_ports() {
        let (_io, hub) = hub_fixture();
        let mut buf = [0u8; 9];
        let n = hub
            .control(0xA0, REQ_GET_DESCRIPTOR, DESC_HUB, 0, Some(&mut buf), None)
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(buf[1], 0x29);
        assert_eq!(buf[2], ROOT_PORTS);
    }

    #[test]
    fn port_status_reflects_portsc_bits() {
        let (io, hub) = hub_fixture();
        io.set_port(REG_PORTSC1, PORTSC_CCS | PORTSC_CSC | PORTSC_LSDA);

        let mut buf = [0u8; 4];
        let n = hub
            .control(0xA3, REQ_GET_STATUS, 0, 1, Some(&mut buf), None)
            .unwrap();
        assert_eq!(n, 4);
        let status = u16::from_le_bytes([buf[0], buf[1]]);
        let change = u16::from_le_bytes([buf[2], buf[3]]);
        assert_ne!(status & PS_CONNECTION, 0);
        assert_ne!(status & PS_LOW_SPEED, 0);
        assert_eq!(status & PS_ENABLE, 0);
        assert_ne!(change & 1, 0); // connect status changed
    }

    #[test]
    fn port_reset_feature_sets_and_clears_pr() {
        let (io, hub) = hub_fixture();
        io.set_port(REG_PORTSC1, PORTSC_CCS);

        hub.control(0x23, REQ_SET_FEATURE, FEAT_PORT_RESET, 1, None, None)
            .unwrap();
        assert_ne!(io.read16(REG_PORTSC1) & PORTSC_PR, 0);

        hub.control(0x23, REQ_CLEAR_FEATURE, FEAT_C_PORT_RESET, 1, None, None)
            .unwrap();
        assert_eq!(io.read16(REG_PORTSC1) & PORTSC_PR, 0);
    }

    #[test]
    fn out_of_range_port_is_an_error() {
        let (_io, hub) = hub_fixture();
        let mut buf = [0u8; 4];
        assert!(hub
            .control(0xA3, REQ_GET_STATUS, 0, 3, Some(&mut buf), None)
            .is_err());
    }

    #[test]
    fn unknown_requests_error_rather_than_hang() {
        let (_io, hub) = hub_fixture();
        assert!(hub.control(0x40, 0x99, 0, 0, None, None).is_err());
    }
}
