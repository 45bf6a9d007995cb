//! Hosted test fixtures: a stub MD layer, page-aligned memory arenas, a
//! RAM filesystem implementing the VFS driver contract, a recording
//! console, and an emulated UHCI controller with scripted USB devices.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::{MachDep, PageRoot};
use crate::drivers::{Device, DeviceOps};
use crate::errno::Result;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::physical::PhysAllocator;
use crate::memory::vmspace::AreaFlags;
use crate::sync::Spinlock;
use crate::task::thread::Thread;
use crate::PAGE_SIZE;

/// Allocate a page-aligned arena and wrap it in an allocator. Leaked for
/// the duration of the test process.
pub fn test_arena(frames: usize) -> Arc<PhysAllocator> {
    let size = frames * PAGE_SIZE;
    let layout = std::alloc::Layout::from_size_align(size, PAGE_SIZE).unwrap();
    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!base.is_null(), "test arena allocation failed");
    Arc::new(PhysAllocator::new(base, size))
}

// ── Stub MD layer ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRecord {
    pub va: u64,
    pub pa: u64,
    pub count: usize,
    pub flags: AreaFlags,
}

/// Records what the core asked the machine layer to do.
pub struct TestMach {
    switches: Spinlock<Vec<u32>>,
    maps: Spinlock<Vec<MapRecord>>,
    unmaps: Spinlock<Vec<(u64, usize)>>,
}

impl TestMach {
    pub fn new() -> Self {
        TestMach {
            switches: Spinlock::new(Vec::new()),
            maps: Spinlock::new(Vec::new()),
            unmaps: Spinlock::new(Vec::new()),
        }
    }

    /// TIDs switched to, in order.
    pub fn switch_log(&self) -> Vec<u32> {
        self.switches.lock().clone()
    }

    pub fn mappings(&self) -> Vec<MapRecord> {
        self.maps.lock().clone()
    }

    pub fn unmappings(&self) -> Vec<(u64, usize)> {
        self.unmaps.lock().clone()
    }
}

impl MachDep for TestMach {
    fn map_kernel(&self, _root: &mut PageRoot) {}

    fn map_pages(
        &self,
        _root: &PageRoot,
        va: VirtAddr,
        pa: PhysAddr,
        count: usize,
        flags: AreaFlags,
    ) -> Result<()> {
        self.maps.lock().push(MapRecord {
            va: va.as_u64(),
            pa: pa.as_u64(),
            count,
            flags,
        });
        Ok(())
    }

    fn unmap_pages(&self, _root: &PageRoot, va: VirtAddr, count: usize) -> Result<()> {
        self.unmaps.lock().push((va.as_u64(), count));
        Ok(())
    }

    fn context_switch(&self, new: &Thread, _old: Option<&Thread>) {
        self.switches.lock().push(new.tid);
    }

    fn delay_us(&self, _us: u64) {}
}

// ── Recording console ───────────────────────────

/// Console device: reads come from a preloaded buffer, writes accumulate.
pub struct RecordingConsole {
    input: Spinlock<Vec<u8>>,
    output: Spinlock<Vec<u8>>,
}

impl RecordingConsole {
    pub fn new(input: Vec<u8>) -> Self {
        RecordingConsole {
            input: Spinlock::new(input),
            output: Spinlock::new(Vec::new()),
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.output.lock().clone()
    }
}

impl DeviceOps for RecordingConsole {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut input = self.input.lock();
        let n = buf.len().min(input.len());
        buf[..n].copy_from_slice(&input[..n]);
        input.drain(..n);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.output.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
}

impl Device for RecordingConsole {
    fn name(&self) -> &str {
        "console"
    }

    fn ops(&self) -> &dyn DeviceOps {
        self
    }
}

// ── RAM filesystem ──────────────────────────────

pub mod ramfs {
    use alloc::boxed::Box;
    use alloc::string::String;
    use alloc::sync::{Arc, Weak};
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU32, Ordering};

    use crate::errno::{ErrorCode, Result};
    use crate::fs::dcache::DentryRef;
    use crate::fs::file::{emit_dirent, File};
    use crate::fs::icache::{Inode, InodeData, InodeRef};
    use crate::fs::mount::{FileType, FilesystemOps, InodeOps, MountedFs, Stat};
    use crate::fs::Vfs;
    use crate::sync::Spinlock;

    const ROOT_INUM: u64 = 1;

    struct RamNode {
        inum: u64,
        name: String,
        data: Vec<u8>,
    }

    /// Per-mount counters, stored in the mount's private blob.
    pub struct RamPriv {
        pub inode_reads: AtomicU32,
        pub lookups: AtomicU32,
    }

    /// An in-memory filesystem with a flat root directory. Exists to
    /// exercise the VFS driver contract from hosted tests.
    pub struct RamFs {
        selfref: Weak<RamFs>,
        nodes: Spinlock<Vec<RamNode>>,
        next_inum: AtomicU32,
    }

    impl RamFs {
        /// Build a filesystem pre-populated with `(name, content)` files.
        pub fn build(files: &[(&str, &[u8])]) -> Arc<RamFs> {
            Arc::new_cyclic(|selfref| {
                let mut nodes = Vec::new();
                let mut inum = 2u64;
                for (name, content) in files {
                    nodes.push(RamNode {
                        inum,
                        name: String::from(*name),
                        data: content.to_vec(),
                    });
                    inum += 1;
                }
                RamFs {
                    selfref: selfref.clone(),
                    nodes: Spinlock::new(nodes),
                    next_inum: AtomicU32::new(inum as u32),
                }
            })
        }

        fn ops(&self) -> Arc<dyn InodeOps> {
            self.selfref.upgrade().expect("ramfs gone")
        }

        fn with_priv<R>(fs: &Arc<MountedFs>, f: impl FnOnce(&RamPriv) -> R) -> R {
            let guard = fs.privdata.lock();
            let p = guard
                .as_ref()
                .and_then(|b| b.downcast_ref::<RamPriv>())
                .expect("ramfs mounted without private data");
            f(p)
        }

        pub fn read_inode_count(fs: &Arc<MountedFs>) -> u32 {
            Self::with_priv(fs, |p| p.inode_reads.load(Ordering::SeqCst))
        }

        pub fn lookup_count(fs: &Arc<MountedFs>) -> u32 {
            Self::with_priv(fs, |p| p.lookups.load(Ordering::SeqCst))
        }
    }

    impl FilesystemOps for RamFs {
        fn mount(&self, vfs: &Arc<Vfs>, fs: &Arc<MountedFs>) -> Result<InodeRef> {
            *fs.privdata.lock() = Some(Box::new(RamPriv {
                inode_reads: AtomicU32::new(0),
                lookups: AtomicU32::new(0),
            }));
            vfs.get_inode(fs, ROOT_INUM)
        }

        fn read_inode(&self, inode: &Inode, data: &mut InodeData) -> Result<()> {
            if let Some(fs) = inode.fs.upgrade() {
                Self::with_priv(&fs, |p| p.inode_reads.fetch_add(1, Ordering::SeqCst));
            }
            if inode.inum == ROOT_INUM {
                data.sb = Stat {
                    inum: ROOT_INUM,
                    file_type: FileType::Directory,
                    size: 0,
                    ..Stat::default()
                };
            } else {
                let nodes = self.nodes.lock();
                let node = nodes
                    .iter()
                    .find(|n| n.inum == inode.inum)
                    .ok_or(ErrorCode::NotFound)?;
                data.sb = Stat {
                    inum: node.inum,
                    file_type: FileType::Regular,
                    size: node.data.len() as u64,
                    ..Stat::default()
                };
            }
            data.ops = Some(self.ops());
            Ok(())
        }
    }

    impl InodeOps for RamFs {
        fn readdir(&self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
            let nodes = self.nodes.lock();
            let mut written = 0usize;
            let mut index = file.offset as usize;
            while index < nodes.len() {
                let node = &nodes[index];
                match emit_dirent(&mut buf[written..], 0, node.inum, &node.name) {
                    Some(n) => written += n,
                    None => break,
                }
                index += 1;
            }
            file.offset = index as u64;
            Ok(written)
        }

        fn lookup(&self, vfs: &Arc<Vfs>, parent: &InodeRef, name: &str) -> Result<InodeRef> {
            let fs = parent.fs();
            Self::with_priv(&fs, |p| p.lookups.fetch_add(1, Ordering::SeqCst));
            if parent.inum != ROOT_INUM {
                return Err(ErrorCode::NotFound);
            }
            let inum = {
                let nodes = self.nodes.lock();
                nodes
                    .iter()
                    .find(|n| n.name == name)
                    .map(|n| n.inum)
                    .ok_or(ErrorCode::NotFound)?
            };
            vfs.get_inode(&fs, inum)
        }

        fn read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
            let inode = file.inode().ok_or(ErrorCode::Io)?;
            let nodes = self.nodes.lock();
            let node = nodes
                .iter()
                .find(|n| n.inum == inode.inum)
                .ok_or(ErrorCode::NotFound)?;
            let off = file.offset as usize;
            if off >= node.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(node.data.len() - off);
            buf[..n].copy_from_slice(&node.data[off..off + n]);
            file.offset += n as u64;
            Ok(n)
        }

        fn write(&self, file: &mut File, buf: &[u8]) -> Result<usize> {
            let inode = file.inode().ok_or(ErrorCode::Io)?;
            let new_size = {
                let mut nodes = self.nodes.lock();
                let node = nodes
                    .iter_mut()
                    .find(|n| n.inum == inode.inum)
                    .ok_or(ErrorCode::NotFound)?;
                let off = file.offset as usize;
                if node.data.len() < off + buf.len() {
                    node.data.resize(off + buf.len(), 0);
                }
                node.data[off..off + buf.len()].copy_from_slice(buf);
                node.data.len() as u64
            };
            inode.i.lock().sb.size = new_size;
            file.offset += buf.len() as u64;
            Ok(buf.len())
        }

        fn create(
            &self,
            vfs: &Arc<Vfs>,
            dir: &InodeRef,
            dentry: &DentryRef,
            _mode: u16,
        ) -> Result<()> {
            if dir.inum != ROOT_INUM {
                return Err(ErrorCode::NotFound);
            }
            let name = String::from(dentry.d.lock().name());
            let inum = self.next_inum.fetch_add(1, Ordering::SeqCst) as u64;
            self.nodes.lock().push(RamNode {
                inum,
                name,
                data: Vec::new(),
            });
            let inode = vfs.get_inode(&dir.fs(), inum)?;
            vfs.dcache.set_inode(dentry, inode);
            Ok(())
        }

        fn unlink(&self, dir: &InodeRef, dentry: &DentryRef) -> Result<()> {
            if dir.inum != ROOT_INUM {
                return Err(ErrorCode::NotFound);
            }
            let name = String::from(dentry.d.lock().name());
            let mut nodes = self.nodes.lock();
            let before = nodes.len();
            nodes.retain(|n| n.name != name);
            if nodes.len() == before {
                return Err(ErrorCode::NotFound);
            }
            Ok(())
        }
    }
}

// ── UHCI emulation ──────────────────────────────

pub mod uhci_emu {
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use crate::drivers::usb::uhci::{
        read_qh, read_td, PortIo, PTR_QH, PTR_T, PTR_VF, REG_FLBASEADD, REG_USBCMD, REG_USBSTS,
        CMD_HCRESET, CMD_RS, STS_USBERRINT, STS_USBINT, TD_PID_IN, TD_PID_OUT, TD_PID_SETUP,
        TD_STATUS_ACTIVE, TD_STATUS_IOC, TD_STATUS_STALLED,
    };
    use crate::memory::address::PhysAddr;
    use crate::memory::physical::PhysAllocator;
    use crate::sync::Spinlock;

    /// Emulated I/O register file with UHCI write semantics: USBSTS is
    /// write-one-to-clear and HCRESET self-completes.
    pub struct FakePortIo {
        regs: Spinlock<[u16; 16]>,
        flbase: Spinlock<u32>,
    }

    impl FakePortIo {
        pub fn new() -> Arc<FakePortIo> {
            Arc::new(FakePortIo {
                regs: Spinlock::new([0u16; 16]),
                flbase: Spinlock::new(0),
            })
        }

        pub fn raise_status(&self, bits: u16) {
            self.regs.lock()[(REG_USBSTS / 2) as usize] |= bits;
        }

        pub fn set_port(&self, reg: u16, value: u16) {
            self.regs.lock()[(reg / 2) as usize] = value;
        }
    }

    impl PortIo for FakePortIo {
        fn read16(&self, offset: u16) -> u16 {
            self.regs.lock()[(offset / 2) as usize]
        }

        fn write16(&self, offset: u16, value: u16) {
            let mut regs = self.regs.lock();
            let idx = (offset / 2) as usize;
            if offset == REG_USBSTS {
                regs[idx] &= !value;
            } else if offset == REG_USBCMD {
                regs[idx] = value & !CMD_HCRESET;
            } else {
                regs[idx] = value;
            }
        }

        fn read32(&self, offset: u16) -> u32 {
            assert_eq!(offset, REG_FLBASEADD);
            *self.flbase.lock()
        }

        fn write32(&self, offset: u16, value: u32) {
            assert_eq!(offset, REG_FLBASEADD);
            *self.flbase.lock() = value;
        }
    }

    /// A scripted device on the emulated bus. `read` returning `None`
    /// models a NAK (the TD stays active).
    pub trait FakeUsbDevice: Send + Sync {
        fn address(&self) -> u8;
        fn setup(&self, request: [u8; 8]);
        fn read(&self, endpoint: u8, maxlen: usize) -> Option<Vec<u8>>;
        fn write(&self, endpoint: u8, data: &[u8]) -> bool;
    }

    /// Walks the frame list like the host controller would: one pass over
    /// frame 0's QH lattice, executing every published TD chain.
    pub struct UhciEmulator {
        io: Arc<FakePortIo>,
        phys: Arc<PhysAllocator>,
        devices: Spinlock<Vec<Arc<dyn FakeUsbDevice>>>,
    }

    impl UhciEmulator {
        pub fn new(io: Arc<FakePortIo>, phys: Arc<PhysAllocator>) -> Arc<UhciEmulator> {
            Arc::new(UhciEmulator {
                io,
                phys,
                devices: Spinlock::new(Vec::new()),
            })
        }

        pub fn add_device(&self, dev: Arc<dyn FakeUsbDevice>) {
            self.devices.lock().push(dev);
        }

        fn device_at(&self, addr: u8) -> Option<Arc<dyn FakeUsbDevice>> {
            self.devices
                .lock()
                .iter()
                .find(|d| d.address() == addr)
                .cloned()
        }

        /// One pass over the first 32 frames (one full period of every
        /// bucket). Raises USBINT when a completed TD had
        /// interrupt-on-complete set, and the error-interrupt bit when a
        /// TD retired with errors.
        pub fn run_once(&self) {
            if self.io.read16(REG_USBCMD) & CMD_RS == 0 {
                return;
            }
            let flbase = self.io.read32(REG_FLBASEADD);

            let mut ioc = false;
            for frame in 0..32usize {
                let mut entry_bytes = [0u8; 4];
                self.phys
                    .copy_out(PhysAddr::new(flbase as u64), frame * 4, &mut entry_bytes);
                let mut ptr = u32::from_le_bytes(entry_bytes);

                let mut hops = 0;
                while ptr & PTR_T == 0 && hops < 64 {
                    hops += 1;
                    let addr = PhysAddr::new((ptr & !0xF) as u64);
                    if ptr & PTR_QH != 0 {
                        let (head, element) = read_qh(&self.phys, addr);
                        if element & PTR_T == 0 && element & PTR_QH == 0 {
                            ioc |= self.run_chain(addr, element);
                        }
                        ptr = head;
                    } else {
                        break;
                    }
                }
            }

            if ioc {
                self.io.raise_status(STS_USBINT);
            }
        }

        /// Execute the TD chain published at a QH's element pointer,
        /// advancing the element as the controller would.
        fn run_chain(&self, qh: PhysAddr, first: u32) -> bool {
            let mut ioc = false;
            let mut element = first;
            let mut steps = 0;
            while element & PTR_T == 0 && steps < 256 {
                steps += 1;
                let td = PhysAddr::new((element & !0xF) as u64);
                let (link, status, token, buffer) = read_td(&self.phys, td);
                if status & TD_STATUS_ACTIVE == 0 {
                    break;
                }

                let pid = token & 0xFF;
                let dev_addr = ((token >> 8) & 0x7F) as u8;
                let endpoint = ((token >> 15) & 0xF) as u8;
                let maxlen = (token >> 21).wrapping_add(1) as usize & 0x7FF;

                let dev = match self.device_at(dev_addr) {
                    Some(d) => d,
                    None => {
                        self.finish_td(td, status, TD_STATUS_STALLED, 0);
                        self.io.raise_status(STS_USBERRINT);
                        break;
                    }
                };

                let mut short_packet = false;
                let actual = match pid {
                    TD_PID_SETUP => {
                        let mut req = [0u8; 8];
                        self.phys
                            .copy_out(PhysAddr::new(buffer as u64), 0, &mut req);
                        dev.setup(req);
                        8
                    }
                    TD_PID_OUT => {
                        let mut data = alloc::vec![0u8; maxlen];
                        self.phys
                            .copy_out(PhysAddr::new(buffer as u64), 0, &mut data);
                        if !dev.write(endpoint, &data) {
                            break; // NAK: TD stays active
                        }
                        maxlen
                    }
                    TD_PID_IN => match dev.read(endpoint, maxlen) {
                        None => break, // NAK
                        Some(data) => {
                            let n = data.len().min(maxlen);
                            self.phys.copy_in(PhysAddr::new(buffer as u64), 0, &data[..n]);
                            short_packet = n < maxlen;
                            n
                        }
                    },
                    _ => {
                        self.finish_td(td, status, TD_STATUS_STALLED, 0);
                        break;
                    }
                };

                self.finish_td(td, status, 0, actual);
                if status & TD_STATUS_IOC != 0 {
                    ioc = true;
                }

                element = link & !PTR_VF;
                self.phys
                    .copy_in(qh, 4, &element.to_le_bytes());
                if short_packet {
                    break;
                }
            }
            ioc
        }

        /// Retire a TD: clear Active, set error bits, store the actual
        /// length (n-1 encoding; 0x7FF for nothing).
        fn finish_td(&self, td: PhysAddr, status: u32, error_bits: u32, actual: usize) {
            let actlen = if actual == 0 {
                0x7FF
            } else {
                (actual as u32 - 1) & 0x7FF
            };
            let new_status =
                (status & !(TD_STATUS_ACTIVE | 0x7FF)) | error_bits | actlen;
            self.phys
                .copy_in(td, 4, &new_status.to_le_bytes());
        }
    }

    // ── Scripted devices ────────────────────────

    /// Minimal control-endpoint device answering GET_MAX_LUN.
    pub struct MaxLunDevice {
        addr: u8,
        lun: u8,
        reply: Spinlock<Option<Vec<u8>>>,
    }

    impl MaxLunDevice {
        pub fn new(addr: u8, lun: u8) -> Arc<MaxLunDevice> {
            Arc::new(MaxLunDevice {
                addr,
                lun,
                reply: Spinlock::new(None),
            })
        }
    }

    impl FakeUsbDevice for MaxLunDevice {
        fn address(&self) -> u8 {
            self.addr
        }

        fn setup(&self, request: [u8; 8]) {
            // bmRequestType 0xA1, bRequest 0xFE: class GET_MAX_LUN.
            if request[0] == 0xA1 && request[1] == 0xFE {
                *self.reply.lock() = Some(alloc::vec![self.lun]);
            } else {
                *self.reply.lock() = Some(Vec::new());
            }
        }

        fn read(&self, _endpoint: u8, maxlen: usize) -> Option<Vec<u8>> {
            let mut reply = self.reply.lock();
            match reply.take() {
                Some(mut data) => {
                    data.truncate(maxlen);
                    Some(data)
                }
                // Zero-length handshake.
                None => Some(Vec::new()),
            }
        }

        fn write(&self, _endpoint: u8, _data: &[u8]) -> bool {
            true
        }
    }

    /// Scripted bulk-only mass-storage device: consumes CBWs, produces a
    /// data phase plus CSW for the commands the tests issue.
    pub struct BbbDevice {
        addr: u8,
        ep_in: u8,
        ep_out: u8,
        state: Spinlock<BbbState>,
    }

    struct BbbState {
        ctrl_reply: Option<Vec<u8>>,
        data_q: Vec<u8>,
        csw_q: Option<Vec<u8>>,
        max_lun: u8,
        /// Status to report in the next CSW.
        next_status: u8,
        /// Corrupt the next CSW's tag (error-path testing).
        corrupt_next_tag: bool,
    }

    impl BbbDevice {
        pub fn new(addr: u8, ep_in: u8, ep_out: u8, max_lun: u8) -> Arc<BbbDevice> {
            Arc::new(BbbDevice {
                addr,
                ep_in,
                ep_out,
                state: Spinlock::new(BbbState {
                    ctrl_reply: None,
                    data_q: Vec::new(),
                    csw_q: None,
                    max_lun,
                    next_status: 0,
                    corrupt_next_tag: false,
                }),
            })
        }

        pub fn fail_next(&self, status: u8) {
            self.state.lock().next_status = status;
        }

        pub fn corrupt_next_tag(&self) {
            self.state.lock().corrupt_next_tag = true;
        }

        /// Deterministic data pattern for READ commands.
        pub fn pattern(len: usize) -> Vec<u8> {
            (0..len).map(|i| (i % 251) as u8).collect()
        }
    }

    impl FakeUsbDevice for BbbDevice {
        fn address(&self) -> u8 {
            self.addr
        }

        fn setup(&self, request: [u8; 8]) {
            let mut st = self.state.lock();
            if request[0] == 0xA1 && request[1] == 0xFE {
                st.ctrl_reply = Some(alloc::vec![st.max_lun]);
            } else {
                st.ctrl_reply = Some(Vec::new());
            }
        }

        fn read(&self, endpoint: u8, maxlen: usize) -> Option<Vec<u8>> {
            let mut st = self.state.lock();
            if endpoint == 0 {
                return match st.ctrl_reply.take() {
                    Some(mut data) => {
                        data.truncate(maxlen);
                        Some(data)
                    }
                    None => Some(Vec::new()),
                };
            }
            if endpoint != self.ep_in {
                return None;
            }
            if !st.data_q.is_empty() {
                let n = maxlen.min(st.data_q.len());
                let out: Vec<u8> = st.data_q.drain(..n).collect();
                return Some(out);
            }
            st.csw_q.take().map(|mut csw| {
                csw.truncate(maxlen);
                csw
            })
        }

        fn write(&self, endpoint: u8, data: &[u8]) -> bool {
            if endpoint == 0 {
                return true; // control handshake
            }
            if endpoint != self.ep_out {
                return false;
            }
            let mut st = self.state.lock();
            if data.len() < 31 || &data[..4] != b"USBC" {
                return true;
            }
            // Parse the CBW.
            let tag = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
            let dtl = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
            let opcode = data[15];

            match opcode {
                // READ(10): produce the requested bytes.
                0x28 => st.data_q = Self::pattern(dtl),
                // TEST UNIT READY and everything else: no data phase.
                _ => st.data_q.clear(),
            }

            let mut csw = Vec::with_capacity(13);
            csw.extend_from_slice(b"USBS");
            let reported_tag = if st.corrupt_next_tag {
                st.corrupt_next_tag = false;
                tag.wrapping_add(0x1000)
            } else {
                tag
            };
            csw.extend_from_slice(&reported_tag.to_le_bytes());
            csw.extend_from_slice(&0u32.to_le_bytes());
            csw.push(st.next_status);
            st.next_status = 0;
            st.csw_q = Some(csw);
            true
        }
    }
}
