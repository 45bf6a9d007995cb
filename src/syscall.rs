//! Syscall dispatch.
//!
//! The ABI is tiny and fixed: 0 exit, 1 read, 2 write, 3 map, 4 unmap.
//! Arguments arrive as raw words from the trap path; results are returned
//! as non-negative values, errors as negative errno.

use crate::errno::{ErrorCode, Result};
use crate::fs::file::File;
use crate::fs::vfs;
use crate::memory::address::VirtAddr;
use crate::memory::uaccess;
use crate::memory::vmspace::{AreaFlags, USER_MAP_BASE};
use crate::task::thread::{self, ThreadRef};
use crate::PAGE_SIZE;

pub const SYS_EXIT: u64 = 0;
pub const SYS_READ: u64 = 1;
pub const SYS_WRITE: u64 = 2;
pub const SYS_MAP: u64 = 3;
pub const SYS_UNMAP: u64 = 4;

/// Handle one syscall for `thread`. Returns the ABI result word.
pub fn dispatch(thread: &ThreadRef, num: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    let res = match num {
        SYS_EXIT => sys_exit(thread),
        SYS_READ => sys_read(thread, a1 as u32, a2, a3),
        SYS_WRITE => sys_write(thread, a1 as u32, a2, a3),
        SYS_MAP => sys_map(thread, a1),
        SYS_UNMAP => sys_unmap(thread, a1, a2),
        _ => Err(ErrorCode::Unsupported),
    };
    match res {
        Ok(v) => v as i64,
        Err(e) => e.as_neg(),
    }
}

fn sys_exit(thread: &ThreadRef) -> Result<u64> {
    thread::thread_exit(thread);
    // The trap path re-enters schedule(); this thread is never selected
    // again.
    Ok(0)
}

/// Borrow one of the standard handles for the duration of an I/O call.
fn with_handle<R>(
    thread: &ThreadRef,
    fd: u32,
    f: impl FnOnce(&mut File) -> Result<R>,
) -> Result<R> {
    let mut handle = {
        let mut info = thread.info.lock();
        let slot = match fd {
            0 => &mut info.stdin,
            1 => &mut info.stdout,
            2 => &mut info.stderr,
            _ => return Err(ErrorCode::NotFound),
        };
        slot.take().ok_or(ErrorCode::NotFound)?
    };
    let res = f(&mut handle);
    let mut info = thread.info.lock();
    let slot = match fd {
        0 => &mut info.stdin,
        1 => &mut info.stdout,
        2 => &mut info.stderr,
        _ => unreachable!(),
    };
    *slot = Some(handle);
    res
}

fn sys_read(thread: &ThreadRef, fd: u32, buf: u64, len: u64) -> Result<u64> {
    let len = len as usize;
    let mut tmp = alloc::vec![0u8; len];
    let n = with_handle(thread, fd, |file| vfs::read(file, &mut tmp))?;

    let vmspace = thread.vmspace.lock().clone().ok_or(ErrorCode::BadAddress)?;
    let mut vs = vmspace.lock();
    uaccess::copy_to_user(&mut vs, VirtAddr::new(buf), &tmp[..n])?;
    Ok(n as u64)
}

fn sys_write(thread: &ThreadRef, fd: u32, buf: u64, len: u64) -> Result<u64> {
    let len = len as usize;
    let mut tmp = alloc::vec![0u8; len];
    {
        let vmspace = thread.vmspace.lock().clone().ok_or(ErrorCode::BadAddress)?;
        let mut vs = vmspace.lock();
        uaccess::copy_from_user(&mut vs, VirtAddr::new(buf), &mut tmp)?;
    }
    let n = with_handle(thread, fd, |file| vfs::write(file, &tmp))?;
    Ok(n as u64)
}

fn sys_map(thread: &ThreadRef, len: u64) -> Result<u64> {
    if len == 0 {
        return Err(ErrorCode::BadLength);
    }
    let len = (len + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
    let vmspace = thread.vmspace.lock().clone().ok_or(ErrorCode::BadAddress)?;
    let mut vs = vmspace.lock();
    let base = vs
        .find_free_range(USER_MAP_BASE, len)
        .ok_or(ErrorCode::OutOfMemory)?;
    vs.map_area(
        base,
        len,
        AreaFlags::READ | AreaFlags::WRITE | AreaFlags::USER | AreaFlags::ALLOC,
        None,
    )?;
    Ok(base.as_u64())
}

fn sys_unmap(thread: &ThreadRef, addr: u64, len: u64) -> Result<u64> {
    let vmspace = thread.vmspace.lock().clone().ok_or(ErrorCode::BadAddress)?;
    let mut vs = vmspace.lock();
    vs.unmap_area(VirtAddr::new(addr), len)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use crate::fs::Vfs;
    use crate::memory::vmspace::VmSpace;
    use crate::sync::Spinlock;
    use crate::task::thread::{Thread, ThreadFlags};
    use crate::test_support::ramfs::RamFs;
    use crate::test_support::{test_arena, RecordingConsole, TestMach};

    fn user_thread() -> (ThreadRef, Arc<Vfs>, Arc<RecordingConsole>) {
        let vfs = Vfs::new(16, 16);
        vfs.register_filesystem("ramfs", RamFs::build(&[("greeting", b"hi there")]));
        vfs.mount("ramfs", None, "/").unwrap();

        let console = Arc::new(RecordingConsole::new(b"typed input".to_vec()));

        let t = Thread::new("init", ThreadFlags::empty());
        let md = Arc::new(TestMach::new());
        let vs = VmSpace::new(md, test_arena(64)).unwrap();
        *t.vmspace.lock() = Some(Arc::new(Spinlock::new(vs)));
        {
            // Wire the info block directly; `vfs::init_thread` does the
            // same through the registered system console.
            let mut info = t.info.lock();
            info.cwd = Some(vfs::open(&vfs, None, "/").unwrap());
            info.stdin = Some(File::from_device(console.clone()));
            info.stdout = Some(File::from_device(console.clone()));
            info.stderr = Some(File::from_device(console.clone()));
        }
        (t, vfs, console)
    }

    #[test]
    fn map_write_read_unmap() {
        let (t, _vfs, _console) = user_thread();
        let addr = dispatch(&t, SYS_MAP, 8192, 0, 0);
        assert!(addr > 0);
        assert_eq!(addr as u64 % PAGE_SIZE as u64, 0);

        // The mapping is usable memory.
        let vmspace = t.vmspace.lock().clone().unwrap();
        {
            let mut vs = vmspace.lock();
            uaccess::copy_to_user(&mut vs, VirtAddr::new(addr as u64), b"ping").unwrap();
            let mut back = [0u8; 4];
            uaccess::copy_from_user(&mut vs, VirtAddr::new(addr as u64), &mut back).unwrap();
            assert_eq!(&back, b"ping");
        }

        assert_eq!(dispatch(&t, SYS_UNMAP, addr as u64, 8192, 0), 0);
        // Unmapped: further access faults as a bad address.
        assert_eq!(
            dispatch(&t, SYS_UNMAP, addr as u64, 8192, 0),
            ErrorCode::BadAddress.as_neg()
        );
    }

    #[test]
    fn write_to_stdout_reaches_console() {
        let (t, _vfs, console) = user_thread();
        let buf = dispatch(&t, SYS_MAP, 4096, 0, 0) as u64;
        let vmspace = t.vmspace.lock().clone().unwrap();
        uaccess::copy_to_user(
            &mut vmspace.lock(),
            VirtAddr::new(buf),
            b"hello console",
        )
        .unwrap();

        let n = dispatch(&t, SYS_WRITE, 1, buf, 13);
        assert_eq!(n, 13);
        assert_eq!(console.written(), b"hello console");
    }

    #[test]
    fn read_from_stdin_copies_into_user_memory() {
        let (t, _vfs, _console) = user_thread();
        let buf = dispatch(&t, SYS_MAP, 4096, 0, 0) as u64;
        let n = dispatch(&t, SYS_READ, 0, buf, 5);
        assert_eq!(n, 5);

        let vmspace = t.vmspace.lock().clone().unwrap();
        let mut back = [0u8; 5];
        uaccess::copy_from_user(&mut vmspace.lock(), VirtAddr::new(buf), &mut back).unwrap();
        assert_eq!(&back, b"typed");
    }

    #[test]
    fn bad_fd_and_bad_syscall_number() {
        let (t, _vfs, _console) = user_thread();
        let buf = dispatch(&t, SYS_MAP, 4096, 0, 0) as u64;
        assert_eq!(
            dispatch(&t, SYS_READ, 7, buf, 1),
            ErrorCode::NotFound.as_neg()
        );
        assert_eq!(
            dispatch(&t, 99, 0, 0, 0),
            ErrorCode::Unsupported.as_neg()
        );
    }

    #[test]
    fn exit_marks_the_thread_zombie() {
        let (t, _vfs, _console) = user_thread();
        assert_eq!(dispatch(&t, SYS_EXIT, 0, 0, 0), 0);
        assert!(t.is_zombie());
    }
}
