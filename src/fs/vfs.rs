//! VFS operations: path walk, open, read/write, seek, readdir, unlink.
//!
//! The path walk funnels every component through the dentry cache. A
//! pending entry (another thread is resolving the same name) makes the walk
//! yield and retry; a negative entry short-circuits to `NotFound` without
//! touching the filesystem driver.

use alloc::string::String;
use alloc::sync::Arc;

use crate::drivers;
use crate::errno::{ErrorCode, Result};
use crate::fs::dcache::DentryRef;
use crate::fs::file::{File, FileBacking};
use crate::fs::mount::FileType;
use crate::fs::Vfs;
use crate::task::scheduler;
use crate::task::thread::ThreadRef;

/// Split a path into `(parent, last component)`.
/// `"/sys/init.bin"` → `("/sys", "init.bin")`; `"/a"` → `("/", "a")`.
pub fn split_parent_name(path: &str) -> Result<(&str, &str)> {
    let path = path.trim_end_matches('/');
    if path.is_empty() || path == "/" {
        return Err(ErrorCode::BadAddress);
    }
    match path.rfind('/') {
        Some(0) => Ok(("/", &path[1..])),
        Some(pos) => Ok((&path[..pos], &path[pos + 1..])),
        None => Ok(("", path)),
    }
}

/// Resolve one component under `parent`, becoming the resolver on a cache
/// miss and retrying while someone else resolves the same name.
fn lookup_component(vfs: &Arc<Vfs>, parent: &DentryRef, name: &str) -> Result<DentryRef> {
    loop {
        let d = match vfs.dcache.lookup(parent, name) {
            // Pending: another caller is filling the entry in. Retry.
            None => {
                scheduler::yield_now();
                continue;
            }
            Some(d) => d,
        };

        if d.is_negative() {
            return Err(ErrorCode::NotFound);
        }
        if d.inode().is_some() {
            return Ok(d);
        }

        // Fresh miss: this caller owns the resolution.
        let parent_inode = parent.inode().ok_or(ErrorCode::NotFound)?;
        if parent_inode.i.lock().sb.file_type != FileType::Directory {
            vfs.dcache.unlink(&d);
            return Err(ErrorCode::NotFound);
        }
        match parent_inode.ops().lookup(vfs, &parent_inode, name) {
            Ok(inode) => {
                vfs.dcache.set_inode(&d, inode);
                return Ok(d);
            }
            Err(e) => {
                // Cache the absence so repeat lookups stay cheap.
                vfs.dcache.unlink(&d);
                return Err(e);
            }
        }
    }
}

/// Walk `path` to a referenced dentry. Relative paths start at `cwd`;
/// absolute paths (and walks without a cwd) start at the root mount.
pub fn lookup(vfs: &Arc<Vfs>, cwd: Option<&File>, path: &str) -> Result<DentryRef> {
    let mut cur = if path.starts_with('/') || cwd.is_none() {
        vfs.root_fs().ok_or(ErrorCode::NotFound)?.root_dentry()
    } else {
        cwd.and_then(|f| f.dentry().cloned())
            .ok_or(ErrorCode::NotFound)?
    };

    for comp in path.split('/') {
        if comp.is_empty() || comp == "." {
            continue;
        }
        cur = lookup_component(vfs, &cur, comp)?;
    }
    Ok(cur)
}

/// Open a path into a file handle.
pub fn open(vfs: &Arc<Vfs>, cwd: Option<&File>, path: &str) -> Result<File> {
    let dentry = lookup(vfs, cwd, path)?;
    let inode = dentry.inode().ok_or(ErrorCode::NotFound)?;
    let mut file = File::from_dentry(dentry);
    let ops = inode.ops();
    ops.fill_file(&inode, &mut file);
    Ok(file)
}

/// Read from an open file: devices go to the driver, directories emit
/// VFS_DIRENT records, regular files go through the inode ops.
pub fn read(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    match &file.backing {
        FileBacking::Device(dev) => dev.ops().read(buf),
        FileBacking::Dentry(_) => {
            let inode = file.inode().ok_or(ErrorCode::Io)?;
            let ops = inode.ops();
            if inode.i.lock().sb.file_type == FileType::Directory {
                ops.readdir(file, buf)
            } else {
                ops.read(file, buf)
            }
        }
    }
}

/// Write to an open file.
pub fn write(file: &mut File, buf: &[u8]) -> Result<usize> {
    match &file.backing {
        FileBacking::Device(dev) => dev.ops().write(buf),
        FileBacking::Dentry(_) => {
            let inode = file.inode().ok_or(ErrorCode::Io)?;
            let ops = inode.ops();
            if inode.i.lock().sb.file_type == FileType::Directory {
                return Err(ErrorCode::Unsupported);
            }
            ops.write(file, buf)
        }
    }
}

/// Position the file offset.
pub fn seek(file: &mut File, offset: u64) -> Result<()> {
    if file.device().is_some() {
        return Err(ErrorCode::Unsupported);
    }
    file.offset = offset;
    Ok(())
}

/// Remove the entry named by `path` and mark its dentry negative.
pub fn unlink(vfs: &Arc<Vfs>, cwd: Option<&File>, path: &str) -> Result<()> {
    let dentry = lookup(vfs, cwd, path)?;
    let parent = dentry
        .d
        .lock()
        .parent
        .clone()
        .ok_or(ErrorCode::Unsupported)?;
    let dir_inode = parent.inode().ok_or(ErrorCode::Io)?;
    dir_inode.ops().unlink(&dir_inode, &dentry)?;
    vfs.dcache.unlink(&dentry);
    Ok(())
}

/// Create `path` in its parent directory and open it.
pub fn create(vfs: &Arc<Vfs>, cwd: Option<&File>, path: &str, mode: u16) -> Result<File> {
    let (parent_path, name) = split_parent_name(path)?;
    let parent = if parent_path.is_empty() {
        lookup(vfs, cwd, ".")?
    } else {
        lookup(vfs, cwd, parent_path)?
    };
    let dir_inode = parent.inode().ok_or(ErrorCode::NotFound)?;
    if dir_inode.i.lock().sb.file_type != FileType::Directory {
        return Err(ErrorCode::NotFound);
    }

    let dentry = loop {
        match vfs.dcache.lookup(&parent, name) {
            None => scheduler::yield_now(),
            Some(d) => break d,
        }
    };
    if dentry.inode().is_some() {
        // Already present: behave like open.
        return Ok(File::from_dentry(dentry));
    }
    match dir_inode.ops().create(vfs, &dir_inode, &dentry, mode) {
        Ok(()) => Ok(File::from_dentry(dentry)),
        Err(e) => {
            vfs.dcache.unlink(&dentry);
            Err(e)
        }
    }
}

/// Read file bytes through a dentry at an explicit offset, without
/// disturbing any caller-visible handle. Used by the page-fill path.
pub fn kread(dentry: &DentryRef, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut f = File::from_dentry(dentry.clone());
    f.offset = offset;
    read(&mut f, buf)
}

/// Wire up a new thread's info block: working directory from the parent
/// (or the filesystem root) and the standard handles onto the console.
/// Kernel threads carry no handles.
pub fn init_thread(vfs: &Arc<Vfs>, thread: &ThreadRef, parent: Option<&ThreadRef>) -> Result<()> {
    if thread.is_kernel() {
        return Ok(());
    }

    let cwd = match parent {
        Some(p) => p.info.lock().cwd.clone(),
        None => open(vfs, None, "/").ok(),
    };

    let console = drivers::console();
    let mut info = thread.info.lock();
    info.cwd = cwd;
    info.stdin = console.clone().map(File::from_device);
    info.stdout = console.clone().map(File::from_device);
    info.stderr = console.map(File::from_device);
    Ok(())
}

/// Read a whole file into a vector (boot-time convenience).
pub fn read_file_to_vec(vfs: &Arc<Vfs>, path: &str) -> Result<alloc::vec::Vec<u8>> {
    let mut file = open(vfs, None, path)?;
    let size = file
        .inode()
        .map(|i| i.i.lock().sb.size as usize)
        .unwrap_or(0);
    let mut out = alloc::vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = read(&mut file, &mut out[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    out.truncate(done);
    Ok(out)
}

/// Human-readable path of a dentry, walking parents up to the root.
pub fn dentry_path(d: &DentryRef) -> String {
    let mut parts = alloc::vec::Vec::new();
    let mut cur = d.entry().clone();
    loop {
        let data = cur.d.lock();
        let name = String::from(data.name());
        let parent = data.parent.clone();
        drop(data);
        match parent {
            Some(p) => {
                parts.push(name);
                cur = p;
            }
            None => break,
        }
    }
    let mut path = String::from("/");
    for (i, part) in parts.iter().rev().enumerate() {
        if i > 0 {
            path.push('/');
        }
        path.push_str(part);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::parse_dirent;
    use crate::test_support::ramfs::RamFs;

    fn fixture() -> Arc<Vfs> {
        let vfs = Vfs::new(16, 16);
        vfs.register_filesystem(
            "ramfs",
            RamFs::build(&[("motd", b"hello, world"), ("blob", &[7u8; 100])]),
        );
        vfs.mount("ramfs", None, "/").unwrap();
        vfs
    }

    #[test]
    fn open_and_read_a_file() {
        let vfs = fixture();
        let mut f = open(&vfs, None, "/motd").unwrap();
        let mut buf = [0u8; 64];
        let n = read(&mut f, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, world");
        // Offset advanced to EOF; the next read is empty.
        assert_eq!(read(&mut f, &mut buf).unwrap(), 0);
    }

    #[test]
    fn seek_then_read() {
        let vfs = fixture();
        let mut f = open(&vfs, None, "/motd").unwrap();
        seek(&mut f, 7).unwrap();
        let mut buf = [0u8; 16];
        let n = read(&mut f, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn missing_path_is_not_found_and_cached_negative() {
        let vfs = fixture();
        assert_eq!(
            open(&vfs, None, "/nope").unwrap_err(),
            ErrorCode::NotFound
        );
        let lookups_before = RamFs::lookup_count(&vfs.root_fs().unwrap());
        assert_eq!(
            open(&vfs, None, "/nope").unwrap_err(),
            ErrorCode::NotFound
        );
        // Second miss was served by the negative dentry.
        assert_eq!(
            RamFs::lookup_count(&vfs.root_fs().unwrap()),
            lookups_before
        );
    }

    #[test]
    fn repeated_opens_hit_the_dcache() {
        let vfs = fixture();
        let f1 = open(&vfs, None, "/motd").unwrap();
        let lookups = RamFs::lookup_count(&vfs.root_fs().unwrap());
        let f2 = open(&vfs, None, "/motd").unwrap();
        assert_eq!(RamFs::lookup_count(&vfs.root_fs().unwrap()), lookups);
        assert!(crate::fs::dcache::DentryRef::ptr_eq(
            f1.dentry().unwrap(),
            f2.dentry().unwrap()
        ));
    }

    #[test]
    fn readdir_emits_wire_dirents() {
        let vfs = fixture();
        let mut dir = open(&vfs, None, "/").unwrap();
        let mut buf = [0u8; 256];
        let n = read(&mut dir, &mut buf).unwrap();
        assert!(n > 0);

        let mut names = alloc::vec::Vec::new();
        let mut off = 0;
        while off < n {
            let (_, inum, name, used) = parse_dirent(&buf[off..n]).unwrap();
            assert!(inum >= 2);
            names.push(name);
            off += used;
        }
        names.sort();
        assert_eq!(names, ["blob", "motd"]);
    }

    #[test]
    fn unlink_removes_and_negativizes() {
        let vfs = fixture();
        unlink(&vfs, None, "/motd").unwrap();
        assert_eq!(
            open(&vfs, None, "/motd").unwrap_err(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn create_open_write_read_roundtrip() {
        let vfs = fixture();
        let mut f = create(&vfs, None, "/notes", 0o644).unwrap();
        assert_eq!(write(&mut f, b"abc").unwrap(), 3);
        let mut g = open(&vfs, None, "/notes").unwrap();
        let mut buf = [0u8; 8];
        let n = read(&mut g, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn dentry_path_reconstruction() {
        let vfs = fixture();
        let f = open(&vfs, None, "/motd").unwrap();
        assert_eq!(dentry_path(f.dentry().unwrap()), "/motd");
    }

    #[test]
    fn read_file_to_vec_collects_everything() {
        let vfs = fixture();
        let data = read_file_to_vec(&vfs, "/blob").unwrap();
        assert_eq!(data.len(), 100);
        assert!(data.iter().all(|&b| b == 7));
    }

    #[test]
    fn init_thread_wires_cwd_and_console_handles() {
        use crate::task::thread::{Thread, ThreadFlags};
        use crate::test_support::RecordingConsole;

        let vfs = fixture();
        crate::drivers::set_console(Arc::new(RecordingConsole::new(alloc::vec::Vec::new())));

        let t = Thread::new("init", ThreadFlags::empty());
        init_thread(&vfs, &t, None).unwrap();
        {
            let info = t.info.lock();
            assert!(info.cwd.is_some());
            assert!(info.stdin.is_some());
            assert!(info.stdout.is_some());
            assert!(info.stderr.is_some());
        }

        // A child inherits the parent's working directory handle.
        let child = Thread::new("child", ThreadFlags::empty());
        init_thread(&vfs, &child, Some(&t)).unwrap();
        assert!(child.info.lock().cwd.is_some());

        // Kernel threads carry no handles at all.
        let k = Thread::new("kworker", ThreadFlags::KTHREAD);
        init_thread(&vfs, &k, None).unwrap();
        let kinfo = k.info.lock();
        assert!(kinfo.stdin.is_none() && kinfo.cwd.is_none());
    }
}
