#![cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]

//! # tfs-fuse
//!
//! Kernel mount of a tfs filesystem.
//!
//! Requests are forwarded to the inode-addressed operations of
//! [`tfs_fs::Fs`]; errors become their POSIX errno. A background thread
//! flushes the filesystem periodically while mounted.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tfs_fs::Ctx;

/// Directory offsets 1 and 2 belong to `.` and `..`
const DOT_ENTRIES: i64 = 2;

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub fsname: String,
    pub allow_other: bool,
    pub flush_interval: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fsname: "tfs".to_string(),
            allow_other: false,
            flush_interval: Duration::from_secs(5),
        }
    }
}

fn system_time(ns: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ns)
}

fn time_ns(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Filesystem position for a kernel directory offset
fn dir_pos(offset: i64) -> u64 {
    (offset - DOT_ENTRIES).max(0) as u64
}

/// Kernel directory offset after the entry ending at `pos`
fn dir_offset(pos: u64) -> i64 {
    pos as i64 + DOT_ENTRIES
}

fn caller(uid: u32, gid: u32, pid: u32) -> Ctx {
    Ctx::new(uid, gid, pid)
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant, SystemTime};

    use fuser::{
        FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
        Request, TimeOrNow,
    };
    use libc::c_int;
    use tfs_config::{log_fs_debug, log_fs_info, log_fs_warn};
    use tfs_fs::meta::{S_IFDIR, S_IFLNK, S_IFMT};
    use tfs_fs::{Attr, Entry, Fs, FsError, SetAttr, ROOT_INO};

    use super::{caller, dir_offset, dir_pos, system_time, time_ns, MountOptions};

    const TTL: Duration = Duration::from_secs(1);
    const READDIR_BATCH: usize = 64;

    fn file_type(mode: u32) -> FileType {
        match mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
            m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
            m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
            m if m == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::RegularFile,
        }
    }

    fn file_attr(attr: &Attr) -> FileAttr {
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: system_time(attr.atime_ns),
            mtime: system_time(attr.mtime_ns),
            ctime: system_time(attr.ctime_ns),
            crtime: system_time(attr.ctime_ns),
            kind: file_type(attr.mode),
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            flags: 0,
            blksize: tfs_fs::BLOCK_SIZE as u32,
        }
    }

    fn time_or_now(time: Option<TimeOrNow>) -> Option<u64> {
        time.map(|t| match t {
            TimeOrNow::SpecificTime(at) => time_ns(at),
            TimeOrNow::Now => time_ns(SystemTime::now()),
        })
    }

    fn ctx(req: &Request<'_>) -> tfs_fs::Ctx {
        caller(req.uid(), req.gid(), req.pid())
    }

    fn errno(op: &'static str, err: FsError) -> c_int {
        match err {
            FsError::NotFound | FsError::Exists | FsError::NoData => {}
            ref other => log_fs_debug!("operation failed", op = op, error = other.to_string()),
        }
        err.errno()
    }

    fn reply_entry(op: &'static str, result: tfs_fs::Result<Entry>, reply: ReplyEntry) {
        match result {
            Ok(entry) => reply.entry(&TTL, &file_attr(&entry.attr), 0),
            Err(err) => reply.error(errno(op, err)),
        }
    }

    fn reply_empty(op: &'static str, result: tfs_fs::Result<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(op, err)),
        }
    }

    /// Bytes or their length, as the kernel asked for
    fn reply_xattr(data: &[u8], size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(data.len() as u32);
        } else if data.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(data);
        }
    }

    /// Kernel adapter over one filesystem.
    pub struct TfsFuse {
        fs: Arc<Fs>,
        options: MountOptions,
        stop: Arc<AtomicBool>,
    }

    impl TfsFuse {
        pub fn new(fs: Arc<Fs>, options: MountOptions) -> Self {
            Self {
                fs,
                options,
                stop: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Mount at `mountpoint` and serve until unmounted
        pub fn mount(self, mountpoint: &Path) -> anyhow::Result<()> {
            let mut opts = vec![
                fuser::MountOption::FSName(self.options.fsname.clone()),
                fuser::MountOption::Subtype("tfs".to_string()),
            ];
            if self.options.allow_other {
                opts.push(fuser::MountOption::AllowOther);
            }
            log_fs_info!("mounting", mountpoint = mountpoint.display().to_string());
            fuser::mount2(self, mountpoint, &opts)?;
            Ok(())
        }

        fn spawn_flusher(&self) {
            let fs = self.fs.clone();
            let stop = self.stop.clone();
            let interval = self.options.flush_interval;
            let spawned = thread::Builder::new()
                .name("tfs-flush".into())
                .spawn(move || {
                    let mut last = Instant::now();
                    while !stop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(100));
                        if last.elapsed() < interval {
                            continue;
                        }
                        last = Instant::now();
                        if let Err(err) = fs.flush() {
                            log_fs_warn!("periodic flush failed", error = err.to_string());
                        }
                    }
                });
            if let Err(err) = spawned {
                log_fs_warn!("no periodic flush", error = err.to_string());
            }
        }

        fn parent_of(&self, req: &Request<'_>, ino: u64) -> u64 {
            if ino == ROOT_INO {
                return ROOT_INO;
            }
            match self.fs.lookup(&ctx(req), ino, b"..") {
                Ok(entry) => {
                    let _ = self.fs.forget(entry.ino, 1);
                    entry.ino
                }
                Err(_) => ino,
            }
        }
    }

    impl Filesystem for TfsFuse {
        fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
            self.spawn_flusher();
            Ok(())
        }

        fn destroy(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Err(err) = self.fs.flush() {
                log_fs_warn!("final flush failed", error = err.to_string());
            }
            log_fs_info!("unmounted");
        }

        fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
            reply_entry("lookup", self.fs.lookup(&ctx(req), parent, name.as_bytes()), reply);
        }

        fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
            if let Err(err) = self.fs.forget(ino, nlookup) {
                log_fs_warn!("forget failed", ino = ino, error = err.to_string());
            }
        }

        fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
            match self.fs.getattr(ino) {
                Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
                Err(err) => reply.error(errno("getattr", err)),
            }
        }

        fn setattr(
            &mut self,
            req: &Request<'_>,
            ino: u64,
            mode: Option<u32>,
            uid: Option<u32>,
            gid: Option<u32>,
            size: Option<u64>,
            atime: Option<TimeOrNow>,
            mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let change = SetAttr {
                mode,
                uid,
                gid,
                size,
                atime_ns: time_or_now(atime),
                mtime_ns: time_or_now(mtime),
            };
            match self.fs.setattr(&ctx(req), ino, &change) {
                Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
                Err(err) => reply.error(errno("setattr", err)),
            }
        }

        fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
            match self.fs.readlink(ino) {
                Ok(target) => reply.data(&target),
                Err(err) => reply.error(errno("readlink", err)),
            }
        }

        fn mknod(
            &mut self,
            req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            mode: u32,
            umask: u32,
            rdev: u32,
            reply: ReplyEntry,
        ) {
            let mode = mode & !(umask & 0o777);
            let result = self
                .fs
                .mknod(&ctx(req), parent, name.as_bytes(), mode, rdev);
            reply_entry("mknod", result, reply);
        }

        fn mkdir(
            &mut self,
            req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            mode: u32,
            umask: u32,
            reply: ReplyEntry,
        ) {
            let mode = mode & !umask;
            let result = self.fs.mkdir(&ctx(req), parent, name.as_bytes(), mode);
            reply_entry("mkdir", result, reply);
        }

        fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            reply_empty("unlink", self.fs.unlink(&ctx(req), parent, name.as_bytes()), reply);
        }

        fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            reply_empty("rmdir", self.fs.rmdir(&ctx(req), parent, name.as_bytes()), reply);
        }

        fn symlink(
            &mut self,
            req: &Request<'_>,
            parent: u64,
            link_name: &OsStr,
            target: &Path,
            reply: ReplyEntry,
        ) {
            let result = self.fs.symlink(
                &ctx(req),
                parent,
                link_name.as_bytes(),
                target.as_os_str().as_bytes(),
            );
            reply_entry("symlink", result, reply);
        }

        fn rename(
            &mut self,
            req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            flags: u32,
            reply: ReplyEmpty,
        ) {
            // RENAME_NOREPLACE and RENAME_EXCHANGE are not supported
            if flags != 0 {
                reply.error(libc::EINVAL);
                return;
            }
            let result = self.fs.rename(
                &ctx(req),
                parent,
                name.as_bytes(),
                newparent,
                newname.as_bytes(),
            );
            reply_empty("rename", result, reply);
        }

        fn link(
            &mut self,
            req: &Request<'_>,
            ino: u64,
            newparent: u64,
            newname: &OsStr,
            reply: ReplyEntry,
        ) {
            let result = self.fs.link(&ctx(req), ino, newparent, newname.as_bytes());
            reply_entry("link", result, reply);
        }

        fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
            match self.fs.open(&ctx(req), ino, flags) {
                Ok(fh) => reply.opened(fh, 0),
                Err(err) => reply.error(errno("open", err)),
            }
        }

        fn read(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            match self.fs.read(fh, offset.max(0) as u64, size as usize) {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(errno("read", err)),
            }
        }

        fn write(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            match self.fs.write(fh, offset.max(0) as u64, data) {
                Ok(n) => reply.written(n as u32),
                Err(err) => reply.error(errno("write", err)),
            }
        }

        fn flush(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            _fh: u64,
            _lock_owner: u64,
            reply: ReplyEmpty,
        ) {
            reply.ok();
        }

        fn release(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            reply_empty("release", self.fs.release(fh), reply);
        }

        fn fsync(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            _fh: u64,
            _datasync: bool,
            reply: ReplyEmpty,
        ) {
            reply_empty("fsync", self.fs.flush(), reply);
        }

        fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
            match self.fs.opendir(&ctx(req), ino) {
                Ok(fh) => reply.opened(fh, 0),
                Err(err) => reply.error(errno("opendir", err)),
            }
        }

        fn readdir(
            &mut self,
            req: &Request<'_>,
            ino: u64,
            fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            if offset < 1 && reply.add(ino, 1, FileType::Directory, ".") {
                reply.ok();
                return;
            }
            if offset < 2 {
                let parent = self.parent_of(req, ino);
                if reply.add(parent, 2, FileType::Directory, "..") {
                    reply.ok();
                    return;
                }
            }
            let mut pos = dir_pos(offset);
            loop {
                let batch = match self.fs.readdir(fh, pos, READDIR_BATCH) {
                    Ok(batch) => batch,
                    Err(err) => {
                        reply.error(errno("readdir", err));
                        return;
                    }
                };
                if batch.is_empty() {
                    break;
                }
                for entry in batch {
                    let name = OsStr::from_bytes(&entry.name);
                    if reply.add(entry.ino, dir_offset(entry.offset), file_type(entry.mode), name) {
                        reply.ok();
                        return;
                    }
                    pos = entry.offset;
                }
            }
            reply.ok();
        }

        fn releasedir(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            _flags: i32,
            reply: ReplyEmpty,
        ) {
            reply_empty("releasedir", self.fs.releasedir(fh), reply);
        }

        fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
            match self.fs.statfs() {
                Ok(st) => reply.statfs(
                    st.blocks, st.bfree, st.bavail, 0, 0, st.bsize, st.namelen, st.bsize,
                ),
                Err(err) => reply.error(errno("statfs", err)),
            }
        }

        fn setxattr(
            &mut self,
            req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            value: &[u8],
            flags: i32,
            _position: u32,
            reply: ReplyEmpty,
        ) {
            let result = self
                .fs
                .setxattr(&ctx(req), ino, name.as_bytes(), value, flags);
            reply_empty("setxattr", result, reply);
        }

        fn getxattr(
            &mut self,
            req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            size: u32,
            reply: ReplyXattr,
        ) {
            match self.fs.getxattr(&ctx(req), ino, name.as_bytes()) {
                Ok(value) => reply_xattr(&value, size, reply),
                Err(err) => reply.error(errno("getxattr", err)),
            }
        }

        fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
            match self.fs.listxattr(&ctx(req), ino) {
                Ok(names) => {
                    let mut data = Vec::new();
                    for name in names {
                        data.extend_from_slice(&name);
                        data.push(0);
                    }
                    reply_xattr(&data, size, reply);
                }
                Err(err) => reply.error(errno("listxattr", err)),
            }
        }

        fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
            let result = self.fs.removexattr(&ctx(req), ino, name.as_bytes());
            reply_empty("removexattr", result, reply);
        }

        fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
            reply_empty("access", self.fs.access(&ctx(req), ino, mask as u32), reply);
        }

        fn create(
            &mut self,
            req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            mode: u32,
            umask: u32,
            flags: i32,
            reply: ReplyCreate,
        ) {
            let mode = mode & !umask;
            match self
                .fs
                .create(&ctx(req), parent, name.as_bytes(), mode, flags)
            {
                Ok((entry, fh)) => reply.created(&TTL, &file_attr(&entry.attr), 0, fh, 0),
                Err(err) => reply.error(errno("create", err)),
            }
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::sync::Arc;

    use tfs_fs::Fs;

    use super::MountOptions;

    /// Stand-in when FUSE support is not compiled in
    pub struct TfsFuse;

    impl TfsFuse {
        pub fn new(_fs: Arc<Fs>, _options: MountOptions) -> Self {
            #[cfg(not(target_os = "linux"))]
            tracing::warn!(os = std::env::consts::OS, "FUSE support is only available on Linux");
            #[cfg(all(target_os = "linux", not(feature = "fuse")))]
            tracing::warn!("FUSE is disabled; build with --features fuse to enable");
            Self
        }

        pub fn mount(self, _mountpoint: &std::path::Path) -> anyhow::Result<()> {
            anyhow::bail!("FUSE not supported in this build");
        }
    }
}

pub use imp::TfsFuse;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_offsets_skip_dot_entries() {
        assert_eq!(dir_pos(0), 0);
        assert_eq!(dir_pos(2), 0);
        assert_eq!(dir_pos(5), 3);
        assert_eq!(dir_offset(3), 5);
        assert_eq!(dir_pos(dir_offset(7)), 7);
    }

    #[test]
    fn test_times_round_trip() {
        let ns = 1_700_000_000_123_456_789;
        assert_eq!(time_ns(system_time(ns)), ns);
        assert_eq!(time_ns(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_caller_identity() {
        let ctx = caller(1000, 100, 42);
        assert!(!ctx.is_root());
        assert_eq!((ctx.uid, ctx.gid, ctx.pid), (1000, 100, 42));
    }

    #[test]
    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    fn test_mount_unavailable_without_fuse() {
        use std::sync::Arc;
        use tfs_codec::CodecChain;
        use tfs_fs::{open_store, Fs, FsOptions};
        use tfs_storage::BackendKind;

        let store = open_store(BackendKind::Memory, "".as_ref(), CodecChain::identity()).unwrap();
        let fs = Arc::new(Fs::mount(Arc::new(store), FsOptions::default()).unwrap());
        let fuse = TfsFuse::new(fs, MountOptions::default());
        assert!(fuse.mount(std::path::Path::new("/nonexistent")).is_err());
    }
}
