//! Filesystem operations addressed by inode number.
//!
//! Calls that return an [`Entry`] count as a lookup of the inode; callers
//! balance them with [`Fs::forget`]. Open handles hold a reference too,
//! released by [`Fs::release`] and [`Fs::releasedir`].

use tracing::{debug, instrument};

use crate::access::{access, sticky_mutate_check, Ctx, R_OK, W_OK, X_OK};
use crate::handles::{DirEntry, Handle};
use crate::inode;
use crate::key::{BlockKey, SubType};
use crate::meta::{Attr, InodeMeta, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::{data, Fs, FsError, Result, BLOCK_SIZE, NAME_MAX, ROOT_INO};

/// Fail if the attribute exists
pub const XATTR_CREATE: i32 = 1;
/// Fail unless the attribute exists
pub const XATTR_REPLACE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ino: u64,
    pub attr: Attr,
}

impl Entry {
    fn new(ino: u64, meta: &InodeMeta) -> Self {
        Self {
            ino,
            attr: Attr::new(ino, meta),
        }
    }
}

/// Attribute changes; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime_ns: Option<u64>,
    pub mtime_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub namelen: u32,
}

fn write_mask(flags: i32) -> u32 {
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => R_OK,
        libc::O_WRONLY => W_OK,
        _ => R_OK | W_OK,
    }
}

/// Destination directory of a rename, which may be the source one
fn target_dir<'a>(src: &'a mut InodeMeta, dst: &'a mut Option<InodeMeta>) -> &'a mut InodeMeta {
    match dst {
        Some(dst) => dst,
        None => src,
    }
}

impl Fs {
    fn make_node(
        &self,
        ctx: &Ctx,
        parent: u64,
        name: &[u8],
        mode: u32,
        rdev: u32,
        contents: Option<&[u8]>,
    ) -> Result<Entry> {
        inode::check_name(name)?;
        let _dir = self.meta_locks.lock(parent);
        let (ino, meta) = self.hugger.update_result(|tr| -> Result<(u64, InodeMeta)> {
            let mut dir = inode::dir_meta(tr, parent)?;
            access(&dir, W_OK | X_OK, false, ctx)?;
            if inode::lookup_entry(tr, parent, name)?.is_some() {
                return Err(FsError::Exists);
            }
            let ino = inode::new_ino(tr)?;
            let mut meta = InodeMeta::new(mode, ctx.uid, ctx.gid, parent);
            meta.rdev = rdev;
            if meta.is_dir() {
                meta.nlink = 1;
            }
            if let Some(contents) = contents {
                data::write_in(tr, ino, &mut meta, &self.options, 0, contents)?;
            }
            inode::add_entry(tr, parent, &mut dir, name, ino, &mut meta)?;
            inode::set_meta(tr, parent, &dir)?;
            inode::set_meta(tr, ino, &meta)?;
            Ok((ino, meta))
        })?;
        self.refer_inode(ino);
        debug!(parent, ino, name = %String::from_utf8_lossy(name), mode, "created inode");
        Ok(Entry::new(ino, &meta))
    }

    pub fn lookup(&self, ctx: &Ctx, parent: u64, name: &[u8]) -> Result<Entry> {
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        let tr = self.hugger.transaction();
        let dir = inode::dir_meta(&tr, parent)?;
        access(&dir, X_OK, false, ctx)?;
        let ino = inode::resolve(&tr, parent, name)?.ok_or(FsError::NotFound)?;
        let meta = inode::meta(&tr, ino)?;
        drop(tr);
        self.refer_inode(ino);
        Ok(Entry::new(ino, &meta))
    }

    /// Drop `nlookup` lookups of `ino`
    pub fn forget(&self, ino: u64, nlookup: u64) -> Result<()> {
        self.release_inode(ino, nlookup)
    }

    pub fn getattr(&self, ino: u64) -> Result<Attr> {
        let tr = self.hugger.transaction();
        Ok(Attr::new(ino, &inode::meta(&tr, ino)?))
    }

    #[instrument(skip(self, ctx), level = "debug")]
    pub fn setattr(&self, ctx: &Ctx, ino: u64, change: &SetAttr) -> Result<Attr> {
        let _meta = self.meta_locks.lock(ino);
        let meta = self.hugger.update_result(|tr| -> Result<InodeMeta> {
            let mut meta = inode::meta(tr, ino)?;
            let owner = ctx.is_root() || ctx.uid == meta.uid;
            if let Some(mode) = change.mode {
                if !owner {
                    return Err(FsError::Perm);
                }
                meta.mode = (meta.mode & S_IFMT) | (mode & !S_IFMT);
            }
            if let Some(uid) = change.uid {
                if uid != meta.uid && !ctx.is_root() {
                    return Err(FsError::Perm);
                }
                meta.uid = uid;
            }
            if let Some(gid) = change.gid {
                if gid != meta.gid && !owner {
                    return Err(FsError::Perm);
                }
                meta.gid = gid;
            }
            if let Some(size) = change.size {
                if meta.is_dir() {
                    return Err(FsError::IsDir);
                }
                access(&meta, W_OK, false, ctx)?;
                data::truncate_in(tr, ino, &mut meta, &self.options, size)?;
            }
            if change.atime_ns.is_some() || change.mtime_ns.is_some() {
                access(&meta, W_OK, true, ctx)?;
            }
            if let Some(atime) = change.atime_ns {
                meta.atime_ns = atime;
            }
            if let Some(mtime) = change.mtime_ns {
                meta.mtime_ns = mtime;
            }
            meta.touch_ctime();
            inode::set_meta(tr, ino, &meta)?;
            Ok(meta)
        })?;
        Ok(Attr::new(ino, &meta))
    }

    pub fn mkdir(&self, ctx: &Ctx, parent: u64, name: &[u8], mode: u32) -> Result<Entry> {
        self.make_node(ctx, parent, name, S_IFDIR | (mode & 0o7777), 0, None)
    }

    pub fn mknod(
        &self,
        ctx: &Ctx,
        parent: u64,
        name: &[u8],
        mode: u32,
        rdev: u32,
    ) -> Result<Entry> {
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        self.make_node(ctx, parent, name, mode, rdev, None)
    }

    /// Create and open a regular file; an existing one is opened unless
    /// `O_EXCL` is given.
    pub fn create(
        &self,
        ctx: &Ctx,
        parent: u64,
        name: &[u8],
        mode: u32,
        flags: i32,
    ) -> Result<(Entry, u64)> {
        match self.make_node(ctx, parent, name, S_IFREG | (mode & 0o7777), 0, None) {
            Ok(entry) => {
                let fh = self.new_handle(Handle::File {
                    ino: entry.ino,
                    flags,
                });
                Ok((entry, fh))
            }
            Err(FsError::Exists) if flags & libc::O_EXCL == 0 => {
                let entry = self.lookup(ctx, parent, name)?;
                match self.open(ctx, entry.ino, flags) {
                    Ok(fh) => Ok((entry, fh)),
                    Err(err) => {
                        self.forget(entry.ino, 1)?;
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    pub fn symlink(&self, ctx: &Ctx, parent: u64, name: &[u8], target: &[u8]) -> Result<Entry> {
        if target.is_empty() {
            return Err(FsError::NotFound);
        }
        self.make_node(ctx, parent, name, S_IFLNK | 0o777, 0, Some(target))
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>> {
        let tr = self.hugger.transaction();
        let meta = inode::meta(&tr, ino)?;
        if !meta.is_symlink() {
            return Err(FsError::Invalid("not a symbolic link"));
        }
        data::read_in(&tr, ino, &meta, &self.options, 0, meta.size as usize)
    }

    pub fn link(&self, ctx: &Ctx, ino: u64, new_parent: u64, new_name: &[u8]) -> Result<Entry> {
        inode::check_name(new_name)?;
        let _namespace = self.namespace.lock();
        let _dir = self.meta_locks.lock(new_parent);
        let _child = self.meta_locks.lock(ino);
        let meta = self.hugger.update_result(|tr| -> Result<InodeMeta> {
            let mut meta = inode::meta(tr, ino)?;
            if meta.is_dir() {
                return Err(FsError::Perm);
            }
            let mut dir = inode::dir_meta(tr, new_parent)?;
            access(&dir, W_OK | X_OK, false, ctx)?;
            if inode::lookup_entry(tr, new_parent, new_name)?.is_some() {
                return Err(FsError::Exists);
            }
            inode::add_entry(tr, new_parent, &mut dir, new_name, ino, &mut meta)?;
            inode::set_meta(tr, new_parent, &dir)?;
            inode::set_meta(tr, ino, &meta)?;
            Ok(meta)
        })?;
        self.refer_inode(ino);
        Ok(Entry::new(ino, &meta))
    }

    fn remove(&self, ctx: &Ctx, parent: u64, name: &[u8], dir_wanted: bool) -> Result<()> {
        match name {
            b"." => return Err(FsError::Invalid("cannot remove '.'")),
            b".." => return Err(FsError::NotEmpty),
            _ => {}
        }
        let _namespace = self.namespace.lock();
        let _dir = self.meta_locks.lock(parent);
        let child = {
            let tr = self.hugger.transaction();
            inode::dir_meta(&tr, parent)?;
            inode::lookup_entry(&tr, parent, name)?.ok_or(FsError::NotFound)?
        };
        let _child = self.meta_locks.lock(child);
        let nlink = self.hugger.update_result(|tr| -> Result<u32> {
            let mut dir = inode::dir_meta(tr, parent)?;
            access(&dir, W_OK | X_OK, false, ctx)?;
            let mut meta = inode::meta(tr, child)?;
            match (dir_wanted, meta.is_dir()) {
                (true, false) => return Err(FsError::NotDir),
                (false, true) => return Err(FsError::IsDir),
                (true, true) if meta.nchildren > 0 => return Err(FsError::NotEmpty),
                _ => {}
            }
            sticky_mutate_check(&dir, &meta, ctx)?;
            inode::remove_entry(tr, parent, &mut dir, name, child, &mut meta)?;
            inode::set_meta(tr, parent, &dir)?;
            inode::set_meta(tr, child, &meta)?;
            Ok(meta.nlink)
        })?;
        if nlink == 0 {
            self.reclaim_if_unused(child)?;
        }
        Ok(())
    }

    pub fn unlink(&self, ctx: &Ctx, parent: u64, name: &[u8]) -> Result<()> {
        self.remove(ctx, parent, name, false)
    }

    pub fn rmdir(&self, ctx: &Ctx, parent: u64, name: &[u8]) -> Result<()> {
        self.remove(ctx, parent, name, true)
    }

    /// Move `parent/name` to `new_parent/new_name`, replacing a compatible
    /// target. Nothing changes unless every step succeeds.
    #[instrument(skip(self, ctx, name, new_name), level = "debug")]
    pub fn rename(
        &self,
        ctx: &Ctx,
        parent: u64,
        name: &[u8],
        new_parent: u64,
        new_name: &[u8],
    ) -> Result<()> {
        inode::check_name(new_name)?;
        if matches!(name, b"." | b"..") {
            return Err(FsError::Invalid("cannot rename '.' or '..'"));
        }
        let _namespace = self.namespace.lock();
        let _first = self.meta_locks.lock(parent.min(new_parent));
        let _second = self.meta_locks.lock(parent.max(new_parent));
        let (child, target) = {
            let tr = self.hugger.transaction();
            let child = inode::lookup_entry(&tr, parent, name)?.ok_or(FsError::NotFound)?;
            (child, inode::lookup_entry(&tr, new_parent, new_name)?)
        };
        if target == Some(child) {
            return Ok(());
        }
        let _child = self.meta_locks.lock(child);
        let _target = target.map(|t| self.meta_locks.lock(t));

        let replaced = self.hugger.update_result(|tr| -> Result<Option<(u64, u32)>> {
            let mut src_dir = inode::dir_meta(tr, parent)?;
            access(&src_dir, W_OK | X_OK, false, ctx)?;
            let mut meta = inode::meta(tr, child)?;
            sticky_mutate_check(&src_dir, &meta, ctx)?;
            let mut dst_dir = if parent == new_parent {
                None
            } else {
                let dst = inode::dir_meta(tr, new_parent)?;
                access(&dst, W_OK | X_OK, false, ctx)?;
                Some(dst)
            };
            if meta.is_dir() && parent != new_parent {
                // A directory must not move below itself
                let mut cur = new_parent;
                loop {
                    if cur == child {
                        return Err(FsError::Invalid("directory moved into itself"));
                    }
                    let up = inode::meta(tr, cur)?.parent_ino;
                    if cur == ROOT_INO || up == cur {
                        break;
                    }
                    cur = up;
                }
            }

            let mut replaced = None;
            if let Some(target) = target {
                let mut target_meta = inode::meta(tr, target)?;
                let dst = target_dir(&mut src_dir, &mut dst_dir);
                sticky_mutate_check(dst, &target_meta, ctx)?;
                match (meta.is_dir(), target_meta.is_dir()) {
                    (true, false) => return Err(FsError::NotDir),
                    (false, true) => return Err(FsError::IsDir),
                    (true, true) if target_meta.nchildren > 0 => return Err(FsError::NotEmpty),
                    _ => {}
                }
                inode::remove_entry(tr, new_parent, dst, new_name, target, &mut target_meta)?;
                inode::set_meta(tr, target, &target_meta)?;
                replaced = Some((target, target_meta.nlink));
            }

            let nlink = meta.nlink;
            inode::remove_entry(tr, parent, &mut src_dir, name, child, &mut meta)?;
            let dst = target_dir(&mut src_dir, &mut dst_dir);
            inode::add_entry(tr, new_parent, dst, new_name, child, &mut meta)?;
            meta.nlink = nlink;

            inode::set_meta(tr, child, &meta)?;
            inode::set_meta(tr, parent, &src_dir)?;
            if let Some(dst) = &dst_dir {
                inode::set_meta(tr, new_parent, dst)?;
            }
            Ok(replaced)
        })?;

        if let Some((target, 0)) = replaced {
            self.reclaim_if_unused(target)?;
        }
        Ok(())
    }

    pub fn open(&self, ctx: &Ctx, ino: u64, flags: i32) -> Result<u64> {
        let meta = inode::meta(&self.hugger.transaction(), ino)?;
        let mask = write_mask(flags);
        if meta.is_dir() && mask & W_OK != 0 {
            return Err(FsError::IsDir);
        }
        access(&meta, mask, false, ctx)?;
        if flags & libc::O_TRUNC != 0 && mask & W_OK != 0 && meta.size > 0 {
            self.setattr(
                ctx,
                ino,
                &SetAttr {
                    size: Some(0),
                    ..SetAttr::default()
                },
            )?;
        }
        Ok(self.new_handle(Handle::File { ino, flags }))
    }

    pub fn read(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let (ino, flags) = self.file_handle(fh)?;
        if write_mask(flags) & R_OK == 0 {
            return Err(FsError::BadHandle(fh));
        }
        self.read_data(ino, offset, size)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let (ino, flags) = self.file_handle(fh)?;
        if write_mask(flags) & W_OK == 0 {
            return Err(FsError::BadHandle(fh));
        }
        if flags & libc::O_APPEND != 0 {
            let _meta = self.meta_locks.lock(ino);
            let size = inode::meta(&self.hugger.transaction(), ino)?.size;
            return self.write_data(ino, size, data);
        }
        self.write_data(ino, offset, data)
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        self.close_handle(fh)
    }

    pub fn opendir(&self, ctx: &Ctx, ino: u64) -> Result<u64> {
        let dir = inode::dir_meta(&self.hugger.transaction(), ino)?;
        access(&dir, R_OK, false, ctx)?;
        Ok(self.new_dir_handle(ino))
    }

    /// Up to `max` entries after the first `pos`; `.` and `..` are not
    /// included.
    pub fn readdir(&self, fh: u64, pos: u64, max: usize) -> Result<Vec<DirEntry>> {
        self.read_dir_handle(fh, pos, max)
    }

    pub fn releasedir(&self, fh: u64) -> Result<()> {
        self.close_handle(fh)
    }

    pub fn getxattr(&self, ctx: &Ctx, ino: u64, name: &[u8]) -> Result<Vec<u8>> {
        let tr = self.hugger.transaction();
        access(&inode::meta(&tr, ino)?, R_OK, false, ctx)?;
        tr.get(BlockKey::xattr(ino, name).as_bytes())?.ok_or(FsError::NoData)
    }

    pub fn setxattr(
        &self,
        ctx: &Ctx,
        ino: u64,
        name: &[u8],
        value: &[u8],
        flags: i32,
    ) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FsError::Invalid("attribute name"));
        }
        let _meta = self.meta_locks.lock(ino);
        self.hugger.update(|tr| -> Result<()> {
            let mut meta = inode::meta(tr, ino)?;
            access(&meta, W_OK, false, ctx)?;
            let key = BlockKey::xattr(ino, name);
            let exists = tr.get(key.as_bytes())?.is_some();
            if exists && flags & XATTR_CREATE != 0 {
                return Err(FsError::Exists);
            }
            if !exists && flags & XATTR_REPLACE != 0 {
                return Err(FsError::NoData);
            }
            tr.set(key.as_bytes(), value)?;
            meta.touch_ctime();
            inode::set_meta(tr, ino, &meta)
        })
    }

    pub fn listxattr(&self, ctx: &Ctx, ino: u64) -> Result<Vec<Vec<u8>>> {
        let tr = self.hugger.transaction();
        access(&inode::meta(&tr, ino)?, R_OK, false, ctx)?;
        Ok(inode::sub_type_keys(&tr, ino, SubType::Xattr)?
            .into_iter()
            .map(|key| key.data().to_vec())
            .collect())
    }

    pub fn removexattr(&self, ctx: &Ctx, ino: u64, name: &[u8]) -> Result<()> {
        let _meta = self.meta_locks.lock(ino);
        self.hugger.update(|tr| -> Result<()> {
            let mut meta = inode::meta(tr, ino)?;
            access(&meta, W_OK, false, ctx)?;
            if !tr.delete(BlockKey::xattr(ino, name).as_bytes())? {
                return Err(FsError::NoData);
            }
            meta.touch_ctime();
            inode::set_meta(tr, ino, &meta)
        })
    }

    /// Check `mask` (`F_OK` or `R_OK | W_OK | X_OK` bits)
    pub fn access(&self, ctx: &Ctx, ino: u64, mask: u32) -> Result<()> {
        let meta = inode::meta(&self.hugger.transaction(), ino)?;
        if mask == 0 {
            return Ok(());
        }
        access(&meta, mask, false, ctx)
    }

    pub fn statfs(&self) -> Result<StatFs> {
        let store = self.hugger.store();
        let free = store.bytes_available() / BLOCK_SIZE;
        Ok(StatFs {
            bsize: BLOCK_SIZE as u32,
            blocks: store.bytes_used() / BLOCK_SIZE,
            bfree: free,
            bavail: free,
            namelen: NAME_MAX as u32,
        })
    }
}
