//! Path based access to a filesystem, as one user.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::warn;

use crate::access::{access, Ctx, X_OK};
use crate::handles::DirEntry;
use crate::meta::Attr;
use crate::{inode, Fs, FsError, Result, ROOT_INO};

const READDIR_BATCH: usize = 128;

fn components(path: &str) -> impl Iterator<Item = &[u8]> {
    path.split('/').filter(|c| !c.is_empty()).map(str::as_bytes)
}

/// Filesystem handle acting with one caller identity.
#[derive(Debug, Clone)]
pub struct FsUser {
    fs: Arc<Fs>,
    ctx: Ctx,
}

impl FsUser {
    pub fn new(fs: Arc<Fs>, ctx: Ctx) -> Self {
        Self { fs, ctx }
    }

    pub fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }

    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }

    fn resolve(&self, path: &str) -> Result<u64> {
        let tr = self.fs.hugger().transaction();
        let mut ino = ROOT_INO;
        for name in components(path) {
            let dir = inode::dir_meta(&tr, ino)?;
            access(&dir, X_OK, false, &self.ctx)?;
            ino = inode::resolve(&tr, ino, name)?.ok_or(FsError::NotFound)?;
        }
        Ok(ino)
    }

    /// Directory inode and final name of `path`
    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(u64, &'p [u8])> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rfind('/') {
            Some(at) => (&trimmed[..at], &trimmed[at + 1..]),
            None => ("", trimmed),
        };
        if name.is_empty() {
            return Err(FsError::Invalid("path has no final component"));
        }
        Ok((self.resolve(dir)?, name.as_bytes()))
    }

    pub fn open_file(&self, path: &str, flags: i32, mode: u32) -> Result<File> {
        let (ino, fh) = if flags & libc::O_CREAT != 0 {
            let (parent, name) = self.resolve_parent(path)?;
            let (entry, fh) = self.fs.create(&self.ctx, parent, name, mode, flags)?;
            self.fs.forget(entry.ino, 1)?;
            (entry.ino, fh)
        } else {
            let ino = self.resolve(path)?;
            (ino, self.fs.open(&self.ctx, ino, flags)?)
        };
        Ok(File {
            fs: self.fs.clone(),
            ino,
            fh,
            pos: 0,
            open: true,
        })
    }

    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let fh = self.fs.opendir(&self.ctx, self.resolve(path)?)?;
        let mut out = Vec::new();
        let result = loop {
            match self.fs.readdir(fh, out.len() as u64, READDIR_BATCH) {
                Ok(batch) if batch.is_empty() => break Ok(()),
                Ok(batch) => out.extend(batch),
                Err(err) => break Err(err),
            }
        };
        self.fs.releasedir(fh)?;
        result.map(|()| out)
    }

    /// Entry names of a directory
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .read_dir(path)?
            .into_iter()
            .map(|e| String::from_utf8_lossy(&e.name).into_owned())
            .collect())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let entry = self.fs.mkdir(&self.ctx, parent, name, mode)?;
        self.fs.forget(entry.ino, 1)
    }

    pub fn stat(&self, path: &str) -> Result<Attr> {
        self.fs.getattr(self.resolve(path)?)
    }

    pub fn link(&self, existing: &str, path: &str) -> Result<()> {
        let ino = self.resolve(existing)?;
        let (parent, name) = self.resolve_parent(path)?;
        let entry = self.fs.link(&self.ctx, ino, parent, name)?;
        self.fs.forget(entry.ino, 1)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        self.fs.unlink(&self.ctx, parent, name)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        self.fs.rmdir(&self.ctx, parent, name)
    }

    /// Unlink a file or remove an empty directory
    pub fn remove(&self, path: &str) -> Result<()> {
        if self.stat(path)?.is_dir() {
            self.rmdir(path)
        } else {
            self.unlink(path)
        }
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(from)?;
        let (new_parent, new_name) = self.resolve_parent(to)?;
        self.fs.rename(&self.ctx, parent, name, new_parent, new_name)
    }

    pub fn symlink(&self, target: &str, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let entry = self.fs.symlink(&self.ctx, parent, name, target.as_bytes())?;
        self.fs.forget(entry.ino, 1)
    }

    pub fn readlink(&self, path: &str) -> Result<Vec<u8>> {
        self.fs.readlink(self.resolve(path)?)
    }

    pub fn get_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        self.fs.getxattr(&self.ctx, self.resolve(path)?, name.as_bytes())
    }

    pub fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> Result<()> {
        self.fs
            .setxattr(&self.ctx, self.resolve(path)?, name.as_bytes(), value, 0)
    }

    pub fn list_xattr(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .fs
            .listxattr(&self.ctx, self.resolve(path)?)?
            .into_iter()
            .map(|n| String::from_utf8_lossy(&n).into_owned())
            .collect())
    }

    pub fn remove_xattr(&self, path: &str, name: &str) -> Result<()> {
        self.fs
            .removexattr(&self.ctx, self.resolve(path)?, name.as_bytes())
    }

    /// Whole contents of a file
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.open_file(path, libc::O_RDONLY, 0)?;
        let data = file.read_at(0, file.stat()?.size as usize)?;
        file.close()?;
        Ok(data)
    }

    /// Create or replace a file with `data`
    pub fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let flags = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC;
        let file = self.open_file(path, flags, mode)?;
        file.write_at(0, data)?;
        file.close()
    }
}

/// An open regular file with a position.
#[derive(Debug)]
pub struct File {
    fs: Arc<Fs>,
    ino: u64,
    fh: u64,
    pos: u64,
    open: bool,
}

impl File {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.fs.read(self.fh, offset, size)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.fs.write(self.fh, offset, data)
    }

    pub fn stat(&self) -> Result<Attr> {
        self.fs.getattr(self.ino)
    }

    pub fn close(mut self) -> Result<()> {
        self.open = false;
        self.fs.release(self.fh)
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.read_at(self.pos, buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        self.pos += data.len() as u64;
        Ok(data.len())
    }
}

impl Write for File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(at) => {
                self.pos = at;
                return Ok(at);
            }
            SeekFrom::Current(delta) => (self.pos, delta),
            SeekFrom::End(delta) => (self.stat()?.size, delta),
        };
        self.pos = base
            .checked_add_signed(delta)
            .ok_or_else(|| io::Error::from(FsError::Invalid("seek before start")))?;
        Ok(self.pos)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.fs.release(self.fh) {
                warn!(fh = self.fh, %err, "releasing file handle failed");
            }
        }
    }
}
