use crate::meta::InodeMeta;
use crate::{FsError, Result};

pub const R_OK: u32 = libc::R_OK as u32;
pub const W_OK: u32 = libc::W_OK as u32;
pub const X_OK: u32 = libc::X_OK as u32;

/// Identity of the caller of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ctx {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl Ctx {
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self { uid, gid, pid }
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Check `mode` (`R_OK | W_OK | X_OK` bits) against the inode's
/// permission bits. With `or_own` the owner passes regardless.
pub fn access(meta: &InodeMeta, mode: u32, or_own: bool, ctx: &Ctx) -> Result<()> {
    if ctx.is_root() {
        return Ok(());
    }
    if or_own && meta.uid == ctx.uid {
        return Ok(());
    }
    let bits = if meta.uid == ctx.uid {
        (meta.mode >> 6) & 7
    } else if meta.gid == ctx.gid {
        (meta.mode >> 3) & 7
    } else {
        meta.mode & 7
    };
    if bits & mode == mode {
        Ok(())
    } else {
        Err(FsError::Access)
    }
}

/// In a sticky directory only the owners of the entry or the directory
/// may remove or rename it.
pub fn sticky_mutate_check(dir: &InodeMeta, child: &InodeMeta, ctx: &Ctx) -> Result<()> {
    if !dir.is_sticky() || ctx.is_root() || ctx.uid == dir.uid || ctx.uid == child.uid {
        return Ok(());
    }
    Err(FsError::Perm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{S_IFDIR, S_IFREG};

    #[test]
    fn test_owner_group_other_bits() {
        let meta = InodeMeta::new(S_IFREG | 0o640, 1000, 100, 1);
        let owner = Ctx::new(1000, 1, 0);
        let group = Ctx::new(2000, 100, 0);
        let other = Ctx::new(3000, 300, 0);

        assert!(access(&meta, R_OK | W_OK, false, &owner).is_ok());
        assert!(access(&meta, R_OK, false, &group).is_ok());
        assert!(matches!(access(&meta, W_OK, false, &group), Err(FsError::Access)));
        assert!(access(&meta, R_OK, false, &other).is_err());
        assert!(access(&meta, X_OK, true, &owner).is_ok());
        assert!(access(&meta, R_OK | W_OK | X_OK, false, &Ctx::root()).is_ok());
    }

    #[test]
    fn test_sticky_directory() {
        let dir = InodeMeta::new(S_IFDIR | 0o1777, 0, 0, 1);
        let file = InodeMeta::new(S_IFREG | 0o644, 1000, 100, 1);
        assert!(sticky_mutate_check(&dir, &file, &Ctx::new(1000, 100, 0)).is_ok());
        assert!(matches!(
            sticky_mutate_check(&dir, &file, &Ctx::new(2000, 100, 0)),
            Err(FsError::Perm)
        ));
        let plain = InodeMeta::new(S_IFDIR | 0o777, 0, 0, 1);
        assert!(sticky_mutate_check(&plain, &file, &Ctx::new(2000, 100, 0)).is_ok());
    }
}
