//! Path-level commands that work on a store without mounting it.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tfs_config::{log_cli_info, Config};
use tfs_fs::meta::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use tfs_fs::{Attr, FsUser};
use walkdir::WalkDir;

use crate::session::Session;

/// Open a session, run `f` as the invoking user, then close the session
/// even when `f` failed.
fn with_user<T>(config: &Config, f: impl FnOnce(&FsUser) -> Result<T>) -> Result<T> {
    let session = Session::open(config)?;
    let result = f(&session.user());
    let closed = session.close();
    let value = result?;
    closed?;
    Ok(value)
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn type_char(mode: u32) -> char {
    match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFREG => '-',
        _ => '?',
    }
}

pub fn ls(config: &Config, path: &str, long: bool) -> Result<()> {
    with_user(config, |user| {
        let mut entries = user
            .read_dir(path)
            .with_context(|| format!("Cannot list {path}"))?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out = io::stdout().lock();
        for entry in entries {
            let name = String::from_utf8_lossy(&entry.name);
            if long {
                let attr = user.stat(&join(path, &name))?;
                writeln!(
                    out,
                    "{}{:o} {:>4} {:>5} {:>5} {:>10} {}",
                    type_char(attr.mode),
                    attr.mode & 0o7777,
                    attr.nlink,
                    attr.uid,
                    attr.gid,
                    attr.size,
                    name
                )?;
            } else {
                writeln!(out, "{name}")?;
            }
        }
        Ok(())
    })
}

pub fn cat(config: &Config, path: &str) -> Result<()> {
    with_user(config, |user| {
        let mut file = user
            .open_file(path, libc::O_RDONLY, 0)
            .with_context(|| format!("Cannot open {path}"))?;
        let mut out = io::stdout().lock();
        io::copy(&mut file, &mut out)?;
        out.flush()?;
        file.close()?;
        Ok(())
    })
}

fn put_file(user: &FsUser, local: &Path, path: &str) -> Result<u64> {
    let mut source =
        std::fs::File::open(local).with_context(|| format!("Cannot read {}", local.display()))?;
    let mode = mode_of(local)?;
    let flags = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC;
    let mut file = user
        .open_file(path, flags, mode)
        .with_context(|| format!("Cannot create {path}"))?;
    let copied = io::copy(&mut source, &mut file)?;
    file.close()?;
    Ok(copied)
}

#[cfg(unix)]
fn mode_of(local: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(local)?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_local: &Path) -> Result<u32> {
    Ok(0o644)
}

pub fn put(config: &Config, local: &Path, path: &str) -> Result<()> {
    with_user(config, |user| {
        if !local.is_dir() {
            let bytes = put_file(user, local, path)?;
            log_cli_info!("copied file", path = path, bytes = bytes);
            return Ok(());
        }

        let (mut files, mut bytes) = (0u64, 0u64);
        for entry in WalkDir::new(local).sort_by_file_name() {
            let entry = entry?;
            let relative = entry.path().strip_prefix(local)?;
            let target = match relative.to_str() {
                Some("") => {
                    mkdir_all(user, path)?;
                    continue;
                }
                Some(rel) => join(path, rel),
                None => bail!("Non UTF-8 path {}", entry.path().display()),
            };
            let kind = entry.file_type();
            if kind.is_dir() {
                match user.mkdir(&target, mode_of(entry.path())?) {
                    Err(tfs_fs::FsError::Exists) if user.stat(&target)?.is_dir() => {}
                    other => other.with_context(|| format!("Cannot create {target}"))?,
                }
            } else if kind.is_symlink() {
                let link = std::fs::read_link(entry.path())?;
                user.symlink(&link.to_string_lossy(), &target)?;
            } else if kind.is_file() {
                bytes += put_file(user, entry.path(), &target)?;
                files += 1;
            }
        }
        println!("{files} files, {bytes} bytes");
        log_cli_info!("copied tree", files = files, bytes = bytes);
        Ok(())
    })
}

fn mkdir_all(user: &FsUser, path: &str) -> Result<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match user.mkdir(&current, 0o755) {
            Ok(()) => {}
            Err(tfs_fs::FsError::Exists) if user.stat(&current)?.is_dir() => {}
            Err(err) => return Err(err).with_context(|| format!("Cannot create {current}")),
        }
    }
    Ok(())
}

pub fn mkdir(config: &Config, path: &str, parents: bool) -> Result<()> {
    with_user(config, |user| {
        if parents {
            mkdir_all(user, path)
        } else {
            user.mkdir(path, 0o755)
                .with_context(|| format!("Cannot create {path}"))
        }
    })
}

fn remove_all(user: &FsUser, path: &str) -> Result<()> {
    let attr = user.stat(path)?;
    if attr.is_dir() {
        for name in user.list_dir(path)? {
            remove_all(user, &join(path, &name))?;
        }
    }
    user.remove(path)
        .with_context(|| format!("Cannot remove {path}"))
}

pub fn rm(config: &Config, path: &str, recursive: bool) -> Result<()> {
    with_user(config, |user| {
        if recursive {
            remove_all(user, path)
        } else {
            user.remove(path)
                .with_context(|| format!("Cannot remove {path}"))
        }
    })
}

fn stat_json(attr: &Attr) -> serde_json::Value {
    serde_json::json!({
        "ino": attr.ino,
        "size": attr.size,
        "blocks": attr.blocks,
        "mode": format!("{:o}", attr.mode),
        "nlink": attr.nlink,
        "uid": attr.uid,
        "gid": attr.gid,
        "rdev": attr.rdev,
        "atime_ns": attr.atime_ns,
        "mtime_ns": attr.mtime_ns,
        "ctime_ns": attr.ctime_ns,
    })
}

pub fn stat(config: &Config, path: &str, json: bool) -> Result<()> {
    with_user(config, |user| {
        let attr = user
            .stat(path)
            .with_context(|| format!("Cannot stat {path}"))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&stat_json(&attr))?);
            return Ok(());
        }
        println!("  File: {path}");
        println!("  Size: {}\tBlocks: {}\tInode: {}", attr.size, attr.blocks, attr.ino);
        println!(
            "  Mode: {}{:o}\tLinks: {}\tUid: {}\tGid: {}",
            type_char(attr.mode),
            attr.mode & 0o7777,
            attr.nlink,
            attr.uid,
            attr.gid
        );
        if attr.is_symlink() {
            println!("Target: {}", String::from_utf8_lossy(&user.readlink(path)?));
        }
        Ok(())
    })
}
