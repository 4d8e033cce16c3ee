//! Narrated, dry-run-aware wrappers around the destructive syscalls.
//!
//! Every operation that mutates the filesystem goes through this module.
//! Under `--verbose` each wrapper prints the equivalent shell command to
//! the verbose sink; under `--dry-run` the syscall itself is suppressed.
//! Wrappers return the raw [`Errno`] so callers decide whether a failure
//! is fatal or merely degrades the run.

use crate::Context;
use nix::errno::Errno;
use nix::sys::stat::{self, major, minor, Mode, SFlag};
use nix::unistd::{self, Gid, Group, Uid, User};
use std::os::fd::BorrowedFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;

fn io_errno(err: &std::io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Render a uid the way `chown` would accept it, preferring the name.
pub fn owner_name(uid: libc::uid_t) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Render a gid the way `chown` would accept it, preferring the name.
pub fn group_name(gid: libc::gid_t) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

/// `mkdir -m MODE path`.
pub fn mkdir(cx: &Context, path: &str, mode: libc::mode_t) -> Result<(), Errno> {
    cx.narrate(format_args!("mkdir -m 0{:o} {}", mode, path));
    if cx.dry_run {
        return Ok(());
    }
    unistd::mkdir(path, Mode::from_bits_truncate(mode))
}

/// `mkdir -m MODE path`, descriptor-relative.
pub fn mkdirat(
    cx: &Context,
    dirfd: BorrowedFd<'_>,
    component: &str,
    mode: libc::mode_t,
    path: &str,
) -> Result<(), Errno> {
    cx.narrate(format_args!("mkdir -m 0{:o} {}", mode, path));
    if cx.dry_run {
        return Ok(());
    }
    stat::mkdirat(Some(dirfd.as_raw_fd()), component, Mode::from_bits_truncate(mode))
}

/// `chmod MODE path` on an already-open descriptor.
pub fn fchmod(cx: &Context, fd: RawFd, mode: libc::mode_t, path: &str) -> Result<(), Errno> {
    cx.narrate(format_args!("chmod 0{:o} {}", mode, path));
    if cx.dry_run {
        return Ok(());
    }
    stat::fchmod(fd, Mode::from_bits_truncate(mode))
}

/// Make sure `path` is a directory, creating it with `mode` if absent.
///
/// Returns `Ok(true)` when the directory was (or would have been)
/// created, `Ok(false)` when it already existed.
pub fn ensure_dir(cx: &Context, path: &str, mode: libc::mode_t) -> Result<bool, Errno> {
    match stat::stat(path) {
        Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFDIR => Ok(false),
        Ok(_) => Err(Errno::ENOTDIR),
        Err(Errno::ENOENT) => mkdir(cx, path, mode).map(|()| true),
        Err(e) => Err(e),
    }
}

/// `chmod MODE path` (follows symlinks, like chmod(2)).
pub fn chmod(cx: &Context, path: &str, mode: libc::mode_t) -> Result<(), Errno> {
    cx.narrate(format_args!("chmod 0{:o} {}", mode & 0o7777, path));
    if cx.dry_run {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode((mode & 0o7777) as u32))
        .map_err(|e| io_errno(&e))
}

/// `chown -h OWNER:GROUP path` (never follows symlinks).
pub fn lchown(cx: &Context, path: &str, uid: libc::uid_t, gid: libc::gid_t) -> Result<(), Errno> {
    // Name lookups are only worth it when they will be printed.
    if cx.verbose {
        cx.narrate(format_args!(
            "chown -h {}:{} {}",
            owner_name(uid),
            group_name(gid),
            path
        ));
    }
    if cx.dry_run {
        return Ok(());
    }
    std::os::unix::fs::lchown(path, Some(uid), Some(gid)).map_err(|e| io_errno(&e))
}

/// `chown OWNER:GROUP path` on an already-open descriptor.
pub fn fchown(
    cx: &Context,
    fd: RawFd,
    uid: libc::uid_t,
    gid: libc::gid_t,
    path: &str,
) -> Result<(), Errno> {
    if cx.verbose {
        cx.narrate(format_args!(
            "chown -h {}:{} {}",
            owner_name(uid),
            group_name(gid),
            path
        ));
    }
    if cx.dry_run {
        return Ok(());
    }
    unistd::fchown(fd, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
}

/// `ln src dst`. `EEXIST` is forgiven when `exists_ok` says the existing
/// entry already is the requested link.
pub fn hard_link(
    cx: &Context,
    src: &str,
    dst: &str,
    exists_ok: impl FnOnce() -> bool,
) -> Result<(), Errno> {
    cx.narrate(format_args!("ln {} {}", src, dst));
    if cx.dry_run {
        return Ok(());
    }
    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if io_errno(&e) == Errno::EEXIST && exists_ok() => Ok(()),
        Err(e) => Err(io_errno(&e)),
    }
}

/// `ln -s target dst`. `EEXIST` is forgiven when the existing symlink
/// carries the identical target text.
pub fn symlink(cx: &Context, target: &str, dst: &str) -> Result<(), Errno> {
    cx.narrate(format_args!("ln -s {} {}", target, dst));
    if cx.dry_run {
        return Ok(());
    }
    match std::os::unix::fs::symlink(target, dst) {
        Ok(()) => Ok(()),
        Err(e) if io_errno(&e) == Errno::EEXIST => {
            match std::fs::read_link(dst) {
                Ok(existing) if existing.as_os_str().to_str() == Some(target) => Ok(()),
                _ => Err(Errno::EEXIST),
            }
        }
        Err(e) => Err(io_errno(&e)),
    }
}

fn dev_desc(mode: libc::mode_t, dev: libc::dev_t) -> String {
    if mode & libc::S_IFMT == libc::S_IFCHR {
        format!("c {} {}", major(dev), minor(dev))
    } else if mode & libc::S_IFMT == libc::S_IFBLK {
        format!("b {} {}", major(dev), minor(dev))
    } else if mode & libc::S_IFMT == libc::S_IFIFO {
        "p".to_string()
    } else {
        format!("{} {}", mode, dev)
    }
}

/// `mknod -m MODE path TYPE [MAJ MIN]`. `EEXIST` is forgiven when the
/// existing node has the identical mode and device number.
pub fn mknod(
    cx: &Context,
    path: &str,
    mode: libc::mode_t,
    dev: libc::dev_t,
) -> Result<(), Errno> {
    cx.narrate(format_args!(
        "mknod -m 0{:o} {} {}",
        mode & 0o7777,
        path,
        dev_desc(mode, dev)
    ));
    if cx.dry_run {
        return Ok(());
    }
    let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
    let perm = Mode::from_bits_truncate(mode);
    match stat::mknod(path, kind, perm, dev) {
        Ok(()) => Ok(()),
        Err(Errno::EEXIST) => match stat::stat(path) {
            Ok(st) if st.st_mode == mode && st.st_rdev == dev => Ok(()),
            _ => Err(Errno::EEXIST),
        },
        Err(e) => Err(e),
    }
}

/// `cp -p src dst` through the host's preserving-copy binary.
///
/// Failures are reported here and degrade the run; the return value only
/// says whether the destination can be relied upon.
pub fn cp_p(cx: &mut Context, src: &str, dst: &str) -> bool {
    cx.narrate(format_args!("cp -p {} {}", src, dst));
    if cx.dry_run {
        return true;
    }
    match Command::new("/bin/cp").arg("-p").arg(src).arg(dst).status() {
        Ok(status) if status.success() => true,
        Ok(_) => {
            cx.soft_fail_msg(&format!("/bin/cp {}", dst), "Bad exit status");
            false
        }
        Err(e) => {
            cx.soft_fail("fork", "/bin/cp", io_errno(&e));
            false
        }
    }
}

/// `rm path` / `rmdir path`, descriptor-relative.
pub fn unlink_entry(
    cx: &Context,
    dirfd: BorrowedFd<'_>,
    name: &str,
    is_dir: bool,
    path: &str,
) -> Result<(), Errno> {
    cx.narrate(format_args!("{} {}", if is_dir { "rmdir" } else { "rm" }, path));
    if cx.dry_run {
        return Ok(());
    }
    let flag = if is_dir {
        unistd::UnlinkatFlags::RemoveDir
    } else {
        unistd::UnlinkatFlags::NoRemoveDir
    };
    unistd::unlinkat(Some(dirfd.as_raw_fd()), name, flag)
}

/// `mv old new`, descriptor-relative on the source side.
pub fn rename_at(
    cx: &Context,
    dirfd: BorrowedFd<'_>,
    component: &str,
    old_path: &str,
    new_path: &str,
) -> Result<(), Errno> {
    cx.narrate(format_args!("mv {} {}", old_path, new_path));
    if cx.dry_run {
        return Ok(());
    }
    nix::fcntl::renameat(
        Some(dirfd.as_raw_fd()),
        component,
        Some(dirfd.as_raw_fd()),
        new_path,
    )
}
