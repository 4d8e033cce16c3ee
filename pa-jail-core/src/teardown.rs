//! Unmounting and removal of a jail, and the in-place rename.
//!
//! Removal never trusts pathnames twice: the walk happens through
//! descriptors opened `O_NOFOLLOW` beneath the retained parent, entries
//! go through `unlinkat`, and directories that are still mount points in
//! the post-umount snapshot are never entered.

use crate::errors::JailError;
use crate::paths::{end_slash, no_end_slash};
use crate::policy::JailDir;
use crate::{fsops, mounts, paths, Context};
use log::debug;
use nix::dir::{Dir, Type};
use nix::errno::Errno;
use nix::fcntl::{self, AtFlags, OFlag};
use nix::sys::stat::{self, Mode};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Unmount everything at or beneath the jail, then empty it.
///
/// Used directly by `run --replace`; `rm` follows up with the final
/// rmdir. Unmount failures are fatal: removing a tree with something
/// still mounted in it would reach through into the host.
pub fn clear(cx: &mut Context, jail: &JailDir) -> Result<(), JailError> {
    let points = cx.mounts()?.points_at_or_under(&jail.dir);
    for point in points {
        mounts::unmount(cx, &point).map_err(|e| JailError::fs("umount", point.clone(), e))?;
        if !cx.dry_run {
            cx.mounts_mut()?.remove(&point);
        }
    }

    let Some(parent_fd) = jail.parent_fd() else {
        // Only a dry run that conjured the jail virtually lacks the
        // parent descriptor; there is nothing on disk to remove.
        return Ok(());
    };
    remove_tree_under(cx, parent_fd, &jail.component, &jail.dir)?;
    debug!("emptied {}", jail.dir);
    Ok(())
}

/// `pa-jail rm`: empty the jail and remove the directory itself.
pub fn remove(cx: &mut Context, jail: &JailDir, force: bool) -> Result<(), JailError> {
    clear(cx, jail)?;

    let dir = no_end_slash(&jail.dir);
    let Some(parent_fd) = jail.parent_fd() else {
        return Ok(());
    };
    match fsops::unlink_entry(cx, parent_fd, &jail.component, true, &dir) {
        Ok(()) => Ok(()),
        Err(Errno::ENOENT) if force => Ok(()),
        Err(e) => Err(JailError::fs("rmdir", dir, e)),
    }
}

fn remove_tree_under(
    cx: &mut Context,
    parent: BorrowedFd<'_>,
    component: &str,
    dirname: &str,
) -> Result<(), JailError> {
    let dirname = end_slash(dirname);
    let raw = fcntl::openat(
        Some(parent.as_raw_fd()),
        component,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW | OFlag::O_DIRECTORY,
        Mode::empty(),
    )
    .map_err(|e| JailError::Path {
        path: dirname.clone(),
        source: e,
    })?;
    let dirfd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut dir = Dir::openat(
        Some(dirfd.as_raw_fd()),
        ".",
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| JailError::Path {
        path: dirname.clone(),
        source: e,
    })?;
    let mut entries: Vec<(String, Option<Type>)> = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| JailError::Path {
            path: dirname.clone(),
            source: e,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        entries.push((name, entry.file_type()));
    }
    drop(dir);

    for (name, file_type) in entries {
        let full = format!("{}{}", dirname, name);
        let is_dir = match file_type {
            Some(t) => t == Type::Directory,
            None => match stat::fstatat(Some(dirfd.as_raw_fd()), name.as_str(), AtFlags::AT_SYMLINK_NOFOLLOW) {
                Ok(st) => st.st_mode & libc::S_IFMT == libc::S_IFDIR,
                Err(e) => return Err(JailError::Path { path: full, source: e }),
            },
        };
        if is_dir {
            if cx.mounts()?.contains(&full) {
                continue;
            }
            remove_tree_under(cx, dirfd.as_fd(), &name, &full)?;
        }
        fsops::unlink_entry(cx, dirfd.as_fd(), &name, is_dir, &full).map_err(|e| {
            JailError::fs(if is_dir { "rmdir" } else { "rm" }, full.clone(), e)
        })?;
    }
    Ok(())
}

/// `pa-jail mv`: atomically rename the jail within its permdir.
///
/// When the destination names an existing directory the jail keeps its
/// basename underneath it.
pub fn rename(cx: &Context, jail: &JailDir, raw_dst: &str) -> Result<(), JailError> {
    let absolute = paths::absolute(raw_dst)?;
    let Some(newpath) = paths::sanitize(&absolute) else {
        return Err(JailError::BadFilename {
            path: raw_dst.to_string(),
            what: "move destination",
        });
    };
    if !newpath.starts_with('/') {
        return Err(JailError::BadFilename {
            path: raw_dst.to_string(),
            what: "move destination",
        });
    }
    if newpath.len() <= jail.permdir.len() || !newpath.starts_with(&jail.permdir) {
        return Err(JailError::MoveOutsidePermdir {
            dst: newpath,
            permdir: jail.permdir.clone(),
        });
    }

    let newpath = match stat::stat(newpath.as_str()) {
        Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFDIR => {
            format!("{}{}", end_slash(&newpath), jail.component)
        }
        _ => newpath,
    };

    let old = format!("{}{}", jail.parent, jail.component);
    let Some(parent_fd) = jail.parent_fd() else {
        return Ok(());
    };
    fsops::rename_at(cx, parent_fd, &jail.component, &old, &newpath)
        .map_err(|e| JailError::fs("mv", format!("{} {}", old, newpath), e))
}
