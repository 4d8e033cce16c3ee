//! The ownership pass run before `pa-jail run`.
//!
//! The jail is recursively chowned to root:root so student code cannot
//! have left privileged-looking files behind, except that entries
//! directly under `<jail>/home/` whose names match a host user's home
//! directory are assigned to that user, subtrees included. Symbolic
//! links are never followed, and subtrees that are mount points in the
//! snapshot are never entered.

use crate::errors::JailError;
use crate::policy::JailDir;
use crate::unsafe_mod::passwd;
use crate::{fsops, Context};
use nix::dir::{Dir, Type};
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{self, Mode};
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

type IdMap = HashMap<String, (libc::uid_t, libc::gid_t)>;

/// Map `/home/<name>` basenames (or, failing that, user names) to ids.
fn build_home_map() -> IdMap {
    let mut map = IdMap::new();
    for entry in passwd::all_entries() {
        let key = match entry.dir.strip_prefix("/home/") {
            Some(base) if !base.contains('/') => base.to_string(),
            _ => entry.name.clone(),
        };
        map.insert(key, (entry.uid, entry.gid));
    }
    map
}

/// Recursively chown the jail for a `run`.
pub fn apply(cx: &mut Context, jail: &JailDir) -> Result<(), JailError> {
    let mount_points: HashSet<String> = cx.mounts()?.iter_points().cloned().collect();

    let Some(parent_fd) = jail.parent_fd() else {
        // The walk only leaves the parent unopened on a dry run that
        // created the jail virtually; there is nothing to chown.
        return Ok(());
    };
    let dirfd = match fcntl::openat(
        Some(parent_fd.as_raw_fd()),
        jail.component.as_str(),
        OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
        Mode::empty(),
    ) {
        Ok(raw) => unsafe { OwnedFd::from_raw_fd(raw) },
        Err(Errno::ENOENT) if cx.dry_run => return Ok(()),
        Err(e) => {
            return Err(JailError::Path {
                path: jail.dir.clone(),
                source: e,
            })
        }
    };

    chown_tree(cx, &dirfd, &jail.dir, 0, 0, 0, &mount_points)
}

fn chown_tree(
    cx: &mut Context,
    dirfd: &OwnedFd,
    dirbuf: &str,
    depth: usize,
    owner: libc::uid_t,
    group: libc::gid_t,
    mount_points: &HashSet<String>,
) -> Result<(), JailError> {
    let home_map = if depth == 1 && dirbuf.ends_with("/home/") {
        Some(build_home_map())
    } else {
        None
    };

    let mut dir = Dir::openat(
        Some(dirfd.as_raw_fd()),
        ".",
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| JailError::Path {
        path: dirbuf.to_string(),
        source: e,
    })?;
    let mut entries: Vec<(String, Option<Type>)> = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| JailError::Path {
            path: dirbuf.to_string(),
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
        let full = format!("{}{}", dirbuf, name);
        let file_type = match file_type {
            Some(t) => t,
            None => match stat::fstatat(
                Some(dirfd.as_raw_fd()),
                name.as_str(),
                fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
            )
            {
                Ok(st) => match st.st_mode & libc::S_IFMT {
                    libc::S_IFDIR => Type::Directory,
                    libc::S_IFLNK => Type::Symlink,
                    _ => Type::File,
                },
                Err(e) => return Err(JailError::Path { path: full, source: e }),
            },
        };

        // Symlinks take the enclosing owner, never the home map's.
        if file_type == Type::Symlink {
            fsops::lchown(cx, &full, owner, group)
                .map_err(|e| JailError::fs("chown", full.clone(), e))?;
            continue;
        }

        let (uid, gid) = home_map
            .as_ref()
            .and_then(|map| map.get(&name).copied())
            .unwrap_or((owner, group));

        if file_type == Type::Directory {
            if mount_points.contains(&full) {
                continue;
            }
            let sub = fcntl::openat(
                Some(dirfd.as_raw_fd()),
                name.as_str(),
                OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
                Mode::empty(),
            )
            .map_err(|e| JailError::Path {
                path: full.clone(),
                source: e,
            })?;
            let sub = unsafe { OwnedFd::from_raw_fd(sub) };
            fsops::fchown(cx, sub.as_raw_fd(), uid, gid, &full)
                .map_err(|e| JailError::fs("chown", full.clone(), e))?;
            let subdir = format!("{}/", full);
            chown_tree(cx, &sub, &subdir, depth + 1, uid, gid, mount_points)?;
        } else {
            fsops::lchown(cx, &full, uid, gid)
                .map_err(|e| JailError::fs("chown", full.clone(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_map_prefers_home_basenames() {
        // Every password entry must land under some key; single-level
        // /home/<name> entries are keyed by that basename.
        let map = build_home_map();
        for entry in passwd::all_entries() {
            if let Some(base) = entry.dir.strip_prefix("/home/") {
                if !base.contains('/') {
                    assert!(map.contains_key(base));
                    continue;
                }
            }
            assert!(map.contains_key(&entry.name));
        }
    }
}
