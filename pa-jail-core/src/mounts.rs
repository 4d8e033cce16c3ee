//! A snapshot of the mounted filesystems and the operations the jail is
//! allowed to perform on them.
//!
//! The snapshot is parsed from `/proc/mounts`. Recognized option words
//! become [`MsFlags`] bits and are stripped from the textual options; the
//! residue is kept as filesystem-specific data for replication. A slot is
//! `allowed` — replicable into a jail — exactly for the four well-known
//! pseudo-filesystem mounts.

use crate::errors::JailError;
use crate::Context;
use nix::errno::Errno;
use nix::mount::{mount, umount, MsFlags};
use std::collections::BTreeMap;

/// One mounted filesystem, keyed by its mount point in [`MountTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSlot {
    /// The mount source (first `/proc/mounts` field).
    pub fsname: String,
    /// The filesystem type.
    pub fstype: String,
    /// The unparsed option string, for narration.
    pub options: String,
    /// Option words recognized as mount flags.
    pub flags: MsFlags,
    /// Leftover option words, passed as filesystem-specific data.
    pub data: String,
    /// Whether the jail may replicate this mount.
    pub allowed: bool,
}

impl MountSlot {
    /// Two slots describe the same mount if everything but `allowed`
    /// matches.
    pub fn same_mount(&self, other: &MountSlot) -> bool {
        self.fsname == other.fsname
            && self.fstype == other.fstype
            && self.flags == other.flags
            && self.data == other.data
    }
}

/// The (mount point → slot) snapshot.
#[derive(Debug, Default)]
pub struct MountTable {
    slots: BTreeMap<String, MountSlot>,
}

fn allow_mount(mount_point: &str, fstype: &str) -> bool {
    matches!(
        (mount_point, fstype),
        ("/proc", "proc") | ("/sys", "sysfs") | ("/dev", "udev") | ("/dev/pts", "devpts")
    )
}

/// Undo the octal escapes `getmntent` fields use for whitespace.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn parse_options(options: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data: Vec<&str> = Vec::new();
    for word in options.split(',') {
        match word {
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "rw" | "" => {}
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

fn parse_line(line: &str) -> Option<(String, MountSlot)> {
    let mut fields = line.split_ascii_whitespace();
    let fsname = unescape(fields.next()?);
    let mount_point = unescape(fields.next()?);
    let fstype = fields.next()?.to_string();
    let options = fields.next()?.to_string();
    let (flags, data) = parse_options(&options);
    let allowed = allow_mount(&mount_point, &fstype);
    Some((
        mount_point,
        MountSlot {
            fsname,
            fstype,
            options,
            flags,
            data,
            allowed,
        },
    ))
}

impl MountTable {
    /// Snapshot the currently mounted filesystems.
    pub fn snapshot() -> Result<MountTable, JailError> {
        let text = std::fs::read_to_string("/proc/mounts").map_err(|e| JailError::Io {
            path: "/proc/mounts".to_string(),
            source: e,
        })?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> MountTable {
        let mut slots = BTreeMap::new();
        for line in text.lines() {
            if let Some((mount_point, slot)) = parse_line(line) {
                slots.insert(mount_point, slot);
            }
        }
        MountTable { slots }
    }

    /// Look up the slot mounted at exactly `mount_point`.
    pub fn get(&self, mount_point: &str) -> Option<&MountSlot> {
        self.slots.get(mount_point)
    }

    /// Whether anything is mounted at exactly `mount_point`.
    pub fn contains(&self, mount_point: &str) -> bool {
        self.slots.contains_key(mount_point)
    }

    /// Mount points at or beneath `dir` (which must end in `/`), deepest
    /// first so children unmount before their parents.
    pub fn points_at_or_under(&self, dir: &str) -> Vec<String> {
        let exact = crate::paths::no_end_slash(dir);
        self.slots
            .keys()
            .filter(|point| point.starts_with(dir) || **point == exact)
            .rev()
            .cloned()
            .collect()
    }

    /// Forget a slot after its mount point was unmounted.
    pub fn remove(&mut self, mount_point: &str) {
        self.slots.remove(mount_point);
    }

    /// All mount points in the snapshot.
    pub fn iter_points(&self) -> impl Iterator<Item = &String> {
        self.slots.keys()
    }
}

/// Replicate `slot` at `dst`. Callers are expected to have checked that
/// an identical mount is not already present there.
pub fn replicate(cx: &Context, slot: &MountSlot, dst: &str) -> Result<(), Errno> {
    cx.narrate(format_args!(
        "mount -i -n -t {}{}{} {} {}",
        slot.fstype,
        if slot.options.is_empty() { "" } else { " -o " },
        slot.options,
        slot.fsname,
        dst
    ));
    if cx.dry_run {
        return Ok(());
    }
    let data = if slot.data.is_empty() {
        None
    } else {
        Some(slot.data.as_str())
    };
    mount(
        Some(slot.fsname.as_str()),
        dst,
        Some(slot.fstype.as_str()),
        slot.flags,
        data,
    )
}

/// Unmount `mount_point`.
pub fn unmount(cx: &Context, mount_point: &str) -> Result<(), Errno> {
    cx.narrate(format_args!("umount -i -n {}", mount_point));
    if cx.dry_run {
        return Ok(());
    }
    umount(mount_point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_mounts_lines() {
        let table = MountTable::parse(
            "proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0\n\
             sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0\n\
             /dev/sda1 / ext4 rw,relatime,errors=remount-ro 0 0\n\
             devpts /dev/pts devpts rw,nosuid,noexec,relatime,gid=5,mode=620,ptmxmode=000 0 0\n",
        );

        let proc = table.get("/proc").unwrap();
        assert!(proc.allowed);
        assert_eq!(proc.fstype, "proc");
        assert_eq!(
            proc.flags,
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME
        );
        assert_eq!(proc.data, "");

        let root = table.get("/").unwrap();
        assert!(!root.allowed);
        assert_eq!(root.flags, MsFlags::MS_RELATIME);
        assert_eq!(root.data, "errors=remount-ro");

        let pts = table.get("/dev/pts").unwrap();
        assert!(pts.allowed);
        assert_eq!(pts.data, "gid=5,mode=620,ptmxmode=000");
    }

    #[test]
    fn udev_is_allowed_only_with_matching_type() {
        let table = MountTable::parse(
            "udev /dev udev rw,nosuid 0 0\n\
             devtmpfs /dev devtmpfs rw,nosuid 0 0\n",
        );
        // Later lines win; devtmpfs at /dev is not replicable.
        assert!(!table.get("/dev").unwrap().allowed);
    }

    #[test]
    fn unescapes_whitespace_in_mount_points() {
        let table = MountTable::parse("tmpfs /mnt/with\\040space tmpfs rw 0 0\n");
        assert!(table.contains("/mnt/with space"));
    }

    #[test]
    fn umount_candidates_are_deepest_first_and_inclusive() {
        let table = MountTable::parse(
            "proc /srv/jails/a/proc proc rw 0 0\n\
             devpts /srv/jails/a/dev/pts devpts rw 0 0\n\
             tmpfs /srv/jails/a tmpfs rw 0 0\n\
             proc /srv/jails/ab/proc proc rw 0 0\n",
        );
        let points = table.points_at_or_under("/srv/jails/a/");
        assert_eq!(
            points,
            vec![
                "/srv/jails/a/proc".to_string(),
                "/srv/jails/a/dev/pts".to_string(),
                "/srv/jails/a".to_string(),
            ]
        );
    }
}
