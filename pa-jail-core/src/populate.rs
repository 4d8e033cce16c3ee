//! Manifest-driven jail population.
//!
//! The populator reproduces a curated view of the host filesystem inside
//! the jail: hard links for same-device regular files, a staging
//! link-farm for cross-device files, directory and device-node
//! recreation, symbolic-link replay with target expansion, and selective
//! replication of the allowed pseudo-filesystem mounts.
//!
//! Per-entry failures are reported and degrade the run but never stop the
//! manifest; only structural failures (an unreadable manifest, a jail
//! root that cannot be claimed) abort.

use crate::errors::JailError;
use crate::paths::{end_slash, join, no_end_slash};
use crate::{fsops, mounts, Context};
use log::debug;
use nix::errno::Errno;
use nix::sys::stat::{self, FileStat};
use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;

/// Flags attached to one manifest entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFlags {
    /// Force a copy even where a hard link would do.
    pub cp: bool,
    /// Never hard-link from the source; copy preserving metadata.
    pub nolink: bool,
}

/// One parsed manifest line.
#[derive(Debug, PartialEq, Eq)]
pub enum Directive {
    /// `<path>:` — switch the current source and destination directories.
    Scope(String),
    /// A file to materialize.
    Entry {
        /// The part naming the destination (and, absent an arrow, the
        /// source as well).
        dst_part: String,
        /// The source named after ` <- `, if any.
        src_override: Option<String>,
        /// Flags from the bracketed suffix.
        flags: EntryFlags,
    },
}

impl Directive {
    /// Parse one manifest line; comments and blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Directive> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(body) = line.strip_suffix(':') {
            let body = if body == "." {
                "/"
            } else if body.starts_with("./") {
                &body[1..]
            } else {
                body
            };
            let mut dir = body.to_string();
            if !dir.starts_with('/') {
                dir.insert(0, '/');
            }
            return Some(Directive::Scope(end_slash(&no_end_slash(&dir))));
        }

        let mut flags = EntryFlags::default();
        let mut body = line;
        if body.ends_with(']') {
            let open = body.rfind('[')?;
            for token in body[open + 1..body.len() - 1].split(',') {
                match token.trim() {
                    "cp" => flags.cp = true,
                    "nolink" => flags.nolink = true,
                    _ => {}
                }
            }
            body = body[..open].trim_end();
        }
        if body.is_empty() {
            return None;
        }

        match body.find(" <- ") {
            Some(pos) => Some(Directive::Entry {
                dst_part: body[..pos].to_string(),
                src_override: Some(body[pos + 4..].to_string()),
                flags,
            }),
            None => Some(Directive::Entry {
                dst_part: body.to_string(),
                src_override: None,
                flags,
            }),
        }
    }
}

/// The population engine for one jail.
pub struct Populator<'a> {
    cx: &'a mut Context,
    dst_root: String,
    link_dir: Option<String>,
    copy_samedev: bool,
    jail_dev: libc::dev_t,
    base_flags: EntryFlags,
    dests: HashSet<String>,
    aliases: BTreeMap<String, Vec<String>>,
    staged_dirs: HashSet<String>,
}

impl<'a> Populator<'a> {
    /// Create a populator rooted at `dst_root` for a jail living on
    /// device `jail_dev`. Without a staging directory every regular file
    /// is copied rather than linked.
    pub fn new(
        cx: &'a mut Context,
        dst_root: &str,
        link_dir: Option<String>,
        jail_dev: libc::dev_t,
    ) -> Self {
        let link_dir = link_dir.map(|d| no_end_slash(&d));
        let base_flags = EntryFlags {
            cp: false,
            nolink: link_dir.is_none(),
        };
        Populator {
            cx,
            dst_root: no_end_slash(dst_root),
            link_dir,
            copy_samedev: false,
            jail_dev,
            base_flags,
            dests: HashSet::new(),
            aliases: BTreeMap::new(),
            staged_dirs: HashSet::new(),
        }
    }

    /// Claim the jail root and pre-seed the pseudo-filesystem paths so an
    /// allowed mount snapshot replicates procfs and devpts into the jail.
    pub fn prepare_root(&mut self) -> Result<(), JailError> {
        fsops::chmod(self.cx, &self.dst_root, 0o755)
            .map_err(|e| JailError::fs("chmod", self.dst_root.clone(), e))?;
        fsops::lchown(self.cx, &self.dst_root, 0, 0)
            .map_err(|e| JailError::fs("chown", self.dst_root.clone(), e))?;
        self.dests.insert(format!("{}/", self.dst_root));

        for path in ["/proc", "/dev/pts", "/dev/ptmx"] {
            let dst = format!("{}{}", self.dst_root, path);
            self.handle_copy(path.to_string(), dst, true, EntryFlags::default());
        }
        Ok(())
    }

    /// Feed the manifest through the engine.
    pub fn populate(
        &mut self,
        reader: &mut dyn BufRead,
        source_name: &str,
    ) -> Result<(), JailError> {
        let mut cursrcdir = String::from("/");
        let mut curdstdir = format!("{}/", self.dst_root);
        let mut entries = 0usize;

        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).map_err(|e| JailError::Io {
                path: source_name.to_string(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            match Directive::parse(&line) {
                None => {}
                Some(Directive::Scope(dir)) => {
                    curdstdir = format!("{}{}", self.dst_root, dir);
                    cursrcdir = dir;
                }
                Some(Directive::Entry {
                    dst_part,
                    src_override,
                    flags,
                }) => {
                    let flags = EntryFlags {
                        cp: flags.cp || self.base_flags.cp,
                        nolink: flags.nolink || self.base_flags.nolink,
                    };
                    let absolute_entry = dst_part.starts_with('/');
                    let (src, dst) = match (absolute_entry, src_override) {
                        (true, Some(s)) => (s, join(&curdstdir, &dst_part)),
                        (true, None) => (dst_part.clone(), join(&curdstdir, &dst_part)),
                        (false, Some(s)) => (s, format!("{}{}", curdstdir, dst_part)),
                        (false, None) => (
                            format!("{}{}", cursrcdir, dst_part),
                            format!("{}{}", curdstdir, dst_part),
                        ),
                    };
                    entries += 1;
                    self.handle_copy(src, dst, absolute_entry, flags);
                }
            }
        }
        debug!("populated {} from {} manifest entries", self.dst_root, entries);
        Ok(())
    }

    /// Materialize `src` at `dst`.
    ///
    /// Returns the source's mode on a fresh, fully successful
    /// materialization; `None` when the destination was already handled
    /// or the entry failed (failures having been reported).
    fn handle_copy(
        &mut self,
        src: String,
        dst: String,
        check_parents: bool,
        flags: EntryFlags,
    ) -> Option<libc::mode_t> {
        if !self.dests.insert(dst.clone()) {
            return None;
        }

        if check_parents {
            if let Some(last_slash) = dst.rfind('/') {
                if last_slash != 0 && last_slash != dst.len() - 1 {
                    let tail_len = dst.len() - last_slash;
                    if src.len() > tail_len && src[src.len() - tail_len..] == dst[last_slash..] {
                        let dst_dir = &dst[..last_slash];
                        if matches!(stat::lstat(dst_dir), Err(Errno::ENOENT)) {
                            self.handle_copy(
                                src[..src.len() - tail_len].to_string(),
                                dst[..dst.len() - tail_len].to_string(),
                                true,
                                EntryFlags::default(),
                            );
                        }
                    }
                }
            }
        }

        let ss = match stat::lstat(src.as_str()) {
            Ok(st) => st,
            Err(e) => {
                self.cx.soft_fail("lstat", &src, e);
                return None;
            }
        };
        let file_type = ss.st_mode & libc::S_IFMT;
        let mut ds_mode = ss.st_mode;
        let mut ds_uid: libc::uid_t = 0;
        let mut ds_gid: libc::gid_t = 0;

        if file_type == libc::S_IFREG && flags.nolink {
            if !fsops::cp_p(self.cx, &src, &dst) {
                return None;
            }
            ds_uid = ss.st_uid;
            ds_gid = ss.st_gid;
        } else if file_type == libc::S_IFREG
            && !self.copy_samedev
            && !flags.cp
            && ss.st_dev == self.jail_dev
        {
            if let Err(e) = fsops::hard_link(&*self.cx, &src, &dst, || {
                self.link_exists_ok(&src, &dst)
            }) {
                self.cx.soft_fail("link", &format!("{} {}", dst, src), e);
                return None;
            }
            ds_uid = ss.st_uid;
            ds_gid = ss.st_gid;
        } else if file_type == libc::S_IFREG || (file_type == libc::S_IFLNK && flags.cp) {
            if self.link_dir.is_none() {
                self.cx.soft_fail("link", &dst, Errno::EXDEV);
                return None;
            }
            if !self.handle_xdev_link(&src, &dst, &ss) {
                return None;
            }
            ds_uid = ss.st_uid;
            ds_gid = ss.st_gid;
        } else if file_type == libc::S_IFDIR {
            // Setuid/setgid bits survive; an existing directory is fine.
            let perm = ss.st_mode & (libc::S_ISUID | libc::S_ISGID | 0o777);
            match fsops::mkdir(self.cx, &dst, perm) {
                Ok(()) => ds_mode = perm | libc::S_IFDIR,
                Err(_) => match stat::lstat(dst.as_str()) {
                    Err(e) => {
                        self.cx.soft_fail("lstat", &dst, e);
                        return None;
                    }
                    Ok(dstat) if dstat.st_mode & libc::S_IFMT != libc::S_IFDIR => {
                        self.cx.soft_fail_msg(&dst, "Not a directory");
                        return None;
                    }
                    Ok(dstat) => {
                        ds_mode = dstat.st_mode;
                        ds_uid = dstat.st_uid;
                        ds_gid = dstat.st_gid;
                    }
                },
            }
        } else if matches!(
            file_type,
            libc::S_IFCHR | libc::S_IFBLK | libc::S_IFIFO | libc::S_IFSOCK
        ) {
            let masked = ss.st_mode
                & (libc::S_IFREG
                    | libc::S_IFCHR
                    | libc::S_IFBLK
                    | libc::S_IFIFO
                    | libc::S_IFSOCK
                    | libc::S_ISUID
                    | libc::S_ISGID
                    | 0o777);
            if let Err(e) = fsops::mknod(self.cx, &dst, masked, ss.st_rdev) {
                self.cx.soft_fail("mknod", &dst, e);
                return None;
            }
            ds_mode = masked;
        } else if file_type == libc::S_IFLNK {
            let target = match std::fs::read_link(&src) {
                Ok(t) => t.to_string_lossy().into_owned(),
                Err(e) => {
                    let errno = Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO));
                    self.cx.soft_fail("readlink", &src, errno);
                    return None;
                }
            };
            if target.len() >= 4096 {
                self.cx.soft_fail_msg(&src, "Symbolic link too long");
                return None;
            }
            if let Err(e) = fsops::symlink(self.cx, &target, &dst) {
                self.cx
                    .soft_fail("symlink", &format!("{} {}", target, dst), e);
                return None;
            }
            ds_mode = ss.st_mode;
            self.handle_symlink_dst(&src, &dst, &target);
        } else {
            self.cx.soft_fail_msg(&src, "Odd file type");
            return None;
        }

        if ds_mode != ss.st_mode {
            if let Err(e) = fsops::chmod(self.cx, &dst, ss.st_mode) {
                self.cx.soft_fail("chmod", &dst, e);
                return None;
            }
        }
        if ds_uid != ss.st_uid || ds_gid != ss.st_gid {
            if let Err(e) = fsops::lchown(self.cx, &dst, ss.st_uid, ss.st_gid) {
                self.cx.soft_fail("chown", &dst, e);
                return None;
            }
        }

        if file_type == libc::S_IFDIR {
            let (slot, already) = match self.cx.mounts() {
                Ok(table) => match table.get(&src) {
                    Some(slot) if slot.allowed => (
                        Some(slot.clone()),
                        table.get(&dst).is_some_and(|d| d.same_mount(slot)),
                    ),
                    _ => (None, false),
                },
                Err(_) => (None, false),
            };
            if let Some(slot) = slot {
                if !already {
                    if let Err(e) = mounts::replicate(self.cx, &slot, &dst) {
                        self.cx.soft_fail("mount", &dst, e);
                        return None;
                    }
                }
            }
        }

        Some(ss.st_mode)
    }

    /// Expand a just-created symlink: realize the file it points at, and
    /// remember directory-level aliases so later entries reaching the
    /// same file through the link are not treated as conflicts.
    fn handle_symlink_dst(&mut self, src: &str, dst: &str, target: &str) {
        let dst_lnkin = dst.to_string();

        let (src, dst) = if target.starts_with('/') {
            (
                target.to_string(),
                format!("{}{}", self.dst_root, target),
            )
        } else {
            let mut src = src.to_string();
            let mut dst = dst.to_string();
            let mut lnk = target.to_string();
            loop {
                if src.len() == 1 {
                    return;
                }
                let srcslash = src[..src.len() - 1].rfind('/');
                let dstslash = dst[..dst.len() - 1].rfind('/');
                let (Some(srcslash), Some(dstslash)) = (srcslash, dstslash) else {
                    return;
                };
                if dstslash < self.dst_root.len() {
                    return;
                }
                src.truncate(srcslash + 1);
                dst.truncate(dstslash + 1);
                if lnk.len() > 3 && lnk.starts_with("../") {
                    lnk.drain(..3);
                } else {
                    break;
                }
            }
            (format!("{}{}", src, lnk), format!("{}{}", dst, lnk))
        };

        // Never follow a link into the jail's procfs.
        let tail = &dst[self.dst_root.len().min(dst.len())..];
        if tail.starts_with("/proc/") {
            return;
        }

        if let Some(mode) = self.handle_copy(src, dst.clone(), true, EntryFlags::default()) {
            if mode & libc::S_IFMT == libc::S_IFDIR {
                self.aliases
                    .entry(dst.clone())
                    .or_default()
                    .push(dst_lnkin.clone());
                self.aliases.entry(dst_lnkin).or_default().push(dst);
            }
        }
    }

    /// Whether an `EEXIST` from `link(src, dst)` is benign: the paths
    /// already name the same inode, or some prefix of `dst` is a known
    /// alias of a destination that was already materialized.
    fn link_exists_ok(&self, src: &str, dst: &str) -> bool {
        if let (Ok(a), Ok(b)) = (stat::stat(src), stat::stat(dst)) {
            if a.st_dev == b.st_dev && a.st_ino == b.st_ino {
                return true;
            }
        }

        let mut end = dst.len();
        loop {
            let Some(slash) = dst[..end].rfind('/') else {
                break;
            };
            let dst_dir = &dst[..slash];
            if let Some(alts) = self.aliases.get(dst_dir) {
                for alt in alts {
                    let candidate = format!("{}{}", alt, &dst[slash..]);
                    if self.dests.contains(&candidate) {
                        return true;
                    }
                }
            }
            if slash == 0 {
                break;
            }
            end = slash;
        }
        false
    }

    /// Cross-device path: refresh the staged copy under the link farm if
    /// its metadata drifted from the source, then hard-link it into the
    /// jail.
    fn handle_xdev_link(&mut self, src: &str, dst: &str, ss: &FileStat) -> bool {
        let link_dir = self
            .link_dir
            .clone()
            .expect("cross-device staging requires a link farm");
        let lnk = format!("{}{}", link_dir, src);

        let fresh = match stat::lstat(lnk.as_str()) {
            Ok(lst) => {
                if lst.st_mode & libc::S_IFMT == libc::S_IFDIR {
                    self.cx.soft_fail_msg(&lnk, "Is a directory");
                    return false;
                }
                lst.st_mode == ss.st_mode
                    && lst.st_uid == ss.st_uid
                    && lst.st_gid == ss.st_gid
                    && lst.st_size == ss.st_size
                    && lst.st_mtime == ss.st_mtime
            }
            Err(_) => false,
        };
        if !fresh && !self.copy_for_xdev_link(src, &lnk, &link_dir) {
            return false;
        }

        if let Err(e) = fsops::hard_link(&*self.cx, &lnk, dst, || self.link_exists_ok(&lnk, dst)) {
            self.cx.soft_fail("link", &format!("{} {}", dst, lnk), e);
            return false;
        }
        true
    }

    /// Mirror the source's directory chain inside the link farm (mode
    /// 0770) and copy the file preserving its metadata.
    fn copy_for_xdev_link(&mut self, src: &str, lnk: &str, link_dir: &str) -> bool {
        let mut pos = link_dir.len().saturating_sub(1);
        while let Some(off) = lnk[pos + 1..].find('/') {
            pos = pos + 1 + off;
            let super_dir = &lnk[..pos];
            if !self.staged_dirs.contains(super_dir) {
                match stat::lstat(super_dir) {
                    Err(Errno::ENOENT) => {
                        if let Err(e) = fsops::mkdir(self.cx, super_dir, 0o770) {
                            if e != Errno::EEXIST {
                                self.cx.soft_fail("mkdir", super_dir, e);
                                return false;
                            }
                        }
                    }
                    Err(e) => {
                        self.cx.soft_fail("lstat", super_dir, e);
                        return false;
                    }
                    Ok(st) if st.st_mode & libc::S_IFMT != libc::S_IFDIR => {
                        self.cx.soft_fail_msg(super_dir, "Not a directory");
                        return false;
                    }
                    Ok(_) => {}
                }
                self.staged_dirs.insert(super_dir.to_string());
            }
        }
        fsops::cp_p(self.cx, src, lnk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dst: &str, src: Option<&str>, cp: bool, nolink: bool) -> Directive {
        Directive::Entry {
            dst_part: dst.to_string(),
            src_override: src.map(str::to_string),
            flags: EntryFlags { cp, nolink },
        }
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        assert_eq!(Directive::parse("# comment"), None);
        assert_eq!(Directive::parse(""), None);
        assert_eq!(Directive::parse("   \n"), None);
    }

    #[test]
    fn scope_directives_normalize() {
        assert_eq!(
            Directive::parse("/usr/bin:"),
            Some(Directive::Scope("/usr/bin/".to_string()))
        );
        assert_eq!(
            Directive::parse("./relative:"),
            Some(Directive::Scope("/relative/".to_string()))
        );
        assert_eq!(Directive::parse(".:"), Some(Directive::Scope("/".to_string())));
        assert_eq!(
            Directive::parse("/trailing//:"),
            Some(Directive::Scope("/trailing/".to_string()))
        );
        assert_eq!(
            Directive::parse("bare:"),
            Some(Directive::Scope("/bare/".to_string()))
        );
    }

    #[test]
    fn entries_parse_flags_and_arrows() {
        assert_eq!(
            Directive::parse("/bin/ls"),
            Some(entry("/bin/ls", None, false, false))
        );
        assert_eq!(
            Directive::parse("libfoo.so [cp]"),
            Some(entry("libfoo.so", None, true, false))
        );
        assert_eq!(
            Directive::parse("libfoo.so [cp,nolink]"),
            Some(entry("libfoo.so", None, true, true))
        );
        assert_eq!(
            Directive::parse("libfoo.so [weird,cp]"),
            Some(entry("libfoo.so", None, true, false))
        );
        assert_eq!(
            Directive::parse("etc/hosts <- /etc/hosts.jail"),
            Some(entry("etc/hosts", Some("/etc/hosts.jail"), false, false))
        );
        assert_eq!(
            Directive::parse("/bin/sh <- /bin/dash [cp]"),
            Some(entry("/bin/sh", Some("/bin/dash"), true, false))
        );
    }

    #[test]
    fn bracket_without_open_is_dropped() {
        assert_eq!(Directive::parse("oops]"), None);
    }

    #[test]
    fn alias_table_forgives_equivalent_destinations() {
        let mut cx = Context::new(false, false, false);
        let mut populator = Populator::new(&mut cx, "/jail", None, 0);
        // A symlink /jail/lib64 -> /jail/usr/lib64 was materialized.
        populator
            .aliases
            .entry("/jail/usr/lib64".to_string())
            .or_default()
            .push("/jail/lib64".to_string());
        populator
            .aliases
            .entry("/jail/lib64".to_string())
            .or_default()
            .push("/jail/usr/lib64".to_string());
        populator
            .dests
            .insert("/jail/lib64/libc.so.6".to_string());

        // Sources do not exist, so only the alias path can succeed.
        assert!(populator.link_exists_ok(
            "/no/such/source",
            "/jail/usr/lib64/libc.so.6"
        ));
        assert!(!populator.link_exists_ok("/no/such/source", "/jail/usr/lib64/other.so"));
    }

    #[test]
    fn populates_a_tree_from_a_manifest() {
        use std::io::BufReader;
        use std::os::unix::fs::MetadataExt;

        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().to_str().unwrap().to_string();
        let src_dir = format!("{}/source", root);
        std::fs::create_dir_all(format!("{}/sub", src_dir)).unwrap();
        std::fs::write(format!("{}/sub/data.txt", src_dir), b"payload").unwrap();
        std::os::unix::fs::symlink("sub/data.txt", format!("{}/alias.txt", src_dir)).unwrap();

        let jail = format!("{}/jail", root);
        std::fs::create_dir(&jail).unwrap();
        let jail_dev = stat::stat(jail.as_str()).unwrap().st_dev;

        let manifest = format!("# files\n{}/sub/data.txt\n{}/alias.txt\n", src_dir, src_dir);
        let farm = format!("{}/farm", root);

        let run_once = || {
            let mut cx = Context::new(false, false, false);
            let mut populator = Populator::new(&mut cx, &jail, Some(farm.clone()), jail_dev);
            populator
                .populate(&mut BufReader::new(manifest.as_bytes()), "manifest")
                .unwrap();
            cx.degraded()
        };

        assert!(!run_once());

        // Parents were created and the file is a hard link to the source.
        let linked = format!("{}{}/sub/data.txt", jail, src_dir);
        let src_meta = std::fs::metadata(format!("{}/sub/data.txt", src_dir)).unwrap();
        let dst_meta = std::fs::metadata(&linked).unwrap();
        assert_eq!(src_meta.ino(), dst_meta.ino());

        // The symlink was replayed with its target text intact.
        let replayed = std::fs::read_link(format!("{}{}/alias.txt", jail, src_dir)).unwrap();
        assert_eq!(replayed.to_str(), Some("sub/data.txt"));

        // Re-running the same manifest is a clean no-op.
        assert!(!run_once());
    }

    #[test]
    fn destination_set_deduplicates() {
        let mut cx = Context::new(false, false, false);
        let mut populator = Populator::new(&mut cx, "/jail", None, 0);
        populator.dests.insert("/jail/bin/ls".to_string());
        // Second materialization of the same destination is a no-op.
        assert_eq!(
            populator.handle_copy(
                "/bin/ls".to_string(),
                "/jail/bin/ls".to_string(),
                true,
                EntryFlags::default()
            ),
            None
        );
    }
}
