//! The authorization walk: decide whether a jail may exist at the target
//! path, and hand back the descriptors teardown and rename rely on.
//!
//! The walk opens the target one component at a time with
//! `openat(O_PATH|O_NOFOLLOW)` beneath the previous component's
//! descriptor, so no step can be redirected through a symlink swapped in
//! behind our back. Every ancestor above the authorizing directory must
//! be root-owned and not writable by anyone else, and somewhere along the
//! way a root-controlled `pa-jail.conf` must explicitly enable jails for
//! this location.

use crate::errors::JailError;
use crate::paths::end_slash;
use crate::{fsops, Action, Context};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{self, FileStat};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// The per-directory policy file name.
pub const POLICY_FILENAME: &str = "pa-jail.conf";
/// The legacy per-directory policy file name, still honored.
pub const LEGACY_POLICY_FILENAME: &str = "JAIL61";
/// The system-wide policy file.
pub const GLOBAL_POLICY_PATH: &str = "/etc/pa-jail.conf";

const GLOB_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// An authorized jail directory.
///
/// Invariant: `dir` begins with `permdir` and `permdir` is non-empty.
/// `parent_fd` stays open so `rm` and `mv` can operate relative to the
/// parent that was actually vetted, not a path that may have changed.
pub struct JailDir {
    /// Absolute sanitized jail path, with a trailing slash.
    pub dir: String,
    /// The prefix of `dir` before the final component.
    pub parent: String,
    /// The final component of `dir`.
    pub component: String,
    /// Device of the jail directory, used to decide link eligibility.
    pub dev: libc::dev_t,
    /// The directory under which jail creation was authorized, with a
    /// trailing slash.
    pub permdir: String,
    parent_fd: Option<OwnedFd>,
}

impl JailDir {
    /// The retained descriptor for the jail's parent directory.
    pub fn parent_fd(&self) -> Option<BorrowedFd<'_>> {
        self.parent_fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Release the retained parent descriptor.
    pub fn close_parent(&mut self) {
        self.parent_fd = None;
    }
}

fn writable_only_by_root(st: &FileStat) -> bool {
    st.st_uid == 0
        && (st.st_gid == 0 || st.st_mode & libc::S_IWGRP == 0)
        && st.st_mode & libc::S_IWOTH == 0
}

/// The prefix of `dir` containing as many `/` as `pattern_dir` does.
fn superdir_for<'d>(dir: &'d str, pattern_dir: &str) -> &'d str {
    let want = pattern_dir.bytes().filter(|&b| b == b'/').count();
    let mut seen = 0;
    for (i, b) in dir.bytes().enumerate() {
        if b == b'/' {
            seen += 1;
            if seen == want {
                return &dir[..i + 1];
            }
        }
    }
    dir
}

/// Accumulated policy decision for one walk.
struct PolicyEval {
    /// The full jail path being authorized, with a trailing slash.
    dir: String,
    allowed: bool,
    permdir: String,
    alternate_permfile: Option<String>,
}

impl PolicyEval {
    fn new(dir: &str) -> Self {
        PolicyEval {
            dir: dir.to_string(),
            allowed: false,
            permdir: String::new(),
            alternate_permfile: None,
        }
    }

    /// Apply one policy file's rules.
    ///
    /// `file_dir` is the directory holding the file; `is_local` is false
    /// only for the system-wide file. Later, more specific rules win over
    /// earlier general ones within the same file; a matching disable is
    /// fatal; a non-matching enable pattern only records the file as a
    /// hint for the final "no policy enables jails" message.
    fn evaluate(
        &mut self,
        text: &str,
        file_dir: &str,
        file_name: &str,
        is_local: bool,
    ) -> Result<(), JailError> {
        let this_dir = end_slash(file_dir);
        let file_path = format!("{}{}", this_dir, file_name);
        let mut allowed_globally: Option<bool> = None;
        let mut allowed_locally: Option<bool> = None;
        let mut scope = String::new();

        for line in text.lines() {
            let mut words = line.split_whitespace();
            let Some(word1) = words.next() else { continue };
            let word2 = words.next().unwrap_or("");

            let mut wdir = word2.to_string();
            while wdir.len() > 2 && wdir.starts_with("./") {
                wdir.drain(..2);
            }
            if wdir.is_empty() || wdir == "." {
                wdir = this_dir.clone();
            }
            wdir = end_slash(&wdir);
            if !wdir.starts_with('/') {
                wdir = format!("{}{}", this_dir, wdir);
            }

            let superdir = superdir_for(&self.dir, &wdir);
            let dirmatch = match glob::Pattern::new(&wdir) {
                Ok(pattern) => pattern.matches_with(superdir, GLOB_OPTIONS),
                Err(_) => false,
            };

            match word1 {
                "disablejail" | "nojail" => {
                    if word2.is_empty() {
                        allowed_globally = Some(false);
                    } else if dirmatch {
                        allowed_locally = Some(false);
                        scope = word2.to_string();
                    }
                }
                "enablejail" | "allowjail" => {
                    if word2.is_empty() {
                        allowed_globally = Some(true);
                    } else if dirmatch {
                        allowed_locally = Some(true);
                        scope = superdir.to_string();
                    } else {
                        self.alternate_permfile = Some(file_path.clone());
                    }
                }
                _ => {}
            }
        }

        if allowed_locally == Some(true) {
            self.allowed = true;
            self.permdir = scope;
            Ok(())
        } else if allowed_locally == Some(false) {
            Err(JailError::JailsDisabledUnder {
                file: file_path,
                scope,
            })
        } else if allowed_globally == Some(true) && is_local {
            self.allowed = true;
            self.permdir = this_dir;
            Ok(())
        } else if allowed_globally == Some(false) && is_local {
            Err(JailError::JailsDisabledHere { file: file_path })
        } else if allowed_globally == Some(false) {
            Err(JailError::JailsDisabled { file: file_path })
        } else {
            Ok(())
        }
    }
}

fn read_policy(fd: OwnedFd) -> Result<String, Errno> {
    let mut file = std::fs::File::from(fd);
    let mut buf = Vec::with_capacity(1024);
    file.by_ref()
        .take(8192)
        .read_to_end(&mut buf)
        .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn open_component(
    parent: Option<&OwnedFd>,
    component: &str,
    oflag: OFlag,
) -> Result<OwnedFd, Errno> {
    let raw = match parent {
        Some(fd) => fcntl::openat(Some(fd.as_raw_fd()), component, oflag, stat::Mode::empty())?,
        // Only the leading "/" is opened without a parent.
        None => fcntl::open(component, oflag, stat::Mode::empty())?,
    };
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Look for a policy file in the directory open as `dirfd` and fold it
/// into `eval`. The directory must itself be writable only by root for
/// its policy file to be honored.
fn check_permfile(
    cx: &Context,
    eval: &mut PolicyEval,
    dirfd: &OwnedFd,
    dirstat: &FileStat,
    this_dir: &str,
) -> Result<(), JailError> {
    let oflag = OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW;
    let mut name = POLICY_FILENAME;
    let mut conf = fcntl::openat(Some(dirfd.as_raw_fd()), name, oflag, stat::Mode::empty());
    if conf == Err(Errno::ENOENT) {
        name = LEGACY_POLICY_FILENAME;
        conf = fcntl::openat(Some(dirfd.as_raw_fd()), name, oflag, stat::Mode::empty());
    }
    let file_path = format!("{}{}", end_slash(this_dir), name);
    let raw = match conf {
        Err(Errno::ENOENT) | Err(Errno::ELOOP) => return Ok(()),
        Err(e) => return Err(JailError::Path {
            path: file_path,
            source: e,
        }),
        Ok(raw) => raw,
    };
    let conf_fd = unsafe { OwnedFd::from_raw_fd(raw) };

    if !writable_only_by_root(dirstat) {
        // A policy file in a loosely-permissioned directory carries no
        // authority either way.
        return Ok(());
    }

    let file_stat = stat::fstat(conf_fd.as_raw_fd()).map_err(|e| JailError::Path {
        path: file_path.clone(),
        source: e,
    })?;
    if !writable_only_by_root(&file_stat) {
        if !eval.allowed {
            return Err(JailError::PolicyFileWritable { path: file_path });
        }
        if cx.verbose {
            eprintln!("{}: Writable by non-root, ignoring", file_path);
        }
        return Ok(());
    }

    let text = read_policy(conf_fd).map_err(|e| JailError::Path {
        path: file_path,
        source: e,
    })?;
    eval.evaluate(&text, this_dir, name, true)
}

/// Authorize the jail path `dir` for `action`.
///
/// `dir` must already be absolute and sanitized. Returns `Ok(None)` only
/// for a forced `rm` whose target no longer exists. On success the
/// returned [`JailDir`] satisfies its permdir invariant.
pub fn authorize(
    cx: &mut Context,
    dir: &str,
    action: Action,
    force: bool,
) -> Result<Option<JailDir>, JailError> {
    if dir.is_empty() || dir == "/" || !dir.starts_with('/') {
        return Err(JailError::BadFilename {
            path: dir.to_string(),
            what: "filename",
        });
    }
    let dir = end_slash(dir);
    let mut eval = PolicyEval::new(&dir);

    // The system-wide policy file speaks first.
    let oflag = OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW;
    if let Ok(raw) = fcntl::open(GLOBAL_POLICY_PATH, oflag, stat::Mode::empty()) {
        let conf_fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let file_stat = stat::fstat(conf_fd.as_raw_fd()).map_err(|e| JailError::Path {
            path: GLOBAL_POLICY_PATH.to_string(),
            source: e,
        })?;
        if !writable_only_by_root(&file_stat) {
            return Err(JailError::PolicyFileWritable {
                path: GLOBAL_POLICY_PATH.to_string(),
            });
        }
        let text = read_policy(conf_fd).map_err(|e| JailError::Path {
            path: GLOBAL_POLICY_PATH.to_string(),
            source: e,
        })?;
        eval.evaluate(&text, "/etc/", POLICY_FILENAME, false)?;
    }

    let bytes = dir.as_bytes();
    let mut last_pos = 0usize;
    let mut parent = String::new();
    let mut component = String::new();
    let mut parent_fd: Option<OwnedFd> = None;
    let mut fd: Option<OwnedFd> = None;
    let mut dry_walking = false;
    let mut dev: libc::dev_t = 0;

    while last_pos != dir.len() {
        let mut next_pos = last_pos;
        while next_pos != 0 && next_pos < dir.len() && bytes[next_pos] != b'/' {
            next_pos += 1;
        }
        if next_pos == 0 {
            next_pos = 1;
        }
        parent = dir[..last_pos].to_string();
        component = dir[last_pos..next_pos].to_string();
        let this_dir = &dir[..next_pos];
        last_pos = next_pos;
        while last_pos != dir.len() && bytes[last_pos] == b'/' {
            last_pos += 1;
        }
        let is_final = last_pos == dir.len();

        let allowed_here = !eval.permdir.is_empty()
            && last_pos >= eval.permdir.len()
            && dir.starts_with(&eval.permdir);

        parent_fd = fd.take();

        let path_flags = OFlag::O_PATH | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW;
        let opened = if dry_walking {
            Err(Errno::ENOENT)
        } else {
            open_component(parent_fd.as_ref(), &component, path_flags)
        };

        let this_fd = match opened {
            Ok(fd) => fd,
            Err(errno) => {
                let creatable = errno == Errno::ENOENT
                    && allowed_here
                    && matches!(action, Action::Init | Action::Run);
                if dry_walking || creatable {
                    if cx.dry_run {
                        cx.narrate(format_args!("mkdir -m 0755 {}", this_dir));
                        if is_final {
                            cx.narrate(format_args!("chmod 0755 {}", this_dir));
                        }
                        dry_walking = true;
                        continue;
                    }
                    let pfd = parent_fd
                        .as_ref()
                        .expect("components below the root have a parent");
                    fsops::mkdirat(cx, pfd.as_fd(), &component, 0o755, this_dir)
                        .map_err(|e| JailError::fs("mkdir", this_dir, e))?;
                    let new_fd = open_component(
                        parent_fd.as_ref(),
                        &component,
                        OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
                    )
                    .map_err(|e| JailError::Path {
                        path: this_dir.to_string(),
                        source: e,
                    })?;
                    if is_final {
                        // Created roots must not carry suid/sgid.
                        fsops::fchmod(cx, new_fd.as_raw_fd(), 0o755, this_dir)
                            .map_err(|e| JailError::fs("chmod", this_dir, e))?;
                    }
                    new_fd
                } else if errno == Errno::ENOENT && action == Action::Rm && force {
                    return Ok(None);
                } else {
                    return Err(JailError::Path {
                        path: this_dir.to_string(),
                        source: errno,
                    });
                }
            }
        };
        let st = stat::fstat(this_fd.as_raw_fd()).map_err(|e| JailError::Path {
            path: this_dir.to_string(),
            source: e,
        })?;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(JailError::NotADirectory {
                path: this_dir.to_string(),
            });
        }
        if !allowed_here && !is_final {
            if st.st_uid != 0 {
                return Err(JailError::NotRootOwned {
                    path: this_dir.to_string(),
                });
            }
            if (st.st_gid != 0 && st.st_mode & libc::S_IWGRP != 0)
                || st.st_mode & libc::S_IWOTH != 0
            {
                return Err(JailError::WritableByNonRoot {
                    path: this_dir.to_string(),
                });
            }
        }
        dev = st.st_dev;

        if !parent.is_empty() {
            check_permfile(cx, &mut eval, &this_fd, &st, this_dir)?;
        }
        fd = Some(this_fd);
    }

    if !eval.allowed {
        let hint = eval
            .alternate_permfile
            .map(|f| format!("\n  (Perhaps you need to edit `{}`.)", f))
            .unwrap_or_default();
        return Err(JailError::NoJailPolicy { dir, hint });
    }
    drop(fd);

    debug!("authorized {} under {}", dir, eval.permdir);
    Ok(Some(JailDir {
        parent,
        component,
        dev,
        permdir: eval.permdir,
        parent_fd,
        dir,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_for(dir: &str) -> PolicyEval {
        PolicyEval::new(dir)
    }

    #[test]
    fn pattern_enable_sets_permdir_to_matched_superdir() {
        let mut eval = eval_for("/var/jails/alice/");
        eval.evaluate("enablejail /var/jails/*/\n", "/var/jails", POLICY_FILENAME, true)
            .unwrap();
        assert!(eval.allowed);
        assert_eq!(eval.permdir, "/var/jails/alice/");
    }

    #[test]
    fn global_enable_in_local_file_uses_file_directory() {
        let mut eval = eval_for("/srv/jails/a/");
        eval.evaluate("enablejail\n", "/srv/jails", POLICY_FILENAME, true)
            .unwrap();
        assert!(eval.allowed);
        assert_eq!(eval.permdir, "/srv/jails/");
    }

    #[test]
    fn global_enable_in_system_file_is_advisory_only() {
        let mut eval = eval_for("/srv/jails/a/");
        eval.evaluate("enablejail\n", "/etc", POLICY_FILENAME, false)
            .unwrap();
        assert!(!eval.allowed);
    }

    #[test]
    fn bare_disable_is_fatal_with_the_local_wording() {
        let mut eval = eval_for("/srv/jails/b/");
        let err = eval
            .evaluate("disablejail\n", "/srv/jails", POLICY_FILENAME, true)
            .unwrap_err();
        assert!(matches!(err, JailError::JailsDisabledHere { .. }));
        assert!(err.to_string().contains("Jails are disabled here"));

        let mut eval = eval_for("/srv/jails/b/");
        let err = eval
            .evaluate("nojail\n", "/etc", POLICY_FILENAME, false)
            .unwrap_err();
        assert!(matches!(err, JailError::JailsDisabled { .. }));
    }

    #[test]
    fn matching_disable_pattern_is_fatal_with_its_scope() {
        let mut eval = eval_for("/var/jails/bad/");
        let err = eval
            .evaluate(
                "enablejail /var/jails/*/\ndisablejail /var/jails/bad/\n",
                "/var/jails",
                POLICY_FILENAME,
                true,
            )
            .unwrap_err();
        match err {
            JailError::JailsDisabledUnder { scope, .. } => {
                assert_eq!(scope, "/var/jails/bad/");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn non_matching_enable_records_the_hint_file() {
        let mut eval = eval_for("/srv/other/x/");
        eval.evaluate(
            "enablejail /var/jails/*/\n",
            "/srv/other",
            POLICY_FILENAME,
            true,
        )
        .unwrap();
        assert!(!eval.allowed);
        assert_eq!(
            eval.alternate_permfile.as_deref(),
            Some("/srv/other/pa-jail.conf")
        );
    }

    #[test]
    fn relative_and_dot_patterns_resolve_against_the_file_directory() {
        let mut eval = eval_for("/srv/jails/sub/a/");
        eval.evaluate("allowjail ./sub/\n", "/srv/jails", POLICY_FILENAME, true)
            .unwrap();
        assert!(eval.allowed);
        assert_eq!(eval.permdir, "/srv/jails/sub/");

        let mut eval = eval_for("/srv/jails/a/");
        eval.evaluate("allowjail .\n", "/srv/jails", POLICY_FILENAME, true)
            .unwrap();
        assert!(eval.allowed);
        assert_eq!(eval.permdir, "/srv/jails/");
    }

    #[test]
    fn patterns_do_not_cross_separators_or_leading_dots() {
        // `*` must not match a nested path component.
        let mut eval = eval_for("/var/jails/a/b/");
        eval.evaluate("enablejail /var/*/\n", "/var", POLICY_FILENAME, true)
            .unwrap();
        assert!(eval.allowed);
        assert_eq!(eval.permdir, "/var/jails/");

        // `*` must not match a dotfile component.
        let mut eval = eval_for("/var/jails/.hidden/");
        eval.evaluate("enablejail /var/jails/*/\n", "/var/jails", POLICY_FILENAME, true)
            .unwrap();
        assert!(!eval.allowed);
    }

    #[test]
    fn later_specific_rules_override_earlier_general_ones() {
        // A matching local enable wins over a bare global disable in the
        // same file.
        let mut eval = eval_for("/var/jails/a/");
        eval.evaluate(
            "disablejail\nenablejail /var/jails/*/\n",
            "/var/jails",
            POLICY_FILENAME,
            true,
        )
        .unwrap();
        assert!(eval.allowed);
    }

    #[test]
    fn superdir_prefix_matches_slash_count() {
        assert_eq!(superdir_for("/a/b/c/", "/x/y/"), "/a/b/");
        assert_eq!(superdir_for("/a/", "/x/y/z/"), "/a/");
        assert_eq!(superdir_for("/a/b/", "/x/"), "/a/");
    }
}
