//! Error types for jail authorization, construction, and execution.
//!
//! The fatal error kinds live here; per-entry population failures are not
//! errors in this sense but set the sticky degraded flag on the
//! [`Context`](crate::Context) and let the run continue. Supervisor
//! outcomes that map to process exit statuses (124, 125, 126, 128+N) are
//! returned as statuses, not errors.

use nix::errno::Errno;
use thiserror::Error;

/// A fatal condition that aborts the current action.
///
/// Message texts deliberately lead with the offending path or operation,
/// so the CLI can print them verbatim.
#[derive(Error, Debug)]
pub enum JailError {
    /// Command-line misuse that clap cannot express structurally.
    #[error("{0}")]
    Usage(String),

    /// A pathname failed sanitization.
    #[error("{path}: Bad characters in {what}")]
    BadFilename {
        /// The rejected pathname as the user supplied it.
        path: String,
        /// `"filename"` or `"move destination"`.
        what: &'static str,
    },

    /// The jail user name exceeds the supported length.
    #[error("{name}: Username too long")]
    UserNameTooLong {
        /// The offending user name.
        name: String,
    },

    /// The jail user does not exist in the host password database.
    #[error("{name}: No such user")]
    UnknownUser {
        /// The offending user name.
        name: String,
    },

    /// The jail user resolves to uid 0.
    #[error("{name}: Jail user cannot be root")]
    RootUser {
        /// The offending user name.
        name: String,
    },

    /// The jail user's home directory is not an acceptable jail home.
    #[error("{name}: Home directory {home} not under /home")]
    HomeNotAllowed {
        /// The offending user name.
        name: String,
        /// The home directory reported by the password database.
        home: String,
    },

    /// The jail user's shell is not in the allowed set.
    #[error("{name}: Shell {shell} not allowed by /etc/shells")]
    ShellNotAllowed {
        /// The offending user name.
        name: String,
        /// The shell reported by the password database.
        shell: String,
    },

    /// A component of the jail path is not a directory.
    #[error("{path}: Not a directory")]
    NotADirectory {
        /// The offending prefix of the jail path.
        path: String,
    },

    /// An ancestor of the jail path is not owned by root.
    #[error("{path}: Not owned by root")]
    NotRootOwned {
        /// The offending prefix of the jail path.
        path: String,
    },

    /// An ancestor of the jail path is writable by a non-root user.
    #[error("{path}: Writable by non-root")]
    WritableByNonRoot {
        /// The offending prefix of the jail path.
        path: String,
    },

    /// A policy file that would have been the authority is writable by a
    /// non-root user.
    #[error("{path}: Writable by non-root")]
    PolicyFileWritable {
        /// The offending policy file.
        path: String,
    },

    /// A policy file disables jails beneath a matched scope.
    #[error("{file}: Jails are disabled under {scope}")]
    JailsDisabledUnder {
        /// The policy file containing the rule.
        file: String,
        /// The pattern scope of the disable rule.
        scope: String,
    },

    /// A local policy file disables jails globally.
    #[error("{file}: Jails are disabled here")]
    JailsDisabledHere {
        /// The policy file containing the rule.
        file: String,
    },

    /// The system-wide policy file disables jails globally.
    #[error("{file}: Jails are disabled")]
    JailsDisabled {
        /// The policy file containing the rule.
        file: String,
    },

    /// No policy file anywhere along the path enables jails.
    #[error("{dir}: No `pa-jail.conf` enables jails here.{hint}")]
    NoJailPolicy {
        /// The jail directory that was requested.
        dir: String,
        /// Empty, or a newline-led "(Perhaps you need to edit ...)" note.
        hint: String,
    },

    /// The move destination escapes the permitted directory.
    #[error("{dst}: Not a subdirectory of {permdir}")]
    MoveOutsidePermdir {
        /// The sanitized move destination.
        dst: String,
        /// The permitted directory the jail was authorized under.
        permdir: String,
    },

    /// The file list was directed at stdin but stdin is a terminal.
    #[error("stdin: Is a tty")]
    StdinIsTty,

    /// A path could not be opened or inspected during the policy walk.
    #[error("{path}: {source}")]
    Path {
        /// The affected path.
        path: String,
        /// The underlying errno.
        #[source]
        source: Errno,
    },

    /// A syscall against a specific path failed fatally.
    #[error("{op} {path}: {source}")]
    Fs {
        /// The operation, named the way the equivalent shell tool would be.
        op: &'static str,
        /// The affected path.
        path: String,
        /// The underlying errno.
        #[source]
        source: Errno,
    },

    /// A syscall not tied to a path failed fatally.
    #[error("{op}: {source}")]
    Sys {
        /// The failed operation.
        op: &'static str,
        /// The underlying errno.
        #[source]
        source: Errno,
    },

    /// An I/O error outside the syscall layer (manifest reading).
    #[error("{path}: {source}")]
    Io {
        /// The affected path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl JailError {
    /// Shorthand for a path-carrying syscall failure.
    pub fn fs(op: &'static str, path: impl Into<String>, source: Errno) -> Self {
        JailError::Fs {
            op,
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a path-free syscall failure.
    pub fn sys(op: &'static str, source: Errno) -> Self {
        JailError::Sys { op, source }
    }
}
