//! pa-jail-core — jail authorization, population, supervision, and teardown.
//!
//! This crate implements the privileged machinery behind the `pa-jail`
//! binary: a TOCTTOU-resistant walk that authorizes a jail location
//! against on-disk policy ([`policy`]), a manifest-driven population
//! engine ([`populate`]), an ownership pass ([`ownership`]), a chrooted
//! and namespace-isolated execution supervisor ([`exec`]), and safe
//! teardown and rename ([`teardown`]).
//!
//! ## Architecture
//!
//! - All run-wide mutable state — verbosity, dry-run, the sticky
//!   per-entry failure flag, and the mount snapshot — is threaded through
//!   a single [`Context`] rather than process globals.
//! - The only process globals are the async-signal-safe self-pipe and
//!   SIGTERM flag in [`unsafe_mod::signal`].
//! - Destructive syscalls go through [`fsops`], which narrates a
//!   shell-like line under `--verbose` and suppresses the call under
//!   `--dry-run`.

pub mod errors;
pub mod exec;
pub mod fsops;
pub mod mounts;
pub mod ownership;
pub mod paths;
pub mod policy;
pub mod populate;
pub mod teardown;
pub mod unsafe_mod;
pub mod users;

pub use errors::JailError;
pub use policy::JailDir;
pub use users::JailOwner;

use mounts::MountTable;

/// Which subcommand is driving the current invocation.
///
/// The policy walk behaves differently per action: missing trailing
/// components are created for `Init`/`Run`, and a missing jail is a
/// success for a forced `Rm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// `pa-jail init`: authorize and populate.
    Init,
    /// `pa-jail run`: authorize, populate, and execute.
    Run,
    /// `pa-jail mv`: rename within the permitted directory.
    Mv,
    /// `pa-jail rm`: unmount and remove.
    Rm,
}

/// Run-wide settings and state threaded through every core routine.
pub struct Context {
    /// Narrate each destructive operation in shell-like syntax.
    pub verbose: bool,
    /// Suppress every destructive operation; implies `verbose`.
    pub dry_run: bool,
    /// Suppress the timeout/termination notices on stdout.
    pub quiet: bool,
    degraded: bool,
    mounts: Option<MountTable>,
}

impl Context {
    /// Create a context. `dry_run` implies `verbose`.
    pub fn new(verbose: bool, dry_run: bool, quiet: bool) -> Self {
        Context {
            verbose: verbose || dry_run,
            dry_run,
            quiet,
            degraded: false,
            mounts: None,
        }
    }

    /// Write one narration line to the verbose sink: stdout under
    /// dry-run (the narration is the product), stderr otherwise.
    pub fn narrate(&self, line: std::fmt::Arguments) {
        if self.verbose {
            if self.dry_run {
                println!("{}", line);
            } else {
                eprintln!("{}", line);
            }
        }
    }

    /// Report a recoverable per-entry failure and remember that the run
    /// is no longer clean.
    pub fn soft_fail(&mut self, op: &str, path: &str, err: nix::errno::Errno) {
        eprintln!("{} {}: {}", op, path, err.desc());
        self.degraded = true;
    }

    /// Report a recoverable per-entry failure with a custom message.
    pub fn soft_fail_msg(&mut self, path: &str, message: &str) {
        eprintln!("{}: {}", path, message);
        self.degraded = true;
    }

    /// True once any per-entry failure was recorded; maps to exit 1.
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    /// The mount snapshot, taken lazily on first use.
    pub fn mounts(&mut self) -> Result<&MountTable, JailError> {
        if self.mounts.is_none() {
            self.mounts = Some(MountTable::snapshot()?);
        }
        Ok(self.mounts.as_ref().expect("snapshot just taken"))
    }

    /// Mutable access to the snapshot; teardown prunes unmounted entries
    /// so the removal walk sees the post-umount state.
    pub fn mounts_mut(&mut self) -> Result<&mut MountTable, JailError> {
        if self.mounts.is_none() {
            self.mounts = Some(MountTable::snapshot()?);
        }
        Ok(self.mounts.as_mut().expect("snapshot just taken"))
    }
}
