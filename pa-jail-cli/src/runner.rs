//! Dispatch from parsed arguments into the core subsystems.
//!
//! The order of operations mirrors the privilege model: everything the
//! invoking user supplies (file list, input stream, pid file) is opened
//! with that user's credentials first, then the real ids are promoted to
//! root, and only then is the jail path authorized and acted on.

use crate::parser::{Cli, Command, InitArgs, MvArgs, RmArgs, RunArgs};
use anyhow::{anyhow, Result};
use log::debug;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{isatty, setgid, setuid, Gid, Uid};
use pa_jail_core::policy::JailDir;
use pa_jail_core::populate::Populator;
use pa_jail_core::{
    exec, fsops, ownership, paths, policy, teardown, Action, Context, JailError, JailOwner,
};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

/// A manifest stream plus the name it is reported under.
type Manifest = (Box<dyn BufRead>, String);

/// Execute one parsed invocation and return the process exit status.
pub fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init(args) => do_init(args),
        Command::Run(args) => do_run(args),
        Command::Mv(args) => do_mv(args),
        Command::Rm(args) => do_rm(args),
    }
}

fn do_init(args: InitArgs) -> Result<i32> {
    let mut cx = Context::new(args.common.verbose, args.common.dry_run, false);
    let owner = args.user.as_deref().map(JailOwner::lookup).transpose()?;
    let manifest = open_manifest(args.files.as_deref())?;

    escalate(&cx)?;
    let dir = sanitize_jail_path(&args.jaildir)?;
    let Some(jail) = policy::authorize(&mut cx, &dir, Action::Init, false)? else {
        return Ok(0);
    };

    build_jail(
        &mut cx,
        &jail,
        owner.as_ref(),
        args.skeleton.as_deref(),
        manifest,
        Action::Init,
    )?;
    Ok(if cx.degraded() { 1 } else { 0 })
}

fn do_run(args: RunArgs) -> Result<i32> {
    let mut cx = Context::new(args.common.verbose, args.common.dry_run, args.quiet);
    let owner = JailOwner::lookup(&args.user)?;
    let manifest = open_manifest(args.files.as_deref())?;

    // Caller-owned descriptors are opened before privilege promotion.
    let input = match args.input.as_deref() {
        Some(path) if !cx.dry_run => Some(open_input(path)?),
        _ => None,
    };
    let mut pid_file = match args.pid_file.as_deref() {
        Some(path) => {
            cx.narrate(format_args!("touch {}", path));
            if cx.dry_run {
                None
            } else {
                Some(PidFile::create(path)?)
            }
        }
        None => None,
    };

    escalate(&cx)?;
    let dir = sanitize_jail_path(&args.jaildir)?;
    let Some(mut jail) = policy::authorize(&mut cx, &dir, Action::Run, false)? else {
        return Ok(0);
    };

    if args.replace {
        teardown::clear(&mut cx, &jail)?;
    }
    build_jail(
        &mut cx,
        &jail,
        Some(&owner),
        args.skeleton.as_deref(),
        manifest,
        Action::Run,
    )?;
    if cx.degraded() {
        return Ok(1);
    }

    // The walk's descriptors are not carried into the jail.
    jail.close_parent();

    let config = exec::RunConfig {
        foreground: args.fg,
        quiet: args.quiet,
        timeout: args.timeout,
        input_fd: input
            .as_ref()
            .map(|f| f.as_raw_fd())
            .unwrap_or_else(|| std::io::stdin().as_raw_fd()),
    };
    let supervised = exec::spawn(&mut cx, &jail, &owner, &args.command, &config)?;
    if let Some(pf) = pid_file.as_mut() {
        pf.write_pid(supervised.pid().as_raw())?;
    }

    if config.foreground {
        Ok(supervised.wait())
    } else {
        if let Some(pf) = pid_file.as_mut() {
            pf.disarm();
        }
        Ok(0)
    }
}

fn do_mv(args: MvArgs) -> Result<i32> {
    let mut cx = Context::new(args.common.verbose, args.common.dry_run, false);

    // Validate the destination before anything irreversible.
    let dest_abs = paths::absolute(&args.newdir)?;
    if paths::sanitize(&dest_abs).filter(|d| d.starts_with('/')).is_none() {
        return Err(JailError::BadFilename {
            path: args.newdir.clone(),
            what: "move destination",
        }
        .into());
    }

    escalate(&cx)?;
    let dir = sanitize_jail_path(&args.olddir)?;
    let Some(jail) = policy::authorize(&mut cx, &dir, Action::Mv, false)? else {
        return Ok(0);
    };
    teardown::rename(&cx, &jail, &args.newdir)?;
    Ok(0)
}

fn do_rm(args: RmArgs) -> Result<i32> {
    let mut cx = Context::new(args.common.verbose, args.common.dry_run, false);

    escalate(&cx)?;
    let dir = sanitize_jail_path(&args.jaildir)?;
    let Some(jail) = policy::authorize(&mut cx, &dir, Action::Rm, args.force)? else {
        return Ok(0);
    };
    teardown::remove(&mut cx, &jail, args.force)?;
    Ok(0)
}

/// Promote the real uid/gid to root so child processes run privileged.
fn escalate(cx: &Context) -> Result<()> {
    if cx.dry_run {
        return Ok(());
    }
    setgid(Gid::from_raw(0)).map_err(|e| anyhow!("setgid: {}", e.desc()))?;
    setuid(Uid::from_raw(0)).map_err(|e| anyhow!("setuid: {}", e.desc()))?;
    Ok(())
}

fn sanitize_jail_path(raw: &str) -> Result<String, JailError> {
    let absolute = paths::absolute(raw)?;
    paths::sanitize(&absolute)
        .filter(|dir| dir.as_str() != "/" && dir.starts_with('/'))
        .ok_or(JailError::BadFilename {
            path: raw.to_string(),
            what: "filename",
        })
}

fn open_manifest(files: Option<&str>) -> Result<Option<Manifest>> {
    match files {
        None => Ok(None),
        Some("-") => {
            if isatty(std::io::stdin().as_raw_fd()).unwrap_or(false) {
                return Err(JailError::StdinIsTty.into());
            }
            Ok(Some((
                Box::new(BufReader::new(std::io::stdin())),
                "<stdin>".to_string(),
            )))
        }
        Some(path) => {
            let file = File::open(path).map_err(|e| anyhow!("{}: {}", path, e))?;
            Ok(Some((Box::new(BufReader::new(file)), path.to_string())))
        }
    }
}

fn open_input(path: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK | nix::libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| anyhow!("{}: {}", path, e))
}

/// Shared tail of `init` and `run`: the staging directory, the owner's
/// home, the ownership pass, and the manifest.
fn build_jail(
    cx: &mut Context,
    jail: &JailDir,
    owner: Option<&JailOwner>,
    skeleton: Option<&str>,
    manifest: Option<Manifest>,
    action: Action,
) -> Result<()> {
    let link_dir = match skeleton {
        Some(dir) => {
            let dir = paths::no_end_slash(dir);
            fsops::ensure_dir(cx, &dir, 0o755)
                .map_err(|e| JailError::fs("mkdir", dir.clone(), e))?;
            Some(paths::absolute(&dir)?)
        }
        None => None,
    };

    if let Some(owner) = owner {
        let home_parent = paths::join(&jail.dir, "home");
        fsops::ensure_dir(cx, &home_parent, 0o755)
            .map_err(|e| JailError::fs("mkdir", home_parent.clone(), e))?;
        let jail_home = paths::join(&jail.dir, &owner.home);
        let created = fsops::ensure_dir(cx, &jail_home, 0o700)
            .map_err(|e| JailError::fs("mkdir", jail_home.clone(), e))?;
        if created {
            fsops::lchown(cx, &jail_home, owner.uid.as_raw(), owner.gid.as_raw())
                .map_err(|e| JailError::fs("chown", jail_home.clone(), e))?;
        }
    }

    if action == Action::Run {
        ownership::apply(cx, jail)?;
    }

    if let Some((mut reader, name)) = manifest {
        debug!("populating {} from {}", jail.dir, name);
        let old_umask = umask(Mode::empty());
        let result = {
            let dst_root = paths::no_end_slash(&jail.dir);
            let mut populator = Populator::new(cx, &dst_root, link_dir, jail.dev);
            populator
                .prepare_root()
                .and_then(|()| populator.populate(&mut reader, &name))
        };
        umask(old_umask);
        result?;
    }
    Ok(())
}

/// The pid file: the supervisor's pid as an ASCII decimal line,
/// truncated to exact length, zeroed at exit in foreground mode.
struct PidFile {
    file: File,
    path: String,
    armed: bool,
}

impl PidFile {
    fn create(path: &str) -> Result<PidFile> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .custom_flags(nix::libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| anyhow!("{}: {}", path, e))?;
        Ok(PidFile {
            file,
            path: path.to_string(),
            armed: true,
        })
    }

    fn write_pid(&mut self, pid: i32) -> Result<()> {
        let text = format!("{}\n", pid);
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(text.as_bytes()))
            .and_then(|_| self.file.set_len(text.len() as u64))
            .map_err(|e| anyhow!("{}: {}", self.path, e))
    }

    /// Leave the recorded pid behind after a background launch.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.write_pid(0);
        }
    }
}
