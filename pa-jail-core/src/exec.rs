//! The jailed execution supervisor.
//!
//! `spawn` enters fresh IPC/mount/pid namespaces, and inside them the
//! session chdirs and chroots into the jail, remounts `/proc`, drops
//! privilege permanently, allocates a pty, and forks the owner's shell
//! with the slave as its controlling terminal. The supervisor side then
//! multiplexes bytes between the pty master, the input descriptor, and
//! stdout under a wall-clock deadline, watching for the `ESC 0x03`
//! escape sequence and for SIGTERM via a self-pipe.

use crate::errors::JailError;
use crate::mounts::{self, MountSlot};
use crate::paths::shell_quote;
use crate::policy::JailDir;
use crate::unsafe_mod::signal;
use crate::users::JailOwner;
use crate::Context;
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{self, Mode};
use nix::sys::termios::{tcgetattr, tcsetattr, OutputFlags, SetArg, SpecialCharacterIndices};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::CString;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const BUF_SIZE: usize = 8192;

/// Two bytes on the input stream that terminate the run: `ESC 0x03`.
const ESCAPE: &[u8] = b"\x1b\x03";

const SIGTERM_STATUS: i32 = 128 + Signal::SIGTERM as i32;

/// Options for one supervised run.
pub struct RunConfig {
    /// Wait for the supervisor and propagate its exit status.
    pub foreground: bool,
    /// Suppress the timeout/termination notices.
    pub quiet: bool,
    /// Wall-clock limit in (possibly fractional) seconds.
    pub timeout: Option<f64>,
    /// The descriptor feeding the jailed command's terminal.
    pub input_fd: RawFd,
}

/// A running supervisor, created by [`spawn`].
pub struct Supervised {
    pid: Pid,
}

impl Supervised {
    /// The supervisor's pid, for the pid file.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait for the supervisor and fold its fate into an exit status.
    pub fn wait(self) -> i32 {
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(_, code)) => return code,
                Ok(WaitStatus::Signaled(_, sig, _)) => return 128 + sig as i32,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => return 1,
            }
        }
    }
}

/// Start the supervisor in fresh namespaces.
///
/// Returns as soon as the namespace child exists; the caller decides
/// whether to wait on it. Fatal setup errors inside the namespaces are
/// reported on stderr and surface as the child's exit status.
pub fn spawn(
    cx: &mut Context,
    jail: &JailDir,
    owner: &JailOwner,
    command: &[String],
    config: &RunConfig,
) -> Result<Supervised, JailError> {
    let command_line = if command.len() == 1 {
        command[0].clone()
    } else {
        command
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    };
    let argv = vec![
        cstring(owner.shell.clone())?,
        cstring("-l".to_string())?,
        cstring("-c".to_string())?,
        cstring(command_line)?,
    ];
    let env = build_env(owner)?;
    let deadline = config
        .timeout
        .filter(|t| *t > 0.0)
        .map(|t| Instant::now() + Duration::from_secs_f64(t));
    let proc_slot = cx
        .mounts()
        .ok()
        .and_then(|table| table.get("/proc"))
        .filter(|slot| slot.allowed)
        .cloned();

    let mut session = Session {
        verbose: cx.verbose,
        dry_run: cx.dry_run,
        quiet: config.quiet,
        jail_dir: jail.dir.clone(),
        proc_slot,
        owner: owner.clone(),
        argv,
        env,
        input_fd: config.input_fd,
        deadline,
        namespaced: true,
    };

    debug!("spawning supervisor for {}", session.jail_dir);
    let mut cb = move |namespaced: bool| -> isize {
        session.namespaced = namespaced;
        session.run() as isize
    };
    let pid = unsafe { crate::unsafe_mod::process::spawn_supervisor(&mut cb) }
        .map_err(|e| JailError::sys("clone", e))?;
    Ok(Supervised { pid })
}

fn cstring(s: String) -> Result<CString, JailError> {
    CString::new(s).map_err(|_| JailError::Usage("argument contains a NUL byte".to_string()))
}

fn build_env(owner: &JailOwner) -> Result<Vec<CString>, JailError> {
    let mut env = Vec::with_capacity(3);
    let path =
        std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/bin:/usr/bin".to_string());
    env.push(cstring(format!("PATH={}", path))?);
    if let Ok(value) = std::env::var("LD_LIBRARY_PATH") {
        env.push(cstring(format!("LD_LIBRARY_PATH={}", value))?);
    }
    env.push(cstring(format!("HOME={}", owner.home))?);
    Ok(env)
}

/// Everything the namespace child needs, owned so the clone callback has
/// no borrows back into the caller.
struct Session {
    verbose: bool,
    dry_run: bool,
    quiet: bool,
    jail_dir: String,
    proc_slot: Option<MountSlot>,
    owner: JailOwner,
    argv: Vec<CString>,
    env: Vec<CString>,
    input_fd: RawFd,
    deadline: Option<Instant>,
    namespaced: bool,
}

impl Session {
    fn run(&self) -> i32 {
        match self.enter_and_exec() {
            Ok(status) => status,
            Err(err) => {
                eprintln!("{}", err);
                1
            }
        }
    }

    fn enter_and_exec(&self) -> Result<i32, JailError> {
        let cx = Context::new(self.verbose, self.dry_run, self.quiet);

        cx.narrate(format_args!("cd {}", self.jail_dir));
        if !cx.dry_run {
            unistd::chdir(self.jail_dir.as_str()).map_err(|e| JailError::Path {
                path: self.jail_dir.clone(),
                source: e,
            })?;
        }
        cx.narrate(format_args!("chroot ."));
        if !cx.dry_run {
            unistd::chroot(".").map_err(|e| JailError::sys("chroot", e))?;
        }

        // Remount /proc so the new pid namespace is what shows through.
        if let Some(slot) = &self.proc_slot {
            if let Err(e) = mounts::replicate(&cx, slot, "/proc") {
                eprintln!("mount /proc: {}", e.desc());
            }
        }

        if cx.verbose {
            cx.narrate(format_args!(
                "su {}",
                crate::fsops::owner_name(self.owner.uid.as_raw())
            ));
        }
        if !cx.dry_run {
            unistd::setgid(self.owner.gid).map_err(|e| JailError::sys("setgid", e))?;
            unistd::setuid(self.owner.uid).map_err(|e| JailError::sys("setuid", e))?;
        }

        let pty = if cx.dry_run {
            cx.narrate(format_args!("make-pty"));
            None
        } else {
            let master = posix_openpt(OFlag::O_RDWR).map_err(|e| JailError::sys("posix_openpt", e))?;
            grantpt(&master).map_err(|e| JailError::sys("grantpt", e))?;
            unlockpt(&master).map_err(|e| JailError::sys("unlockpt", e))?;
            let slave_name = ptsname_r(&master).map_err(|e| JailError::sys("ptsname", e))?;
            cx.narrate(format_args!("make-pty {}", slave_name));
            let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
            Some((master, slave_name))
        };

        cx.narrate(format_args!("cd {}", self.owner.home));
        if !cx.dry_run {
            unistd::chdir(self.owner.home.as_str()).map_err(|e| JailError::Path {
                path: self.owner.home.clone(),
                source: e,
            })?;
            let shell_fd = fcntl::open(self.owner.shell.as_str(), OFlag::O_RDONLY, Mode::empty())
                .map_err(|e| JailError::Path {
                    path: self.owner.shell.clone(),
                    source: e,
                })?;
            let _ = unistd::close(shell_fd);
        }

        if cx.verbose {
            let mut line = String::new();
            for pair in &self.env {
                line.push_str(&pair.to_string_lossy());
                line.push(' ');
            }
            let args: Vec<String> = self
                .argv
                .iter()
                .map(|arg| shell_quote(&arg.to_string_lossy()))
                .collect();
            line.push_str(&args.join(" "));
            cx.narrate(format_args!("{}", line));
        }

        if cx.dry_run {
            return Ok(0);
        }
        let (master, slave_name) = pty.expect("pty exists outside dry-run");

        let pipe = signal::install().map_err(|e| JailError::sys("pipe", e))?;
        let _ = signal::set_nonblocking(self.input_fd);
        let _ = signal::set_nonblocking(libc::STDOUT_FILENO);

        match unsafe { unistd::fork() }.map_err(|e| JailError::sys("fork", e))? {
            ForkResult::Child => self.exec_shell(&master, &slave_name, &pipe),
            ForkResult::Parent { child } => Ok(self.supervise(child, master, pipe)),
        }
    }

    /// The forked child: wire the pty slave up as the controlling
    /// terminal and become the owner's shell.
    fn exec_shell(&self, master: &OwnedFd, slave_name: &str, pipe: &signal::SignalPipe) -> ! {
        let (pipe_r, pipe_w) = pipe.raw_fds();
        unsafe {
            libc::close(pipe_r);
            libc::close(pipe_w);
        }

        if let Err(e) = unistd::setsid() {
            eprintln!("setsid: {}", e.desc());
            std::process::exit(1);
        }

        // First tty opened after setsid becomes controlling.
        let slave = match fcntl::open(slave_name, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) => {
                eprintln!("{}: {}", slave_name, e.desc());
                std::process::exit(1);
            }
        };

        unsafe {
            let mut ws: libc::winsize = std::mem::zeroed();
            libc::ioctl(slave, libc::TIOCGWINSZ, &mut ws);
            ws.ws_row = 24;
            ws.ws_col = 80;
            libc::ioctl(slave, libc::TIOCSWINSZ, &ws);
        }

        // No output post-processing: bytes cross the pty unmodified.
        let slave_borrowed = unsafe { BorrowedFd::borrow_raw(slave) };
        if let Ok(mut tty) = tcgetattr(slave_borrowed) {
            tty.output_flags = OutputFlags::empty();
            let _ = tcsetattr(slave_borrowed, SetArg::TCSANOW, &tty);
        }

        let _ = unistd::dup2(slave, libc::STDIN_FILENO);
        let _ = unistd::dup2(slave, libc::STDOUT_FILENO);
        let _ = unistd::dup2(slave, libc::STDERR_FILENO);
        unsafe {
            libc::close(master.as_raw_fd());
            libc::close(slave);
        }
        close_extra_fds();

        // The launcher may have ignored SIGPIPE and friends; student
        // code gets pristine dispositions.
        signal::reset_all_dispositions();

        let err = unistd::execve(&self.argv[0], &self.argv, &self.env)
            .expect_err("execve only returns on failure");
        eprintln!("exec {}: {}", self.owner.shell, err.desc());
        std::process::exit(126);
    }

    /// The I/O loop between the pty master, the input stream, and
    /// stdout.
    fn supervise(&self, child: Pid, master: OwnedFd, pipe: signal::SignalPipe) -> i32 {
        // Block reads for at most half a second so a slow child cannot
        // park the loop past its deadline.
        if let Ok(mut tty) = tcgetattr(&master) {
            tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
            tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 5;
            let _ = tcsetattr(&master, SetArg::TCSANOW, &tty);
        }
        let _ = signal::set_nonblocking(master.as_raw_fd());
        let _ = std::io::stdout().flush();

        let input = unsafe { BorrowedFd::borrow_raw(self.input_fd) };
        let stdout = std::io::stdout();
        let stdout_fd = stdout.as_fd();
        let mut to_slave = Ring::new();
        let mut from_slave = Ring::new();

        loop {
            self.wait_ready(&pipe, input, &master, stdout_fd, &to_slave, &from_slave);

            to_slave.transfer_in(input);
            if to_slave.pending() && to_slave.contains_escape() {
                return self.finish(child, SIGTERM_STATUS);
            }
            to_slave.transfer_out(master.as_fd());
            from_slave.transfer_in(master.as_fd());
            from_slave.transfer_out(stdout_fd);

            // Only reap once the pty read side has reported EOF.
            if let Some(status) = check_child(child, from_slave.input_closed, self.deadline) {
                return self.finish(child, status);
            }

            // EIO just means the slave side went away; anything else on
            // a live child is a real error.
            if from_slave.input_closed && from_slave.read_errno != Some(Errno::EIO) {
                match from_slave.read_errno {
                    Some(e) => eprintln!("read: {}", e.desc()),
                    None => eprintln!("read: Unexpected end of file"),
                }
                return self.finish(child, 125);
            }
        }
    }

    fn wait_ready(
        &self,
        pipe: &signal::SignalPipe,
        input: BorrowedFd<'_>,
        master: &OwnedFd,
        stdout: BorrowedFd<'_>,
        to_slave: &Ring,
        from_slave: &Ring,
    ) {
        let mut readfds = FdSet::new();
        let mut writefds = FdSet::new();
        let sig_fd = pipe.read_fd().as_fd();

        readfds.insert(sig_fd);
        if !to_slave.input_closed && !to_slave.output_closed {
            readfds.insert(input);
        }
        if !to_slave.output_closed && to_slave.pending() {
            writefds.insert(master.as_fd());
        }
        if !from_slave.input_closed && !from_slave.output_closed {
            readfds.insert(master.as_fd());
        }
        if !from_slave.output_closed && from_slave.pending() {
            writefds.insert(stdout);
        }

        let result = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let micros = remaining.as_micros().min(i64::MAX as u128) as i64;
                let mut tv = TimeVal::microseconds(micros);
                select(
                    None::<i32>,
                    &mut readfds,
                    &mut writefds,
                    None::<&mut FdSet>,
                    &mut tv,
                )
            }
            None => select(
                None::<i32>,
                &mut readfds,
                &mut writefds,
                None::<&mut FdSet>,
                None::<&mut TimeVal>,
            ),
        };
        if result.is_ok() && readfds.contains(sig_fd) {
            pipe.drain();
        }
    }

    fn finish(&self, child: Pid, status: i32) -> i32 {
        if status == 124 && !self.quiet {
            println!("\n\x1b[3;7;31m...timed out\x1b[0m");
        }
        if status == SIGTERM_STATUS && !self.quiet {
            println!("\n\x1b[3;7;31m...terminated\x1b[0m");
        }
        let _ = std::io::stdout().flush();
        // With a pid namespace the supervisor's exit reaps everything;
        // without one the child must be killed explicitly.
        if !self.namespaced && status >= 124 {
            let _ = kill(child, Signal::SIGKILL);
        }
        status
    }
}

fn check_child(child: Pid, reap: bool, deadline: Option<Instant>) -> Option<i32> {
    if reap {
        loop {
            match waitpid(child, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(_, code)) => return Some(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Some(128 + sig as i32),
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => return Some(125),
            }
        }
    }
    if signal::got_sigterm() {
        return Some(SIGTERM_STATUS);
    }
    if let Some(deadline) = deadline {
        if Instant::now() > deadline {
            return Some(124);
        }
    }
    None
}

/// Close everything above the stdio triple before exec.
fn close_extra_fds() {
    let mut fds: Vec<RawFd> = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
                fds.push(fd);
            }
        }
    } else {
        fds.extend(3..256);
    }
    for fd in fds {
        if fd > 2 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// One direction of pty traffic: an 8 KiB buffer with explicit head and
/// tail, compacted when the tail hits capacity.
struct Ring {
    buf: [u8; BUF_SIZE],
    head: usize,
    tail: usize,
    input_closed: bool,
    input_isfifo: bool,
    output_closed: bool,
    read_errno: Option<Errno>,
}

impl Ring {
    fn new() -> Self {
        Ring {
            buf: [0; BUF_SIZE],
            head: 0,
            tail: 0,
            input_closed: false,
            input_isfifo: false,
            output_closed: false,
            read_errno: None,
        }
    }

    fn pending(&self) -> bool {
        self.head != self.tail
    }

    fn contains_escape(&self) -> bool {
        self.buf[self.head..self.tail]
            .windows(ESCAPE.len())
            .any(|w| w == ESCAPE)
    }

    fn transfer_in(&mut self, from: BorrowedFd<'_>) {
        if self.tail == BUF_SIZE && self.head != 0 {
            self.buf.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
        if self.input_closed || self.tail == BUF_SIZE {
            return;
        }
        match unistd::read(from.as_raw_fd(), &mut self.buf[self.tail..]) {
            Ok(0) => {
                // A FIFO may gain writers again; never give up on it.
                if !self.input_isfifo {
                    match stat::fstat(from.as_raw_fd()) {
                        Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFIFO => {
                            self.input_isfifo = true;
                        }
                        _ => self.input_closed = true,
                    }
                }
            }
            Ok(n) => self.tail += n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(e) => {
                self.input_closed = true;
                self.read_errno = Some(e);
            }
        }
    }

    fn transfer_out(&mut self, to: BorrowedFd<'_>) {
        if self.output_closed || self.head == self.tail {
            return;
        }
        match unistd::write(to, &self.buf[self.head..self.tail]) {
            Ok(0) => {}
            Ok(n) => self.head += n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(_) => self.output_closed = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    fn write_all(fd: &OwnedFd, bytes: &[u8]) {
        let mut off = 0;
        while off < bytes.len() {
            off += unistd::write(fd, &bytes[off..]).unwrap();
        }
    }

    #[test]
    fn ring_moves_bytes_through_pipes() {
        let (r_in, w_in) = pipe().unwrap();
        let (r_out, w_out) = pipe().unwrap();
        let mut ring = Ring::new();

        write_all(&w_in, b"hello jail");
        ring.transfer_in(r_in.as_fd());
        assert!(ring.pending());
        ring.transfer_out(w_out.as_fd());
        assert!(!ring.pending());

        let mut buf = [0u8; 32];
        let n = unistd::read(r_out.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello jail");
    }

    #[test]
    fn ring_detects_split_escape_sequence() {
        let (r_in, w_in) = pipe().unwrap();
        let mut ring = Ring::new();

        write_all(&w_in, b"abc\x1b");
        ring.transfer_in(r_in.as_fd());
        assert!(!ring.contains_escape());

        // The second byte arrives later; the scan runs over the
        // buffered bytes, so the pair is still caught.
        write_all(&w_in, b"\x03def");
        ring.transfer_in(r_in.as_fd());
        assert!(ring.contains_escape());
    }

    #[test]
    fn ring_compacts_when_tail_reaches_capacity() {
        let mut ring = Ring::new();
        ring.head = BUF_SIZE - 4;
        ring.tail = BUF_SIZE;
        ring.buf[BUF_SIZE - 4..].copy_from_slice(b"tail");

        let (r_in, w_in) = pipe().unwrap();
        write_all(&w_in, b"more");
        ring.transfer_in(r_in.as_fd());

        assert_eq!(ring.head, 0);
        assert_eq!(&ring.buf[..8], b"tailmore");
        assert_eq!(ring.tail, 8);
    }

    #[test]
    fn ring_keeps_fifo_inputs_open_at_eof() {
        let (r_in, w_in) = pipe().unwrap();
        let mut ring = Ring::new();
        drop(w_in);
        ring.transfer_in(r_in.as_fd());
        assert!(ring.input_isfifo);
        assert!(!ring.input_closed);
    }

    #[test]
    fn escape_scan_only_covers_live_bytes() {
        let mut ring = Ring::new();
        ring.buf[..2].copy_from_slice(ESCAPE);
        ring.head = 2;
        ring.tail = 2;
        assert!(!ring.contains_escape());
    }

    fn quiet_session(namespaced: bool) -> Session {
        Session {
            verbose: false,
            dry_run: false,
            quiet: true,
            jail_dir: "/".to_string(),
            proc_slot: None,
            owner: JailOwner {
                uid: nix::unistd::Uid::from_raw(65534),
                gid: nix::unistd::Gid::from_raw(65534),
                home: "/home/nobody".to_string(),
                shell: "/bin/sh".to_string(),
            },
            argv: Vec::new(),
            env: Vec::new(),
            input_fd: 0,
            deadline: None,
            namespaced,
        }
    }

    #[test]
    fn finish_kills_the_child_when_no_pid_namespace_reaps() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .unwrap();
        let session = quiet_session(false);
        let status = session.finish(Pid::from_raw(child.id() as i32), 124);
        assert_eq!(status, 124);
        let wait = child.wait().unwrap();
        assert_eq!(wait.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn finish_trusts_a_pid_namespace_to_reap() {
        let mut child = std::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .unwrap();
        let session = quiet_session(true);
        assert_eq!(session.finish(Pid::from_raw(child.id() as i32), 124), 124);
        // No SIGKILL was sent; the child is still running.
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        let _ = child.wait();
    }

    #[test]
    fn finish_only_kills_on_timeout_or_termination() {
        let mut child = std::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .unwrap();
        let session = quiet_session(false);
        // An ordinary exit status needs no cleanup even without a pid
        // namespace.
        assert_eq!(session.finish(Pid::from_raw(child.id() as i32), 0), 0);
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        let _ = child.wait();
    }
}
