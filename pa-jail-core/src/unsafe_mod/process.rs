//! Namespace-entering process creation.
//!
//! This is the platform adapter's "enter new namespaces" operation: put
//! the supervisor in fresh IPC, mount, and pid namespaces where the
//! kernel provides them, and degrade to an ordinary fork where it does
//! not.

use nix::errno::Errno;
use nix::sched::{clone, CloneFlags};
use nix::unistd::{self, ForkResult, Pid};

const CLONE_STACK_SIZE: usize = 256 * 1024;

/// Create the supervisor child, preferring fresh IPC, mount, and pid
/// namespaces.
///
/// The callback runs in the child; its argument says whether namespaces
/// were entered, and its return value becomes the child's exit status.
/// The child is a copy-on-write image of the caller, so the callback may
/// use owned data freely. When the kernel refuses the namespace clone —
/// `EPERM` inside restricted containers, `EINVAL`/`ENOSYS` on kernels
/// built without the feature — the child is created with a plain `fork`
/// and the callback is told no pid namespace will reap for it.
///
/// # Safety
///
/// On the clone path the callback runs on a fixed `CLONE_STACK_SIZE`
/// stack and must not overflow it; on either path, as with any child of
/// a process that may hold locks, it must not rely on state owned by
/// other threads (the supervisor is single-threaded).
pub unsafe fn spawn_supervisor(cb: &mut (dyn FnMut(bool) -> isize)) -> Result<Pid, Errno> {
    let mut stack = vec![0u8; CLONE_STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID;
    match unsafe { clone(Box::new(|| cb(true)), &mut stack, flags, Some(libc::SIGCHLD)) } {
        Ok(pid) => Ok(pid),
        Err(Errno::EPERM) | Err(Errno::EINVAL) | Err(Errno::ENOSYS) => {
            match unsafe { unistd::fork() }? {
                ForkResult::Parent { child } => Ok(child),
                ForkResult::Child => std::process::exit(cb(false) as i32),
            }
        }
        Err(e) => Err(e),
    }
}
