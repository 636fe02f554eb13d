//! Types for attaching to a single running process and interpreting its ptrace-stops.

use std::marker::PhantomData;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info, trace};

use crate::error::{Error, Result, ResultExt};

#[cfg(target_arch = "aarch64")]
use crate::aarch64;

pub use nix::unistd::Pid;
pub use nix::sys::ptrace::Options;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Register state of a tracee.
#[cfg(target_arch = "aarch64")]
pub type Registers = aarch64::user_pt_regs;

/// Register state of a tracee.
#[cfg(target_arch = "x86_64")]
pub type Registers = libc::user_regs_struct;

/// A machine word of tracee memory, as returned by `PTRACE_PEEKDATA`.
pub type Word = libc::c_long;

/// Linux constant defined in `include/uapi/linux/elf.h`.
#[cfg(target_arch = "aarch64")]
const NT_PRSTATUS: i32 = 0x1;

/// A _ptrace-stop_, a tracee state in which it is stopped and ready to accept ptrace
/// commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    /// The `PTRACE_INTERRUPT` stop which completes an attach.
    Attach,

    // signal-delivery-stop
    SignalDelivery { signal: Signal },

    // group-stop, reported as a `PTRACE_EVENT_STOP` for seized tracees.
    Group { signal: Signal },

    // syscall-stop, either enter or exit.
    //
    // From the manual:
    //
    //     Syscall-enter-stop and syscall-exit-stop are indistinguishable from
    //     each other by the tracer.  The tracer needs to keep track of the
    //     sequence of ptrace-stops in order to not misinterpret syscall-enter-
    //     stop as syscall-exit-stop or vice versa.
    //
    Syscall,

    // ptrace-event-stop, carrying the raw `PTRACE_EVENT_*` code.
    Event { code: i32 },
}

/// Restart requests, which resume stopped tracees.
///
/// The restart mode determines the possible subsequent stops of the restarted tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Continue,
    Syscall,
}

/// Tracee in ptrace-stop, with an optional pending signal.
///
/// **Warning:** the underlying tracee is not guaranteed to exist, and
/// operations on it may fail between calls to [`Ptracer::wait()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tracee {
    pid: Pid,
    pending: Option<Signal>,
    stop: Stop,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Tracee {
    pub fn new(pid: Pid, pending: impl Into<Option<Signal>>, stop: Stop) -> Self {
        let pending = pending.into();
        let _not_send = PhantomData;

        Self { pid, pending, stop, _not_send }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pending_signal(&self) -> Option<Signal> {
        self.pending
    }

    pub fn stop(&self) -> Stop {
        self.stop
    }

    /// Set custom tracing options on the tracee.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, even if unset in the passed value.
    pub fn set_options(&mut self, options: Options) -> Result<()> {
        let options = options | REQUIRED_OPTIONS;
        let pid = self.pid;

        ptrace::setoptions(pid, options).map_err(|source| Error::SetOptions { pid, source })
    }

    #[cfg(target_arch = "x86_64")]
    pub fn registers(&self) -> Result<Registers> {
        Ok(ptrace::getregs(self.pid).died_if_esrch(self.pid)?)
    }

    #[cfg(target_arch = "aarch64")]
    pub fn registers(&self) -> Result<Registers> {
        let mut data = std::mem::MaybeUninit::<Registers>::uninit();
        let mut rv = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        let res = unsafe {
            libc::ptrace(libc::PTRACE_GETREGSET, self.pid.as_raw(), NT_PRSTATUS, &mut rv as *mut _ as *mut libc::c_void)
        };

        Errno::result(res).died_if_esrch(self.pid)?;

        Ok(unsafe { data.assume_init() })
    }

    /// Read one word of tracee memory at `addr` with `PTRACE_PEEKDATA`.
    ///
    /// `addr` need not be word-aligned.
    pub fn peek_word(&self, addr: u64) -> Result<Word> {
        let addr = addr as ptrace::AddressType;

        Ok(ptrace::read(self.pid, addr).died_if_esrch(self.pid)?)
    }
}

/// Lifecycle of the debug attachment held by a [`Ptracer`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    // No attach has been requested.
    Unattached,

    // Seized and interrupted, expecting the interrupt's `PTRACE_EVENT_STOP`.
    Attaching,

    // Attached, and the tracee is in a ptrace-stop.
    Stopped,

    // Attached, and the tracee has been restarted.
    Running,

    // Explicitly detached, or the tracee has terminated.
    Detached,
}

/// Tracer for exactly one running Linux process.
///
/// Unlike a general-purpose tracer, this never follows `fork()` or `clone()`: only the
/// attached task is ever resumed or waited on.
#[derive(Debug, Eq, PartialEq)]
pub struct Ptracer {
    /// Ptrace options applied to the tracee when it is seized.
    options: Options,

    /// The attached task, once an attach has been requested.
    target: Option<Pid>,

    state: State,
}

const DEFAULT_OPTIONS: Options = REQUIRED_OPTIONS;

/// Options required for interpreting tracee stops.
/// These are:
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD), so syscall-stops are
///   distinguishable from `SIGTRAP` signal-delivery-stops.
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC), so a successful `execve()`
///   reports a ptrace-event-stop rather than a `SIGTRAP` that would be re-delivered.
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEEXEC);

impl Ptracer {
    pub fn new() -> Self {
        let options = DEFAULT_OPTIONS;
        let target = None;
        let state = State::Unattached;

        Self { options, target, state }
    }

    /// Return the ptrace options applied on attach.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options applied on attach.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, even if unset in the passed value.
    ///
    /// Setting this value does not affect an existing attachment. See
    /// [`Tracee::set_options()`].
    pub fn set_options(&mut self, options: Options) {
        self.options = options | REQUIRED_OPTIONS;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn target(&self) -> Option<Pid> {
        self.target
    }

    /// Attach to a running process, wait for its attach-stop, and apply our options.
    ///
    /// On success, the returned tracee is stopped and exclusively ours.
    ///
    /// We seize rather than `PTRACE_ATTACH`, so our options are in effect from the first
    /// instant. A legacy attach racing an `execve()` would otherwise see the post-exec
    /// `SIGTRAP`, which is fatal to the tracee if delivered.
    pub fn attach(&mut self, pid: Pid) -> Result<Tracee> {
        if let State::Attaching | State::Stopped | State::Running = self.state {
            internal_error!("attach requested while already attached");
        }

        ptrace::seize(pid, self.options).map_err(|source| Error::Attach { pid, source })?;

        info!(pid = pid.as_raw(), "seized tracee");

        self.target = Some(pid);
        self.state = State::Attaching;

        ptrace::interrupt(pid).map_err(|source| Error::Attach { pid, source })?;

        loop {
            match self.wait()? {
                Some(mut tracee) if tracee.stop() == Stop::Attach => {
                    tracee.set_options(self.options)?;
                    return Ok(tracee);
                },
                Some(tracee) => {
                    // Some other stop won the race with our interrupt. Let it through, and
                    // keep waiting for the attach-stop. The interrupt stays pending.
                    debug!(stop = ?tracee.stop(), "stop observed before attach-stop");
                    self.restart(tracee, Restart::Continue)?;
                },
                None => {
                    let source = Errno::ESRCH;
                    return Err(Error::TraceeDied { pid, source });
                },
            }
        }
    }

    /// Resume the stopped tracee, delivering any pending signal.
    pub fn restart(&mut self, tracee: Tracee, restart: Restart) -> Result<()> {
        let Tracee { pid, pending, .. } = tracee;

        let res = match restart {
            Restart::Continue =>
                ptrace::cont(pid, pending),
            Restart::Syscall =>
                ptrace::syscall(pid, pending),
        };

        res.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::Restart { pid, mode: restart, source }
            }
        })?;

        // Until the attach-stop, every stop is provisional.
        if self.state != State::Attaching {
            self.state = State::Running;
        }

        Ok(())
    }

    /// Block until the tracee stops or terminates.
    ///
    /// Returns `None` once the tracee has terminated, or if it was already detached.
    pub fn wait(&mut self) -> Result<Option<Tracee>> {
        use Signal::*;

        let pid = self.target.ok_or(Error::NotAttached)?;

        if let State::Unattached | State::Detached = self.state {
            debug!("no tracee to wait on");
            return Ok(None);
        }

        let status = loop {
            match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => break status,
                Err(Errno::EINTR) => {
                    trace!("wait interrupted, retrying");
                    continue;
                },
                Err(source) => return Err(Error::Wait { pid, source }),
            }
        };

        let attaching = self.state == State::Attaching;

        let tracee = match status {
            WaitStatus::Exited(_pid, exit_code) => {
                info!(pid = pid.as_raw(), exit_code, "tracee exited");
                self.state = State::Detached;
                return Ok(None);
            },
            WaitStatus::Signaled(_pid, signal, core_dumped) => {
                info!(pid = pid.as_raw(), ?signal, core_dumped, "tracee terminated by signal");
                self.state = State::Detached;
                return Ok(None);
            },
            WaitStatus::Stopped(pid, signal) => {
                // For a seized tracee, this is always a signal-delivery-stop.
                Tracee::new(pid, signal, Stop::SignalDelivery { signal })
            },
            WaitStatus::PtraceSyscall(pid) => {
                Tracee::new(pid, None, Stop::Syscall)
            },
            WaitStatus::PtraceEvent(pid, _signal, libc::PTRACE_EVENT_STOP) if attaching => {
                Tracee::new(pid, None, Stop::Attach)
            },
            WaitStatus::PtraceEvent(pid, signal @ (SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU), libc::PTRACE_EVENT_STOP) => {
                // From the manual:
                //
                //     If the tracee was attached using PTRACE_SEIZE, group-stop is
                //     indicated by PTRACE_EVENT_STOP: status>>16 == PTRACE_EVENT_STOP.
                //
                // Restarting with the stopping signal would only re-enter the group-stop.
                Tracee::new(pid, None, Stop::Group { signal })
            },
            WaitStatus::PtraceEvent(pid, _signal, code) => {
                // The event `SIGTRAP` is an artifact of the stop, and must not be delivered.
                Tracee::new(pid, None, Stop::Event { code })
            },
            // Assume `!WNOHANG`, `!WCONTINUED`.
            WaitStatus::Continued(_) |
            WaitStatus::StillAlive =>
                internal_error!("unreachable `wait()` status"),
        };

        if !attaching || tracee.stop() == Stop::Attach {
            self.state = State::Stopped;
        }

        trace!(pid = pid.as_raw(), stop = ?tracee.stop(), "tracee stopped");

        Ok(Some(tracee))
    }

    /// Release the attachment. A no-op if not attached.
    ///
    /// Fails if the tracee is not in a ptrace-stop, or no longer exists.
    pub fn detach(&mut self) -> Result<()> {
        let pid = match (self.target, self.state) {
            (Some(pid), State::Attaching | State::Stopped | State::Running) => pid,
            _ => return Ok(()),
        };

        self.state = State::Detached;

        ptrace::detach(pid, None).died_if_esrch(pid)?;

        info!(pid = pid.as_raw(), "detached from tracee");

        Ok(())
    }
}

impl Default for Ptracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Ptracer {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            debug!(%err, "best-effort detach on drop failed");
        }
    }
}
