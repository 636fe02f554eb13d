//! Mirroring of a tracee's terminal output, recovered from its `write(2)` calls.
//!
//! The tracee is stepped from syscall-stop to syscall-stop. At each `write()` entry we
//! record its arguments, and at the matching exit we peek the bytes it actually wrote
//! out of its address space and forward them to our sink.

use std::cmp;
use std::fmt;
use std::io::{self, Write};
use std::mem;

use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::ptracer::{Pid, Ptracer, Restart, Stop, Tracee, Word};
use crate::regs::SyscallRegisters;


/// Maximum number of bytes recovered from a single `write()`. Larger writes are
/// truncated.
pub const CAPTURE_LIMIT: usize = 4096;

/// Syscall number of `write(2)` on the host architecture.
pub const WRITE_SYSCALL: u64 = libc::SYS_write as u64;

const WORD_SIZE: usize = mem::size_of::<Word>();

/// Word-granular read access to tracee memory.
pub trait PeekMemory {
    fn peek_word(&self, addr: u64) -> Result<Word>;
}

impl PeekMemory for Tracee {
    fn peek_word(&self, addr: u64) -> Result<Word> {
        Tracee::peek_word(self, addr)
    }
}

/// A `write()` seen entering, but not yet exiting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingCall {
    pub fd: i32,
    pub buf: u64,
    pub count: u64,
}

impl PendingCall {
    /// Read the call arguments from a syscall-enter-stop snapshot.
    pub fn from_entry(regs: &impl SyscallRegisters) -> Self {
        let fd = regs.arg0() as i32;
        let buf = regs.arg1();
        let count = regs.arg2();

        Self { fd, buf, count }
    }

    /// True if the call writes to standard output or standard error.
    pub fn is_standard_stream(&self) -> bool {
        matches!(self.fd, libc::STDOUT_FILENO | libc::STDERR_FILENO)
    }
}

/// Bytes recovered from one completed `write()`.
#[derive(Clone)]
pub struct CapturedOutput {
    data: [u8; CAPTURE_LIMIT],
    len: usize,
}

impl CapturedOutput {
    /// Peek up to `len` bytes at `addr`, one word at a time.
    ///
    /// `len` is clamped to [`CAPTURE_LIMIT`]. If a peek fails, the capture ends with the
    /// bytes gathered before the failing word.
    pub fn read(mem: &impl PeekMemory, addr: u64, len: usize) -> Self {
        let window = cmp::min(len, CAPTURE_LIMIT);
        let mut out = Self { data: [0; CAPTURE_LIMIT], len: 0 };

        while out.len < window {
            let word_addr = match addr.checked_add(out.len as u64) {
                Some(word_addr) => word_addr,
                None => break,
            };

            let word = match mem.peek_word(word_addr) {
                Ok(word) => word,
                Err(err) => {
                    debug!(%err, addr = word_addr, captured = out.len, window, "truncating capture at unreadable word");
                    break;
                },
            };

            // The tail word may extend past the window. Only keep what was written.
            let n = cmp::min(WORD_SIZE, window - out.len);
            out.data[out.len..out.len + n].copy_from_slice(&word.to_ne_bytes()[..n]);
            out.len += n;
        }

        out
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedOutput")
            .field("len", &self.len)
            .field("data", &String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

/// Syscall-stop handler.
///
/// Tracks whether the tracee is inside a syscall, since enter- and exit-stops look the
/// same to the tracer. Assumes a single-threaded tracee, so stops strictly alternate.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Interceptor {
    in_syscall: bool,
    pending: Option<PendingCall>,
}

impl Interceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between a syscall-enter-stop and its syscall-exit-stop.
    pub fn in_syscall(&self) -> bool {
        self.in_syscall
    }

    pub fn pending(&self) -> Option<PendingCall> {
        self.pending
    }

    /// Handle one syscall-stop, given its register snapshot.
    ///
    /// Returns the output of a `write()` to stdout or stderr that has just completed.
    pub fn on_syscall_stop(
        &mut self,
        regs: &impl SyscallRegisters,
        mem: &impl PeekMemory,
    ) -> Option<CapturedOutput> {
        if !self.in_syscall {
            self.in_syscall = true;
            self.on_enter(regs);
            return None;
        }

        self.in_syscall = false;
        self.on_exit(regs, mem)
    }

    fn on_enter(&mut self, regs: &impl SyscallRegisters) {
        // Arguments must be taken now: they may be clobbered by exit.
        self.pending = if regs.syscall_number() == WRITE_SYSCALL {
            let call = PendingCall::from_entry(regs);
            trace!(?call, "write() entered");
            Some(call)
        } else {
            None
        };
    }

    fn on_exit(&mut self, regs: &impl SyscallRegisters, mem: &impl PeekMemory) -> Option<CapturedOutput> {
        let call = self.pending.take()?;

        if regs.syscall_number() != WRITE_SYSCALL || !call.is_standard_stream() {
            return None;
        }

        // The return value, not the requested count, is what was transferred.
        let ret = regs.return_value();

        if ret <= 0 {
            trace!(?call, ret, "write() transferred nothing");
            return None;
        }

        let len = cmp::min(ret as u64, CAPTURE_LIMIT as u64) as usize;

        if ret as u64 > CAPTURE_LIMIT as u64 {
            debug!(?call, ret, limit = CAPTURE_LIMIT, "write() exceeds capture limit, truncating");
        }

        let output = CapturedOutput::read(mem, call.buf, len);
        trace!(?call, ret, captured = output.len(), "write() exited");

        Some(output)
    }
}

/// Attachment to one running process, mirroring its terminal output to a sink.
pub struct Tracer<W: Write> {
    ptracer: Ptracer,
    pid: Pid,

    // Tracee in its attach-stop, until the session starts.
    attached: Option<Tracee>,

    interceptor: Interceptor,
    sink: W,

    captured_calls: u64,
    captured_bytes: u64,
}

impl Tracer<io::Stdout> {
    /// Attach to `pid`, mirroring its output to our own stdout.
    pub fn attach(pid: Pid) -> Result<Self> {
        Self::with_sink(pid, io::stdout())
    }
}

impl<W: Write> Tracer<W> {
    /// Attach to `pid`, mirroring its output to `sink`.
    pub fn with_sink(pid: Pid, sink: W) -> Result<Self> {
        Self::with_ptracer(Ptracer::new(), pid, sink)
    }

    /// Attach to `pid` using a preconfigured `ptracer`.
    ///
    /// Any failure here is fatal for the session. No output has been captured yet.
    pub fn with_ptracer(mut ptracer: Ptracer, pid: Pid, sink: W) -> Result<Self> {
        let tracee = ptracer.attach(pid)?;

        Ok(Self {
            ptracer,
            pid,
            attached: Some(tracee),
            interceptor: Interceptor::new(),
            sink,
            captured_calls: 0,
            captured_bytes: 0,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn ptracer(&self) -> &Ptracer {
        &self.ptracer
    }

    /// Number of `write()` calls whose output was forwarded.
    pub fn captured_calls(&self) -> u64 {
        self.captured_calls
    }

    /// Total bytes forwarded to the sink.
    pub fn captured_bytes(&self) -> u64 {
        self.captured_bytes
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Mirror output until the tracee exits or can no longer be traced, then detach.
    ///
    /// Tracing failures mid-session end the session normally. Only a failure to write
    /// to the sink is returned as an error.
    pub fn run(&mut self) -> Result<()> {
        let res = self.intercept();

        if let Err(err) = self.ptracer.detach() {
            debug!(%err, "ignoring detach failure");
        }

        info!(
            pid = self.pid.as_raw(),
            calls = self.captured_calls,
            bytes = self.captured_bytes,
            "session ended"
        );

        res
    }

    fn intercept(&mut self) -> Result<()> {
        let mut tracee = self.attached.take().ok_or(Error::NotAttached)?;

        loop {
            if let Err(err) = self.ptracer.restart(tracee, Restart::Syscall) {
                end_of_session(&err, "could not resume tracee");
                return Ok(());
            }

            tracee = match self.ptracer.wait() {
                Ok(Some(tracee)) => tracee,
                Ok(None) => return Ok(()),
                Err(err) => {
                    end_of_session(&err, "could not wait on tracee");
                    return Ok(());
                },
            };

            if tracee.stop() != Stop::Syscall {
                // Any pending signal is delivered on restart.
                trace!(stop = ?tracee.stop(), pending = ?tracee.pending_signal(), "passing through non-syscall stop");
                continue;
            }

            let regs = match tracee.registers() {
                Ok(regs) => regs,
                Err(err) => {
                    end_of_session(&err, "could not read tracee registers");
                    return Ok(());
                },
            };

            if let Some(output) = self.interceptor.on_syscall_stop(&regs, &tracee) {
                self.forward(&output)?;
            }
        }
    }

    fn forward(&mut self, output: &CapturedOutput) -> Result<()> {
        if output.is_empty() {
            return Ok(());
        }

        self.sink.write_all(output.as_bytes())?;
        self.sink.flush()?;

        self.captured_calls += 1;
        self.captured_bytes += output.len() as u64;

        Ok(())
    }
}

fn end_of_session(err: &Error, msg: &str) {
    if err.tracee_died() {
        info!(%err, "{}, tracee is gone", msg);
    } else {
        warn!(%err, "{}, ending session", msg);
    }
}

/// Attach to `pid` and mirror its terminal output to stdout until it exits.
pub fn mirror(pid: Pid) -> Result<()> {
    Tracer::attach(pid)?.run()
}
