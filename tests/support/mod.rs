#![allow(unused)]

use std::cell::Cell;
use std::fs;
use std::io::{self, Write};
use std::mem;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use ptee::error::{Error, Result};
use ptee::ptracer::Word;
use ptee::tracer::WRITE_SYSCALL;
use ptee::{Pid, PeekMemory, SyscallRegisters};

const WORD_SIZE: usize = mem::size_of::<Word>();

/// Byte used to fill memory past the end of a [`FakeMemory`] buffer.
pub const GARBAGE: u8 = 0xaa;

/// Register snapshot with just the syscall-relevant fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct FakeRegs {
    pub nr: u64,
    pub args: [u64; 3],
    pub ret: i64,
}

impl SyscallRegisters for FakeRegs {
    fn syscall_number(&self) -> u64 {
        self.nr
    }

    fn arg0(&self) -> u64 {
        self.args[0]
    }

    fn arg1(&self) -> u64 {
        self.args[1]
    }

    fn arg2(&self) -> u64 {
        self.args[2]
    }

    fn return_value(&self) -> i64 {
        self.ret
    }
}

/// Syscall-enter-stop for `write(fd, buf, count)`.
pub fn write_enter(fd: i32, buf: u64, count: u64) -> FakeRegs {
    FakeRegs {
        nr: WRITE_SYSCALL,
        args: [fd as u64, buf, count],
        ret: -(Errno::ENOSYS as i64),
    }
}

/// Syscall-exit-stop for `write()`. The first argument register is clobbered by the
/// result, as on aarch64.
pub fn write_exit(ret: i64) -> FakeRegs {
    FakeRegs {
        nr: WRITE_SYSCALL,
        args: [ret as u64, 0, 0],
        ret,
    }
}

/// Syscall-stop for some syscall other than `write()`.
pub fn other_syscall(nr: u64) -> FakeRegs {
    assert_ne!(nr, WRITE_SYSCALL);

    FakeRegs { nr, args: [1, 0x1000, 8], ret: 8 }
}

/// Tracee memory holding `bytes` at `base`. Words starting past the end fault, and words
/// straddling it are padded with [`GARBAGE`].
pub struct FakeMemory {
    base: u64,
    bytes: Vec<u8>,
    fault_at: Option<u64>,
    peeks: Cell<usize>,
}

impl FakeMemory {
    pub fn new(base: u64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            base,
            bytes: bytes.into(),
            fault_at: None,
            peeks: Cell::new(0),
        }
    }

    /// Make any peek at or above `addr` fail.
    pub fn fault_at(mut self, addr: u64) -> Self {
        self.fault_at = Some(addr);
        self
    }

    /// Number of peeks attempted, including failed ones.
    pub fn peeks(&self) -> usize {
        self.peeks.get()
    }
}

impl PeekMemory for FakeMemory {
    fn peek_word(&self, addr: u64) -> Result<Word> {
        self.peeks.set(self.peeks.get() + 1);

        if matches!(self.fault_at, Some(fault) if addr >= fault) {
            return Err(Error::OS(Errno::EIO));
        }

        let end = self.base + self.bytes.len() as u64;

        if addr < self.base || addr >= end {
            return Err(Error::OS(Errno::EFAULT));
        }

        let offset = (addr - self.base) as usize;
        let mut word = [GARBAGE; WORD_SIZE];

        for (i, byte) in self.bytes[offset..].iter().take(WORD_SIZE).enumerate() {
            word[i] = *byte;
        }

        Ok(Word::from_ne_bytes(word))
    }
}

/// Spawn `sh -c script` with its output discarded, to be attached to later.
pub fn spawn_shell(script: &str) -> std::io::Result<Child> {
    Command::new("/bin/sh")
        .args(&["-c", script])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

pub fn child_pid(child: &Child) -> Pid {
    Pid::from_raw(child.id() as i32)
}

/// Block until `pid` is a shell blocked in the kernel, i.e. past its `execve()` and
/// waiting on a child.
///
/// Panics if it does not get there in time.
pub fn wait_until_settled(pid: Pid) {
    let path = format!("/proc/{}/stat", pid);
    let deadline = Instant::now() + Duration::from_secs(3);

    while Instant::now() < deadline {
        if let Ok(stat) = fs::read_to_string(&path) {
            if is_sleeping_shell(&stat) {
                return;
            }
        }

        thread::sleep(Duration::from_millis(10));
    }

    panic!("pid {} never settled", pid);
}

fn is_sleeping_shell(stat: &str) -> bool {
    let (open, close) = match (stat.find('('), stat.rfind(')')) {
        (Some(open), Some(close)) => (open, close),
        _ => return false,
    };

    let comm = &stat[open + 1..close];
    let state = stat[close + 1..].split_whitespace().next();

    comm == "sh" && state == Some("S")
}

/// Sink that rejects every write, as if our stdout were a closed pipe.
#[derive(Debug, Default)]
pub struct BrokenPipe {
    pub attempts: usize,
}

impl Write for BrokenPipe {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        self.attempts += 1;
        Err(io::ErrorKind::BrokenPipe.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
