#[macro_use]
pub mod error;
pub mod ptracer;
pub mod regs;
pub mod sessions;
pub mod tracer;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

pub use error::Error;
pub use ptracer::{Pid, Ptracer, Registers, Restart, Signal, Stop, Tracee};
pub use regs::SyscallRegisters;
pub use tracer::{mirror, CapturedOutput, Interceptor, PeekMemory, PendingCall, Tracer};
