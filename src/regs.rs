//! Architecture-independent view of the registers that describe a syscall.

use crate::ptracer::Registers;


/// The syscall-related slice of a register snapshot.
///
/// Arguments are only meaningful at syscall-enter-stop, and the return value only at
/// syscall-exit-stop. On some architectures (e.g. aarch64) the first argument register
/// is overwritten by the return value.
pub trait SyscallRegisters {
    /// Number of the syscall being entered or exited.
    fn syscall_number(&self) -> u64;

    fn arg0(&self) -> u64;

    fn arg1(&self) -> u64;

    fn arg2(&self) -> u64;

    /// Syscall result. Negative values in `-4095..0` are `-errno`.
    fn return_value(&self) -> i64;
}

#[cfg(target_arch = "x86_64")]
impl SyscallRegisters for Registers {
    fn syscall_number(&self) -> u64 {
        // `rax` holds `-ENOSYS` at syscall-enter-stop, so the kernel saves the number here.
        self.orig_rax
    }

    fn arg0(&self) -> u64 {
        self.rdi
    }

    fn arg1(&self) -> u64 {
        self.rsi
    }

    fn arg2(&self) -> u64 {
        self.rdx
    }

    fn return_value(&self) -> i64 {
        self.rax as i64
    }
}

#[cfg(target_arch = "aarch64")]
impl SyscallRegisters for Registers {
    fn syscall_number(&self) -> u64 {
        self.regs[8]
    }

    fn arg0(&self) -> u64 {
        self.regs[0]
    }

    fn arg1(&self) -> u64 {
        self.regs[1]
    }

    fn arg2(&self) -> u64 {
        self.regs[2]
    }

    fn return_value(&self) -> i64 {
        self.regs[0] as i64
    }
}
