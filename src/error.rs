use std::io;

use nix::errno::Errno;

use crate::ptracer::{Pid, Restart};


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not set ptrace options for tracee = {pid}")]
    SetOptions {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not restart tracee = {pid} with mode = {mode:?}")]
    Restart { pid: Pid, mode: Restart, source: nix::Error },

    #[error("Could not wait on tracee = {pid}")]
    Wait { pid: Pid, source: nix::Error },

    #[error("Tracee died while a request was in flight, pid = {pid}")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("No tracee is attached")]
    NotAttached,

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the error means the tracee no longer exists.
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::TraceeDied { .. } => true,
            Error::Restart { source, .. } |
            Error::Wait { source, .. } => *source == Errno::ESRCH || *source == Errno::ECHILD,
            _ => false,
        }
    }

    /// True for errors raised while establishing the attachment. These end a session
    /// before any output has been captured.
    pub fn is_attach_failure(&self) -> bool {
        matches!(self, Error::Attach { .. } | Error::SetOptions { .. })
    }
}

pub(crate) trait ResultExt<T> {
    /// Map `ESRCH` to [`Error::TraceeDied`], and any other error to [`Error::OS`].
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::OS(source)
            }
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
