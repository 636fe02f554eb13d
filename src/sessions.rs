//! Discovery of interactive shells attached to pseudo-terminals, as candidate tracees.

use std::fmt;
use std::fs;
use std::io;

use nix::unistd::{Uid, User};
use tracing::{debug, trace};

use crate::error::Result;
use crate::ptracer::Pid;


/// Command names accepted as interactive shells.
pub const SHELLS: &[&str] = &["bash", "zsh", "fish", "sh"];

/// Upper bound on the number of sessions returned by [`list()`].
pub const MAX_SESSIONS: usize = 100;

/// Range of device majors used for Unix98 pty slaves, `/dev/pts/N`.
const PTS_MAJORS: std::ops::RangeInclusive<u32> = 136..=143;

/// A shell process running on a pseudo-terminal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    pub pid: Pid,

    /// Terminal name, relative to `/dev`, e.g. `pts/3`.
    pub tty: String,

    /// Owner of the process.
    pub user: String,

    pub command: String,
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PID: {}, TTY: {}, User: {}, Command: {}",
            self.pid, self.tty, self.user, self.command,
        )
    }
}

/// List shells running on pseudo-terminals, ordered by pid.
pub fn list() -> Result<Vec<Session>> {
    let mut sessions = vec![];

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;

        let pid = match entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) {
            Some(pid) => Pid::from_raw(pid),
            None => continue,
        };

        // The process may exit, or be unreadable to us, at any point in the scan.
        match session(pid) {
            Ok(Some(session)) => sessions.push(session),
            Ok(None) => {},
            Err(err) => trace!(pid = pid.as_raw(), %err, "skipping unreadable process"),
        }
    }

    sessions.sort_by_key(|s| s.pid);
    sessions.truncate(MAX_SESSIONS);

    debug!(count = sessions.len(), "found terminal sessions");

    Ok(sessions)
}

fn session(pid: Pid) -> io::Result<Option<Session>> {
    let dir = format!("/proc/{}", pid);
    let stat = fs::read_to_string(format!("{}/stat", dir))?;

    let stat = match Stat::parse(&stat) {
        Some(stat) => stat,
        None => return Ok(None),
    };

    if !SHELLS.contains(&stat.comm.as_str()) {
        return Ok(None);
    }

    let tty = match pts_name(stat.tty_nr) {
        Some(tty) => tty,
        None => return Ok(None),
    };

    let status = fs::read_to_string(format!("{}/status", dir))?;

    let user = match real_uid(&status) {
        Some(uid) => user_name(uid),
        None => return Ok(None),
    };

    Ok(Some(Session { pid, tty, user, command: stat.comm }))
}

fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Real uid, the first field of the `Uid:` line of `/proc/<pid>/status`.
fn real_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Fields of `/proc/<pid>/stat` that we care about.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Stat {
    comm: String,
    tty_nr: u32,
}

impl Stat {
    fn parse(stat: &str) -> Option<Self> {
        // `comm` is parenthesized, and may itself contain spaces or parens.
        let open = stat.find('(')?;
        let close = stat.rfind(')')?;
        let comm = stat.get(open + 1..close)?.to_owned();

        // Fields after `comm`: state, ppid, pgrp, session, tty_nr.
        let tty_nr = stat.get(close + 1..)?
            .split_whitespace()
            .nth(4)?
            .parse::<i64>()
            .ok()? as u32;

        Some(Self { comm, tty_nr })
    }
}

/// Decode a `tty_nr` device number as a `pts/N` name, if it is a pty slave.
fn pts_name(tty_nr: u32) -> Option<String> {
    let major = (tty_nr >> 8) & 0xfff;
    let minor = (tty_nr & 0xff) | ((tty_nr >> 12) & 0xfff00);

    if !PTS_MAJORS.contains(&major) {
        return None;
    }

    let index = (major - PTS_MAJORS.start()) * 256 + minor;

    Some(format!("pts/{}", index))
}
