use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use ptee::{sessions, Pid, Tracer};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

/// Mirror the terminal output of a running process.
#[derive(StructOpt, Debug)]
#[structopt(name = "ptee")]
struct Opt {
    /// Process to trace. If omitted, choose from the active terminal sessions.
    pid: Option<i32>,

    /// List active terminal sessions and exit.
    #[structopt(short, long)]
    list: bool,

    /// Log more to stderr. Repeat for more detail. Overridden by `RUST_LOG`.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    init_logging(opt.verbose);

    tracing::debug!(?opt, "parsed arguments");

    if opt.list {
        for session in sessions::list()? {
            println!("{}", session);
        }
        return Ok(());
    }

    let pid = match opt.pid {
        Some(pid) => Pid::from_raw(pid),
        None => match select_session()? {
            Some(pid) => pid,
            None => {
                println!("Exiting...");
                return Ok(());
            },
        },
    };

    let mut tracer = Tracer::attach(pid)
        .with_context(|| format!("unable to trace process {}", pid))?;

    tracer.run()?;

    Ok(())
}

// Logs go to stderr, so they never interleave with the mirrored output.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ptee={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

// Prompt for one of the active sessions. Returns `None` if the user chose to exit.
fn select_session() -> Result<Option<Pid>> {
    let sessions = sessions::list()?;

    if sessions.is_empty() {
        bail!("no active terminal sessions found");
    }

    println!("\nSession Monitor");
    println!("-------------------------");
    println!("Available sessions:\n");

    for (i, session) in sessions.iter().enumerate() {
        println!("{}. {}", i + 1, session);
    }

    println!("\n0. Exit");
    print!("\nSelect a session to monitor: ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    let choice: usize = line.trim().parse().context("invalid input")?;

    if choice == 0 {
        return Ok(None);
    }

    let session = match sessions.get(choice - 1) {
        Some(session) => session,
        None => bail!("invalid selection: {}", choice),
    };

    println!("\nMonitoring session {} (TTY: {})...", session.pid, session.tty);
    println!("Press Ctrl+C to stop monitoring\n");

    Ok(Some(session.pid))
}
