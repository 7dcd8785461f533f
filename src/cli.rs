//! Command-line surface and process lifecycle: `start | stop | restart |
//! stand | status`, matching the original's `Command` class one-for-one.
//! `stand` runs in the foreground (useful under a supervisor, or for the
//! `LoopbackImClient`-backed smoke run); the rest manage a background
//! daemon through a pidfile.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "l2overlayd", about = "Virtual layer-2 overlay daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Overrides the config file search order in `crate::config`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Fork into the background and run the overlay.
    Start,
    /// Signal a running daemon to exit.
    Stop,
    /// Stop, then start.
    Restart,
    /// Run in the foreground without daemonizing.
    Stand,
    /// Report whether a daemon is running.
    Status,
}

/// Reads a pidfile and checks (via signal 0) whether that process is
/// still alive, matching the original's `os.kill(pid, 0)` liveness probe.
pub fn running_pid(pid_path: &Path) -> Option<Pid> {
    let text = std::fs::read_to_string(pid_path).ok()?;
    let pid: i32 = text.trim().parse().ok()?;
    let pid = Pid::from_raw(pid);
    signal::kill(pid, None).ok().map(|_| pid)
}

pub fn write_pidfile(pid_path: &Path) -> std::io::Result<()> {
    std::fs::write(pid_path, format!("{}\n", std::process::id()))
}

pub fn remove_pidfile(pid_path: &Path) {
    if let Err(err) = std::fs::remove_file(pid_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %err, path = %pid_path.display(), "removing pidfile");
        }
    }
}

/// Sends `SIGTERM` to whatever pidfile-recorded process is alive, and
/// waits briefly for it to exit. Exits non-zero (via the returned error)
/// when nothing is running, matching the original's `sys.exit(1)` for
/// "There is no instance running."
pub fn stop(pid_path: &Path) -> std::io::Result<()> {
    match running_pid(pid_path) {
        Some(pid) => {
            info!(pid = pid.as_raw(), "stopping running daemon");
            signal::kill(pid, Signal::SIGTERM)
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
            for _ in 0..50 {
                if running_pid(pid_path).is_none() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Ok(())
        }
        None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no running daemon found")),
    }
}
