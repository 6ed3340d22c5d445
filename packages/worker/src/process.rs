//! Platform process control.

use std::io;
use std::process::ExitStatus;

/// Forcefully stop the process `pid`.
///
/// A process that has already exited is not an error.
#[cfg(unix)]
pub fn kill_process(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    match signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

/// Forcefully stop the process `pid` and every process it started.
#[cfg(windows)]
pub fn kill_process(pid: u32) -> io::Result<()> {
    use std::process::{Command, Stdio};

    Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(drop)
}

/// Name of the signal that ended the process, if any.
#[cfg(unix)]
pub fn exit_signal(status: &ExitStatus) -> Option<String> {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    let raw = status.signal()?;
    Some(
        Signal::try_from(raw)
            .map(|signal| signal.as_str().to_string())
            .unwrap_or_else(|_| raw.to_string()),
    )
}

#[cfg(not(unix))]
pub fn exit_signal(_status: &ExitStatus) -> Option<String> {
    None
}
