use std::{
  io::{self, Read},
  os::unix::process::{CommandExt as _, ExitStatusExt as _},
  process::{Child, Command, ExitStatus, Output, Stdio},
  thread,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use wait_timeout::ChildExt as WaitExt;

use crate::cancel::CancellationToken;

/// How often a blocking wait re-checks for cancellation.
pub const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Sends `signal` to every process in the group led by `pgid`. A group that
/// no longer exists is not an error.
pub fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
  let ret = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
  if ret == -1 {
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
      return Err(err);
    }
  }

  Ok(())
}

/// Sends `signal` to each of `pids`, skipping any that are already gone.
pub fn signal_all(pids: &[u32], signal: libc::c_int) -> io::Result<()> {
  for &pid in pids {
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == -1 {
      let err = io::Error::last_os_error();
      if err.raw_os_error() != Some(libc::ESRCH) {
        return Err(err);
      }
    }
  }

  Ok(())
}

#[extend::ext]
pub impl ExitStatus {
  fn check_success(&self) -> Result<()> {
    if !self.success() {
      anyhow::bail!("exited with non-zero status {self}");
    }

    Ok(())
  }

  /// The exit code, or the negated signal number for a signalled process.
  fn code_or_signal(&self) -> i32 {
    self.code().or_else(|| self.signal().map(|signal| -signal)).unwrap_or(-1)
  }
}

#[extend::ext]
pub impl Child {
  /// Terminates the child's whole process group: SIGTERM, up to `grace` for
  /// the leader to exit, then SIGKILL. Always reaps the leader.
  fn terminate_group(&mut self, grace: Duration) -> io::Result<ExitStatus> {
    let pgid = self.id();

    if let Some(status) = self.try_wait()? {
      signal_group(pgid, libc::SIGKILL)?;
      return Ok(status);
    }

    signal_group(pgid, libc::SIGTERM)?;
    let exited = self.wait_timeout(grace)?;

    // Grandchildren may outlive the leader, so the group is killed either way.
    signal_group(pgid, libc::SIGKILL)?;

    match exited {
      Some(status) => Ok(status),
      None => self.wait(),
    }
  }
}

#[extend::ext]
pub impl Command {
  /// Starts the child as the leader of a new process group so the tree it
  /// spawns can be signalled as a unit.
  fn isolated(&mut self) -> &mut Command {
    self.process_group(0)
  }

  /// Runs the command with stdout and stderr captured. Returns `Ok(None)` if
  /// it does not finish within `timeout`, after terminating its process group.
  fn output_timeout(&mut self, timeout: Duration, grace: Duration) -> Result<Option<Output>> {
    self.output_until(timeout, grace, &CancellationToken::new())
  }

  /// Like `output_timeout`, but also gives up as soon as `cancel` fires.
  fn output_until(&mut self, timeout: Duration, grace: Duration, cancel: &CancellationToken) -> Result<Option<Output>> {
    let mut child = self
      .isolated()
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .context("spawn")?;

    let mut stdout = child.stdout.take().context("stdout")?;
    let mut stderr = child.stderr.take().context("stderr")?;
    let deadline = Instant::now() + timeout;

    thread::scope(|scope| {
      let stdout = scope.spawn(move || drain(&mut stdout));
      let stderr = scope.spawn(move || drain(&mut stderr));

      let exited = loop {
        let now = Instant::now();
        if now >= deadline || cancel.is_cancelled() {
          break None;
        }
        if let Some(status) = child.wait_timeout((deadline - now).min(CANCEL_POLL)).context("wait")? {
          break Some(status);
        }
      };

      let status = match exited {
        Some(status) => {
          signal_group(child.id(), libc::SIGKILL).context("kill group")?;
          Some(status)
        }
        None => {
          child.terminate_group(grace).context("terminate")?;
          None
        }
      };

      let stdout = stdout.join().unwrap_or_default();
      let stderr = stderr.join().unwrap_or_default();

      Ok(status.map(|status| Output { status, stdout, stderr }))
    })
  }
}

/// Reads a pipe to its end. Read errors truncate the capture.
pub fn drain<R: Read>(reader: &mut R) -> Vec<u8> {
  let mut buf = Vec::new();
  let _ = reader.read_to_end(&mut buf);
  buf
}
