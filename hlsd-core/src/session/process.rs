use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

/// Puts the subprocess in a fresh process group so it can be killed together
/// with everything it spawns.
#[cfg(unix)]
pub(super) fn isolate_process_group(command: &mut Command) {
    // SAFETY: setpgid is async-signal-safe and touches no parent memory.
    unsafe {
        command.pre_exec(|| {
            if libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        });
    }
}

#[cfg(not(unix))]
pub(super) fn isolate_process_group(_command: &mut Command) {}

/// SIGKILLs the subprocess's process group, falling back to the subprocess
/// alone when the group cannot be resolved.
#[cfg(unix)]
pub(super) fn kill_process_group(child: &mut Child, session: &str) {
    let Some(pid) = child.id() else {
        debug!(session, "transcoder already exited");
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        kill_child(child, session);
        return;
    };

    // SAFETY: getpgid/getpgrp only read process table entries.
    let (pgid, own_pgid) = unsafe { (libc::getpgid(pid), libc::getpgrp()) };
    // never signal our own group
    if pgid <= 0 || pgid == own_pgid {
        warn!(
            session,
            pid,
            error = %std::io::Error::last_os_error(),
            "could not get process group id"
        );
        kill_child(child, session);
        return;
    }

    // SAFETY: a negative pid addresses the group; no memory is touched.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        debug!(session, pgid, "killed process group");
    } else {
        warn!(
            session,
            pgid,
            error = %std::io::Error::last_os_error(),
            "killing process group failed"
        );
    }
}

#[cfg(not(unix))]
pub(super) fn kill_process_group(child: &mut Child, session: &str) {
    kill_child(child, session);
}

fn kill_child(child: &mut Child, session: &str) {
    match child.start_kill() {
        Ok(()) => debug!(session, "killed process"),
        Err(err) => warn!(session, error = %err, "killing process failed"),
    }
}

/// Forwards subprocess stderr line by line to the log hook, or to tracing.
pub(super) async fn log_stderr(
    session: String,
    stderr: ChildStderr,
    hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match &hook {
                Some(hook) => hook(&line),
                None => info!(session = %session, module = "ffmpeg", "{line}"),
            },
            Ok(None) => break,
            Err(err) => {
                debug!(session = %session, error = %err, "transcoder stderr closed");
                break;
            }
        }
    }
}
