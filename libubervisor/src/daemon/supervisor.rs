// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The instance supervisor (C5): spawning, killing, and path templating
//! for the child processes belonging to a group.

use std::{
    ffi::CString,
    fs::OpenOptions,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{anyhow, Context};
use nix::{
    fcntl::OFlag,
    sys::signal::{self, Signal},
    unistd::{self, ForkResult, Gid, Pid, Uid},
};
use tracing::{info, instrument, warn};

use crate::{
    consts,
    daemon::registry::{Group, Instance},
};

/// Replace every occurrence of the literal `%(NUM)` with the decimal
/// instance index.
pub fn expand_template(template: &str, index: u32) -> String {
    template.replace("%(NUM)", &index.to_string())
}

/// Resolve a (possibly templated, possibly relative) log path against a
/// group's configured working directory. The server never chdirs itself,
/// so relative paths are joined against `dir` (or left relative to the
/// server's own cwd if `dir` is unset) at open time, not at spawn time.
pub fn resolve_log_path(template: &str, index: u32, dir: Option<&str>) -> PathBuf {
    let expanded = expand_template(template, index);
    let p = Path::new(&expanded);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match dir {
        Some(d) => Path::new(d).join(p),
        None => p.to_path_buf(),
    }
}

fn signal_from_raw(sig: i32) -> anyhow::Result<Signal> {
    Signal::try_from(sig).map_err(|_| anyhow!("invalid signal number {}", sig))
}

/// Spawn the instance at `index` in `group`. On success, fills in the
/// returned `Instance`'s pid and timing fields; the caller is
/// responsible for writing it back into the registry.
#[instrument(skip(group), fields(group = %group.name, index))]
pub fn spawn(group: &Group, index: u32) -> anyhow::Result<Instance> {
    let stdout_path = group.stdout.as_deref().map(|t| resolve_log_path(t, index, group.dir.as_deref()));
    let stderr_path = group.stderr.as_deref().map(|t| resolve_log_path(t, index, group.dir.as_deref()));

    let (err_r, err_w) = unistd::pipe2(OFlag::O_CLOEXEC).context("creating spawn error pipe")?;

    let args: Vec<CString> =
        group.args.iter().map(|a| CString::new(a.as_str())).collect::<Result<_, _>>()?;
    let dir = group.dir.clone();
    let uid = group.uid;
    let gid = group.gid;

    // Safety: between fork() and execv()/`_exit`, the child only calls
    // async-signal-safe operations (chdir, setgid/setuid, open, dup2,
    // close, write, execv, _exit).
    match unsafe { unistd::fork() }.context("forking instance")? {
        ForkResult::Parent { child } => {
            let _ = unistd::close(err_w.as_raw_fd());
            // A setup/exec failure in the child is just a very fast exit:
            // it gets reaped through the ordinary SIGCHLD path and counted
            // by the fast-fail policy like any other early death, so we
            // never block here waiting to find out. This is a best-effort
            // diagnostic only.
            let _ = nix::fcntl::fcntl(err_r.as_raw_fd(), nix::fcntl::FcntlArg::F_SETFL(OFlag::O_NONBLOCK));
            let mut buf = [0u8; 1];
            if matches!(unistd::read(err_r.as_raw_fd(), &mut buf), Ok(n) if n > 0) {
                warn!(pid = child.as_raw(), "instance may have failed to start (chdir/uid/gid/exec error)");
            }
            let _ = unistd::close(err_r.as_raw_fd());

            let spawned_at = std::time::SystemTime::now();
            info!(
                pid = child.as_raw(),
                at = %chrono::DateTime::<chrono::Local>::from(spawned_at).to_rfc3339(),
                "spawned instance"
            );
            crate::test_hooks::emit("instance-spawned");
            Ok(Instance {
                index,
                pid: Some(child.as_raw()),
                start_time: Some(Instant::now()),
                spawned_at: Some(spawned_at),
                stdout_path: stdout_path.map(|p| p.to_string_lossy().into_owned()),
                stderr_path: stderr_path.map(|p| p.to_string_lossy().into_owned()),
            })
        }
        ForkResult::Child => {
            let _ = unistd::close(err_r.as_raw_fd());
            if let Err(_e) = child_setup(dir.as_deref(), uid, gid, stdout_path.as_deref(), stderr_path.as_deref()) {
                let _ = unistd::write(&err_w, &[1u8]);
                unsafe { libc::_exit(127) };
            }

            let _ = unistd::execv(&args[0], &args);
            // execv only returns on failure.
            let _ = unistd::write(&err_w, &[1u8]);
            unsafe { libc::_exit(127) };
        }
    }
}

fn child_setup(
    dir: Option<&str>,
    uid: i64,
    gid: i64,
    stdout_path: Option<&Path>,
    stderr_path: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(d) = dir {
        unistd::chdir(d).map_err(|e| anyhow!("chdir: {}", e))?;
    }

    if gid != -1 {
        unistd::setgid(Gid::from_raw(gid as u32)).map_err(|e| anyhow!("setgid: {}", e))?;
    }
    if uid != -1 {
        unistd::setuid(Uid::from_raw(uid as u32)).map_err(|e| anyhow!("setuid: {}", e))?;
    }

    if let Some(p) = stdout_path {
        redirect_fd(p, libc::STDOUT_FILENO)?;
    }
    if let Some(p) = stderr_path {
        redirect_fd(p, libc::STDERR_FILENO)?;
    }

    Ok(())
}

fn redirect_fd(path: &Path, target_fd: i32) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(consts::DEFAULT_LOG_OPEN_MODE)
        .open(path)
        .map_err(|e| anyhow!("opening log file {:?}: {}", path, e))?;
    unistd::dup2(file.as_raw_fd(), target_fd).map_err(|e| anyhow!("dup2: {}", e))?;
    Ok(())
}

/// Send `sig` to a single live instance. No-op if the slot is empty.
pub fn kill_instance(inst: &Instance, sig: i32) -> anyhow::Result<Option<libc::pid_t>> {
    let Some(pid) = inst.pid else {
        return Ok(None);
    };
    let signal = signal_from_raw(sig)?;
    match signal::kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(Some(pid)),
        Err(nix::errno::Errno::ESRCH) => {
            // Already gone; the reaper just hasn't observed it yet.
            Ok(Some(pid))
        }
        Err(e) => {
            warn!(pid, "kill failed: {}", e);
            Err(anyhow!("kill({}, {}): {}", pid, sig, e))
        }
    }
}
