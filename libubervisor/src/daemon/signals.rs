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

//! The self-pipe that lets the single-threaded reactor observe SIGCHLD,
//! SIGTERM and SIGHUP safely: the actual signal handlers (installed by
//! `signal_hook`) only ever write a single byte to the pipe's write end,
//! which is async-signal-safe. The reactor multiplexes the read end
//! alongside the listening and client sockets and drains it each turn.

use std::{
    os::unix::io::RawFd,
    sync::{atomic::{AtomicBool, Ordering}, Arc},
};

use anyhow::Context;
use nix::unistd;
use tracing::info;

pub struct SelfPipe {
    pub read_fd: RawFd,
    write_fd: RawFd,
    term: Arc<AtomicBool>,
    _sigchld: signal_hook::SigId,
    _sigterm_pipe: signal_hook::SigId,
    _sighup_pipe: signal_hook::SigId,
    _sigterm_flag: signal_hook::SigId,
    _sighup_flag: signal_hook::SigId,
}

impl SelfPipe {
    /// Create the pipe and register the handlers. Must be called once,
    /// before the reactor starts polling.
    pub fn install() -> anyhow::Result<SelfPipe> {
        let (read_fd, write_fd) = unistd::pipe().context("creating self-pipe")?;
        let read_fd = std::os::fd::IntoRawFd::into_raw_fd(read_fd);
        let write_fd = std::os::fd::IntoRawFd::into_raw_fd(write_fd);

        nix::fcntl::fcntl(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(read_fd) },
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .context("setting self-pipe read end nonblocking")?;

        let sigchld = signal_hook::low_level::pipe::register_raw(signal_hook::consts::SIGCHLD, write_fd)
            .context("registering SIGCHLD")?;
        let sigterm_pipe = signal_hook::low_level::pipe::register_raw(signal_hook::consts::SIGTERM, write_fd)
            .context("registering SIGTERM")?;
        let sighup_pipe = signal_hook::low_level::pipe::register_raw(signal_hook::consts::SIGHUP, write_fd)
            .context("registering SIGHUP")?;

        // The self-pipe wakes the reactor but doesn't say which signal
        // fired; SIGTERM/SIGHUP additionally set this flag so the reactor
        // can tell "time to shut down" apart from "go check for exited
        // children".
        let term = Arc::new(AtomicBool::new(false));
        let sigterm_flag = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))
            .context("registering SIGTERM shutdown flag")?;
        let sighup_flag = signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&term))
            .context("registering SIGHUP shutdown flag")?;

        info!("self-pipe installed for SIGCHLD/SIGTERM/SIGHUP");

        Ok(SelfPipe {
            read_fd,
            write_fd,
            term,
            _sigchld: sigchld,
            _sigterm_pipe: sigterm_pipe,
            _sighup_pipe: sighup_pipe,
            _sigterm_flag: sigterm_flag,
            _sighup_flag: sighup_flag,
        })
    }

    /// Whether SIGTERM or SIGHUP has been observed since startup.
    pub fn shutdown_requested(&self) -> bool {
        self.term.load(Ordering::Relaxed)
    }

    /// Drain every byte currently buffered in the pipe. Each byte
    /// corresponds to one signal delivery, but since signals of the same
    /// kind coalesce while pending, the reactor always treats "the pipe
    /// had data" as "go check everything", not "N deliveries happened".
    pub fn drain(&self) -> anyhow::Result<()> {
        let mut buf = [0u8; 256];
        loop {
            match unistd::read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("reading self-pipe"),
            }
        }
        Ok(())
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        let _ = unistd::close(self.read_fd);
        let _ = unistd::close(self.write_fd);
    }
}
