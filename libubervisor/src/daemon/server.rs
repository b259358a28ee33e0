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

//! The connection manager and reactor: a single thread multiplexes the
//! listening socket, every client socket, and the self-pipe's read end
//! with `poll(2)`, dispatching whatever each turn finds ready.

use std::{
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    os::unix::{io::AsFd, net::UnixListener, net::UnixStream},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use tracing::{debug, info, instrument, warn};
use ubervisor_protocol::{CommandTag, HELO};

use crate::{
    config,
    consts,
    daemon::{codec, dispatch, dispatch::Dispatcher, dump, reaper, registry::Registry, signals::SelfPipe},
};

/// Identifies one accepted connection for the lifetime of the process.
/// Distinct from the underlying fd, which gets reused once a connection
/// closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub usize);

struct Connection {
    stream: UnixStream,
    helo_done: bool,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    /// Bytes accumulated so far for each in-flight chunked message,
    /// keyed by the frame's `cid`.
    partial: HashMap<u16, Vec<u8>>,
    should_close: bool,
}

impl Connection {
    fn new(stream: UnixStream) -> anyhow::Result<Connection> {
        stream.set_nonblocking(true).context("setting client socket nonblocking")?;
        Ok(Connection {
            stream,
            helo_done: false,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            partial: HashMap::new(),
            should_close: false,
        })
    }
}

pub struct Server {
    listener: UnixListener,
    self_pipe: SelfPipe,
    dispatcher: Dispatcher,
    conns: HashMap<usize, Connection>,
    next_client: usize,
    socket_path: PathBuf,
    last_heartbeat: Instant,
    last_age_check: Instant,
    /// Set when an `EXIT` reply has been queued; once it drains from the
    /// write buffer the reactor stops, the same as a clean SIGTERM.
    exit_requested: bool,
}

impl Server {
    pub fn bind(socket_path: PathBuf, config_manager: config::Manager) -> anyhow::Result<Server> {
        let listener = bind_listener(&socket_path)?;
        let self_pipe = SelfPipe::install()?;

        let config = config_manager.get().clone();
        let mut registry = Registry::new();
        if let Ok(dump_path) = config.dump_path() {
            for cfg in dump::load(&dump_path)? {
                let mut group = crate::daemon::registry::Group::from_config(&cfg);
                if group.status() == ubervisor_protocol::GroupStatus::Running {
                    dispatch::spawn_all(&mut group);
                }
                if let Err(e) = registry.insert(group) {
                    warn!("skipping duplicate group name found in dump file: {}", e);
                }
            }
        }

        Ok(Server {
            listener,
            self_pipe,
            dispatcher: Dispatcher::new(registry, config),
            conns: HashMap::new(),
            next_client: 0,
            socket_path,
            last_heartbeat: Instant::now(),
            last_age_check: Instant::now(),
            exit_requested: false,
        })
    }

    /// Run the reactor loop until a client or signal tells it to stop.
    /// Returns `Ok(())` on a clean SIGTERM/SIGHUP shutdown.
    #[instrument(skip(self))]
    pub fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            if self.poll_once()? {
                break;
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    /// One reactor turn. Returns `true` if the caller should stop serving
    /// (a terminating signal was observed).
    fn poll_once(&mut self) -> anyhow::Result<bool> {
        let mut fds: Vec<PollFd> = Vec::with_capacity(self.conns.len() + 2);
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        let self_pipe_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.self_pipe.read_fd) };
        fds.push(PollFd::new(self_pipe_fd, PollFlags::POLLIN));

        let ids: Vec<usize> = self.conns.keys().copied().collect();
        for id in &ids {
            let conn = &self.conns[id];
            let mut flags = PollFlags::POLLIN;
            if !conn.write_buf.is_empty() {
                flags |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(conn.stream.as_fd(), flags));
        }

        match poll(&mut fds, PollTimeout::from(consts::REACTOR_POLL_INTERVAL.as_millis() as u16)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(false),
            Err(e) => return Err(anyhow::anyhow!("poll: {}", e)),
        }

        if fds[1].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
            self.self_pipe.drain()?;
            let stop = self.run_signal_driven_work()?;
            if stop {
                return Ok(true);
            }
        }

        if fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
            self.accept_one()?;
        }

        for (id, fd) in ids.iter().zip(fds.iter().skip(2)) {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            if revents.is_empty() {
                continue;
            }
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
                self.close_connection(*id);
                continue;
            }
            if revents.contains(PollFlags::POLLOUT) {
                self.flush_writes(*id);
            }
            if revents.contains(PollFlags::POLLIN) {
                self.read_client(*id)?;
            }
        }

        self.run_timers();

        if self.exit_requested && self.conns.values().all(|c| c.write_buf.is_empty()) {
            return Ok(true);
        }
        Ok(false)
    }

    /// SIGCHLD reaping is driven directly off the self-pipe; SIGTERM/SIGHUP
    /// both mean "shut down cleanly" for a supervisor with no live reload
    /// path for its own config.
    fn run_signal_driven_work(&mut self) -> anyhow::Result<bool> {
        let broadcasts = reaper::reap_all(&mut self.dispatcher)?;
        self.deliver(broadcasts);
        Ok(self.self_pipe.shutdown_requested())
    }

    fn run_timers(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_heartbeat) >= self.dispatcher.config.heartbeat_interval() {
            reaper::heartbeat_tick(&self.dispatcher);
            self.last_heartbeat = now;
        }
        if now.duration_since(self.last_age_check) >= self.dispatcher.config.age_check_interval() {
            reaper::age_tick(&mut self.dispatcher);
            self.last_age_check = now;
        }
    }

    fn accept_one(&mut self) -> anyhow::Result<()> {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                let id = self.next_client;
                self.next_client += 1;
                let conn = Connection::new(stream)?;
                debug!(client = id, "accepted connection");
                self.conns.insert(id, conn);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e).context("accepting connection"),
        }
    }

    fn close_connection(&mut self, id: usize) {
        if self.conns.remove(&id).is_some() {
            self.dispatcher.on_disconnect(ClientId(id));
            debug!(client = id, "connection closed");
        }
    }

    fn flush_writes(&mut self, id: usize) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        match conn.stream.write(&conn.write_buf) {
            Ok(0) => {}
            Ok(n) => {
                conn.write_buf.drain(0..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => conn.should_close = true,
        }
        if conn.should_close && conn.write_buf.is_empty() {
            self.close_connection(id);
        }
    }

    fn read_client(&mut self, id: usize) -> anyhow::Result<()> {
        let mut buf = [0u8; 64 * 1024];
        let mut closed = false;
        loop {
            let Some(conn) = self.conns.get_mut(&id) else { return Ok(()) };
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    conn.read_buf.extend_from_slice(&buf[..n]);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(client = id, "read error: {}", e);
                    closed = true;
                    break;
                }
            }
        }

        self.process_buffered(id)?;

        if closed {
            self.close_connection(id);
        }
        Ok(())
    }

    fn process_buffered(&mut self, id: usize) -> anyhow::Result<()> {
        loop {
            let Some(conn) = self.conns.get_mut(&id) else { return Ok(()) };

            if !conn.helo_done {
                let Some(parsed) = codec::try_parse_frame(&conn.read_buf)? else {
                    return Ok(());
                };
                let payload = &conn.read_buf[codec::HEADER_LEN..parsed.consumed];
                if payload != HELO.as_slice() {
                    warn!(client = id, "client sent invalid handshake");
                    conn.should_close = true;
                    return Ok(());
                }
                conn.read_buf.drain(0..parsed.consumed);
                conn.write_buf.extend_from_slice(HELO.as_slice());
                conn.helo_done = true;
                continue;
            }

            let Some(parsed) = codec::try_parse_frame(&conn.read_buf)? else {
                return Ok(());
            };
            let header = parsed.header;
            let body_start = 4;
            let chunk = conn.read_buf[body_start..parsed.consumed].to_vec();
            conn.read_buf.drain(0..parsed.consumed);

            let entry = conn.partial.entry(header.cid).or_default();
            entry.extend_from_slice(&chunk);
            if entry.len() > self.dispatcher.config.max_message_bytes {
                warn!(client = id, cid = header.cid, "message exceeds max_message_bytes, dropping connection");
                conn.should_close = true;
                return Ok(());
            }
            if header.more {
                continue;
            }

            let message = conn.partial.remove(&header.cid).unwrap_or_default();
            self.dispatch_message(id, header.cid, &message)?;
        }
    }

    fn dispatch_message(&mut self, id: usize, cid: u16, message: &[u8]) -> anyhow::Result<()> {
        let (tag, body) = match codec::split_command_payload(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(client = id, "malformed command frame: {}", e);
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.should_close = true;
                }
                return Ok(());
            }
        };

        let outcome = self.dispatcher.handle(tag, body, ClientId(id), cid)?;

        if matches!(tag, CommandTag::Helo) {
            // The HELO command tag is only ever sent after the raw
            // handshake and gets the same raw (unframed) treatment.
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.write_buf.extend_from_slice(&outcome.reply);
            }
        } else if let Some(conn) = self.conns.get_mut(&id) {
            let framed = codec::encode_message(cid, &outcome.reply)?;
            conn.write_buf.extend_from_slice(&framed);
        }

        if outcome.close_connection {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.should_close = true;
            }
        }
        if outcome.shutdown {
            self.exit_requested = true;
        }

        self.deliver(outcome.broadcasts);
        Ok(())
    }

    fn deliver(&mut self, outbound: Vec<crate::daemon::dispatch::Outbound>) {
        for item in outbound {
            if let Some(conn) = self.conns.get_mut(&item.client.0) {
                if conn.write_buf.len() + item.payload.len() > self.dispatcher.config.max_client_write_queue_bytes {
                    warn!(client = item.client.0, "write queue overflow, dropping connection");
                    conn.should_close = true;
                    continue;
                }
                match codec::encode_message(item.cid, &item.payload) {
                    Ok(framed) => conn.write_buf.extend_from_slice(&framed),
                    Err(e) => warn!("failed to frame event payload: {}", e),
                }
            }
        }
    }
}

/// Bind the control socket, clearing a stale socket file left behind by a
/// daemon that didn't shut down cleanly. A connect attempt distinguishes
/// "stale file, nothing listening" from "another daemon is already here".
fn bind_listener(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        match UnixStream::connect(socket_path) {
            Ok(_) => {
                anyhow::bail!("a daemon is already listening on {:?}", socket_path);
            }
            Err(_) => {
                info!("removing stale socket file {:?}", socket_path);
                std::fs::remove_file(socket_path).context("removing stale socket file")?;
            }
        }
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("creating socket directory")?;
    }
    let listener = UnixListener::bind(socket_path).context("binding control socket")?;
    listener.set_nonblocking(true).context("setting listener nonblocking")?;
    Ok(listener)
}
