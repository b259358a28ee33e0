#![allow(dead_code)]

use std::{
    fs,
    os::unix::net::UnixStream,
    path::PathBuf,
    process::{self, Command, Stdio},
    time,
};

use anyhow::Context;

use super::{client::Client, events::Events, ubervisor_bin};

/// A handle to a `ubervisor daemon` subprocess. Kills the subprocess when
/// it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    pub tmp_dir: PathBuf,
    pub socket_path: PathBuf,
    pub events: Option<Events>,
}

impl Proc {
    /// Spawn a daemon into a fresh temp dir. `listen_events` wires up the
    /// internal test-hook socket so `await_event` can observe spawn/reap/
    /// BROKEN transitions without sleep-polling the control socket.
    pub fn new(listen_events: bool) -> anyhow::Result<Proc> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("ubervisor-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?
            .into_path();

        let socket_path = tmp_dir.join("ubervisor.socket");
        let log_file = tmp_dir.join("daemon.log");
        let config_file = tmp_dir.join("config.toml");
        fs::write(&config_file, format!("dump_file = {:?}\n", tmp_dir.join("dump.json")))
            .context("writing test config file")?;
        let test_hook_socket_path = tmp_dir.join("ubervisor-daemon-test-hook.socket");

        eprintln!("spawning daemon proc with log {:?}", &log_file);
        let mut cmd = Command::new(ubervisor_bin()?);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--socket")
            .arg(&socket_path)
            .arg("--config-file")
            .arg(&config_file)
            .arg("daemon");
        if listen_events {
            cmd.env("UBERVISOR_TEST_HOOK_SOCKET_PATH", &test_hook_socket_path);
        }
        let proc = cmd.spawn().context("spawning daemon process")?;

        let events = if listen_events { Some(Events::new(&test_hook_socket_path)?) } else { None };

        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if UnixStream::connect(&socket_path).is_ok() {
                break;
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }

        Ok(Proc { proc, tmp_dir, socket_path, events })
    }

    pub fn client(&self) -> anyhow::Result<Client> {
        Client::connect(&self.socket_path)
    }

    pub fn await_event(&mut self, event: &str) -> anyhow::Result<()> {
        match &mut self.events {
            Some(events) => events.await_event(event),
            None => anyhow::bail!("no events stream (Proc::new was called with listen_events=false)"),
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing daemon proc: {:?}", e);
        }
        let _ = self.proc.wait();
        if std::env::var("UBERVISOR_LEAVE_TEST_LOGS").unwrap_or_default() != "true" {
            let _ = fs::remove_dir_all(&self.tmp_dir);
        }
    }
}
