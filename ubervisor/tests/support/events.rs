#![allow(dead_code)]

use std::{io, io::BufRead, os::unix::net::UnixStream, path::Path, time};

use anyhow::anyhow;

/// A stream of test-hook event tags read off the daemon's internal hook
/// socket (see `libubervisor::test_hooks`), one newline-delimited tag per
/// reactor-observable event (a spawn, a reap, a BROKEN transition).
pub struct Events {
    lines: io::Lines<io::BufReader<UnixStream>>,
}

impl Events {
    pub fn new<P: AsRef<Path>>(sock: P) -> anyhow::Result<Self> {
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if let Ok(s) = UnixStream::connect(&sock) {
                return Ok(Events { lines: io::BufReader::new(s).lines() });
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }

        Err(anyhow!("timed out waiting for connection to event sock"))
    }

    /// Block until `event` is observed on the stream. Earlier, non-matching
    /// events are discarded, so call this right after the action expected
    /// to trigger it to avoid racing unrelated events.
    pub fn await_event(&mut self, event: &str) -> anyhow::Result<()> {
        for line in &mut self.lines {
            let line = line?;
            if line == event {
                return Ok(());
            }
        }
        Err(anyhow!("event stream closed before '{}' was observed", event))
    }
}
