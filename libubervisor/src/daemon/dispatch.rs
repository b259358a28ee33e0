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

//! Command dispatch (C3): request validation and routing from a decoded
//! command frame to the registry/supervisor/reaper/logs/dump machinery,
//! producing the reply bytes (and any event broadcasts) a command
//! produces.

use std::fmt;

use tracing::{info, warn};
use ubervisor_protocol::{
    CodeReply, CommandTag, ErrorReply, Event, EventStatus, GetcReply, GroupConfig, GroupStatus,
    KillRequest, ListReply, NameRequest, PidsReply, ReadReply, ReadRequest, SpwnRequest, SubsRequest,
    UpdtRequest,
};

use crate::{
    config::Config,
    consts,
    daemon::{
        codec, dump,
        events::{Bus, EventKind},
        logs,
        registry::{Group, Lifecycle, Registry},
        server::ClientId,
        supervisor,
    },
};

/// The three error classes from the external-interfaces error taxonomy:
/// malformed input on the wire, a semantically invalid request against
/// otherwise well-formed input, and a resource-level failure (spawn
/// failed, file not found, ...).
#[derive(Debug)]
pub enum CommandError {
    Protocol(String),
    Semantic(String),
    Resource(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Protocol(m) => write!(f, "protocol error: {}", m),
            CommandError::Semantic(m) => write!(f, "semantic error: {}", m),
            CommandError::Resource(m) => write!(f, "resource error: {}", m),
        }
    }
}

impl std::error::Error for CommandError {}

impl CommandError {
    fn into_reply(self) -> ErrorReply {
        ErrorReply::new(self.to_string())
    }
}

fn validate_instances(n: u32) -> Result<(), CommandError> {
    if (consts::MIN_INSTANCES..=consts::MAX_INSTANCES).contains(&n) {
        Ok(())
    } else {
        Err(CommandError::Semantic(format!(
            "instances {} out of range [{}, {}]",
            n,
            consts::MIN_INSTANCES,
            consts::MAX_INSTANCES
        )))
    }
}

fn validate_signal(sig: i32) -> Result<(), CommandError> {
    if (consts::MIN_SIGNAL..=consts::MAX_SIGNAL).contains(&sig) {
        Ok(())
    } else {
        Err(CommandError::Semantic(format!(
            "signal {} out of range [{}, {}]",
            sig,
            consts::MIN_SIGNAL,
            consts::MAX_SIGNAL
        )))
    }
}

fn validate_name(name: &str) -> Result<(), CommandError> {
    if name.is_empty() {
        Err(CommandError::Semantic("group name must not be empty".into()))
    } else {
        Ok(())
    }
}

fn validate_args(args: &[String]) -> Result<(), CommandError> {
    if args.is_empty() || args[0].is_empty() {
        Err(CommandError::Semantic("args must be non-empty, with a non-empty argv[0]".into()))
    } else {
        Ok(())
    }
}

/// Everything a command handler needs: the registry, the subscriber bus,
/// the live config, and where the dump file lives.
pub struct Dispatcher {
    pub registry: Registry,
    pub bus: Bus,
    pub config: Config,
}

/// One outgoing frame destined for a specific client, produced as a side
/// effect of handling a command (an event broadcast, typically).
pub struct Outbound {
    pub client: ClientId,
    pub cid: u16,
    pub payload: Vec<u8>,
}

/// The result of dispatching one command frame.
pub struct DispatchOutcome {
    pub reply: Vec<u8>,
    pub broadcasts: Vec<Outbound>,
    /// Set by `EXIT`: the reactor should close this connection after
    /// flushing the reply.
    pub close_connection: bool,
    /// Set by `EXIT`: the whole daemon should shut down after flushing
    /// the reply, same as a clean SIGTERM.
    pub shutdown: bool,
}

impl DispatchOutcome {
    fn reply_only(reply: Vec<u8>) -> DispatchOutcome {
        DispatchOutcome { reply, broadcasts: Vec::new(), close_connection: false, shutdown: false }
    }
}

impl Dispatcher {
    pub fn new(registry: Registry, config: Config) -> Dispatcher {
        Dispatcher { registry, bus: Bus::new(), config }
    }

    pub fn handle(
        &mut self,
        tag: CommandTag,
        body: &[u8],
        client: ClientId,
        cid: u16,
    ) -> anyhow::Result<DispatchOutcome> {
        match tag {
            CommandTag::Spwn => self.handle_spwn(body),
            CommandTag::Dele => self.handle_dele(body),
            CommandTag::Kill => self.handle_kill(body),
            CommandTag::Getc => self.handle_getc(body),
            CommandTag::List => self.handle_list(),
            CommandTag::Updt => self.handle_updt(body),
            CommandTag::Helo => self.handle_helo(),
            CommandTag::Exit => Ok(DispatchOutcome {
                reply: self.ok()?,
                broadcasts: Vec::new(),
                close_connection: true,
                shutdown: true,
            }),
            CommandTag::Dump => self.handle_dump(),
            CommandTag::Subs => self.handle_subs(body, client, cid),
            CommandTag::Pids => self.handle_pids(body),
            CommandTag::Read => self.handle_read(body),
        }
    }

    /// Called by the client connection's cleanup path, not from `handle`.
    pub fn on_disconnect(&mut self, client: ClientId) {
        self.bus.unsubscribe(client);
    }

    fn ok(&mut self) -> anyhow::Result<Vec<u8>> {
        codec::encode_json(&CodeReply { code: true })
    }

    fn err_reply(&self, e: CommandError) -> anyhow::Result<Vec<u8>> {
        warn!(%e, "command failed");
        codec::encode_json(&e.into_reply())
    }

    fn handle_spwn(&mut self, body: &[u8]) -> anyhow::Result<DispatchOutcome> {
        let req: SpwnRequest = match codec::decode_json(body) {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Protocol(e.to_string()))?)),
        };

        if let Err(e) = validate_name(&req.name)
            .and_then(|_| validate_args(&req.args))
            .and_then(|_| validate_instances(req.instances))
            .and_then(|_| validate_signal(req.killsig))
        {
            return Ok(DispatchOutcome::reply_only(self.err_reply(e)?));
        }

        let cfg = GroupConfig {
            name: req.name.clone(),
            args: req.args,
            dir: req.dir,
            stdout: req.stdout,
            stderr: req.stderr,
            instances: req.instances,
            status: req.status,
            killsig: req.killsig,
            uid: req.uid,
            gid: req.gid,
            heartbeat: req.heartbeat,
            fatal_cb: req.fatal_cb,
            age: req.age,
        };
        let mut group = Group::from_config(&cfg);

        if self.registry.get(&group.name).is_some() {
            return Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic(format!("group '{}' already exists", group.name)))?,
            ));
        }

        if group.status() == GroupStatus::Running {
            spawn_all(&mut group);
        }

        let name = group.name.clone();
        let now_running = group.status() == GroupStatus::Running;
        self.registry.insert(group).map_err(|e| anyhow::anyhow!(e))?;
        info!(name = %name, "group added");

        let mut broadcasts = self.publish(
            EventKind::Status,
            Event { name: name.clone(), status: EventStatus::Added, index: None, pid: None, config: None },
        );
        if now_running {
            broadcasts.extend(self.publish(
                EventKind::Status,
                Event { name, status: EventStatus::Running, index: None, pid: None, config: None },
            ));
        }
        Ok(DispatchOutcome { reply: self.ok()?, broadcasts, close_connection: false, shutdown: false })
    }

    fn handle_dele(&mut self, body: &[u8]) -> anyhow::Result<DispatchOutcome> {
        let req: NameRequest = match codec::decode_json(body) {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Protocol(e.to_string()))?)),
        };

        let Some(group) = self.registry.get_mut(&req.name) else {
            return Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic(format!("no such group '{}'", req.name)))?,
            ));
        };

        let pids = group.live_pids();
        group.lifecycle = Lifecycle::Deleting;
        for inst in &group.slots {
            if inst.is_live() {
                let _ = supervisor::kill_instance(inst, group.killsig);
            }
        }

        // If nothing was live, the group can be dropped immediately; the
        // reaper handles the rest when live instances still exist.
        if group.live_count() == 0 {
            self.registry.remove(&req.name);
        }

        let broadcasts = self.publish(
            EventKind::Status,
            Event { name: req.name, status: EventStatus::Removed, index: None, pid: None, config: None },
        );
        Ok(DispatchOutcome {
            reply: codec::encode_json(&PidsReply { code: true, pids })?,
            broadcasts,
            close_connection: false,
            shutdown: false,
        })
    }

    fn handle_kill(&mut self, body: &[u8]) -> anyhow::Result<DispatchOutcome> {
        let req: KillRequest = match codec::decode_json(body) {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Protocol(e.to_string()))?)),
        };
        let Some(group) = self.registry.get_mut(&req.name) else {
            return Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic(format!("no such group '{}'", req.name)))?,
            ));
        };
        let sig = req.sig.unwrap_or(group.killsig);
        if let Err(e) = validate_signal(sig) {
            return Ok(DispatchOutcome::reply_only(self.err_reply(e)?));
        }

        let mut pids = Vec::new();
        match req.index {
            Some(idx) => {
                let Some(inst) = group.slots.iter().find(|i| i.index == idx) else {
                    return Ok(DispatchOutcome::reply_only(
                        self.err_reply(CommandError::Semantic(format!("no instance {} in '{}'", idx, req.name)))?,
                    ));
                };
                match supervisor::kill_instance(inst, sig) {
                    Ok(Some(pid)) => pids.push(pid),
                    Ok(None) => {}
                    Err(e) => {
                        return Ok(DispatchOutcome::reply_only(
                            self.err_reply(CommandError::Resource(e.to_string()))?,
                        ));
                    }
                }
            }
            None => {
                for inst in &group.slots {
                    if let Ok(Some(pid)) = supervisor::kill_instance(inst, sig) {
                        pids.push(pid);
                    }
                }
            }
        }

        Ok(DispatchOutcome::reply_only(codec::encode_json(&PidsReply { code: true, pids })?))
    }

    fn handle_getc(&mut self, body: &[u8]) -> anyhow::Result<DispatchOutcome> {
        let req: NameRequest = match codec::decode_json(body) {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Protocol(e.to_string()))?)),
        };
        match self.registry.get(&req.name) {
            Some(group) => Ok(DispatchOutcome::reply_only(
                codec::encode_json(&GetcReply { code: true, config: group.to_config() })?,
            )),
            None => Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic(format!("no such group '{}'", req.name)))?,
            )),
        }
    }

    fn handle_list(&mut self) -> anyhow::Result<DispatchOutcome> {
        let mut names = self.registry.names();
        names.sort();
        Ok(DispatchOutcome::reply_only(codec::encode_json(&ListReply(names))?))
    }

    fn handle_updt(&mut self, body: &[u8]) -> anyhow::Result<DispatchOutcome> {
        let req: UpdtRequest = match codec::decode_json(body) {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Protocol(e.to_string()))?)),
        };

        if let Some(n) = req.instances {
            if let Err(e) = validate_instances(n) {
                return Ok(DispatchOutcome::reply_only(self.err_reply(e)?));
            }
        }
        if let Some(sig) = req.killsig {
            if let Err(e) = validate_signal(sig) {
                return Ok(DispatchOutcome::reply_only(self.err_reply(e)?));
            }
        }

        let name = req.name.clone();
        let Some(group) = self.registry.get_mut(&name) else {
            return Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic(format!("no such group '{}'", name)))?,
            ));
        };
        let status_before = group.status();

        if let Some(v) = req.stdout {
            group.stdout = Some(v);
        }
        if let Some(v) = req.stderr {
            group.stderr = Some(v);
        }
        if let Some(v) = req.dir {
            group.dir = Some(v);
        }
        if let Some(v) = req.killsig {
            group.killsig = v;
        }
        if let Some(v) = req.heartbeat {
            group.heartbeat = Some(v);
        }
        if let Some(v) = req.fatal_cb {
            group.fatal_cb = Some(v);
        }
        if let Some(v) = req.age {
            group.age = v;
        }

        if let Some(status) = req.status {
            if status == GroupStatus::Running && status_before != GroupStatus::Running {
                group.fast_fail.reset();
                group.lifecycle = Lifecycle::Normal(GroupStatus::Running);
                spawn_all(group);
            } else if status == GroupStatus::Stopped {
                group.lifecycle = Lifecycle::Normal(GroupStatus::Stopped);
                for inst in &group.slots {
                    let _ = supervisor::kill_instance(inst, group.killsig);
                }
            }
        }

        if let Some(n) = req.instances {
            resize_instances(group, n);
        }

        let status_after = group.status();
        let config = group.to_config();

        let mut broadcasts = Vec::new();
        if status_after != status_before {
            let event_status = match status_after {
                GroupStatus::Running => EventStatus::Running,
                GroupStatus::Stopped => EventStatus::Stopped,
                GroupStatus::Broken => EventStatus::Stopped,
            };
            broadcasts.extend(self.publish(
                EventKind::Status,
                Event { name: name.clone(), status: event_status, index: None, pid: None, config: None },
            ));
        }
        broadcasts.extend(self.publish(
            EventKind::Config,
            Event { name, status: EventStatus::Running, index: None, pid: None, config: Some(config) },
        ));

        Ok(DispatchOutcome { reply: self.ok()?, broadcasts, close_connection: false, shutdown: false })
    }

    fn handle_helo(&mut self) -> anyhow::Result<DispatchOutcome> {
        Ok(DispatchOutcome::reply_only(ubervisor_protocol::HELO.to_vec()))
    }

    fn handle_dump(&mut self) -> anyhow::Result<DispatchOutcome> {
        let path = match self.config.dump_path() {
            Ok(p) => p,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Resource(e.to_string()))?)),
        };
        match dump::write(&self.registry, &path) {
            Ok(()) => Ok(DispatchOutcome::reply_only(self.ok()?)),
            Err(e) => Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Resource(e.to_string()))?)),
        }
    }

    fn handle_subs(&mut self, body: &[u8], client: ClientId, cid: u16) -> anyhow::Result<DispatchOutcome> {
        let req: SubsRequest = match codec::decode_json(body) {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Protocol(e.to_string()))?)),
        };
        self.bus.subscribe(client, cid, req.ident);
        Ok(DispatchOutcome::reply_only(self.ok()?))
    }

    fn handle_pids(&mut self, body: &[u8]) -> anyhow::Result<DispatchOutcome> {
        let req: NameRequest = match codec::decode_json(body) {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Protocol(e.to_string()))?)),
        };
        match self.registry.get(&req.name) {
            Some(group) => Ok(DispatchOutcome::reply_only(
                codec::encode_json(&PidsReply { code: true, pids: group.live_pids() })?,
            )),
            None => Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic(format!("no such group '{}'", req.name)))?,
            )),
        }
    }

    fn handle_read(&mut self, body: &[u8]) -> anyhow::Result<DispatchOutcome> {
        let req: ReadRequest = match codec::decode_json(body) {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Protocol(e.to_string()))?)),
        };

        let Some(group) = self.registry.get(&req.name) else {
            return Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic(format!("no such group '{}'", req.name)))?,
            ));
        };
        let Some(inst) = group.slots.iter().find(|i| i.index == req.instance) else {
            return Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic(format!("no instance {} in '{}'", req.instance, req.name)))?,
            ));
        };

        let path = match req.stream {
            1 => inst.stdout_path.clone(),
            _ => inst.stderr_path.clone(),
        };
        let Some(path) = path else {
            return Ok(DispatchOutcome::reply_only(
                self.err_reply(CommandError::Semantic("instance has no log path configured".into()))?,
            ));
        };

        match logs::read(&path, req.offset, req.bytes, self.config.max_read_bytes) {
            Ok((log, fsize)) => {
                Ok(DispatchOutcome::reply_only(codec::encode_json(&ReadReply { code: true, log, fsize })?))
            }
            Err(e) => Ok(DispatchOutcome::reply_only(self.err_reply(CommandError::Resource(e.to_string()))?)),
        }
    }

    pub(crate) fn publish(&self, kind: EventKind, event: Event) -> Vec<Outbound> {
        let targets = self.bus.route(kind, &event);
        let mut out = Vec::with_capacity(targets.len());
        for (client, cid) in targets {
            match codec::encode_json(&event) {
                Ok(payload) => out.push(Outbound { client, cid, payload }),
                Err(e) => warn!("failed to encode event payload: {}", e),
            }
        }
        out
    }
}

/// Spawn every instance that isn't already live, filling the group's
/// existing (pre-sized, possibly-empty) slot vector in place rather than
/// appending to it.
///
/// A per-instance spawn failure (fork/exec) is not reported back to the
/// caller: it is treated as a failed start, left for the ordinary
/// SIGCHLD/fast-fail path to reconcile, exactly like an instance that
/// spawned fine and then died immediately.
pub(crate) fn spawn_all(group: &mut Group) {
    for idx in 0..group.instances as usize {
        if group.slots.get(idx).map(|s| s.is_live()).unwrap_or(false) {
            continue;
        }
        match supervisor::spawn(group, idx as u32) {
            Ok(inst) => {
                if idx < group.slots.len() {
                    group.slots[idx] = inst;
                } else {
                    group.slots.push(inst);
                }
            }
            Err(e) => {
                warn!(name = %group.name, index = idx, "failed to spawn instance: {}", e);
                if idx >= group.slots.len() {
                    group.slots.push(crate::daemon::registry::Instance::empty(idx as u32));
                }
            }
        }
    }
}

fn resize_instances(group: &mut Group, n: u32) {
    group.instances = n;
    if group.slots.len() as u32 > n {
        // Signal the excess instances but leave their slots in place: pid
        // mapping is torn down on reap, not on signal, so PIDS/GETC keep
        // counting them live and `reaper::handle_exit` (not this
        // function) is what actually drops them from `slots`, mirroring
        // how `handle_dele` waits for `live_count() == 0`. A slot that
        // was never live (group stopped) has nothing to reap, so it's
        // dropped right away instead of waiting for a SIGCHLD that will
        // never come.
        for inst in group.slots.iter().filter(|i| i.index >= n && i.is_live()) {
            let _ = supervisor::kill_instance(inst, group.killsig);
        }
        group.slots.retain(|i| i.index < n || i.is_live());
    } else {
        while (group.slots.len() as u32) < n {
            let idx = group.slots.len() as u32;
            if group.status() == GroupStatus::Running {
                match supervisor::spawn(group, idx) {
                    Ok(inst) => group.slots.push(inst),
                    Err(e) => {
                        warn!(name = %group.name, "failed to spawn new instance {}: {}", idx, e);
                        break;
                    }
                }
            } else {
                group.slots.push(crate::daemon::registry::Instance::empty(idx));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn validate_instances_rejects_out_of_range() {
        assert_matches!(validate_instances(0), Err(CommandError::Semantic(_)));
        assert_matches!(validate_instances(1025), Err(CommandError::Semantic(_)));
        assert!(validate_instances(1).is_ok());
        assert!(validate_instances(1024).is_ok());
    }

    #[test]
    fn validate_signal_rejects_out_of_range() {
        assert_matches!(validate_signal(0), Err(CommandError::Semantic(_)));
        assert_matches!(validate_signal(32), Err(CommandError::Semantic(_)));
        assert!(validate_signal(9).is_ok());
    }

    #[test]
    fn validate_args_rejects_empty_argv0() {
        assert_matches!(validate_args(&[]), Err(CommandError::Semantic(_)));
        assert_matches!(validate_args(&["".to_string()]), Err(CommandError::Semantic(_)));
        assert!(validate_args(&["/bin/true".to_string()]).is_ok());
    }
}
