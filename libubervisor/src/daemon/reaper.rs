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

//! Reaping and health (C6): drains dead children after SIGCHLD, applies
//! the fast-fail/BROKEN restart policy, and runs the heartbeat and age
//! expiry ticks.

use std::{process::Command, time::Instant};

use nix::sys::wait::{WaitPidFlag, WaitStatus};
use tracing::{info, warn};
use ubervisor_protocol::{Event, EventStatus, GroupStatus};

use crate::daemon::{
    dispatch::{Dispatcher, Outbound},
    events::EventKind,
    registry::Lifecycle,
    supervisor,
};

/// Drain every exited child currently reapable with a non-blocking
/// `waitpid(-1, ...)`, updating the registry and producing any event
/// broadcasts the transitions trigger. Called once per reactor turn
/// after the self-pipe reports SIGCHLD activity.
pub fn reap_all(d: &mut Dispatcher) -> anyhow::Result<Vec<Outbound>> {
    let mut broadcasts = Vec::new();
    loop {
        let status = match nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(s) => s,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => return Err(anyhow::anyhow!("waitpid: {}", e)),
        };
        let Some(pid) = status.pid() else { break };

        let Some((name, index)) = d.registry.find_by_pid(pid.as_raw()) else {
            continue;
        };
        info!(name = %name, index, pid = pid.as_raw(), ?status, "reaped instance");
        crate::test_hooks::emit("instance-reaped");
        broadcasts.extend(handle_exit(d, &name, index));
    }
    Ok(broadcasts)
}

fn handle_exit(d: &mut Dispatcher, name: &str, index: u32) -> Vec<Outbound> {
    let threshold = d.config.fast_fail_threshold();
    let window = d.config.fast_fail_window();
    let limit = d.config.fast_fail_limit;

    let Some(group) = d.registry.get_mut(name) else { return Vec::new() };
    let Some(slot) = group.slots.iter_mut().find(|i| i.index == index) else { return Vec::new() };

    let fast = slot.start_time.map(|t| t.elapsed() < threshold).unwrap_or(false);
    *slot = crate::daemon::registry::Instance::empty(index);

    if group.is_deleting() {
        if group.live_count() == 0 {
            d.registry.remove(name);
            return d.publish(
                EventKind::Status,
                Event { name: name.to_string(), status: EventStatus::Removed, index: None, pid: None, config: None },
            );
        }
        return Vec::new();
    }

    // A shrinking UPDT signaled this instance and lowered `instances`
    // below its index, but left the slot in place until now so PIDS/GETC
    // kept counting it live. Drop it for good; it's not a failure worth
    // fast-fail bookkeeping or a respawn.
    if index >= group.instances {
        group.slots.retain(|i| i.index != index);
        return d.publish(
            EventKind::Delta,
            Event { name: name.to_string(), status: EventStatus::Removed, index: Some(index), pid: None, config: None },
        );
    }

    if group.status() != GroupStatus::Running {
        return d.publish(
            EventKind::Delta,
            Event { name: name.to_string(), status: EventStatus::Stopped, index: Some(index), pid: None, config: None },
        );
    }

    let mut out = d.publish(
        EventKind::Delta,
        Event { name: name.to_string(), status: EventStatus::Removed, index: Some(index), pid: None, config: None },
    );

    if fast {
        let count = group.fast_fail.record(Instant::now(), window);
        if count >= limit {
            group.lifecycle = Lifecycle::Normal(GroupStatus::Broken);
            warn!(name, "group entered BROKEN after {} fast exits", count);
            crate::test_hooks::emit("group-broken");
            if let Some(cb) = group.fatal_cb.clone() {
                invoke_hook(&cb, name);
            }
            out.extend(d.publish(
                EventKind::Status,
                Event { name: name.to_string(), status: EventStatus::Stopped, index: None, pid: None, config: None },
            ));
            return out;
        }
    } else {
        group.fast_fail.reset();
    }

    match supervisor::spawn(group, index) {
        Ok(inst) => {
            let pid = inst.pid;
            group.slots[index as usize] = inst;
            out.extend(d.publish(
                EventKind::Delta,
                Event { name: name.to_string(), status: EventStatus::Added, index: Some(index), pid, config: None },
            ));
        }
        Err(e) => warn!(name, index, "respawn failed: {}", e),
    }

    out
}

/// Invoke the heartbeat hook for every live instance. The hook is purely
/// observational: its exit status and output are never inspected, so it
/// is spawned and immediately let go, not waited on.
pub fn heartbeat_tick(d: &Dispatcher) {
    for group in d.registry.iter() {
        let Some(hb) = &group.heartbeat else { continue };
        for inst in &group.slots {
            let Some(pid) = inst.pid else { continue };
            invoke_hook(hb, &pid.to_string());
        }
    }
}

/// Signal any instance whose age exceeds its group's configured `age`
/// (an `age` of 0 means "no expiry").
pub fn age_tick(d: &mut Dispatcher) {
    let entries: Vec<(String, u32, i32)> = d
        .registry
        .iter()
        .filter(|g| g.age > 0)
        .flat_map(|g| {
            g.slots.iter().filter_map(move |inst| {
                let started = inst.start_time?;
                if started.elapsed().as_secs() >= g.age {
                    Some((g.name.clone(), inst.index, g.killsig))
                } else {
                    None
                }
            })
        })
        .collect();

    for (name, index, killsig) in entries {
        if let Some(group) = d.registry.get(&name) {
            if let Some(inst) = group.slots.iter().find(|i| i.index == index) {
                if let Err(e) = supervisor::kill_instance(inst, killsig) {
                    warn!(name, index, "age expiry kill failed: {}", e);
                }
            }
        }
    }
}

fn invoke_hook(program: &str, arg: &str) {
    match Command::new(program).arg(arg).spawn() {
        Ok(_child) => {}
        Err(e) => warn!(program, arg, "failed to invoke hook: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, daemon::registry::Registry};

    #[test]
    fn heartbeat_tick_skips_groups_without_a_hook() {
        let mut dispatcher = Dispatcher::new(Registry::new(), Config::default());
        let cfg = ubervisor_protocol::GroupConfig::defaults_for("g".into(), vec!["/bin/true".into()]);
        dispatcher.registry.insert(crate::daemon::registry::Group::from_config(&cfg)).unwrap();
        heartbeat_tick(&dispatcher);
    }

    #[test]
    fn age_tick_is_noop_with_no_groups() {
        let mut dispatcher = Dispatcher::new(Registry::new(), Config::default());
        age_tick(&mut dispatcher);
    }
}
