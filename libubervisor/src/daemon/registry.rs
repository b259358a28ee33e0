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

//! The group registry (C4): the authoritative map from group name to
//! group record, plus the per-instance bookkeeping the supervisor and
//! reaper mutate in place.

use std::{
    collections::HashMap,
    time::{Instant, SystemTime},
};

use ubervisor_protocol::{GroupConfig, GroupStatus};

/// One supervised child process slot within a group.
#[derive(Debug, Clone)]
pub struct Instance {
    pub index: u32,
    pub pid: Option<libc::pid_t>,
    pub start_time: Option<Instant>,
    pub spawned_at: Option<SystemTime>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

impl Instance {
    pub fn empty(index: u32) -> Instance {
        Instance { index, pid: None, start_time: None, spawned_at: None, stdout_path: None, stderr_path: None }
    }

    pub fn is_live(&self) -> bool {
        self.pid.is_some()
    }
}

/// Rolling fast-fail bookkeeping for a group, reset whenever the group
/// leaves BROKEN or an instance survives past the fast-fail threshold.
#[derive(Debug, Clone, Default)]
pub struct FastFailWindow {
    pub exits: Vec<Instant>,
}

impl FastFailWindow {
    pub fn reset(&mut self) {
        self.exits.clear();
    }

    /// Record a fast exit and return the number of fast exits still
    /// inside the configured window.
    pub fn record(&mut self, now: Instant, window: std::time::Duration) -> u32 {
        self.exits.push(now);
        self.exits.retain(|t| now.duration_since(*t) <= window);
        self.exits.len() as u32
    }
}

/// deleting mode is a transient status outside the wire-visible
/// `GroupStatus` set: the group has been told to tear down, but still has
/// live instances being reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Normal(GroupStatus),
    Deleting,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub args: Vec<String>,
    pub dir: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub instances: u32,
    pub lifecycle: Lifecycle,
    pub killsig: i32,
    pub uid: i64,
    pub gid: i64,
    pub heartbeat: Option<String>,
    pub fatal_cb: Option<String>,
    pub age: u64,
    pub slots: Vec<Instance>,
    pub fast_fail: FastFailWindow,
}

impl Group {
    pub fn status(&self) -> GroupStatus {
        match self.lifecycle {
            Lifecycle::Normal(s) => s,
            Lifecycle::Deleting => GroupStatus::Stopped,
        }
    }

    pub fn live_pids(&self) -> Vec<libc::pid_t> {
        self.slots.iter().filter_map(|i| i.pid).collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|i| i.is_live()).count()
    }

    pub fn is_deleting(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Deleting)
    }

    pub fn to_config(&self) -> GroupConfig {
        GroupConfig {
            name: self.name.clone(),
            args: self.args.clone(),
            dir: self.dir.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            instances: self.instances,
            status: self.status(),
            killsig: self.killsig,
            uid: self.uid,
            gid: self.gid,
            heartbeat: self.heartbeat.clone(),
            fatal_cb: self.fatal_cb.clone(),
            age: self.age,
        }
    }

    pub fn from_config(cfg: &GroupConfig) -> Group {
        let mut slots = Vec::with_capacity(cfg.instances as usize);
        for i in 0..cfg.instances {
            slots.push(Instance::empty(i));
        }
        Group {
            name: cfg.name.clone(),
            args: cfg.args.clone(),
            dir: cfg.dir.clone(),
            stdout: cfg.stdout.clone(),
            stderr: cfg.stderr.clone(),
            instances: cfg.instances,
            lifecycle: Lifecycle::Normal(cfg.status),
            killsig: cfg.killsig,
            uid: cfg.uid,
            gid: cfg.gid,
            heartbeat: cfg.heartbeat.clone(),
            fatal_cb: cfg.fatal_cb.clone(),
            age: cfg.age,
            slots,
            fast_fail: FastFailWindow::default(),
        }
    }
}

/// Authoritative map from group name to group record. Enforces name
/// uniqueness; all other invariants (live-instance counts, etc.) are
/// enforced by the supervisor/reaper that mutate the `Group`s it hands
/// out.
#[derive(Debug, Default)]
pub struct Registry {
    groups: HashMap<String, Group>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { groups: HashMap::new() }
    }

    pub fn insert(&mut self, group: Group) -> Result<(), String> {
        if self.groups.contains_key(&group.name) {
            return Err(format!("group '{}' already exists", group.name));
        }
        self.groups.insert(group.name.clone(), group);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Group> {
        self.groups.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Group> {
        self.groups.values_mut()
    }

    /// Locate the (group name, instance index) owning a live pid. Used
    /// by the reaper to route a waitpid() result back to its slot.
    pub fn find_by_pid(&self, pid: libc::pid_t) -> Option<(String, u32)> {
        for g in self.groups.values() {
            for inst in &g.slots {
                if inst.pid == Some(pid) {
                    return Some((g.name.clone(), inst.index));
                }
            }
        }
        None
    }
}
