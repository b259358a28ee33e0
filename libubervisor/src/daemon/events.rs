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

//! The event bus (C7): fan-out of lifecycle events to subscribed
//! clients, filtered by the subscription's `ident` bitmask.

use tracing::trace;
use ubervisor_protocol::{ident, Event};

use crate::daemon::server::ClientId;

#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub client: ClientId,
    pub cid: u16,
    pub ident: u32,
}

/// Which bit of a subscription's `ident` mask a given event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Delta,
    Status,
    Config,
}

impl EventKind {
    fn mask(self) -> u32 {
        match self {
            EventKind::Delta => ident::DELTA,
            EventKind::Status => ident::STATUS,
            EventKind::Config => ident::CONFIG,
        }
    }
}

#[derive(Debug, Default)]
pub struct Bus {
    subs: Vec<Subscription>,
}

impl Bus {
    pub fn new() -> Bus {
        Bus { subs: Vec::new() }
    }

    pub fn subscribe(&mut self, client: ClientId, cid: u16, ident: u32) {
        self.subs.retain(|s| s.client != client);
        self.subs.push(Subscription { client, cid, ident });
    }

    pub fn unsubscribe(&mut self, client: ClientId) {
        self.subs.retain(|s| s.client != client);
    }

    /// Return the (client, cid, event) pairs that should receive this
    /// event, in subscriber-registration order. Ordering across distinct
    /// subscribers is not guaranteed by the protocol; this just gives a
    /// deterministic iteration order for a single reactor turn.
    pub fn route(&self, kind: EventKind, event: &Event) -> Vec<(ClientId, u16)> {
        let mask = kind.mask();
        let targets: Vec<(ClientId, u16)> = self
            .subs
            .iter()
            .filter(|s| s.ident & mask != 0)
            .map(|s| (s.client, s.cid))
            .collect();
        trace!(?kind, name = %event.name, status = ?event.status, ntargets = targets.len(), "routing event");
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubervisor_protocol::EventStatus;

    fn ev(name: &str) -> Event {
        Event { name: name.to_string(), status: EventStatus::Running, index: None, pid: None, config: None }
    }

    #[test]
    fn routes_only_matching_ident_bits() {
        let mut bus = Bus::new();
        bus.subscribe(ClientId(1), 10, ident::STATUS);
        bus.subscribe(ClientId(2), 11, ident::DELTA | ident::CONFIG);

        let targets = bus.route(EventKind::Status, &ev("t"));
        assert_eq!(targets, vec![(ClientId(1), 10)]);

        let targets = bus.route(EventKind::Config, &ev("t"));
        assert_eq!(targets, vec![(ClientId(2), 11)]);
    }

    #[test]
    fn unsubscribe_drops_client() {
        let mut bus = Bus::new();
        bus.subscribe(ClientId(1), 1, ident::STATUS);
        bus.unsubscribe(ClientId(1));
        assert!(bus.route(EventKind::Status, &ev("t")).is_empty());
    }

    #[test]
    fn resubscribe_replaces_prior_subscription() {
        let mut bus = Bus::new();
        bus.subscribe(ClientId(1), 1, ident::STATUS);
        bus.subscribe(ClientId(1), 2, ident::DELTA);
        assert!(bus.route(EventKind::Status, &ev("t")).is_empty());
        assert_eq!(bus.route(EventKind::Delta, &ev("t")), vec![(ClientId(1), 2)]);
    }
}
