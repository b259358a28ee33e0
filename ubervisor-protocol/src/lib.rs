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

//! Wire types shared between the ubervisor daemon and anything that speaks
//! to it: the chunked frame header and the JSON command/reply bodies.
//!
//! Every message on the wire is a frame header followed by payload bytes:
//! `len:u16 BE | cid:u16 BE | payload[len & 0x3FFF]`. The top bit of `len`
//! is a continuation flag: a frame with it set is one chunk of a message
//! whose next frame (same `cid`) continues the payload.

use std::fmt;

use anyhow::anyhow;
use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top bit of the length field: payload is a chunk, more frames with the
/// same cid follow.
pub const CONTINUATION_BIT: u16 = 0x8000;
/// Mask that yields the actual payload length of a single frame.
pub const LEN_MASK: u16 = 0x3FFF;
/// Maximum number of payload bytes carried by a single frame.
pub const MAX_CHUNK_BYTES: usize = LEN_MASK as usize;

/// Recommended cap on the total reassembled size of a chunked message.
/// Not enforced by the header itself -- callers must track this as they
/// reassemble chunks.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Recommended cap on a client's outbound write queue before the
/// connection is treated as unresponsive and dropped.
pub const DEFAULT_MAX_WRITE_QUEUE_BYTES: usize = 1024 * 1024;

/// Recommended cap on a single `READ` response.
pub const DEFAULT_MAX_READ_BYTES: usize = 1024 * 1024;

/// The raw 4-byte ASCII handshake payload, sent unframed in both
/// directions. See the "Open questions" section of the protocol design:
/// this predates the framed loop and is preserved verbatim for client
/// compatibility.
pub const HELO: &[u8; 4] = b"HELO";

/// The fixed set of 4-byte ASCII command tags that prefix a command
/// frame's payload. Reply frames carry no tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandTag {
    Spwn,
    Dele,
    Kill,
    Getc,
    List,
    Updt,
    Helo,
    Exit,
    Dump,
    Subs,
    Pids,
    Read,
}

impl CommandTag {
    pub const fn as_bytes(&self) -> &'static [u8; 4] {
        match self {
            CommandTag::Spwn => b"SPWN",
            CommandTag::Dele => b"DELE",
            CommandTag::Kill => b"KILL",
            CommandTag::Getc => b"GETC",
            CommandTag::List => b"LIST",
            CommandTag::Updt => b"UPDT",
            CommandTag::Helo => b"HELO",
            CommandTag::Exit => b"EXIT",
            CommandTag::Dump => b"DUMP",
            CommandTag::Subs => b"SUBS",
            CommandTag::Pids => b"PIDS",
            CommandTag::Read => b"READ",
        }
    }

    pub fn from_bytes(tag: &[u8]) -> Option<CommandTag> {
        match tag {
            b"SPWN" => Some(CommandTag::Spwn),
            b"DELE" => Some(CommandTag::Dele),
            b"KILL" => Some(CommandTag::Kill),
            b"GETC" => Some(CommandTag::Getc),
            b"LIST" => Some(CommandTag::List),
            b"UPDT" => Some(CommandTag::Updt),
            b"HELO" => Some(CommandTag::Helo),
            b"EXIT" => Some(CommandTag::Exit),
            b"DUMP" => Some(CommandTag::Dump),
            b"SUBS" => Some(CommandTag::Subs),
            b"PIDS" => Some(CommandTag::Pids),
            b"READ" => Some(CommandTag::Read),
            _ => None,
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// A decoded frame header, without the payload bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub cid: u16,
    pub payload_len: u16,
    pub more: bool,
}

impl FrameHeader {
    pub fn decode(len_word: u16, cid: u16) -> FrameHeader {
        FrameHeader { cid, payload_len: len_word & LEN_MASK, more: len_word & CONTINUATION_BIT != 0 }
    }

    /// Encode this header's length word (the continuation bit folded in).
    pub fn len_word(&self) -> anyhow::Result<u16> {
        if self.payload_len as usize > MAX_CHUNK_BYTES {
            return Err(anyhow!(
                "payload of {} bytes exceeds max chunk size of {}",
                self.payload_len,
                MAX_CHUNK_BYTES
            ));
        }
        let mut w = self.payload_len & LEN_MASK;
        if self.more {
            w |= CONTINUATION_BIT;
        }
        Ok(w)
    }
}

/// Group lifecycle status, as tracked by the registry and reported by
/// `GETC`/events. Numeric values are part of the wire protocol, so this
/// round-trips through `u8` rather than serde's usual variant-name string.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum GroupStatus {
    Running = 1,
    Stopped = 2,
    Broken = 3,
}

impl Default for GroupStatus {
    fn default() -> Self {
        GroupStatus::Running
    }
}

impl TryFrom<u8> for GroupStatus {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(GroupStatus::Running),
            2 => Ok(GroupStatus::Stopped),
            3 => Ok(GroupStatus::Broken),
            other => Err(anyhow!("invalid group status {}", other)),
        }
    }
}

impl From<GroupStatus> for u8 {
    fn from(v: GroupStatus) -> u8 {
        v as u8
    }
}

/// Event status codes observed on a `SUBS` stream. These are distinct
/// from `GroupStatus`: a subscriber sees transient codes (0, 4, 5) around
/// the steady states (1, 2) a group's own status can hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum EventStatus {
    /// An instance spawn is pending (about to fork).
    Pending = 0,
    /// The group (or an instance within it) is RUNNING.
    Running = 1,
    /// The group (or an instance within it) is STOPPED.
    Stopped = 2,
    /// The group was just added to the registry / a spawn is in progress.
    Added = 4,
    /// An instance exited, or the group was removed from the registry.
    Removed = 5,
}

impl TryFrom<u8> for EventStatus {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(EventStatus::Pending),
            1 => Ok(EventStatus::Running),
            2 => Ok(EventStatus::Stopped),
            4 => Ok(EventStatus::Added),
            5 => Ok(EventStatus::Removed),
            other => Err(anyhow!("invalid event status {}", other)),
        }
    }
}

impl From<EventStatus> for u8 {
    fn from(v: EventStatus) -> u8 {
        v as u8
    }
}

/// The full configuration record of a group, as accepted by `SPWN` and
/// (partially) by `UPDT`, and returned by `GETC`.
///
/// Optional fields that were never set are omitted from the JSON entirely
/// (not sent as `null`), matching the original client's encoding and the
/// round-trip tested by `GETC`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub instances: u32,
    pub status: GroupStatus,
    pub killsig: i32,
    pub uid: i64,
    pub gid: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_cb: Option<String>,
    pub age: u64,
}

impl GroupConfig {
    pub fn defaults_for(name: String, args: Vec<String>) -> GroupConfig {
        GroupConfig {
            name,
            args,
            dir: None,
            stdout: None,
            stderr: None,
            instances: 1,
            status: GroupStatus::Running,
            killsig: 15,
            uid: -1,
            gid: -1,
            heartbeat: None,
            fatal_cb: None,
            age: 0,
        }
    }
}

/// Request body for `SPWN`. Identical shape to `GroupConfig`; kept as a
/// distinct type so request validation (required vs defaulted fields) is
/// explicit at the type level rather than inferred from an omnibus struct.
#[derive(Debug, Clone, Deserialize)]
pub struct SpwnRequest {
    pub name: String,
    pub args: Vec<String>,
    pub dir: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default)]
    pub status: GroupStatus,
    #[serde(default = "default_killsig")]
    pub killsig: i32,
    #[serde(default = "default_id")]
    pub uid: i64,
    #[serde(default = "default_id")]
    pub gid: i64,
    pub heartbeat: Option<String>,
    pub fatal_cb: Option<String>,
    #[serde(default)]
    pub age: u64,
}

fn default_instances() -> u32 {
    1
}
fn default_killsig() -> i32 {
    15
}
fn default_id() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpdtRequest {
    pub name: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub instances: Option<u32>,
    pub status: Option<GroupStatus>,
    pub killsig: Option<i32>,
    pub heartbeat: Option<String>,
    pub fatal_cb: Option<String>,
    pub age: Option<u64>,
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillRequest {
    pub name: String,
    pub sig: Option<i32>,
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubsRequest {
    pub ident: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadRequest {
    pub name: String,
    pub stream: u8,
    pub offset: i64,
    pub bytes: i64,
    pub instance: u32,
}

/// Generic success/failure envelope. Every reply includes `code`; data
/// fields ride alongside it on success, `msg` rides alongside it on
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeReply {
    pub code: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: bool,
    pub msg: String,
}

impl ErrorReply {
    pub fn new(msg: impl Into<String>) -> ErrorReply {
        ErrorReply { code: false, msg: msg.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsReply {
    pub code: bool,
    pub pids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListReply(pub Vec<String>);

/// `GETC`'s reply: the effective group record with `code` riding
/// alongside it rather than nested under a `config` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetcReply {
    pub code: bool,
    #[serde(flatten)]
    pub config: GroupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReply {
    pub code: bool,
    pub log: String,
    pub fsize: u64,
}

/// A lifecycle event delivered to subscribed clients. `cid` on the frame
/// it travels in is the subscription id returned from `SUBS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<GroupConfig>,
}

/// Subscription ident bitmask, per spec section on the event bus.
pub mod ident {
    /// Spawn/exit "delta" events for any instance.
    pub const DELTA: u32 = 1;
    /// Group status transition events.
    pub const STATUS: u32 = 2;
    /// Config-change events emitted by `UPDT`.
    pub const CONFIG: u32 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tag_round_trip() {
        let tags = [
            CommandTag::Spwn,
            CommandTag::Dele,
            CommandTag::Kill,
            CommandTag::Getc,
            CommandTag::List,
            CommandTag::Updt,
            CommandTag::Helo,
            CommandTag::Exit,
            CommandTag::Dump,
            CommandTag::Subs,
            CommandTag::Pids,
            CommandTag::Read,
        ];
        for tag in tags {
            let bytes = tag.as_bytes();
            assert_eq!(CommandTag::from_bytes(bytes), Some(tag));
        }
        assert_eq!(CommandTag::from_bytes(b"XXXX"), None);
    }

    #[test]
    fn frame_header_len_word_round_trips_continuation_bit() {
        let h = FrameHeader { cid: 7, payload_len: 100, more: true };
        let w = h.len_word().unwrap();
        let decoded = FrameHeader::decode(w, 7);
        assert_eq!(decoded, h);
    }

    #[test]
    fn frame_header_rejects_oversize_chunk() {
        let h = FrameHeader { cid: 0, payload_len: 0x7FFF, more: false };
        assert!(h.len_word().is_err());
    }

    #[test]
    fn group_config_omits_unset_optionals() {
        let cfg = GroupConfig::defaults_for("t".into(), vec!["/bin/sleep".into()]);
        let v = serde_json::to_value(&cfg).unwrap();
        assert!(v.get("heartbeat").is_none());
        assert!(v.get("dir").is_none());
        assert!(v.get("fatal_cb").is_none());
    }
}
