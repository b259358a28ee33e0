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

//! The frame codec (C1): stateless encode/decode of the length-prefixed,
//! chunkable frame header described in the protocol design, plus
//! reassembly of a (possibly chunked) message out of a byte buffer.

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ByteOrder};
use ubervisor_protocol::{FrameHeader, CONTINUATION_BIT, LEN_MASK};

pub const HEADER_LEN: usize = 4;

/// A single decoded frame's header plus where its payload lives in the
/// caller's buffer.
#[derive(Debug)]
pub struct ParsedFrame {
    pub header: FrameHeader,
    pub consumed: usize,
}

/// Attempt to parse one frame header + payload out of the front of
/// `buf`. Returns `Ok(None)` if `buf` doesn't yet contain a whole frame
/// (the caller should read more bytes and retry).
pub fn try_parse_frame(buf: &[u8]) -> anyhow::Result<Option<ParsedFrame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len_word = BigEndian::read_u16(&buf[0..2]);
    let cid = BigEndian::read_u16(&buf[2..4]);
    let header = FrameHeader::decode(len_word, cid);
    let total = HEADER_LEN + header.payload_len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(ParsedFrame { header, consumed: total }))
}

/// Encode a full message (already-serialized payload bytes) into a
/// sequence of frames, splitting at `MAX_CHUNK_BYTES` and setting the
/// continuation bit on every frame but the last.
pub fn encode_message(cid: u16, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    if payload.is_empty() {
        let header = FrameHeader { cid, payload_len: 0, more: false };
        let mut out = vec![0u8; HEADER_LEN];
        BigEndian::write_u16(&mut out[0..2], header.len_word()?);
        BigEndian::write_u16(&mut out[2..4], cid);
        return Ok(out);
    }

    let mut out = Vec::with_capacity(payload.len() + HEADER_LEN * 2);
    let mut offset = 0;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let take = remaining.min(ubervisor_protocol::MAX_CHUNK_BYTES);
        let more = offset + take < payload.len();
        let header = FrameHeader { cid, payload_len: take as u16, more };
        let mut hdr_bytes = [0u8; HEADER_LEN];
        BigEndian::write_u16(&mut hdr_bytes[0..2], header.len_word()?);
        BigEndian::write_u16(&mut hdr_bytes[2..4], cid);
        out.extend_from_slice(&hdr_bytes);
        out.extend_from_slice(&payload[offset..offset + take]);
        offset += take;
    }
    Ok(out)
}

/// Split a command frame's payload into its 4-byte ASCII tag and the
/// remaining JSON body bytes.
pub fn split_command_payload(payload: &[u8]) -> anyhow::Result<(ubervisor_protocol::CommandTag, &[u8])> {
    if payload.len() < 4 {
        return Err(anyhow!("frame payload too short to contain a command tag"));
    }
    let tag = ubervisor_protocol::CommandTag::from_bytes(&payload[0..4])
        .ok_or_else(|| anyhow!("unknown command tag"))?;
    Ok((tag, &payload[4..]))
}

pub fn decode_json<T>(body: &[u8]) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    if body.is_empty() {
        return serde_json::from_str("{}").context("decoding empty command body");
    }
    serde_json::from_slice(body).context("decoding JSON command body")
}

pub fn encode_json<T>(value: &T) -> anyhow::Result<Vec<u8>>
where
    T: serde::Serialize,
{
    serde_json::to_vec(value).context("encoding JSON reply body")
}
