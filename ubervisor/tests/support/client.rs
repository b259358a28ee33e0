#![allow(dead_code)]

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    sync::mpsc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use ubervisor_protocol::{
    CodeReply, CommandTag, Event, FrameHeader, GetcReply, KillRequest, ListReply, NameRequest,
    PidsReply, ReadReply, ReadRequest, SpwnRequest, SubsRequest, UpdtRequest, HELO, MAX_CHUNK_BYTES,
};

/// A synchronous test client for the framed request/response protocol: one
/// `HELO` handshake followed by a series of tagged command frames, each
/// waited on for its matching reply before the next is sent.
pub struct Client {
    stream: UnixStream,
    next_cid: u16,
}

impl Client {
    pub fn connect<P: AsRef<Path>>(sock: P) -> anyhow::Result<Client> {
        let mut stream = UnixStream::connect(sock).context("connecting to control socket")?;
        // The handshake request is a normal framed message; only the
        // server's reply is the raw 4-byte `HELO` (it predates the framed
        // loop).
        write_message(&mut stream, 0, HELO)?;
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).context("reading HELO reply")?;
        if &reply != HELO {
            bail!("bad HELO reply: {:?}", reply);
        }
        Ok(Client { stream, next_cid: 1 })
    }

    fn call_raw(&mut self, tag: &[u8; 4], body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);

        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(tag);
        payload.extend_from_slice(&body);
        write_message(&mut self.stream, cid, &payload)?;

        let (reply_cid, reply) = read_message(&mut self.stream)?;
        if reply_cid != cid {
            bail!("reply cid {} does not match request cid {}", reply_cid, cid);
        }
        Ok(reply)
    }

    fn call<Req, Rep>(&mut self, tag: CommandTag, req: &Req) -> anyhow::Result<Rep>
    where
        Req: serde::Serialize,
        Rep: serde::de::DeserializeOwned,
    {
        let body = serde_json::to_vec(req).context("encoding request body")?;
        let reply = self.call_raw(tag.as_bytes(), body)?;
        serde_json::from_slice(&reply).context("decoding reply body")
    }

    pub fn spwn(&mut self, req: &SpwnRequest) -> anyhow::Result<CodeReply> {
        self.call(CommandTag::Spwn, req)
    }

    pub fn dele(&mut self, name: &str) -> anyhow::Result<PidsReply> {
        self.call(CommandTag::Dele, &NameRequest { name: name.to_string() })
    }

    pub fn kill(&mut self, req: &KillRequest) -> anyhow::Result<PidsReply> {
        self.call(CommandTag::Kill, req)
    }

    pub fn getc(&mut self, name: &str) -> anyhow::Result<GetcReply> {
        self.call(CommandTag::Getc, &NameRequest { name: name.to_string() })
    }

    pub fn list(&mut self) -> anyhow::Result<ListReply> {
        self.call(CommandTag::List, &serde_json::json!({}))
    }

    pub fn updt(&mut self, req: &UpdtRequest) -> anyhow::Result<CodeReply> {
        self.call(CommandTag::Updt, req)
    }

    pub fn pids(&mut self, name: &str) -> anyhow::Result<PidsReply> {
        self.call(CommandTag::Pids, &NameRequest { name: name.to_string() })
    }

    pub fn read(&mut self, req: &ReadRequest) -> anyhow::Result<ReadReply> {
        self.call(CommandTag::Read, req)
    }

    pub fn dump(&mut self) -> anyhow::Result<CodeReply> {
        self.call(CommandTag::Dump, &serde_json::json!({}))
    }

    pub fn exit(&mut self) -> anyhow::Result<CodeReply> {
        self.call(CommandTag::Exit, &serde_json::json!({}))
    }

    /// Subscribe this connection to `ident` and hand the caller an
    /// `EventStream`. The connection is consumed: a background thread now
    /// owns it, reading every subsequent frame as either the `SUBS` ack or
    /// a lifecycle event.
    pub fn subscribe(mut self, ident: u32) -> anyhow::Result<EventStream> {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);

        let body = serde_json::to_vec(&SubsRequest { ident }).context("encoding SUBS body")?;
        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(CommandTag::Subs.as_bytes());
        payload.extend_from_slice(&body);
        write_message(&mut self.stream, cid, &payload)?;

        let (ack_cid, ack) = read_message(&mut self.stream)?;
        if ack_cid != cid {
            bail!("SUBS ack cid {} does not match request cid {}", ack_cid, cid);
        }
        let ack: CodeReply = serde_json::from_slice(&ack).context("decoding SUBS ack")?;
        if !ack.code {
            bail!("SUBS was rejected");
        }

        let (tx, rx) = mpsc::channel();
        let mut stream = self.stream;
        std::thread::spawn(move || loop {
            match read_message(&mut stream) {
                Ok((_, payload)) => match serde_json::from_slice::<Event>(&payload) {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        eprintln!("event stream: bad payload: {:?}", e);
                        return;
                    }
                },
                Err(_) => return,
            }
        });

        Ok(EventStream { rx })
    }
}

/// The event half of a subscribed connection: a channel fed by a background
/// thread reading frames off the socket as they arrive.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub fn recv_timeout(&self, dur: Duration) -> anyhow::Result<Event> {
        self.rx.recv_timeout(dur).map_err(|_| anyhow!("no event received within {:?}", dur))
    }
}

fn write_message(stream: &mut UnixStream, cid: u16, payload: &[u8]) -> anyhow::Result<()> {
    if payload.is_empty() {
        let header = FrameHeader { cid, payload_len: 0, more: false };
        stream.write_all(&header.len_word()?.to_be_bytes())?;
        stream.write_all(&cid.to_be_bytes())?;
        return Ok(());
    }

    let mut offset = 0;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let take = remaining.min(MAX_CHUNK_BYTES);
        let more = offset + take < payload.len();
        let header = FrameHeader { cid, payload_len: take as u16, more };
        stream.write_all(&header.len_word()?.to_be_bytes())?;
        stream.write_all(&cid.to_be_bytes())?;
        stream.write_all(&payload[offset..offset + take])?;
        offset += take;
    }
    Ok(())
}

fn read_frame_header(stream: &mut UnixStream) -> anyhow::Result<FrameHeader> {
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).context("reading frame header")?;
    let len_word = u16::from_be_bytes([hdr[0], hdr[1]]);
    let cid = u16::from_be_bytes([hdr[2], hdr[3]]);
    Ok(FrameHeader::decode(len_word, cid))
}

fn read_message(stream: &mut UnixStream) -> anyhow::Result<(u16, Vec<u8>)> {
    let mut payload = Vec::new();
    let mut cid = 0u16;
    loop {
        let header = read_frame_header(stream)?;
        cid = header.cid;
        let mut chunk = vec![0u8; header.payload_len as usize];
        stream.read_exact(&mut chunk).context("reading frame payload")?;
        payload.extend_from_slice(&chunk);
        if !header.more {
            break;
        }
    }
    Ok((cid, payload))
}
