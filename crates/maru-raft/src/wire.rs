//! Peer wire codec: length-prefixed framing of the four Raft messages.
//!
//! Frame layout: `[type: u32][payload_len: u32][payload]`, all integers
//! little-endian. Inside a payload, integer fields are 4 bytes, booleans a
//! single 0/1 byte, and a byte string is `[len: u32][bytes]`.
//!
//! [`FrameDecoder`] consumes a byte stream incrementally: feed it whatever
//! the socket produced and drain complete messages; a trailing partial
//! frame stays buffered for the next read. Anything structurally invalid
//! surfaces as [`RaftError::MalformedFrame`] and the caller is expected to
//! drop the connection.

use crate::error::{RaftError, Result};
use crate::types::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size: type tag + payload length.
const HEADER_LEN: usize = 8;

/// Upper bound on a single payload. A full batch of entries is a few KiB;
/// anything near this is a corrupt or hostile frame.
const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

const TAG_VOTE_REQUEST: u32 = 1;
const TAG_VOTE_RESPONSE: u32 = 2;
const TAG_APPEND_REQUEST: u32 = 3;
const TAG_APPEND_RESPONSE: u32 = 4;

/// Encode a message into a complete frame, header included.
pub fn encode(message: &Message) -> Bytes {
    let mut payload = BytesMut::with_capacity(64);

    let tag = match message {
        Message::VoteRequest(req) => {
            payload.put_u32_le(req.term.0);
            payload.put_u32_le(req.candidate_id.0);
            payload.put_u32_le(req.last_log_index.0);
            payload.put_u32_le(req.last_log_term.0);
            TAG_VOTE_REQUEST
        }
        Message::VoteResponse(resp) => {
            payload.put_u32_le(resp.term.0);
            payload.put_u8(resp.vote_granted as u8);
            TAG_VOTE_RESPONSE
        }
        Message::AppendRequest(req) => {
            payload.put_u32_le(req.term.0);
            payload.put_u32_le(req.leader_id.0);
            payload.put_u32_le(req.prev_log_index.0);
            payload.put_u32_le(req.prev_log_term.0);
            payload.put_u32_le(req.leader_commit.0);
            payload.put_u32_le(req.seq);
            payload.put_u32_le(req.entries.len() as u32);
            for entry in &req.entries {
                payload.put_u32_le(entry.term.0);
                payload.put_u32_le(entry.data.len() as u32);
                payload.put_slice(&entry.data);
            }
            TAG_APPEND_REQUEST
        }
        Message::AppendResponse(resp) => {
            payload.put_u32_le(resp.term.0);
            payload.put_u32_le(resp.follower_id.0);
            payload.put_u32_le(resp.log_index.0);
            payload.put_u8(resp.success as u8);
            payload.put_u32_le(resp.follower_commit.0);
            payload.put_u32_le(resp.ack);
            TAG_APPEND_RESPONSE
        }
    };

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32_le(tag);
    frame.put_u32_le(payload.len() as u32);
    frame.extend_from_slice(&payload);
    frame.freeze()
}

/// Streaming decoder over a growable buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, or `None` if only a partial frame is
    /// buffered.
    pub fn next(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
        let payload_len = u32::from_le_bytes(self.buf[4..8].try_into().unwrap()) as usize;

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(RaftError::MalformedFrame {
                reason: "payload length exceeds frame cap",
            });
        }

        if self.buf.len() < HEADER_LEN + payload_len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(payload_len).freeze();
        decode_payload(tag, payload).map(Some)
    }
}

/// Decode one payload given its type tag.
fn decode_payload(tag: u32, payload: Bytes) -> Result<Message> {
    let mut p: &[u8] = &payload;

    let message = match tag {
        TAG_VOTE_REQUEST => Message::VoteRequest(RequestVoteRequest {
            term: Term(get_u32(&mut p)?),
            candidate_id: NodeId(get_u32(&mut p)?),
            last_log_index: LogIndex(get_u32(&mut p)?),
            last_log_term: Term(get_u32(&mut p)?),
        }),
        TAG_VOTE_RESPONSE => Message::VoteResponse(RequestVoteResponse {
            term: Term(get_u32(&mut p)?),
            vote_granted: get_bool(&mut p)?,
        }),
        TAG_APPEND_REQUEST => {
            let term = Term(get_u32(&mut p)?);
            let leader_id = NodeId(get_u32(&mut p)?);
            let prev_log_index = LogIndex(get_u32(&mut p)?);
            let prev_log_term = Term(get_u32(&mut p)?);
            let leader_commit = LogIndex(get_u32(&mut p)?);
            let seq = get_u32(&mut p)?;
            let entry_count = get_u32(&mut p)? as usize;

            let mut entries = Vec::with_capacity(entry_count.min(1024));
            for _ in 0..entry_count {
                let entry_term = Term(get_u32(&mut p)?);
                let data = get_bytes(&mut p)?;
                entries.push(LogEntry {
                    term: entry_term,
                    data,
                });
            }

            Message::AppendRequest(AppendEntriesRequest {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                leader_commit,
                seq,
                entries,
            })
        }
        TAG_APPEND_RESPONSE => Message::AppendResponse(AppendEntriesResponse {
            term: Term(get_u32(&mut p)?),
            follower_id: NodeId(get_u32(&mut p)?),
            log_index: LogIndex(get_u32(&mut p)?),
            success: get_bool(&mut p)?,
            follower_commit: LogIndex(get_u32(&mut p)?),
            ack: get_u32(&mut p)?,
        }),
        _ => {
            return Err(RaftError::MalformedFrame {
                reason: "unknown message type tag",
            })
        }
    };

    if p.has_remaining() {
        return Err(RaftError::MalformedFrame {
            reason: "trailing bytes after payload fields",
        });
    }

    Ok(message)
}

fn get_u32(p: &mut &[u8]) -> Result<u32> {
    if p.remaining() < 4 {
        return Err(RaftError::MalformedFrame {
            reason: "truncated integer field",
        });
    }
    Ok(p.get_u32_le())
}

fn get_bool(p: &mut &[u8]) -> Result<bool> {
    if !p.has_remaining() {
        return Err(RaftError::MalformedFrame {
            reason: "truncated boolean field",
        });
    }
    Ok(p.get_u8() != 0)
}

fn get_bytes(p: &mut &[u8]) -> Result<Bytes> {
    let len = get_u32(p)? as usize;
    if p.remaining() < len {
        return Err(RaftError::MalformedFrame {
            reason: "truncated byte-string field",
        });
    }
    Ok(p.copy_to_bytes(len))
}
