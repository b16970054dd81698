// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Wire protocol codec.
//!
//! Every message is framed as `<len:2> <msgt:1> <seqid:8> <payload...>`, all multi-byte fields
//! big-endian, `len` including the header itself. Decoders tolerate unaligned input by copying
//! fields byte-wise rather than overlaying a packed struct; encoders assert the caller's buffer
//! is large enough for the message they produce.

/// Length of the common header: `len(2) + msgt(1) + seqid(8)`.
pub const HEADER_LEN: usize = 11;

/// Upper bound on a single message's total length, including the header.
pub const MAX_MSG_LEN: usize = 2048;

/// Maximum number of client ids a single `CREATE_GROUP` message may name.
pub const MAX_UIDS_PER_MSG: usize = 200;

/// Message type tags, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    ServerError,
    SetUsername,
    SetUsernameResponse,
    CreateGroup,
    CreateGroupResponse,
    Unknown(u8),
}

impl From<u8> for MsgType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::ServerError,
            1 => Self::SetUsername,
            2 => Self::SetUsernameResponse,
            3 => Self::CreateGroup,
            4 => Self::CreateGroupResponse,
            other => Self::Unknown(other),
        }
    }
}

impl From<MsgType> for u8 {
    fn from(t: MsgType) -> u8 {
        match t {
            MsgType::ServerError => 0,
            MsgType::SetUsername => 1,
            MsgType::SetUsernameResponse => 2,
            MsgType::CreateGroup => 3,
            MsgType::CreateGroupResponse => 4,
            MsgType::Unknown(v) => v,
        }
    }
}

/// `SERVER_ERROR` codes (payload of `ServerError` messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    InvalidMsgType = 1,
    InvalidMsgLen = 2,
    InvalidUsername = 3,
    Failure = 4,
}

/// Common header shared by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: u16,
    pub msgt: MsgType,
    pub seqid: u64,
}

/// Decode the fixed-size header. `buf` must contain at least `HEADER_LEN` bytes; the caller (the
/// event loop's framing logic) guarantees this before calling.
pub fn decode_header(buf: &[u8]) -> Header {
    debug_assert!(buf.len() >= HEADER_LEN);

    let len = u16::from_be_bytes([buf[0], buf[1]]);
    let msgt = MsgType::from(buf[2]);
    let seqid = u64::from_be_bytes(buf[3..11].try_into().unwrap());

    Header { len, msgt, seqid }
}

fn write_header(buf: &mut [u8], len: u16, msgt: MsgType, seqid: u64) {
    buf[0..2].copy_from_slice(&len.to_be_bytes());
    buf[2] = msgt.into();
    buf[3..11].copy_from_slice(&seqid.to_be_bytes());
}

/// Decoded `SET_USERNAME` request. `username` borrows from the frame.
#[derive(Debug)]
pub struct SetUsernameRequest<'a> {
    pub seqid: u64,
    pub username: &'a [u8],
}

/// Structural decode errors: the frame length doesn't match what the message type promises.
/// These are protocol violations (spec §7) — the caller must drop the connection, not reply.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodeError;

/// Decode a `SET_USERNAME` payload. `frame` is the whole message including the header. Does not
/// enforce the `3..=15` length bound or the alphanumeric character set — those are semantic
/// checks performed by the handler (spec §4.5/§4.6).
pub fn decode_set_username(frame: &[u8]) -> Result<SetUsernameRequest<'_>, DecodeError> {
    if frame.len() < HEADER_LEN {
        return Err(DecodeError);
    }
    let hdr = decode_header(frame);
    Ok(SetUsernameRequest {
        seqid: hdr.seqid,
        username: &frame[HEADER_LEN..],
    })
}

/// Encode a `SET_USERNAME_RESPONSE`. Returns the number of bytes written.
pub fn encode_set_username_response(buf: &mut [u8], seqid: u64) -> usize {
    let len = HEADER_LEN;
    assert!(len <= buf.len());
    write_header(&mut buf[..len], len as u16, MsgType::SetUsernameResponse, seqid);
    len
}

/// Encode a `SERVER_ERROR`. Returns the number of bytes written.
pub fn encode_server_error(buf: &mut [u8], seqid: u64, code: ErrorCode) -> usize {
    let len = HEADER_LEN + 1;
    assert!(len <= buf.len());
    write_header(&mut buf[..HEADER_LEN], len as u16, MsgType::ServerError, seqid);
    buf[HEADER_LEN] = code as u8;
    len
}

/// Decoded `CREATE_GROUP` request. `uids` is parsed eagerly since fan-out iterates it more than
/// once (once to build the group, once -- in a future extension -- to notify members).
#[derive(Debug)]
pub struct CreateGroupRequest {
    pub seqid: u64,
    pub uids: Vec<u64>,
}

/// Decode a `CREATE_GROUP` payload: `<uids_len:1> <uid:8>×uids_len`.
///
/// Returns `Err` if the declared `uids_len` doesn't match the frame's actual remaining length, if
/// it's zero, or if it exceeds `MAX_UIDS_PER_MSG` — all treated as protocol violations per
/// spec §7, matching `original_source/protocol.c`'s `deser_create_group`.
pub fn decode_create_group(frame: &[u8]) -> Result<CreateGroupRequest, DecodeError> {
    if frame.len() < HEADER_LEN + 1 {
        return Err(DecodeError);
    }
    let hdr = decode_header(frame);
    let uids_len = frame[HEADER_LEN] as usize;

    if uids_len == 0 || uids_len > MAX_UIDS_PER_MSG {
        return Err(DecodeError);
    }

    let uids_bytes = &frame[HEADER_LEN + 1..];
    if uids_bytes.len() != uids_len * 8 {
        return Err(DecodeError);
    }

    let uids = uids_bytes
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
        .collect();

    Ok(CreateGroupRequest {
        seqid: hdr.seqid,
        uids,
    })
}

/// Encode a `CREATE_GROUP_RESPONSE`: `<gid:8>`. Returns the number of bytes written.
pub fn encode_create_group_response(buf: &mut [u8], seqid: u64, gid: u64) -> usize {
    let len = HEADER_LEN + 8;
    assert!(len <= buf.len());
    write_header(&mut buf[..HEADER_LEN], len as u16, MsgType::CreateGroupResponse, seqid);
    buf[HEADER_LEN..len].copy_from_slice(&gid.to_be_bytes());
    len
}
