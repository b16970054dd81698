// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Request handling: turns a decoded frame into registry mutations plus a reply to encode.
//!
//! Kept separate from the event loop so the submit/complete machinery in `server::ring` doesn't
//! have to know about usernames or group membership -- it only ever asks "given this frame from
//! this client, what goes back on the wire, and should the connection stay open".

use log::{debug, warn};

use crate::clients::ClientMap;
use crate::error::Error;
use crate::groups::GroupMap;
use crate::protocol::{
    self, CreateGroupRequest, DecodeError, ErrorCode, MsgType, SetUsernameRequest,
};

const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 15;

/// Outcome of handling one complete frame.
pub enum Outcome {
    /// Write `len` bytes from the handler's scratch buffer back to the client.
    Reply { seqid: u64, len: usize },
    /// The frame was a protocol violation (spec §7): drop the connection without replying.
    Drop,
}

/// Dispatch one complete frame for `client_id`, writing any reply into `out`. `out` must be at
/// least `protocol::MAX_MSG_LEN` bytes -- the caller (the event loop) allocates it from the small
/// slab class, which is sized accordingly.
pub fn handle_frame(
    frame: &[u8],
    client_id: u64,
    clients: &mut ClientMap,
    groups: &mut GroupMap,
    out: &mut [u8],
) -> Outcome {
    let hdr = protocol::decode_header(frame);

    match hdr.msgt {
        MsgType::SetUsername => match protocol::decode_set_username(frame) {
            Ok(req) => handle_set_username(req, client_id, clients, out),
            Err(DecodeError) => {
                let err = Error::Protocol("malformed SET_USERNAME frame");
                warn!("client {client_id}: {err}");
                Outcome::Drop
            }
        },
        MsgType::CreateGroup => match protocol::decode_create_group(frame) {
            Ok(req) => handle_create_group(req, client_id, groups, out),
            Err(DecodeError) => {
                let err = Error::Protocol("malformed CREATE_GROUP frame");
                warn!("client {client_id}: {err}");
                Outcome::Drop
            }
        },
        MsgType::ServerError | MsgType::SetUsernameResponse | MsgType::CreateGroupResponse => {
            // Server-to-client-only message types sent by a client: a protocol violation.
            warn!("client {client_id}: received server-only message type {:?}", hdr.msgt);
            Outcome::Drop
        }
        MsgType::Unknown(code) => {
            warn!("client {client_id}: unknown message type {code}");
            Outcome::Drop
        }
    }
}

fn handle_set_username(
    req: SetUsernameRequest<'_>,
    client_id: u64,
    clients: &mut ClientMap,
    out: &mut [u8],
) -> Outcome {
    let len = req.username.len();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        debug!("client {client_id}: invalid username length ({len})");
        let n = protocol::encode_server_error(out, req.seqid, ErrorCode::InvalidMsgLen);
        return Outcome::Reply { seqid: req.seqid, len: n };
    }
    if !req.username.iter().all(|b| b.is_ascii_alphanumeric()) {
        debug!("client {client_id}: invalid username characters");
        let n = protocol::encode_server_error(out, req.seqid, ErrorCode::InvalidUsername);
        return Outcome::Reply { seqid: req.seqid, len: n };
    }

    let username = String::from_utf8_lossy(req.username).into_owned();
    if let Some(info) = clients.get_mut(client_id) {
        info.username = Some(username);
    }

    let n = protocol::encode_set_username_response(out, req.seqid);
    Outcome::Reply { seqid: req.seqid, len: n }
}

fn handle_create_group(
    req: CreateGroupRequest,
    client_id: u64,
    groups: &mut GroupMap,
    out: &mut [u8],
) -> Outcome {
    let gid = groups.create_group(client_id, &req.uids);
    debug!("client {client_id}: created group {gid} with {} members", req.uids.len());
    let n = protocol::encode_create_group_response(out, req.seqid, gid);
    Outcome::Reply { seqid: req.seqid, len: n }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientInfo;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4242)
    }

    fn encode_set_username(seqid: u64, name: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; protocol::HEADER_LEN + name.len()];
        let len = frame.len() as u16;
        frame[0..2].copy_from_slice(&len.to_be_bytes());
        frame[2] = u8::from(MsgType::SetUsername);
        frame[3..11].copy_from_slice(&seqid.to_be_bytes());
        frame[protocol::HEADER_LEN..].copy_from_slice(name);
        frame
    }

    #[test]
    fn set_username_accepts_valid_name() {
        let mut clients = ClientMap::new(16);
        clients.insert(ClientInfo { client_id: 1, addr: addr(), username: None });
        let mut groups = GroupMap::new(16);
        let mut out = [0u8; protocol::MAX_MSG_LEN];

        let frame = encode_set_username(1, b"jojo");
        match handle_frame(&frame, 1, &mut clients, &mut groups, &mut out) {
            Outcome::Reply { seqid, len } => {
                assert_eq!(seqid, 1);
                let hdr = protocol::decode_header(&out[..len]);
                assert_eq!(hdr.msgt, MsgType::SetUsernameResponse);
            }
            Outcome::Drop => panic!("expected a reply"),
        }
        assert_eq!(clients.get(1).unwrap().username.as_deref(), Some("jojo"));
    }

    #[test]
    fn set_username_rejects_short_name() {
        let mut clients = ClientMap::new(16);
        clients.insert(ClientInfo { client_id: 1, addr: addr(), username: None });
        let mut groups = GroupMap::new(16);
        let mut out = [0u8; protocol::MAX_MSG_LEN];

        let frame = encode_set_username(1, b"ab");
        match handle_frame(&frame, 1, &mut clients, &mut groups, &mut out) {
            Outcome::Reply { len, .. } => {
                let hdr = protocol::decode_header(&out[..len]);
                assert_eq!(hdr.msgt, MsgType::ServerError);
                assert_eq!(out[protocol::HEADER_LEN], ErrorCode::InvalidMsgLen as u8);
            }
            Outcome::Drop => panic!("expected an error reply, not a drop"),
        }
        assert!(clients.get(1).unwrap().username.is_none());
    }

    #[test]
    fn set_username_rejects_long_name() {
        let mut clients = ClientMap::new(16);
        clients.insert(ClientInfo { client_id: 1, addr: addr(), username: None });
        let mut groups = GroupMap::new(16);
        let mut out = [0u8; protocol::MAX_MSG_LEN];

        let frame = encode_set_username(1, b"way_too_long_a_name_for_this");
        match handle_frame(&frame, 1, &mut clients, &mut groups, &mut out) {
            Outcome::Reply { len, .. } => {
                let hdr = protocol::decode_header(&out[..len]);
                assert_eq!(hdr.msgt, MsgType::ServerError);
                assert_eq!(out[protocol::HEADER_LEN], ErrorCode::InvalidMsgLen as u8);
            }
            Outcome::Drop => panic!("expected an error reply, not a drop"),
        }
        assert!(clients.get(1).unwrap().username.is_none());
    }

    #[test]
    fn set_username_rejects_bad_chars() {
        let mut clients = ClientMap::new(16);
        clients.insert(ClientInfo { client_id: 1, addr: addr(), username: None });
        let mut groups = GroupMap::new(16);
        let mut out = [0u8; protocol::MAX_MSG_LEN];

        let frame = encode_set_username(1, b"bad!name");
        match handle_frame(&frame, 1, &mut clients, &mut groups, &mut out) {
            Outcome::Reply { len, .. } => {
                let hdr = protocol::decode_header(&out[..len]);
                assert_eq!(hdr.msgt, MsgType::ServerError);
                assert_eq!(out[protocol::HEADER_LEN], ErrorCode::InvalidUsername as u8);
            }
            Outcome::Drop => panic!("expected an error reply, not a drop"),
        }
        assert!(clients.get(1).unwrap().username.is_none());
    }

    #[test]
    fn unknown_message_type_drops_connection() {
        let mut clients = ClientMap::new(16);
        let mut groups = GroupMap::new(16);
        let mut out = [0u8; protocol::MAX_MSG_LEN];

        let mut frame = vec![0u8; protocol::HEADER_LEN];
        frame[0..2].copy_from_slice(&(protocol::HEADER_LEN as u16).to_be_bytes());
        frame[2] = 200; // unknown type
        match handle_frame(&frame, 1, &mut clients, &mut groups, &mut out) {
            Outcome::Drop => {}
            Outcome::Reply { .. } => panic!("expected a drop"),
        }
    }

    #[test]
    fn create_group_roundtrip() {
        let mut clients = ClientMap::new(16);
        let mut groups = GroupMap::new(16);
        let mut out = [0u8; protocol::MAX_MSG_LEN];

        let uids = [2u64, 3u64];
        let mut frame = vec![0u8; protocol::HEADER_LEN + 1 + uids.len() * 8];
        frame[0..2].copy_from_slice(&(frame.len() as u16).to_be_bytes());
        frame[2] = u8::from(MsgType::CreateGroup);
        frame[3..11].copy_from_slice(&5u64.to_be_bytes());
        frame[protocol::HEADER_LEN] = uids.len() as u8;
        for (i, uid) in uids.iter().enumerate() {
            let off = protocol::HEADER_LEN + 1 + i * 8;
            frame[off..off + 8].copy_from_slice(&uid.to_be_bytes());
        }

        match handle_frame(&frame, 1, &mut clients, &mut groups, &mut out) {
            Outcome::Reply { seqid, len } => {
                assert_eq!(seqid, 5);
                let hdr = protocol::decode_header(&out[..len]);
                assert_eq!(hdr.msgt, MsgType::CreateGroupResponse);
                let gid = u64::from_be_bytes(out[protocol::HEADER_LEN..len].try_into().unwrap());
                assert!(groups.get(gid).unwrap().contains(1));
            }
            Outcome::Drop => panic!("expected a reply"),
        }
    }

    #[test]
    fn malformed_create_group_drops_connection() {
        let mut clients = ClientMap::new(16);
        let mut groups = GroupMap::new(16);
        let mut out = [0u8; protocol::MAX_MSG_LEN];

        let mut frame = vec![0u8; protocol::HEADER_LEN + 1];
        frame[0..2].copy_from_slice(&(frame.len() as u16).to_be_bytes());
        frame[2] = u8::from(MsgType::CreateGroup);
        frame[protocol::HEADER_LEN] = 0; // zero uids: invalid

        match handle_frame(&frame, 1, &mut clients, &mut groups, &mut out) {
            Outcome::Drop => {}
            Outcome::Reply { .. } => panic!("expected a drop"),
        }
    }
}
