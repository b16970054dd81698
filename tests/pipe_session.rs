// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Connection-level exercises over a real `socketpair`, via `chatd::test_support::pipe` -- these
//! drive the codec and handler across actual bytes crossing a socket, without a live `io_uring`
//! instance.

use chatd::clients::{ClientInfo, ClientMap};
use chatd::groups::GroupMap;
use chatd::handler::{handle_frame, Outcome};
use chatd::protocol::{self, MsgType};
use chatd::test_support::pipe;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4343)
}

fn set_username_frame(seqid: u64, name: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; protocol::HEADER_LEN + name.len()];
    frame[0..2].copy_from_slice(&(frame.len() as u16).to_be_bytes());
    frame[2] = u8::from(MsgType::SetUsername);
    frame[3..11].copy_from_slice(&seqid.to_be_bytes());
    frame[protocol::HEADER_LEN..].copy_from_slice(name);
    frame
}

fn read_exact_len(end: &mut impl Read, buf: &mut [u8], len: usize) -> usize {
    let mut got = 0;
    while got < len {
        let n = end.read(&mut buf[got..len]).expect("read");
        assert!(n > 0, "peer closed before sending a full frame");
        got += n;
    }
    got
}

/// A client writes a SET_USERNAME frame across a real socket in two separate writes (splitting
/// mid-header); the reading side accumulates bytes the way the event loop's recv buffer would
/// before handing a complete frame to the handler.
#[test]
fn split_frame_assembles_across_two_writes() {
    let (mut client_end, mut server_end) = pipe().expect("socketpair");

    let frame = set_username_frame(1, b"nova");
    let (first, second) = frame.split_at(5);
    client_end.write_all(first).unwrap();
    client_end.write_all(second).unwrap();

    let mut buf = [0u8; protocol::MAX_MSG_LEN];
    let got = read_exact_len(&mut server_end, &mut buf, frame.len());

    let mut clients = ClientMap::new(16);
    clients.insert(ClientInfo { client_id: 1, addr: addr(), username: None });
    let mut groups = GroupMap::new(16);
    let mut out = [0u8; protocol::MAX_MSG_LEN];

    let outcome = handle_frame(&buf[..got], 1, &mut clients, &mut groups, &mut out);
    let Outcome::Reply { len, .. } = outcome else {
        panic!("expected a reply");
    };
    assert_eq!(protocol::decode_header(&out[..len]).msgt, MsgType::SetUsernameResponse);
    assert_eq!(clients.get(1).unwrap().username.as_deref(), Some("nova"));
}

/// A reply built by the handler round-trips over the same kind of socket the event loop writes
/// to, byte for byte.
#[test]
fn reply_round_trips_over_the_socket() {
    let (mut client_end, mut server_end) = pipe().expect("socketpair");

    let mut clients = ClientMap::new(16);
    clients.insert(ClientInfo { client_id: 7, addr: addr(), username: None });
    let mut groups = GroupMap::new(16);
    let mut out = [0u8; protocol::MAX_MSG_LEN];

    let frame = set_username_frame(42, b"kip");
    let outcome = handle_frame(&frame, 7, &mut clients, &mut groups, &mut out);
    let Outcome::Reply { len, .. } = outcome else {
        panic!("expected a reply");
    };

    server_end.write_all(&out[..len]).unwrap();

    let mut buf = [0u8; protocol::MAX_MSG_LEN];
    let got = read_exact_len(&mut client_end, &mut buf, len);
    let hdr = protocol::decode_header(&buf[..got]);
    assert_eq!(hdr.msgt, MsgType::SetUsernameResponse);
    assert_eq!(hdr.seqid, 42);
}
