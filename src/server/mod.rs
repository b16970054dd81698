// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Server bootstrap: socket setup plus the io_uring event loop in [`ring`].

pub mod ring;

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use nix::sys::socket::{setsockopt, sockopt};

use crate::error::Error;

/// Bind a listening socket the way the event loop expects it: `SO_REUSEADDR` and non-blocking set
/// on the raw fd *before* `bind`, then listening with the given backlog -- setting `SO_REUSEADDR`
/// after `bind` has already succeeded has no effect on the thing it's for (rebinding a recently
/// used address), so the socket is built by hand here instead of going through
/// `TcpListener::bind`, which would run `bind`/`listen` before we get a chance to set it.
pub fn bind_listener(host: &str, port: u16, backlog: i32) -> Result<TcpListener, Error> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "invalid host address")))?;

    // SAFETY: a plain socket(2) call; checked for -1 below.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // SAFETY: fd was just created above and isn't owned by anything else yet.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    setsockopt(&owned, sockopt::ReuseAddr, &true)
        .map_err(|e| Error::Io(io::Error::from_raw_os_error(e as i32)))?;

    // SAFETY: owned holds the only handle to this fd; from_raw_fd takes over that ownership.
    let listener = unsafe { TcpListener::from_raw_fd(owned.into_raw_fd()) };
    listener.set_nonblocking(true)?;

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(ip).to_be();

    // SAFETY: addr is a valid sockaddr_in matching the AF_INET socket created above.
    let ret = unsafe {
        libc::bind(
            listener.as_raw_fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    // SAFETY: listener owns a valid socket fd for the lifetime of this call.
    let ret = unsafe { libc::listen(listener.as_raw_fd(), backlog) };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(listener)
}

/// Build the server and run its event loop. Never returns under normal operation.
pub fn run(host: &str, port: u16, backlog: i32, ring_entries: u32) -> Result<(), Error> {
    let listener = bind_listener(host, port, backlog)?;
    log::info!("listening on {host}:{port}");

    let mut server = ring::Server::new(listener, ring_entries)?;
    server.run()?;
    Ok(())
}
