// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::io;

/// Errors that can arise at the edges of this crate: process bootstrap and wire decoding.
///
/// The event loop itself does not propagate these — per-connection failures are handled locally
/// by tearing down the connection (see `server::ring`), never by unwinding through `Result`.
#[derive(Debug)]
pub enum Error {
    /// I/O failures during socket setup or ring initialization.
    Io(io::Error),

    /// A structurally invalid frame: wrong length for the declared message type, or an unknown
    /// message type.
    Protocol(&'static str),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
