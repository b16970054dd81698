// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod clients;
pub mod error;
pub mod groups;
pub mod handler;
pub mod op_pool;
pub mod protocol;
pub mod server;
pub mod slab;
pub mod test_support;

pub use error::Error;
