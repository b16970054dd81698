// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The io_uring submit/complete loop.
//!
//! Each in-flight accept/recv/send is an `Operation` held in the `OpPool`; its pool index is
//! handed to the kernel as the `user_data` cookie and used to look the operation back up when its
//! completion arrives. Unlike a boxed-and-leaked cookie, this never allocates per operation and
//! never needs an `unsafe` pointer reconstruction -- the pool is the single owner throughout.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;

use io_uring::{opcode, types, IoUring};
use log::{debug, trace, warn};

use crate::clients::{ClientInfo, ClientMap};
use crate::error::Error;
use crate::groups::GroupMap;
use crate::handler::{self, Outcome};
use crate::op_pool::OpPool;
use crate::protocol;
use crate::slab::{SlabHandle, SlabPool};

const RING_ENTRIES: u32 = 256;
const CQE_BATCH_SIZE: usize = 32;
const OP_POOL_INITIAL: usize = 64;
const SLAB64_INITIAL: usize = 64;
const SLAB2K_INITIAL: usize = 16;
const SMALL_BUF_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Accept,
    Recv,
    Send,
}

/// Scratch storage for the peer address an `Accept` completion fills in. Boxed so the pointer
/// handed to the kernel stays stable even if the owning `Operation` is moved within the pool's
/// `Vec` (it never is, in practice, but the indirection makes that guarantee free).
struct AcceptAddr {
    addr: libc::sockaddr_in,
    len: libc::socklen_t,
}

/// One in-flight kernel operation. Mirrors the reference `Operation` struct field for field:
/// `client_id`, `buf`/`buf_cap`/`buf_len`, `processed`, `client_fd`, `type`.
pub struct Operation {
    op_type: OpType,
    client_id: u64,
    client_fd: i32,
    buf: Option<SlabHandle>,
    buf_is_large: bool,
    processed: usize,
    accept_addr: Option<Box<AcceptAddr>>,
}

impl Default for Operation {
    fn default() -> Self {
        Operation {
            op_type: OpType::Accept,
            client_id: 0,
            client_fd: -1,
            buf: None,
            buf_is_large: false,
            processed: 0,
            accept_addr: None,
        }
    }
}

impl Operation {
    /// Whether this operation has released its buffer and fd -- the precondition `OpPool::release`
    /// asserts before returning a slot to the free list.
    pub(crate) fn is_clear(&self) -> bool {
        self.buf.is_none() && self.client_fd == -1
    }
}

fn sockaddr_in_to_socket_addr(addr: &libc::sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    SocketAddr::new(IpAddr::V4(ip), port)
}

pub struct Server {
    ring: IoUring,
    listener: TcpListener,
    op_pool: OpPool,
    slab64: SlabPool,
    slab2k: SlabPool,
    clients: ClientMap,
    groups: GroupMap,
    next_client_id: u64,
}

impl Server {
    pub fn new(listener: TcpListener, ring_entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(ring_entries.max(RING_ENTRIES))?;
        Ok(Server {
            ring,
            listener,
            op_pool: OpPool::new(OP_POOL_INITIAL),
            slab64: SlabPool::new(SMALL_BUF_THRESHOLD, SLAB64_INITIAL),
            slab2k: SlabPool::new(protocol::MAX_MSG_LEN, SLAB2K_INITIAL),
            clients: ClientMap::default(),
            groups: GroupMap::default(),
            next_client_id: 1,
        })
    }

    /// Run the event loop. Never returns under normal operation.
    pub fn run(&mut self) -> io::Result<()> {
        self.add_accept(self.next_client_id);
        self.next_client_id += 1;
        self.submit()?;

        let mut cqes = Vec::with_capacity(CQE_BATCH_SIZE);
        loop {
            self.wait_one_and_drain(&mut cqes)?;
            self.handle_cqe_batch(&cqes);
            self.submit()?;
            cqes.clear();
        }
    }

    fn wait_one_and_drain(&mut self, out: &mut Vec<(u64, i32, u32)>) -> io::Result<()> {
        self.try_submit_and_wait();
        for cqe in self.ring.completion() {
            out.push((cqe.user_data(), cqe.result(), cqe.flags()));
            if out.len() >= CQE_BATCH_SIZE {
                break;
            }
        }
        Ok(())
    }

    fn try_submit_and_wait(&mut self) {
        if let Err(e) = self.ring.submit_and_wait(1) {
            match nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)) {
                nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR => {}
                other => panic!("unexpected error from io_uring_enter: {other}"),
            }
        }
    }

    fn submit(&mut self) -> io::Result<()> {
        self.ring.submit()?;
        Ok(())
    }

    fn handle_cqe_batch(&mut self, cqes: &[(u64, i32, u32)]) {
        for &(user_data, res, _flags) in cqes {
            let pool_id = user_data as u32;
            check_completion_error(res, pool_id);

            if res < 0 {
                let op = self.op_pool.get(pool_id);
                warn!(
                    "[fd={} client_id={}] op {:?} failed: {}",
                    op.client_fd,
                    op.client_id,
                    op.op_type,
                    io::Error::from_raw_os_error(-res)
                );
                self.disconnect_and_free_op(pool_id);
                continue;
            }

            let op = self.op_pool.get(pool_id);
            let client_id = op.client_id;
            let op_type = op.op_type;

            // Accept completions create their own client entry below; every other op type must
            // find a live client to proceed, or the operation is an orphaned completion for a
            // connection we already tore down.
            if op_type != OpType::Accept && self.clients.get(client_id).is_none() {
                debug!(
                    "[client_id={client_id}] successful op {op_type:?} but client already disconnected"
                );
                self.free_op(pool_id);
                continue;
            }

            match op_type {
                OpType::Accept => self.handle_accept(pool_id, res),
                OpType::Recv => self.handle_recv(pool_id, res as usize),
                OpType::Send => self.handle_send(pool_id, res as usize),
            }
        }
    }

    fn add_accept(&mut self, client_id: u64) {
        let pool_id = self.op_pool.acquire();
        let op = self.op_pool.get_mut(pool_id);
        let handle = self.slab2k.get();
        op.buf = Some(handle);
        op.buf_is_large = true;
        op.processed = 0;
        op.client_id = client_id;
        op.client_fd = -1;
        op.op_type = OpType::Accept;
        op.accept_addr = Some(Box::new(AcceptAddr {
            // SAFETY: sockaddr_in is a plain-old-data struct; the all-zeros bit pattern is valid.
            addr: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        }));

        let addr_box = op.accept_addr.as_mut().unwrap();
        let addr_ptr = &mut addr_box.addr as *mut libc::sockaddr_in as *mut libc::sockaddr;
        let addrlen_ptr = &mut addr_box.len as *mut libc::socklen_t;

        self.clients.insert(ClientInfo {
            client_id,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            username: None,
        });

        let listen_fd = types::Fd(self.listener.as_raw_fd());
        let submission = opcode::Accept::new(listen_fd, addr_ptr, addrlen_ptr)
            .build()
            .user_data(pool_id as u64);

        self.push_sqe(&submission);
    }

    fn add_recv(&mut self, pool_id: u32, client_fd: i32) {
        let op = self.op_pool.get_mut(pool_id);
        op.client_fd = client_fd;
        op.op_type = OpType::Recv;

        let handle = op.buf.expect("recv op must own a buffer");
        let cap = self.slab2k.buf_cap();
        let ptr = self.slab2k.buf_mut(handle).as_mut_ptr();

        let submission = opcode::Recv::new(types::Fd(client_fd), ptr, cap as u32)
            .build()
            .user_data(pool_id as u64);

        self.push_sqe(&submission);
    }

    fn resume_recv(&mut self, pool_id: u32, bytes_read: usize) {
        let op = self.op_pool.get(pool_id);
        let handle = op.buf.expect("recv op must own a buffer");
        let client_fd = op.client_fd;
        let cap = self.slab2k.buf_cap();

        let ptr = unsafe { self.slab2k.buf_mut(handle).as_mut_ptr().add(bytes_read) };
        let len = (cap - bytes_read) as u32;

        let submission = opcode::Recv::new(types::Fd(client_fd), ptr, len)
            .build()
            .user_data(pool_id as u64);

        self.push_sqe(&submission);
    }

    fn add_send(&mut self, pool_id: u32, client_fd: i32, client_id: u64) {
        let op = self.op_pool.get_mut(pool_id);
        op.client_id = client_id;
        op.processed = 0;
        op.client_fd = client_fd;
        op.op_type = OpType::Send;

        let handle = op.buf.expect("send op must own a buffer");
        let pool = if op.buf_is_large { &self.slab2k } else { &self.slab64 };
        let len = pool.len(handle);
        let ptr = if op.buf_is_large {
            self.slab2k.buf_mut(handle).as_ptr()
        } else {
            self.slab64.buf_mut(handle).as_ptr()
        };

        let submission = opcode::Send::new(types::Fd(client_fd), ptr, len as u32)
            .build()
            .user_data(pool_id as u64);

        self.push_sqe(&submission);
    }

    fn resume_send(&mut self, pool_id: u32, processed: usize) {
        let op = self.op_pool.get_mut(pool_id);
        op.processed += processed;
        let handle = op.buf.expect("send op must own a buffer");
        let client_fd = op.client_fd;
        let is_large = op.buf_is_large;
        let start = op.processed;

        let (total_len, ptr) = if is_large {
            (self.slab2k.len(handle), unsafe { self.slab2k.buf_mut(handle).as_ptr().add(start) })
        } else {
            (self.slab64.len(handle), unsafe { self.slab64.buf_mut(handle).as_ptr().add(start) })
        };
        let remaining = (total_len - start) as u32;

        let submission = opcode::Send::new(types::Fd(client_fd), ptr, remaining)
            .build()
            .user_data(pool_id as u64);

        self.push_sqe(&submission);
    }

    fn push_sqe(&mut self, submission: &io_uring::squeue::Entry) {
        // SAFETY: every buffer pointer passed in a submission above is owned by a slab slot whose
        // refcount keeps it alive until the matching completion is processed and the op freed.
        unsafe {
            self.ring
                .submission()
                .push(submission)
                .expect("submission queue is full");
        }
    }

    /// Acquire a reply buffer sized for `len` bytes from the appropriate slab class and queue a
    /// send of it.
    fn acquire_and_send(&mut self, client_fd: i32, client_id: u64, len: usize, write: impl FnOnce(&mut [u8])) {
        let pool_id = self.op_pool.acquire();
        let is_large = len > SMALL_BUF_THRESHOLD;
        let handle = if is_large { self.slab2k.get() } else { self.slab64.get() };

        if is_large {
            write(self.slab2k.buf_mut(handle));
            self.slab2k.set_len(handle, len);
        } else {
            write(self.slab64.buf_mut(handle));
            self.slab64.set_len(handle, len);
        }

        let op = self.op_pool.get_mut(pool_id);
        op.buf = Some(handle);
        op.buf_is_large = is_large;

        self.add_send(pool_id, client_fd, client_id);
    }

    fn handle_accept(&mut self, pool_id: u32, client_fd: i32) {
        let op = self.op_pool.get_mut(pool_id);
        let client_id = op.client_id;
        let addr = op
            .accept_addr
            .take()
            .map(|b| sockaddr_in_to_socket_addr(&b.addr));

        if let (Some(addr), Some(info)) = (addr, self.clients.get_mut(client_id)) {
            info.addr = addr;
        }

        debug!("client_id={client_id} connected as fd={client_fd} from {addr:?}");

        self.add_recv(pool_id, client_fd);

        let next = self.next_client_id;
        self.next_client_id += 1;
        self.add_accept(next);
    }

    fn handle_recv(&mut self, pool_id: u32, bytes_read: usize) {
        if bytes_read == 0 {
            self.disconnect_and_free_op(pool_id);
            return;
        }

        let op = self.op_pool.get(pool_id);
        let handle = op.buf.expect("recv op must own a buffer");
        let client_id = op.client_id;
        let client_fd = op.client_fd;

        // Copy the valid window out so later buffer mutation (replies, compaction) doesn't
        // conflict with an immutable borrow of the slab.
        let window = self.slab2k.window(handle, bytes_read).to_vec();
        let mut cursor = &window[..];

        loop {
            if cursor.len() < protocol::HEADER_LEN {
                break;
            }
            let hdr = protocol::decode_header(cursor);
            let frame_len = hdr.len as usize;
            if frame_len < protocol::HEADER_LEN || frame_len > protocol::MAX_MSG_LEN {
                let err = Error::Protocol("declared frame length out of bounds");
                warn!("client_id={client_id}: {err}");
                self.disconnect_and_free_op(pool_id);
                return;
            }
            if cursor.len() < frame_len {
                break;
            }

            let frame = &cursor[..frame_len];
            let mut reply = [0u8; protocol::MAX_MSG_LEN];
            let outcome = handler::handle_frame(frame, client_id, &mut self.clients, &mut self.groups, &mut reply);

            match outcome {
                Outcome::Reply { len, .. } => {
                    self.acquire_and_send(client_fd, client_id, len, |buf| {
                        buf[..len].copy_from_slice(&reply[..len]);
                    });
                }
                Outcome::Drop => {
                    self.disconnect_and_free_op(pool_id);
                    return;
                }
            }

            cursor = &cursor[frame_len..];
        }

        // Compact any leftover partial frame to the front of the buffer before resuming recv.
        let leftover = cursor.len();
        if leftover > 0 {
            let buf = self.slab2k.buf_mut(handle);
            buf.copy_within(bytes_read - leftover..bytes_read, 0);
        }
        self.resume_recv(pool_id, leftover);
    }

    fn handle_send(&mut self, pool_id: u32, bytes_written: usize) {
        let op = self.op_pool.get(pool_id);
        if bytes_written == 0 {
            trace!("client_id={} SHORT_WRITE_0", op.client_id);
        }

        let handle = op.buf.expect("send op must own a buffer");
        let total_len = if op.buf_is_large {
            self.slab2k.len(handle)
        } else {
            self.slab64.len(handle)
        };

        if op.processed + bytes_written < total_len {
            self.resume_send(pool_id, bytes_written);
            return;
        }

        self.free_op(pool_id);
    }

    fn free_op(&mut self, pool_id: u32) {
        let op = self.op_pool.get_mut(pool_id);
        if let Some(handle) = op.buf.take() {
            if op.buf_is_large {
                self.slab2k.put(handle);
            } else {
                self.slab64.put(handle);
            }
        }
        op.client_fd = -1;
        self.op_pool.release(pool_id);
    }

    fn disconnect_and_free_op(&mut self, pool_id: u32) {
        let op = self.op_pool.get(pool_id);
        let client_id = op.client_id;
        let client_fd = op.client_fd;

        if let Some(info) = self.clients.get(client_id) {
            debug!("client_id={client_id} ({:?}) disconnected", info.username);
            if client_fd >= 0 {
                // SAFETY: client_fd is a valid, still-open fd owned by this operation; it is
                // closed exactly once here, matching the reference server's close discipline.
                unsafe {
                    libc::close(client_fd);
                }
            }
            self.clients.remove(client_id);
        }

        self.free_op(pool_id);
    }
}

/// Fatal completion errors that can only indicate a bug in this server, not a remote peer's
/// misbehavior. `EBADF`/`EFAULT` on a descriptor or buffer this process owns means our own
/// bookkeeping is wrong.
fn check_completion_error(res: i32, pool_id: u32) {
    if res >= 0 {
        return;
    }
    match nix::errno::Errno::from_raw(-res) {
        nix::errno::Errno::EBADF => panic!("completion returned EBADF for op {pool_id}"),
        nix::errno::Errno::EFAULT => panic!("completion returned EFAULT for op {pool_id}"),
        _ => {}
    }
}
