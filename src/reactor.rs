//! Completion layer over the platform poller.
//!
//! Each connection slot may hold at most one armed operation. Arming moves
//! the transfer buffer into the reactor; the matching completion hands it
//! back, so a slot's buffers are never shared with an in-flight operation.
//! Registrations are one-shot: an event fires once, the reactor performs the
//! syscall, and the slot stays quiet until it is armed again.

use std::collections::VecDeque;
use std::io;

use libc::c_int;

use crate::error::MazurkaResult;
use crate::syscalls::{self, epoll_event, IoStep, Poller, EPOLLIN, EPOLLOUT};

/// Token for the listening socket.
pub const TOKEN_ACCEPT: u64 = u64::MAX;
/// Token for the wake pipe.
pub const TOKEN_WAKE: u64 = u64::MAX - 1;

enum Op {
    Recv {
        fd: c_int,
        buf: Vec<u8>,
    },
    Send {
        fd: c_int,
        buf: Vec<u8>,
        pos: usize,
        end: usize,
    },
}

pub enum Event {
    /// A receive finished; `n <= 0` means EOF or transport failure. The valid
    /// bytes are `buf[..n]`.
    Recv { buf: Vec<u8>, n: isize },
    /// A send finished; `n` bytes of the armed window went out.
    Sent { buf: Vec<u8>, n: isize },
    /// The close requested for this slot has been performed.
    Closed,
}

pub enum Completion {
    /// The outstanding accept finished. `fd < 0` is a soft failure: the
    /// listener survives, the caller decides whether to re-arm.
    Accepted { fd: c_int },
    Io { slot: usize, event: Event },
    /// Another thread rang the wake pipe.
    Wake,
}

pub struct Reactor {
    poll: Poller,
    listen_fd: c_int,
    accept_added: bool,
    wake_rx: c_int,
    wake_tx: c_int,
    ops: Vec<Option<Op>>,
    registered: Vec<bool>,
    ready: VecDeque<Completion>,
    events: Vec<epoll_event>,
}

impl Reactor {
    pub fn new(listen_fd: c_int, slots: usize, reap_max: usize) -> MazurkaResult<Reactor> {
        let poll = Poller::new()?;
        let (wake_rx, wake_tx) = syscalls::create_pipe()?;
        // The wake pipe is the one persistent, level-triggered registration:
        // a pending byte keeps waking us until drained.
        poll.add(wake_rx, TOKEN_WAKE, EPOLLIN, false)?;

        let mut ops = Vec::with_capacity(slots);
        ops.resize_with(slots, || None);

        Ok(Reactor {
            poll,
            listen_fd,
            accept_added: false,
            wake_rx,
            wake_tx,
            ops,
            registered: vec![false; slots],
            ready: VecDeque::new(),
            events: vec![epoll_event { events: 0, u64: 0 }; reap_max.max(1)],
        })
    }

    /// Write end of the wake pipe, for cross-thread triggers.
    pub fn wake_handle(&self) -> c_int {
        self.wake_tx
    }

    /// Arm the single outstanding accept.
    pub fn arm_accept(&mut self) -> io::Result<()> {
        if self.accept_added {
            self.poll.modify(self.listen_fd, TOKEN_ACCEPT, EPOLLIN, true)
        } else {
            self.poll.add(self.listen_fd, TOKEN_ACCEPT, EPOLLIN, true)?;
            self.accept_added = true;
            Ok(())
        }
    }

    /// Arm a receive into `buf`. On arming failure the error surfaces as a
    /// failed receive completion rather than an error return, so every armed
    /// operation is answered exactly once.
    pub fn arm_recv(&mut self, slot: usize, fd: c_int, buf: Vec<u8>) {
        debug_assert!(self.ops[slot].is_none(), "slot {} already armed", slot);
        if let Err(err) = self.arm_io(slot, fd, EPOLLIN) {
            log::debug!("slot {}: failed to arm recv: {}", slot, err);
            self.ready.push_back(Completion::Io {
                slot,
                event: Event::Recv { buf, n: -1 },
            });
            return;
        }
        self.ops[slot] = Some(Op::Recv { fd, buf });
    }

    /// Arm a send of `buf[pos..end]`.
    pub fn arm_send(&mut self, slot: usize, fd: c_int, buf: Vec<u8>, pos: usize, end: usize) {
        debug_assert!(self.ops[slot].is_none(), "slot {} already armed", slot);
        debug_assert!(pos < end && end <= buf.len());
        if let Err(err) = self.arm_io(slot, fd, EPOLLOUT) {
            log::debug!("slot {}: failed to arm send: {}", slot, err);
            self.ready.push_back(Completion::Io {
                slot,
                event: Event::Sent { buf, n: -1 },
            });
            return;
        }
        self.ops[slot] = Some(Op::Send { fd, buf, pos, end });
    }

    /// Tear the descriptor down now and surface the completion on the next
    /// reap, keeping close on the same completion path as everything else.
    pub fn close(&mut self, slot: usize, fd: c_int) {
        debug_assert!(self.ops[slot].is_none(), "close with an op in flight");
        let _ = self.poll.delete(fd);
        syscalls::close_fd(fd);
        self.registered[slot] = false;
        self.ready.push_back(Completion::Io {
            slot,
            event: Event::Closed,
        });
    }

    /// Reap completions into `out`. Blocks up to `timeout_ms` only when
    /// nothing is already pending.
    pub fn wait(&mut self, out: &mut Vec<Completion>, timeout_ms: i32) -> MazurkaResult<()> {
        out.clear();
        while let Some(c) = self.ready.pop_front() {
            out.push(c);
        }
        let timeout = if out.is_empty() { timeout_ms } else { 0 };

        let n = self.poll.wait(&mut self.events, timeout)?;
        for i in 0..n {
            let token = self.events[i].u64;
            match token {
                TOKEN_WAKE => {
                    syscalls::pipe_drain(self.wake_rx);
                    out.push(Completion::Wake);
                }
                TOKEN_ACCEPT => match syscalls::accept_connection(self.listen_fd) {
                    Ok(Some(fd)) => out.push(Completion::Accepted { fd }),
                    // Spurious wakeup: quietly keep the accept armed.
                    Ok(None) => self.arm_accept()?,
                    Err(err) => {
                        log::warn!("accept failed: {}", err);
                        out.push(Completion::Accepted { fd: -1 });
                    }
                },
                slot => {
                    let slot = slot as usize;
                    if slot >= self.ops.len() {
                        debug_assert!(false, "event for unknown token {}", slot);
                        continue;
                    }
                    let Some(op) = self.ops[slot].take() else {
                        debug_assert!(false, "event for idle slot {}", slot);
                        continue;
                    };
                    if let Some(c) = self.perform(slot, op) {
                        out.push(c);
                    }
                }
            }
        }
        Ok(())
    }

    fn perform(&mut self, slot: usize, op: Op) -> Option<Completion> {
        match op {
            Op::Recv { fd, mut buf } => match syscalls::read_step(fd, &mut buf[..]) {
                Ok(IoStep::WouldBlock) => {
                    self.restore(slot, fd, EPOLLIN, Op::Recv { fd, buf });
                    None
                }
                Ok(IoStep::Ready(n)) => Some(Completion::Io {
                    slot,
                    event: Event::Recv {
                        buf,
                        n: n as isize,
                    },
                }),
                Err(err) => {
                    log::debug!("slot {}: recv failed: {}", slot, err);
                    Some(Completion::Io {
                        slot,
                        event: Event::Recv { buf, n: -1 },
                    })
                }
            },
            Op::Send { fd, buf, pos, end } => match syscalls::write_step(fd, &buf[pos..end]) {
                Ok(IoStep::WouldBlock) => {
                    self.restore(slot, fd, EPOLLOUT, Op::Send { fd, buf, pos, end });
                    None
                }
                Ok(IoStep::Ready(n)) => Some(Completion::Io {
                    slot,
                    event: Event::Sent {
                        buf,
                        n: n as isize,
                    },
                }),
                Err(err) => {
                    log::debug!("slot {}: send failed: {}", slot, err);
                    Some(Completion::Io {
                        slot,
                        event: Event::Sent { buf, n: -1 },
                    })
                }
            },
        }
    }

    fn restore(&mut self, slot: usize, fd: c_int, interest: i32, op: Op) {
        // One-shot registration already fired; re-arm before putting the op
        // back so the next readiness reaches us.
        if let Err(err) = self.arm_io(slot, fd, interest) {
            log::debug!("slot {}: failed to re-arm: {}", slot, err);
            let event = match op {
                Op::Recv { buf, .. } => Event::Recv { buf, n: -1 },
                Op::Send { buf, .. } => Event::Sent { buf, n: -1 },
            };
            self.ready.push_back(Completion::Io { slot, event });
            return;
        }
        self.ops[slot] = Some(op);
    }

    fn arm_io(&mut self, slot: usize, fd: c_int, interest: i32) -> io::Result<()> {
        let token = slot as u64;
        if self.registered[slot] {
            self.poll.modify(fd, token, interest, true)
        } else {
            self.poll.add(fd, token, interest, true)?;
            self.registered[slot] = true;
            Ok(())
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        syscalls::close_fd(self.wake_rx);
        syscalls::close_fd(self.wake_tx);
    }
}
