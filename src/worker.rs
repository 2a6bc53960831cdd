//! The worker runtime: one thread, one poller, one connection pool.
//!
//! Everything here is driven by completions. Each connection slot carries a
//! tagged job; a completion is dispatched against that tag and every handler
//! asserts the variant it expects. Between completions all mutation is
//! synchronous, so no connection state is ever shared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use libc::c_int;
use log::{debug, info, warn};

use crate::config::ServerConfig;
use crate::conn::{Conn, HandshakePhase, Job, SendSecurity, Stage, INVALID_FD};
use crate::error::MazurkaResult;
use crate::http::{self, Context, Method, Outcome, Response, Version};
use crate::metrics::WorkerMetrics;
use crate::parser::{self, ParseError};
use crate::pseudo::Pseudoslice;
use crate::reactor::{Completion, Event, Reactor};
use crate::router::{self, Lookup, Router, QUERIES_MAX};
use crate::slab::ConnSlab;
use crate::syscalls;
use crate::tls::{Acceptor, HandshakeStep, Session};

/// Handshakes that keep needing continuation cycles beyond this are cut off.
const HANDSHAKE_CYCLES_MAX: u32 = 50;

/// Poll timeout; bounds how long a quiet worker takes to notice shutdown.
const WAIT_TIMEOUT_MS: i32 = 500;

pub(crate) enum TriggerMsg {
    Respond { slot: usize, response: Response },
    Resume { slot: usize },
}

/// Resume handle for handlers that answer asynchronously.
///
/// A handler that returns [`Outcome::Spawned`] keeps a clone; the connection
/// is parked with no I/O outstanding until one of these methods re-enters
/// the worker.
#[derive(Clone)]
pub struct Link {
    slot: usize,
    tx: Sender<TriggerMsg>,
    wake_fd: c_int,
}

impl Link {
    /// Deliver the response and run the send pipeline.
    pub fn respond(&self, response: Response) {
        let _ = self.tx.send(TriggerMsg::Respond {
            slot: self.slot,
            response,
        });
        syscalls::pipe_wake(self.wake_fd);
    }

    /// Re-arm the read instead: the handler wants more request bytes dealt
    /// with by the normal machinery.
    pub fn resume_recv(&self) {
        let _ = self.tx.send(TriggerMsg::Resume { slot: self.slot });
        syscalls::pipe_wake(self.wake_fd);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Link, Receiver<TriggerMsg>) {
        let (tx, rx) = mpsc::channel();
        (
            Link {
                slot: 0,
                tx,
                wake_fd: -1,
            },
            rx,
        )
    }
}

/// What request assembly wants next.
pub(crate) enum Step {
    Recv,
    Respond(Response),
    Spawned,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Kill,
}

enum HsAct {
    Recv,
    Send(Vec<u8>),
    Established,
    Close,
}

enum SendArm {
    Arm {
        fd: c_int,
        buf: Vec<u8>,
        pos: usize,
        end: usize,
    },
    RestoreAndFinish(Vec<u8>),
    Finish,
    Close,
}

pub struct Worker {
    id: usize,
    cfg: Arc<ServerConfig>,
    router: Arc<Router>,
    metrics: Arc<WorkerMetrics>,
    reactor: Reactor,
    pool: ConnSlab,
    tls_slots: Vec<Option<Box<dyn Session>>>,
    acceptor: Option<Arc<dyn Acceptor>>,
    accept_queued: bool,
    next_hint: usize,
    trigger_tx: Sender<TriggerMsg>,
    trigger_rx: Receiver<TriggerMsg>,
}

impl Worker {
    pub fn new(
        id: usize,
        cfg: Arc<ServerConfig>,
        router: Arc<Router>,
        metrics: Arc<WorkerMetrics>,
        listen_fd: c_int,
        acceptor: Option<Arc<dyn Acceptor>>,
    ) -> MazurkaResult<Worker> {
        let reactor = Reactor::new(
            listen_fd,
            cfg.size_connections_max,
            cfg.size_completions_reap_max,
        )?;
        let pool = ConnSlab::new(&cfg);
        let tls_slots = if acceptor.is_some() {
            let mut v = Vec::with_capacity(cfg.size_connections_max);
            v.resize_with(cfg.size_connections_max, || None);
            v
        } else {
            Vec::new()
        };
        let (trigger_tx, trigger_rx) = mpsc::channel();
        Ok(Worker {
            id,
            cfg,
            router,
            metrics,
            reactor,
            pool,
            tls_slots,
            acceptor,
            accept_queued: false,
            next_hint: 0,
            trigger_tx,
            trigger_rx,
        })
    }

    /// Run until shutdown is requested or a handler kills the runtime.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> MazurkaResult<()> {
        self.reactor.arm_accept()?;
        self.accept_queued = true;
        info!("worker {} running", self.id);

        let mut completions = Vec::with_capacity(self.cfg.size_completions_reap_max);
        'main: while !shutdown.load(Ordering::Acquire) {
            self.reactor.wait(&mut completions, WAIT_TIMEOUT_MS)?;
            for completion in completions.drain(..) {
                if self.on_completion(completion)? == Flow::Kill {
                    info!("worker {} stopping on kill", self.id);
                    break 'main;
                }
            }
        }

        self.teardown();
        info!("worker {} exited", self.id);
        Ok(())
    }

    fn teardown(&mut self) {
        for i in 0..self.pool.capacity() {
            let conn = self.pool.get_mut(i);
            if !conn.job.is_empty() && conn.fd != INVALID_FD {
                syscalls::close_fd(conn.fd);
                conn.fd = INVALID_FD;
            }
        }
        for slot in self.tls_slots.iter_mut() {
            *slot = None;
        }
    }

    fn on_completion(&mut self, completion: Completion) -> MazurkaResult<Flow> {
        match completion {
            Completion::Accepted { fd } => {
                self.on_accept(fd);
                Ok(Flow::Continue)
            }
            Completion::Wake => self.on_wake(),
            Completion::Io { slot, event } => match event {
                Event::Recv { buf, n } => self.on_recv(slot, buf, n),
                Event::Sent { buf, n } => self.on_sent(slot, buf, n),
                Event::Closed => {
                    self.on_closed(slot);
                    Ok(Flow::Continue)
                }
            },
        }
    }

    // ---- Accept & close ----

    fn on_accept(&mut self, fd: c_int) {
        self.accept_queued = false;
        // Admission control: keep an accept outstanding only while there is
        // headroom for the connection it would bring in. Otherwise the next
        // close re-arms it.
        if self.pool.clean() >= 2 {
            match self.reactor.arm_accept() {
                Ok(()) => self.accept_queued = true,
                Err(err) => warn!("worker {}: failed to re-arm accept: {}", self.id, err),
            }
        }

        if fd < 0 {
            warn!("worker {}: accept produced no socket", self.id);
            return;
        }

        assert!(
            self.pool.clean() > 0,
            "connection pool exhausted at accept; admission control must defer the accept"
        );
        let hint = self.next_hint;
        self.next_hint = self.next_hint.wrapping_add(1);
        let slot = self.pool.borrow(hint).expect("borrow after clean check");

        if let Err(err) = syscalls::set_nodelay(fd) {
            debug!("worker {}: TCP_NODELAY failed: {}", self.id, err);
        }
        let _ = syscalls::set_nonblocking(fd);

        self.metrics.inc_conn();
        self.pool.get_mut(slot).fd = fd;

        let session = match &self.acceptor {
            None => None,
            Some(acceptor) => match acceptor.session() {
                Ok(sess) => Some(sess),
                Err(err) => {
                    warn!("worker {}: TLS session setup failed: {}", self.id, err);
                    self.start_close(slot);
                    return;
                }
            },
        };

        let (fd, buf) = {
            let conn = self.pool.get_mut(slot);
            conn.job = match session {
                Some(_) => Job::Handshake {
                    phase: HandshakePhase::Recv,
                    count: 0,
                    out: Vec::with_capacity(2 * self.cfg.size_socket_buffer),
                    out_pos: 0,
                },
                None => Job::Recv { count: 0 },
            };
            (conn.fd, conn.take_buffer())
        };
        if let Some(sess) = session {
            self.tls_slots[slot] = Some(sess);
        }
        self.reactor.arm_recv(slot, fd, buf);
        debug!("worker {}: accepted into slot {}", self.id, slot);
    }

    fn start_close(&mut self, slot: usize) {
        let fd = {
            let conn = self.pool.get_mut(slot);
            debug_assert!(conn.fd != INVALID_FD, "closing a slot without a socket");
            conn.job = Job::Close;
            conn.fd
        };
        // Paired by index with the connection: a closing slot holds no
        // session any more.
        if !self.tls_slots.is_empty() {
            self.tls_slots[slot] = None;
        }
        self.reactor.close(slot, fd);
    }

    fn on_closed(&mut self, slot: usize) {
        {
            let Worker {
                ref mut pool,
                ref cfg,
                ..
            } = *self;
            let conn = pool.get_mut(slot);
            assert!(
                matches!(conn.job, Job::Close),
                "close completion in {} state",
                conn.job.name()
            );
            conn.reset_closed(cfg);
        }
        self.pool.release(slot);
        self.metrics.dec_conn();
        debug!("worker {}: slot {} closed", self.id, slot);

        if !self.accept_queued {
            match self.reactor.arm_accept() {
                Ok(()) => self.accept_queued = true,
                Err(err) => warn!("worker {}: failed to re-arm accept: {}", self.id, err),
            }
        }
    }

    // ---- Receive path ----

    fn on_recv(&mut self, slot: usize, buf: Vec<u8>, n: isize) -> MazurkaResult<Flow> {
        enum Kind {
            Handshake,
            Request,
        }
        let kind = match &self.pool.get(slot).job {
            Job::Handshake { phase, .. } => {
                debug_assert_eq!(*phase, HandshakePhase::Recv, "recv completion in send phase");
                Kind::Handshake
            }
            Job::Recv { .. } => Kind::Request,
            job => panic!("recv completion in {} state", job.name()),
        };

        self.pool.get_mut(slot).buffer = buf;
        if n <= 0 {
            debug!("worker {}: slot {} peer gone during recv", self.id, slot);
            self.start_close(slot);
            return Ok(Flow::Continue);
        }

        match kind {
            Kind::Handshake => self.handshake_advance(slot, n as usize),
            Kind::Request => self.on_request_recv(slot, n as usize),
        }
    }

    fn on_request_recv(&mut self, slot: usize, n: usize) -> MazurkaResult<Flow> {
        let step = {
            let Worker {
                ref mut pool,
                ref mut tls_slots,
                ref cfg,
                ref router,
                ref trigger_tx,
                ref reactor,
                ..
            } = *self;
            let conn = pool.get_mut(slot);
            let link = Link {
                slot,
                tx: trigger_tx.clone(),
                wake_fd: reactor.wake_handle(),
            };

            let over = match &mut conn.job {
                Job::Recv { count } => {
                    *count += n;
                    *count >= cfg.size_request_max
                }
                job => panic!("request recv in {} state", job.name()),
            };

            if over {
                Step::Respond(Response::canned(413))
            } else {
                let resume = conn.recv_buffer.len().saturating_sub(3);
                if tls_slots.is_empty() {
                    let take = n.min(conn.buffer.len());
                    conn.recv_buffer.extend_from_slice(&conn.buffer[..take]);
                    if conn.recv_buffer.len() > cfg.size_recv_buffer_max {
                        Step::Respond(Response::canned(413))
                    } else {
                        advance_stage(conn, cfg, router, &link, resume)
                    }
                } else {
                    let sess = tls_slots[slot]
                        .as_mut()
                        .expect("receive under TLS without a session");
                    let take = n.min(conn.buffer.len());
                    match sess.decrypt(&conn.buffer[..take], &mut conn.recv_buffer) {
                        Err(err) => {
                            debug!("worker: slot {} decrypt failed: {}", slot, err);
                            Step::Close
                        }
                        Ok(()) => {
                            if conn.recv_buffer.len() > cfg.size_recv_buffer_max {
                                Step::Respond(Response::canned(413))
                            } else {
                                advance_stage(conn, cfg, router, &link, resume)
                            }
                        }
                    }
                }
            }
        };
        self.finish_recv_step(slot, step)
    }

    fn finish_recv_step(&mut self, slot: usize, step: Step) -> MazurkaResult<Flow> {
        match step {
            Step::Recv => {
                let (fd, buf) = {
                    let conn = self.pool.get_mut(slot);
                    (conn.fd, conn.take_buffer())
                };
                self.reactor.arm_recv(slot, fd, buf);
                Ok(Flow::Continue)
            }
            Step::Respond(response) => self.dispatch_response(slot, response),
            Step::Spawned => Ok(Flow::Continue), // parked until the link fires
            Step::Close => {
                self.start_close(slot);
                Ok(Flow::Continue)
            }
        }
    }

    // ---- Handshake ----

    /// Drive the handshake after a completion. `input_len` is how many fresh
    /// bytes sit in the connection's scratch buffer (zero when re-entering
    /// after a finished send).
    fn handshake_advance(&mut self, slot: usize, input_len: usize) -> MazurkaResult<Flow> {
        let act = {
            let Worker {
                ref mut pool,
                ref mut tls_slots,
                ..
            } = *self;
            let conn = pool.get_mut(slot);
            let sess = tls_slots[slot]
                .as_mut()
                .expect("handshake without a TLS session");
            match &mut conn.job {
                Job::Handshake {
                    phase,
                    count,
                    out,
                    out_pos,
                } => {
                    if *count >= HANDSHAKE_CYCLES_MAX {
                        warn!("slot {}: handshake cycles exhausted", slot);
                        HsAct::Close
                    } else {
                        *count += 1;
                        let mut flight = std::mem::take(out);
                        match sess.advance(&conn.buffer[..input_len], &mut flight) {
                            Ok(HandshakeStep::WantRecv) => {
                                *phase = HandshakePhase::Recv;
                                *out = flight;
                                *out_pos = 0;
                                HsAct::Recv
                            }
                            Ok(HandshakeStep::WantSend) if flight.is_empty() => {
                                debug!("slot {}: handshake produced an empty flight", slot);
                                HsAct::Close
                            }
                            Ok(HandshakeStep::WantSend) => {
                                *phase = HandshakePhase::Send;
                                *out_pos = 0;
                                HsAct::Send(flight)
                            }
                            Ok(HandshakeStep::Complete) => HsAct::Established,
                            Err(err) => {
                                debug!("slot {}: handshake failed: {}", slot, err);
                                HsAct::Close
                            }
                        }
                    }
                }
                job => panic!("handshake step in {} state", job.name()),
            }
        };

        match act {
            HsAct::Recv => {
                let (fd, buf) = {
                    let conn = self.pool.get_mut(slot);
                    (conn.fd, conn.take_buffer())
                };
                self.reactor.arm_recv(slot, fd, buf);
                Ok(Flow::Continue)
            }
            HsAct::Send(flight) => {
                let fd = self.pool.get(slot).fd;
                let end = flight.len();
                self.reactor.arm_send(slot, fd, flight, 0, end);
                Ok(Flow::Continue)
            }
            HsAct::Established => self.on_established(slot),
            HsAct::Close => {
                self.start_close(slot);
                Ok(Flow::Continue)
            }
        }
    }

    /// Handshake done: switch the slot to request I/O. Plaintext that rode
    /// in alongside the final flight is pulled out of the session before the
    /// first read is armed.
    fn on_established(&mut self, slot: usize) -> MazurkaResult<Flow> {
        debug!("worker {}: slot {} TLS established", self.id, slot);
        let step = {
            let Worker {
                ref mut pool,
                ref mut tls_slots,
                ref cfg,
                ref router,
                ref trigger_tx,
                ref reactor,
                ..
            } = *self;
            let conn = pool.get_mut(slot);
            let sess = tls_slots[slot]
                .as_mut()
                .expect("established without a TLS session");
            conn.job = Job::Recv { count: 0 };
            match sess.decrypt(&[], &mut conn.recv_buffer) {
                Err(err) => {
                    debug!("slot {}: early data rejected: {}", slot, err);
                    Step::Close
                }
                Ok(()) if conn.recv_buffer.is_empty() => Step::Recv,
                Ok(()) => {
                    if let Job::Recv { count } = &mut conn.job {
                        *count = conn.recv_buffer.len();
                    }
                    let link = Link {
                        slot,
                        tx: trigger_tx.clone(),
                        wake_fd: reactor.wake_handle(),
                    };
                    advance_stage(conn, cfg, router, &link, 0)
                }
            }
        };
        self.finish_recv_step(slot, step)
    }

    fn on_handshake_sent(&mut self, slot: usize, buf: Vec<u8>, n: usize) -> MazurkaResult<Flow> {
        let resend = {
            let conn = self.pool.get_mut(slot);
            match &mut conn.job {
                Job::Handshake { out, out_pos, .. } => {
                    *out = buf;
                    *out_pos += n;
                    if *out_pos < out.len() {
                        let pos = *out_pos;
                        let flight = std::mem::take(out);
                        Some((conn.fd, flight, pos))
                    } else {
                        None
                    }
                }
                job => panic!("handshake send completion in {} state", job.name()),
            }
        };
        match resend {
            Some((fd, flight, pos)) => {
                let end = flight.len();
                self.reactor.arm_send(slot, fd, flight, pos, end);
                Ok(Flow::Continue)
            }
            None => self.handshake_advance(slot, 0),
        }
    }

    // ---- Send path ----

    fn dispatch_response(&mut self, slot: usize, response: Response) -> MazurkaResult<Flow> {
        if response.status == http::KILL {
            info!("worker {}: kill requested by handler", self.id);
            return Ok(Flow::Kill);
        }
        self.metrics.inc_req();

        let act = {
            let Worker {
                ref mut pool,
                ref mut tls_slots,
                ref cfg,
                ..
            } = *self;
            let conn = pool.get_mut(slot);
            debug!(
                "slot {}: {} {}",
                slot,
                response.status,
                http::status_name(response.status)
            );

            conn.response = response;
            let body_len = conn.response.body.len();
            let is_head = conn.head_request;
            let mut head = Vec::with_capacity(128);
            conn.response.render_head_into(&mut head, body_len);
            conn.response.headers.clear();

            if tls_slots.is_empty() {
                let mut buf = conn.take_buffer();
                let body: &[u8] = if is_head {
                    &[]
                } else {
                    conn.response.body.as_bytes()
                };
                let w = Pseudoslice::new(&head, body).read_into(0, &mut buf[..]);
                let fd = conn.fd;
                conn.job = Job::Send {
                    head,
                    count: 0,
                    is_head,
                    security: SendSecurity::Plain,
                };
                SendArm::Arm {
                    fd,
                    buf,
                    pos: 0,
                    end: w,
                }
            } else {
                let sess = tls_slots[slot]
                    .as_mut()
                    .expect("send under TLS without a session");
                let mut encrypted = Vec::with_capacity(2 * cfg.size_socket_buffer);
                let encrypt_result = {
                    let body: &[u8] = if is_head {
                        &[]
                    } else {
                        conn.response.body.as_bytes()
                    };
                    let ps = Pseudoslice::new(&head, body);
                    let w = ps.len().min(cfg.size_socket_buffer);
                    let view = ps.get(0, w, &mut conn.buffer[..]);
                    sess.encrypt(view, &mut encrypted).map(|()| w)
                };
                match encrypt_result {
                    Err(err) => {
                        debug!("slot {}: encrypt failed: {}", slot, err);
                        SendArm::Close
                    }
                    Ok(w) => {
                        let fd = conn.fd;
                        conn.job = Job::Send {
                            head,
                            count: w,
                            is_head,
                            security: SendSecurity::Tls {
                                encrypted: Vec::new(),
                                encrypted_count: 0,
                            },
                        };
                        let end = encrypted.len();
                        SendArm::Arm {
                            fd,
                            buf: encrypted,
                            pos: 0,
                            end,
                        }
                    }
                }
            }
        };
        self.apply_send_arm(slot, act)
    }

    fn on_sent(&mut self, slot: usize, buf: Vec<u8>, n: isize) -> MazurkaResult<Flow> {
        enum Kind {
            Handshake,
            Response,
        }
        let kind = match &self.pool.get(slot).job {
            Job::Handshake { phase, .. } => {
                debug_assert_eq!(*phase, HandshakePhase::Send, "send completion in recv phase");
                Kind::Handshake
            }
            Job::Send { .. } => Kind::Response,
            job => panic!("send completion in {} state", job.name()),
        };

        if n <= 0 {
            debug!("worker {}: slot {} peer gone during send", self.id, slot);
            self.start_close(slot);
            return Ok(Flow::Continue);
        }
        let n = n as usize;
        self.metrics.add_bytes(n as u64);

        match kind {
            Kind::Handshake => self.on_handshake_sent(slot, buf, n),
            Kind::Response => self.on_response_sent(slot, buf, n),
        }
    }

    fn on_response_sent(&mut self, slot: usize, buf: Vec<u8>, n: usize) -> MazurkaResult<Flow> {
        let act = {
            let Worker {
                ref mut pool,
                ref mut tls_slots,
                ref cfg,
                ..
            } = *self;
            let conn = pool.get_mut(slot);
            let fd = conn.fd;
            match &mut conn.job {
                Job::Send {
                    head,
                    count,
                    is_head,
                    security,
                } => {
                    let body: &[u8] = if *is_head {
                        &[]
                    } else {
                        conn.response.body.as_bytes()
                    };
                    let total = head.len() + body.len();
                    match security {
                        SendSecurity::Plain => {
                            *count += n;
                            if *count >= total {
                                SendArm::RestoreAndFinish(buf)
                            } else {
                                let mut buf = buf;
                                let w = Pseudoslice::new(head, body)
                                    .read_into(*count, &mut buf[..]);
                                SendArm::Arm {
                                    fd,
                                    buf,
                                    pos: 0,
                                    end: w,
                                }
                            }
                        }
                        SendSecurity::Tls {
                            encrypted,
                            encrypted_count,
                        } => {
                            *encrypted = buf;
                            *encrypted_count += n;
                            if *encrypted_count < encrypted.len() {
                                let pos = *encrypted_count;
                                let flight = std::mem::take(encrypted);
                                let end = flight.len();
                                SendArm::Arm {
                                    fd,
                                    buf: flight,
                                    pos,
                                    end,
                                }
                            } else if *count >= total {
                                SendArm::Finish
                            } else {
                                let w = (total - *count).min(cfg.size_socket_buffer);
                                let mut fresh = std::mem::take(encrypted);
                                fresh.clear();
                                let ps = Pseudoslice::new(head, body);
                                let view = ps.get(*count, *count + w, &mut conn.buffer[..]);
                                let sess = tls_slots[slot]
                                    .as_mut()
                                    .expect("send under TLS without a session");
                                match sess.encrypt(view, &mut fresh) {
                                    Err(err) => {
                                        debug!("slot {}: encrypt failed: {}", slot, err);
                                        SendArm::Close
                                    }
                                    Ok(()) => {
                                        *count += w;
                                        *encrypted_count = 0;
                                        let end = fresh.len();
                                        SendArm::Arm {
                                            fd,
                                            buf: fresh,
                                            pos: 0,
                                            end,
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                job => panic!("response send completion in {} state", job.name()),
            }
        };
        self.apply_send_arm(slot, act)
    }

    fn apply_send_arm(&mut self, slot: usize, act: SendArm) -> MazurkaResult<Flow> {
        match act {
            SendArm::Arm { fd, buf, pos, end } => {
                self.reactor.arm_send(slot, fd, buf, pos, end);
                Ok(Flow::Continue)
            }
            SendArm::RestoreAndFinish(buf) => {
                let conn = self.pool.get_mut(slot);
                if conn.buffer.is_empty() {
                    conn.buffer = buf;
                }
                self.finish_send(slot)
            }
            SendArm::Finish => self.finish_send(slot),
            SendArm::Close => {
                self.start_close(slot);
                Ok(Flow::Continue)
            }
        }
    }

    /// The response is fully delivered: reset per-request state and go back
    /// to reading.
    fn finish_send(&mut self, slot: usize) -> MazurkaResult<Flow> {
        let (fd, buf) = {
            let Worker {
                ref mut pool,
                ref cfg,
                ..
            } = *self;
            let conn = pool.get_mut(slot);
            conn.finish_request(cfg);
            conn.job = Job::Recv { count: 0 };
            (conn.fd, conn.take_buffer())
        };
        self.reactor.arm_recv(slot, fd, buf);
        Ok(Flow::Continue)
    }

    // ---- Spawned-handler triggers ----

    fn on_wake(&mut self) -> MazurkaResult<Flow> {
        while let Ok(msg) = self.trigger_rx.try_recv() {
            match msg {
                TriggerMsg::Resume { slot } => {
                    let (fd, buf) = {
                        let conn = self.pool.get_mut(slot);
                        assert!(
                            matches!(conn.job, Job::Recv { .. }),
                            "resume trigger in {} state",
                            conn.job.name()
                        );
                        (conn.fd, conn.take_buffer())
                    };
                    self.reactor.arm_recv(slot, fd, buf);
                }
                TriggerMsg::Respond { slot, response } => {
                    debug_assert!(
                        matches!(self.pool.get(slot).job, Job::Recv { .. }),
                        "respond trigger in {} state",
                        self.pool.get(slot).job.name()
                    );
                    if self.dispatch_response(slot, response)? == Flow::Kill {
                        return Ok(Flow::Kill);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }
}

// ---- Request assembly ----

/// Advance the parse stage over whatever sits in the accumulator. `resume`
/// is where the head-terminator scan restarts (computed before the append so
/// a terminator spanning two receives is seen).
pub(crate) fn advance_stage(
    conn: &mut Conn,
    cfg: &ServerConfig,
    router: &Router,
    link: &Link,
    resume: usize,
) -> Step {
    match conn.stage {
        Stage::Header => {
            let Some(header_end) = parser::find_head_end(&conn.recv_buffer, resume) else {
                return Step::Recv;
            };
            header_stage(conn, cfg, router, link, header_end)
        }
        Stage::Body { header_end } => body_stage(conn, cfg, router, link, header_end),
    }
}

/// Test entry point mirroring the receive path: append one plaintext chunk,
/// then advance.
#[cfg(test)]
pub(crate) fn ingest(
    conn: &mut Conn,
    cfg: &ServerConfig,
    router: &Router,
    link: &Link,
    chunk: &[u8],
) -> Step {
    let resume = conn.recv_buffer.len().saturating_sub(3);
    conn.recv_buffer.extend_from_slice(chunk);
    advance_stage(conn, cfg, router, link, resume)
}

fn response_for_parse_error(err: ParseError) -> Response {
    let status = match err {
        ParseError::ContentTooLarge => 413,
        ParseError::TooManyHeaders => 431,
        ParseError::Malformed => 400,
        ParseError::UriTooLong => 414,
        ParseError::InvalidMethod => 501,
        ParseError::VersionNotSupported => 505,
    };
    Response::canned(status)
}

fn header_stage(
    conn: &mut Conn,
    cfg: &ServerConfig,
    router: &Router,
    link: &Link,
    header_end: usize,
) -> Step {
    let (expects_body, content_length) = {
        let req = match parser::parse_headers(
            &conn.recv_buffer[..header_end],
            cfg.size_request_uri_max,
            cfg.num_header_max,
        ) {
            Ok(req) => req,
            Err(err) => return Step::Respond(response_for_parse_error(err)),
        };

        if req.version == Version::Http11 && req.header("Host").is_none() {
            return Step::Respond(Response::new(400).body("Missing \"Host\" Header"));
        }

        if !req.method.expects_body() {
            (false, 0usize)
        } else {
            match parser::content_length(&req) {
                Ok(Some(v)) => match usize::try_from(v) {
                    Ok(v) => (true, v),
                    Err(_) => return Step::Respond(Response::canned(413)),
                },
                Ok(None) => return Step::Respond(Response::canned(411)),
                Err(ParseError::ContentTooLarge) => return Step::Respond(Response::canned(413)),
                Err(_) => return Step::Respond(Response::canned(400)),
            }
        }
    };

    if !expects_body {
        return route_request(conn, cfg, router, link, header_end, header_end);
    }

    let have = conn.recv_buffer.len() - header_end;
    if have == content_length {
        route_request(conn, cfg, router, link, header_end, header_end + content_length)
    } else if have < content_length {
        conn.stage = Stage::Body { header_end };
        Step::Recv
    } else {
        // Bytes beyond the declared body: adversarial clients can produce
        // this, and it must be a protocol error rather than a truncation.
        Step::Respond(Response::canned(400))
    }
}

fn body_stage(
    conn: &mut Conn,
    cfg: &ServerConfig,
    router: &Router,
    link: &Link,
    header_end: usize,
) -> Step {
    let content_length = {
        let req = match parser::parse_headers(
            &conn.recv_buffer[..header_end],
            cfg.size_request_uri_max,
            cfg.num_header_max,
        ) {
            Ok(req) => req,
            Err(_) => return Step::Respond(Response::canned(400)),
        };
        match parser::content_length(&req) {
            Ok(Some(v)) => match usize::try_from(v) {
                Ok(v) => v,
                Err(_) => return Step::Respond(Response::canned(413)),
            },
            Ok(None) => return Step::Respond(Response::canned(411)),
            Err(ParseError::ContentTooLarge) => return Step::Respond(Response::canned(413)),
            Err(_) => return Step::Respond(Response::canned(400)),
        }
    };

    let request_length = header_end + content_length;
    if request_length > cfg.size_request_max {
        return Step::Respond(Response::canned(413));
    }
    if conn.recv_buffer.len() >= request_length {
        route_request(conn, cfg, router, link, header_end, request_length)
    } else {
        Step::Recv
    }
}

fn route_request(
    conn: &mut Conn,
    cfg: &ServerConfig,
    router: &Router,
    link: &Link,
    header_end: usize,
    body_end: usize,
) -> Step {
    let head = &conn.recv_buffer[..header_end];
    let mut req = match parser::parse_headers(head, cfg.size_request_uri_max, cfg.num_header_max) {
        Ok(req) => req,
        Err(_) => return Step::Respond(Response::canned(400)),
    };
    req.body = &conn.recv_buffer[header_end..body_end];
    conn.head_request = req.method == Method::Head;

    let mut queries = [("", ""); QUERIES_MAX];
    let query_count = req
        .query
        .map(|q| router::parse_queries(q, &mut queries, cfg.num_queries_max))
        .unwrap_or(0);

    match router.lookup(req.method, req.path, cfg.num_captures_max) {
        Lookup::NotFound => {
            debug!("{} {} -> no route", req.method.as_str(), req.path);
            Step::Respond(Response::not_found())
        }
        Lookup::MethodNotAllowed(set) => {
            debug!("{} {} -> method not allowed", req.method.as_str(), req.path);
            Step::Respond(Response::canned(405).header("Allow", set.allow_header()))
        }
        Lookup::Found {
            handler,
            captures,
            capture_count,
        } => {
            let ctx = Context {
                req: &req,
                captures: &captures[..capture_count as usize],
                queries: &queries[..query_count as usize],
                arena: &conn.arena,
                link: link.clone(),
            };
            match handler(ctx) {
                Outcome::Respond(response) => Step::Respond(response),
                Outcome::Spawned => Step::Spawned,
            }
        }
    }
}
