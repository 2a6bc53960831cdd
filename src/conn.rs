use crate::arena::Arena;
use crate::config::ServerConfig;
use crate::http::Response;

pub const INVALID_FD: i32 = -1;

/// Where request assembly stands on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Still collecting the head section.
    Header,
    /// Head parsed; collecting `Content-Length` body bytes. The offset is
    /// where the body starts in `recv_buffer`.
    Body { header_end: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Recv,
    Send,
}

/// Transmission half of a send job.
pub enum SendSecurity {
    Plain,
    /// The current encrypted window and how much of it has gone out. The
    /// buffer is briefly empty while it rides an armed send.
    Tls {
        encrypted: Vec<u8>,
        encrypted_count: usize,
    },
}

/// The connection's current in-flight operation. Every completion asserts
/// the variant it expects; a mismatch is a bug, not a runtime condition.
pub enum Job {
    /// In the free pool.
    Empty,
    /// Driving the TLS handshake. `out` holds the current outbound flight
    /// (`out_pos` sent so far); `count` is the continuation-cycle guard.
    Handshake {
        phase: HandshakePhase,
        count: u32,
        out: Vec<u8>,
        out_pos: usize,
    },
    /// Awaiting request bytes; `count` is wire bytes received for the
    /// current request.
    Recv { count: usize },
    /// Draining a response. `head` is the rendered head section; `count` is
    /// plaintext bytes delivered (under TLS: consumed into encryption).
    Send {
        head: Vec<u8>,
        count: usize,
        is_head: bool,
        security: SendSecurity,
    },
    /// A close has been issued to the reactor.
    Close,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Empty => "empty",
            Job::Handshake { .. } => "handshake",
            Job::Recv { .. } => "recv",
            Job::Send { .. } => "send",
            Job::Close => "close",
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Job::Empty)
    }
}

/// Per-slot connection state. Allocated once at startup, reused for the
/// lifetime of the worker.
pub struct Conn {
    pub index: usize,
    pub fd: i32,
    /// Fixed socket scratch buffer. Taken (left empty) while it rides an
    /// armed receive or a plain send window.
    pub buffer: Vec<u8>,
    /// Accumulated decrypted request bytes.
    pub recv_buffer: Vec<u8>,
    pub arena: Arena,
    pub response: Response,
    pub stage: Stage,
    pub job: Job,
    /// Whether the request being answered was HEAD (suppresses body bytes).
    pub head_request: bool,
}

impl Conn {
    pub fn new(index: usize, cfg: &ServerConfig) -> Self {
        Conn {
            index,
            fd: INVALID_FD,
            buffer: vec![0u8; cfg.size_socket_buffer],
            recv_buffer: Vec::new(),
            arena: Arena::new(cfg.size_connection_arena_retain),
            response: Response::new(200),
            stage: Stage::Header,
            job: Job::Empty,
            head_request: false,
        }
    }

    /// Move the scratch buffer out for an armed operation.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        debug_assert!(!self.buffer.is_empty(), "scratch buffer already taken");
        std::mem::take(&mut self.buffer)
    }

    /// Reset between requests on a live connection: the arena keeps its
    /// retained capacity, the accumulator shrinks back to its floor.
    pub fn finish_request(&mut self, cfg: &ServerConfig) {
        self.arena.reset();
        self.recv_buffer.clear();
        self.recv_buffer.shrink_to(cfg.size_recv_buffer_retain);
        self.stage = Stage::Header;
        self.response = Response::new(200);
        self.head_request = false;
    }

    /// Reset after the close completion; the slot is about to be released.
    pub fn reset_closed(&mut self, cfg: &ServerConfig) {
        self.fd = INVALID_FD;
        self.job = Job::Empty;
        self.finish_request(cfg);
        if self.buffer.is_empty() {
            // An armed buffer can be abandoned on transport failure paths;
            // restore the slot to its ready shape.
            self.buffer = vec![0u8; cfg.size_socket_buffer];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ServerConfig {
        ServerConfig::default()
    }

    #[test]
    fn fresh_slot_shape() {
        let cfg = cfg();
        let conn = Conn::new(3, &cfg);
        assert_eq!(conn.index, 3);
        assert_eq!(conn.fd, INVALID_FD);
        assert!(conn.job.is_empty());
        assert_eq!(conn.buffer.len(), cfg.size_socket_buffer);
        assert_eq!(conn.stage, Stage::Header);
    }

    #[test]
    fn finish_request_shrinks_accumulator() {
        let cfg = cfg();
        let mut conn = Conn::new(0, &cfg);
        conn.recv_buffer.extend_from_slice(&vec![7u8; 64 * 1024]);
        conn.stage = Stage::Body { header_end: 10 };
        conn.finish_request(&cfg);
        assert!(conn.recv_buffer.is_empty());
        assert!(conn.recv_buffer.capacity() <= cfg.size_recv_buffer_retain);
        assert_eq!(conn.stage, Stage::Header);
    }

    #[test]
    fn reset_closed_restores_taken_buffer() {
        let cfg = cfg();
        let mut conn = Conn::new(0, &cfg);
        conn.fd = 9;
        conn.job = Job::Close;
        let _taken = conn.take_buffer();
        conn.reset_closed(&cfg);
        assert_eq!(conn.fd, INVALID_FD);
        assert!(conn.job.is_empty());
        assert_eq!(conn.buffer.len(), cfg.size_socket_buffer);
    }
}
