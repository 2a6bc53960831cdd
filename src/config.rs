use std::env;
use std::path::PathBuf;

/// Transport security for a server.
#[derive(Debug, Clone)]
pub enum Security {
    /// Plain TCP.
    Plain,
    /// TLS with certificate material loaded from PEM files.
    ///
    /// `cert_name` / `key_name` select which PEM section label to read, for
    /// bundles that carry several sections in one file.
    Tls {
        cert: PathBuf,
        key: PathBuf,
        cert_name: String,
        key_name: String,
    },
}

impl Security {
    pub fn tls(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Security {
        Security::Tls {
            cert: cert.into(),
            key: key.into(),
            cert_name: "CERTIFICATE".to_string(),
            key_name: "PRIVATE KEY".to_string(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Security::Tls { .. })
    }
}

/// Worker-count selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threading {
    /// One worker per available core.
    Auto,
    /// A single worker.
    Single,
    /// An explicit worker count.
    Count(usize),
}

/// Engine configuration. Every knob has a default tuned for small-message
/// workloads; override with the builder setters or `from_env`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen backlog handed to the kernel.
    pub size_backlog: i32,
    /// Connection pool capacity per worker.
    pub size_connections_max: usize,
    /// Maximum completions reaped per poll round.
    pub size_completions_reap_max: usize,
    /// Arena bytes retained across requests on one connection.
    pub size_connection_arena_retain: usize,
    /// Receive accumulator capacity retained across requests.
    pub size_recv_buffer_retain: usize,
    /// Fixed per-connection socket scratch buffer; also the send window size.
    pub size_socket_buffer: usize,
    /// Hard cap on the receive accumulator.
    pub size_recv_buffer_max: usize,
    /// Hard cap on a single request (head + body).
    pub size_request_max: usize,
    /// Hard cap on the request target.
    pub size_request_uri_max: usize,
    /// Maximum number of request headers.
    pub num_header_max: usize,
    /// Maximum route captures stored per match.
    pub num_captures_max: usize,
    /// Maximum query pairs stored per request.
    pub num_queries_max: usize,
    pub security: Security,
    pub threading: Threading,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            size_backlog: 512,
            size_connections_max: 1024,
            size_completions_reap_max: 256,
            size_connection_arena_retain: 1024,
            size_recv_buffer_retain: 1024,
            size_socket_buffer: 4096,
            size_recv_buffer_max: 2 * 1024 * 1024,
            size_request_max: 2 * 1024 * 1024,
            size_request_uri_max: 2048,
            num_header_max: 32,
            num_captures_max: 8,
            num_queries_max: 8,
            security: Security::Plain,
            threading: Threading::Auto,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backlog(mut self, value: i32) -> Self {
        self.size_backlog = value;
        self
    }

    pub fn connections_max(mut self, value: usize) -> Self {
        self.size_connections_max = value;
        self
    }

    pub fn completions_reap_max(mut self, value: usize) -> Self {
        self.size_completions_reap_max = value.max(1);
        self
    }

    pub fn arena_retain(mut self, value: usize) -> Self {
        self.size_connection_arena_retain = value;
        self
    }

    pub fn recv_buffer_retain(mut self, value: usize) -> Self {
        self.size_recv_buffer_retain = value;
        self
    }

    pub fn socket_buffer(mut self, value: usize) -> Self {
        self.size_socket_buffer = value.max(64);
        self
    }

    pub fn recv_buffer_max(mut self, value: usize) -> Self {
        self.size_recv_buffer_max = value;
        self
    }

    pub fn request_max(mut self, value: usize) -> Self {
        self.size_request_max = value;
        self
    }

    pub fn request_uri_max(mut self, value: usize) -> Self {
        self.size_request_uri_max = value;
        self
    }

    pub fn header_max(mut self, value: usize) -> Self {
        self.num_header_max = value;
        self
    }

    pub fn captures_max(mut self, value: usize) -> Self {
        self.num_captures_max = value;
        self
    }

    pub fn queries_max(mut self, value: usize) -> Self {
        self.num_queries_max = value;
        self
    }

    pub fn security(mut self, value: Security) -> Self {
        self.security = value;
        self
    }

    pub fn threading(mut self, value: Threading) -> Self {
        self.threading = value;
        self
    }

    /// Apply `MAZURKA_*` environment overrides on top of the current values.
    /// Unset or unparsable variables leave the field untouched.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        read_env("MAZURKA_BACKLOG", &mut cfg.size_backlog);
        read_env("MAZURKA_CONNECTIONS_MAX", &mut cfg.size_connections_max);
        read_env("MAZURKA_REAP_MAX", &mut cfg.size_completions_reap_max);
        read_env("MAZURKA_ARENA_RETAIN", &mut cfg.size_connection_arena_retain);
        read_env("MAZURKA_RECV_RETAIN", &mut cfg.size_recv_buffer_retain);
        read_env("MAZURKA_SOCKET_BUFFER", &mut cfg.size_socket_buffer);
        read_env("MAZURKA_RECV_MAX", &mut cfg.size_recv_buffer_max);
        read_env("MAZURKA_REQUEST_MAX", &mut cfg.size_request_max);
        read_env("MAZURKA_URI_MAX", &mut cfg.size_request_uri_max);
        read_env("MAZURKA_HEADER_MAX", &mut cfg.num_header_max);
        if let Ok(v) = env::var("MAZURKA_WORKERS") {
            cfg.threading = match v.as_str() {
                "auto" => Threading::Auto,
                "1" | "single" => Threading::Single,
                n => n.parse().map(Threading::Count).unwrap_or(cfg.threading),
            };
        }
        cfg
    }

    /// Resolved worker count for the configured threading mode.
    pub fn worker_count(&self) -> usize {
        match self.threading {
            Threading::Auto => num_cpus::get().max(1),
            Threading::Single => 1,
            Threading::Count(n) => n.max(1),
        }
    }
}

fn read_env<T: std::str::FromStr>(name: &str, field: &mut T) {
    if let Ok(v) = env::var(name) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.size_backlog, 512);
        assert_eq!(cfg.size_connections_max, 1024);
        assert_eq!(cfg.size_socket_buffer, 4096);
        assert_eq!(cfg.size_request_max, 2 * 1024 * 1024);
        assert_eq!(cfg.num_header_max, 32);
        assert_eq!(cfg.num_captures_max, 8);
        assert!(!cfg.security.is_tls());
        assert_eq!(cfg.threading, Threading::Auto);
    }

    #[test]
    fn builder_chains() {
        let cfg = ServerConfig::new()
            .connections_max(8)
            .socket_buffer(128)
            .request_max(4096)
            .threading(Threading::Single);
        assert_eq!(cfg.size_connections_max, 8);
        assert_eq!(cfg.size_socket_buffer, 128);
        assert_eq!(cfg.size_request_max, 4096);
        assert_eq!(cfg.worker_count(), 1);
    }

    #[test]
    fn env_overrides() {
        unsafe {
            env::set_var("MAZURKA_CONNECTIONS_MAX", "17");
            env::set_var("MAZURKA_WORKERS", "3");
        }
        let cfg = ServerConfig::from_env();
        assert_eq!(cfg.size_connections_max, 17);
        assert_eq!(cfg.threading, Threading::Count(3));
        unsafe {
            env::remove_var("MAZURKA_CONNECTIONS_MAX");
            env::remove_var("MAZURKA_WORKERS");
        }
    }
}
