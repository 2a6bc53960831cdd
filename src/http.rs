use std::io::Write;
use std::time::SystemTime;

use crate::arena::Arena;
use crate::worker::Link;

/// Sentinel status: a handler returning this asks the worker runtime to stop
/// instead of sending a response.
pub const KILL: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub const ALL: [Method; 9] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Patch,
        Method::Head,
        Method::Options,
        Method::Trace,
        Method::Connect,
    ];

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"PATCH" => Some(Method::Patch),
            b"HEAD" => Some(Method::Head),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }

    /// Whether requests with this method carry an entity body that must be
    /// framed by `Content-Length` before routing.
    pub fn expects_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

pub struct Request<'a> {
    pub method: Method,
    pub version: Version,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
}

impl<'a> Request<'a> {
    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

pub enum Body {
    Empty,
    Bytes(Vec<u8>),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Bytes(b) => b.as_slice(),
        }
    }
}

pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn header(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((key, value.into()));
        self
    }

    pub fn content_type(mut self, value: &'static str) -> Self {
        self.content_type = value;
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Response::new(200).body(body)
    }

    /// Error page with the canonical `{code} {reason}` body.
    pub fn canned(status: u16) -> Self {
        Response::new(status).body(format!("{} {}", status, status_name(status)))
    }

    pub fn not_found() -> Self {
        Response::canned(404)
    }

    pub fn internal_error() -> Self {
        Response::canned(500)
    }

    /// Ask the worker runtime to stop. No bytes are sent for this response.
    pub fn kill() -> Self {
        Response::new(KILL)
    }

    /// Render the response head (status line through the blank line) into
    /// `buf`. `body_len` is written as `Content-Length` regardless of how many
    /// body bytes will actually go out (HEAD responses advertise the real
    /// length but transmit none).
    pub fn render_head_into(&self, buf: &mut Vec<u8>, body_len: usize) {
        let _ = write!(buf, "HTTP/1.1 {} {}\r\n", self.status, status_name(self.status));
        let _ = write!(buf, "Server: mazurka\r\n");
        let _ = write!(buf, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));
        let _ = write!(buf, "Content-Type: {}\r\n", self.content_type);
        for (k, v) in &self.headers {
            let _ = write!(buf, "{}: {}\r\n", k, v);
        }
        let _ = write!(buf, "Content-Length: {}\r\n\r\n", body_len);
    }
}

/// Canonical reason phrase for a status code.
pub fn status_name(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        418 => "I'm a Teapot",
        421 => "Misdirected Request",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// What a handler hands back to the engine.
pub enum Outcome {
    /// A complete response; the engine renders and sends it.
    Respond(Response),
    /// The handler took ownership of the connection's resume [`Link`] and
    /// will trigger it later. No I/O is outstanding until then.
    Spawned,
}

/// Per-request view handed to handlers.
pub struct Context<'a> {
    pub req: &'a Request<'a>,
    pub captures: &'a [(&'a str, &'a str)],
    pub queries: &'a [(&'a str, &'a str)],
    pub arena: &'a Arena,
    pub link: Link,
}

impl<'a> Context<'a> {
    pub fn capture(&self, name: &str) -> Option<&'a str> {
        self.captures.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
    }

    pub fn query(&self, name: &str) -> Option<&'a str> {
        self.queries.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
    }

    pub fn body(&self) -> &'a [u8] {
        self.req.body
    }
}
